//! One behavior camera: device description + user settings wired to a
//! stream controller and its command channel

use std::collections::BTreeMap;
use std::sync::Arc;

use flume::Receiver;
use tracing::{debug, info, instrument, warn};

use crate::capture::FrameSource;
use crate::command::{encode_change, resolve_all, CommandDispatcher, CommandTemplate, DeviceBus};
use crate::config::{
    AppConfig, CameraConfig, ControlSetting, ControlValue, DeviceRegistry, DeviceTypeConfig,
    PipelineConfig,
};
use crate::error::{ConfigError, StreamError};
use crate::roi::Roi;
use crate::stream::{EventHub, StreamController, StreamEvent};

/// A control from the device description, with its current value and its
/// pre-resolved `sendCommand` templates.
#[derive(Debug, Clone)]
pub struct Control {
    pub setting: ControlSetting,
    pub value: ControlValue,
    pub commands: Vec<CommandTemplate>,
}

pub struct CameraSession {
    name: String,
    device: Arc<DeviceTypeConfig>,
    camera: CameraConfig,
    controller: StreamController,
    controls: BTreeMap<String, Control>,
    init: Arc<[CommandTemplate]>,
    roi: Roi,
    events: Arc<EventHub>,
}

impl CameraSession {
    pub fn new(
        device: Arc<DeviceTypeConfig>,
        camera: CameraConfig,
        pipeline: PipelineConfig,
    ) -> Self {
        let name = camera.name();
        let events = Arc::new(EventHub::new(pipeline.event_queue_depth));

        let init: Arc<[CommandTemplate]> = if device.capture_only {
            Arc::from(Vec::new())
        } else {
            // Init commands carry no runtime values, so placeholders can
            // never be filled in.
            resolve_all(&format!("{name} initialize"), &device.initialize)
                .into_iter()
                .filter(|template| {
                    let sendable = !template.has_placeholders();
                    if !sendable {
                        warn!(
                            "{name}: init command for {:#04x} {:02x?} has placeholders, dropped",
                            template.address_w, template.reg
                        );
                    }
                    sendable
                })
                .collect()
        };

        let controls = device
            .control_settings
            .iter()
            .map(|(control, setting)| {
                let value = camera
                    .control_override(control)
                    .cloned()
                    .or_else(|| setting.start_value.clone())
                    .unwrap_or(ControlValue::Number(0.0));
                let commands =
                    resolve_all(&format!("{name} {control}"), &setting.send_command);
                let entry = Control {
                    setting: setting.clone(),
                    value,
                    commands,
                };
                (control.clone(), entry)
            })
            .collect();

        let roi = camera
            .roi
            .map(|roi| roi.clamped(device.width, device.height))
            .unwrap_or_else(|| Roi::full_frame(device.width, device.height));

        let mut controller = StreamController::new(name.clone(), pipeline, events.clone());
        let mut adjust = controller.display_adjust();
        adjust.show_saturation = camera.show_saturation;
        controller.set_display_adjust(adjust);

        let mut session = Self {
            name,
            device,
            camera,
            controller,
            controls,
            init,
            roi,
            events,
        };
        session.apply_display_controls();
        session
    }

    /// Look the camera's device type up in the process-wide registry.
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        let device = DeviceRegistry::global()?.get(&config.camera.device_type)?;
        Ok(Self::new(
            device,
            config.camera.clone(),
            config.pipeline.clone(),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &DeviceTypeConfig {
        &self.device
    }

    pub fn controller(&self) -> &StreamController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut StreamController {
        &mut self.controller
    }

    pub fn subscribe(&self) -> Receiver<StreamEvent> {
        self.events.subscribe()
    }

    pub fn controls(&self) -> &BTreeMap<String, Control> {
        &self.controls
    }

    pub fn init_commands(&self) -> &[CommandTemplate] {
        &self.init
    }

    /// Current value of every control, as published on connect.
    pub fn start_values(&self) -> impl Iterator<Item = (&str, &ControlValue)> {
        self.controls
            .iter()
            .map(|(name, control)| (name.as_str(), &control.value))
    }

    /// Start streaming from `source`. Unless the device is capture-only,
    /// `bus` carries init commands and control changes to the camera.
    #[instrument(skip(self, source, bus), fields(device = %self.name))]
    pub fn connect(
        &mut self,
        source: Box<dyn FrameSource>,
        bus: Option<Box<dyn DeviceBus>>,
    ) -> Result<(), StreamError> {
        if self.controller.is_streaming() {
            return Err(StreamError::AlreadyRunning);
        }
        match bus {
            Some(bus) if !self.device.capture_only => {
                let dispatcher = CommandDispatcher::spawn(
                    self.name.clone(),
                    bus,
                    self.init.clone(),
                    self.events.clone(),
                )?;
                self.controller.attach_dispatcher(dispatcher);
            }
            Some(_) => debug!("{}: capture-only device, bus ignored", self.name),
            None => {}
        }

        if let Err(e) = self.controller.start(source) {
            if let Some(mut dispatcher) = self.controller.detach_dispatcher() {
                dispatcher.shutdown();
            }
            return Err(e);
        }

        if self.controller.has_dispatcher() {
            self.controller.request_reinit();
        }

        for (control, value) in self.start_values() {
            self.events.publish(StreamEvent::PropertyChanged {
                device: self.name.clone(),
                control: control.to_string(),
                value: value.clone(),
            });
        }
        if self.camera.roi.is_some() {
            self.events.publish(StreamEvent::RoiChanged(self.roi));
        }
        Ok(())
    }

    /// A control moved. `display_value` is what the user sees; `value` and
    /// `value2` are substituted into the control's command placeholders.
    pub fn on_control_changed(&mut self, control: &str, display_value: f64, value: f64, value2: f64) {
        self.events.message(format!(
            "{} {control} changed to {display_value}.",
            self.name
        ));

        if is_display_control(control) {
            if let Some(entry) = self.controls.get_mut(control) {
                entry.value = ControlValue::Number(display_value);
            }
            self.set_display_control(control, display_value);
            return;
        }

        let Some(entry) = self.controls.get_mut(control) else {
            warn!("{}: unknown control {control:?}", self.name);
            return;
        };
        entry.value = ControlValue::Number(display_value);

        self.events.publish(StreamEvent::PropertyChanged {
            device: self.name.clone(),
            control: control.to_string(),
            value: ControlValue::Number(display_value),
        });

        if self.device.capture_only {
            return;
        }
        for template in &entry.commands {
            match encode_change(template, value, value2) {
                Ok(packet) => {
                    debug!(
                        "{}: {control} -> {:#x} {:02x?}",
                        self.name, packet.address_key, packet.bytes
                    );
                    self.controller.send_command(packet);
                }
                Err(e) => {
                    warn!("{}: {control} command skipped: {e}", self.name);
                    metrics::counter!("device_packets_skipped").increment(1);
                }
            }
        }
    }

    /// The device asked for its init commands again.
    pub fn on_reinit_requested(&self) {
        info!("{}: reinitializing device", self.name);
        self.controller.request_reinit();
    }

    /// A box was drawn on the display, in display pixels.
    pub fn on_new_roi(&mut self, display: Roi) -> Roi {
        self.roi = Roi::from_display(
            display,
            self.camera.window_scale,
            self.device.width,
            self.device.height,
        );
        self.events.publish(StreamEvent::RoiChanged(self.roi));
        self.events.message(format!("ROI Set to {}", self.roi));
        self.roi
    }

    /// Native-pixel region of interest.
    pub fn roi(&self) -> Roi {
        self.roi
    }

    pub fn roi_for_display(&self) -> Roi {
        self.roi.to_display(self.camera.window_scale)
    }

    pub fn set_show_saturation(&mut self, show: bool) {
        let mut adjust = self.controller.display_adjust();
        adjust.show_saturation = show;
        self.controller.set_display_adjust(adjust);
    }

    /// Stop streaming. Also joins a capture worker that already ended on
    /// its own.
    pub fn close(&mut self) -> Result<(), StreamError> {
        match self.controller.stop() {
            Ok(()) | Err(StreamError::NotRunning) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn apply_display_controls(&mut self) {
        let mut adjust = self.controller.display_adjust();
        if let Some(alpha) = self.control_f64("alpha") {
            adjust.alpha = alpha;
        }
        if let Some(beta) = self.control_f64("beta") {
            adjust.beta = beta;
        }
        self.controller.set_display_adjust(adjust);
    }

    fn set_display_control(&mut self, control: &str, value: f64) {
        let mut adjust = self.controller.display_adjust();
        match control {
            "alpha" => adjust.alpha = value,
            "beta" => adjust.beta = value,
            _ => return,
        }
        self.controller.set_display_adjust(adjust);
    }

    fn control_f64(&self, control: &str) -> Option<f64> {
        self.controls.get(control).and_then(|c| c.value.as_f64())
    }
}

/// Controls that only change how frames are shown.
fn is_display_control(control: &str) -> bool {
    matches!(control, "alpha" | "beta")
}
