//! Fire-and-forget dispatch of encoded packets to the device bus
//!
//! A single dispatcher thread owns the bus, so packets for any one control
//! are written strictly in the order they were queued. Failures are reported
//! as log lines and [`StreamEvent::Message`]s, never returned to the sender.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};
use tracing::{debug, info, warn};

use super::encoder::{encode_init, ResolvedPacket};
use super::template::CommandTemplate;
use crate::error::{BusError, StreamError};
use crate::stream::events::EventHub;

/// The external bus that carries packets to the camera (I2C over the
/// capture link, a UVC extension unit, ...).
pub trait DeviceBus: Send + 'static {
    fn write(&mut self, packet: &ResolvedPacket) -> Result<(), BusError>;
}

impl<F> DeviceBus for F
where
    F: FnMut(&ResolvedPacket) -> Result<(), BusError> + Send + 'static,
{
    fn write(&mut self, packet: &ResolvedPacket) -> Result<(), BusError> {
        self(packet)
    }
}

/// Bus for capture-only setups and dry runs: every packet is logged.
#[derive(Debug, Default)]
pub struct LoggingBus;

impl DeviceBus for LoggingBus {
    fn write(&mut self, packet: &ResolvedPacket) -> Result<(), BusError> {
        debug!("bus write {:#x}: {:02x?}", packet.address_key, packet.bytes);
        Ok(())
    }
}

enum Request {
    Packet(ResolvedPacket),
    ReplayInit,
    Shutdown,
}

/// Cloneable handle for queueing work on a [`CommandDispatcher`].
#[derive(Clone)]
pub struct DispatchHandle {
    tx: Sender<Request>,
}

impl DispatchHandle {
    pub fn send(&self, packet: ResolvedPacket) {
        if self.tx.send(Request::Packet(packet)).is_err() {
            warn!("command dispatcher has shut down, packet dropped");
        }
    }

    pub fn request_reinit(&self) {
        if self.tx.send(Request::ReplayInit).is_err() {
            warn!("command dispatcher has shut down, reinit dropped");
        }
    }
}

pub struct CommandDispatcher {
    handle: DispatchHandle,
    worker: Option<JoinHandle<()>>,
}

impl CommandDispatcher {
    pub fn spawn(
        device: String,
        bus: Box<dyn DeviceBus>,
        init: Arc<[CommandTemplate]>,
        events: Arc<EventHub>,
    ) -> Result<Self, StreamError> {
        let (tx, rx) = flume::unbounded();
        let worker = thread::Builder::new()
            .name(format!("{device}-commands"))
            .spawn(move || dispatch_loop(device, bus, init, events, rx))
            .map_err(StreamError::Spawn)?;

        Ok(Self {
            handle: DispatchHandle { tx },
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    pub fn send(&self, packet: ResolvedPacket) {
        self.handle.send(packet);
    }

    pub fn request_reinit(&self) {
        self.handle.request_reinit();
    }

    /// Drain everything queued so far, then stop the worker.
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.handle.tx.send(Request::Shutdown);
            if worker.join().is_err() {
                warn!("command dispatcher panicked");
            }
        }
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_loop(
    device: String,
    mut bus: Box<dyn DeviceBus>,
    init: Arc<[CommandTemplate]>,
    events: Arc<EventHub>,
    rx: Receiver<Request>,
) {
    debug!("{device}: command dispatcher started");

    while let Ok(request) = rx.recv() {
        match request {
            Request::Packet(packet) => write_packet(&device, bus.as_mut(), &events, &packet),
            Request::ReplayInit => {
                info!("{device}: sending {} init commands", init.len());
                for template in init.iter() {
                    match encode_init(template) {
                        Ok(packet) => write_packet(&device, bus.as_mut(), &events, &packet),
                        Err(e) => {
                            warn!("{device}: init command skipped: {e}");
                            metrics::counter!("device_packets_skipped").increment(1);
                        }
                    }
                }
            }
            Request::Shutdown => break,
        }
    }

    debug!("{device}: command dispatcher stopped");
}

fn write_packet(device: &str, bus: &mut dyn DeviceBus, events: &EventHub, packet: &ResolvedPacket) {
    match bus.write(packet) {
        Ok(()) => {
            metrics::counter!("device_packets_sent").increment(1);
        }
        Err(e) => {
            warn!("{device}: bus write for key {:#x} failed: {e}", packet.address_key);
            events.message(format!("{device}: failed to send command: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::command::template::{CommandField, Protocol};
    use crate::stream::events::StreamEvent;

    fn literal(address_w: u8, data: u8) -> CommandTemplate {
        CommandTemplate {
            protocol: Protocol::I2c,
            address_w,
            reg: vec![0x01],
            data: vec![CommandField::Literal(data)],
        }
    }

    fn recording_bus() -> (Box<dyn DeviceBus>, Receiver<ResolvedPacket>) {
        let (tx, rx) = flume::unbounded();
        let bus = move |p: &ResolvedPacket| {
            tx.send(p.clone()).map_err(|_| BusError::NotConnected)
        };
        (Box::new(bus), rx)
    }

    #[test]
    fn writes_packets_in_order() {
        let (bus, written) = recording_bus();
        let events = Arc::new(EventHub::default());
        let mut dispatcher =
            CommandDispatcher::spawn("cam".into(), bus, Arc::from(Vec::new()), events).unwrap();

        for data in 0..5u8 {
            dispatcher.send(encode_init(&literal(0x20, data)).unwrap());
        }
        dispatcher.shutdown();

        let order: Vec<u8> = written.drain().map(|p| p.bytes[2]).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn replays_valid_init_commands_only() {
        let (bus, written) = recording_bus();
        let events = Arc::new(EventHub::default());
        let mut spi = literal(0x30, 9);
        spi.protocol = Protocol::Spi;
        let init: Arc<[CommandTemplate]> = Arc::from(vec![literal(0x20, 1), spi, literal(0x22, 2)]);

        let mut dispatcher = CommandDispatcher::spawn("cam".into(), bus, init, events).unwrap();
        dispatcher.request_reinit();
        dispatcher.shutdown();

        let addresses: Vec<u8> = written.drain().map(|p| p.bytes[0]).collect();
        assert_eq!(addresses, vec![0x20, 0x22]);
    }

    #[test]
    fn bus_failure_becomes_a_message() {
        let events = Arc::new(EventHub::default());
        let rx = events.subscribe();
        let bus = |p: &ResolvedPacket| -> Result<(), BusError> {
            Err(BusError::Rejected {
                key: p.address_key,
                reason: "nack".into(),
            })
        };
        let mut dispatcher =
            CommandDispatcher::spawn("cam".into(), Box::new(bus), Arc::from(Vec::new()), events)
                .unwrap();

        dispatcher.send(encode_init(&literal(0x20, 1)).unwrap());
        dispatcher.shutdown();

        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            StreamEvent::Message(text) => assert!(text.contains("nack")),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
