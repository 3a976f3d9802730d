//! Conversion of device wire formats into slot storage

use crate::capture::frame::{Frame, PixelFormat};
use crate::error::CaptureError;

/// Formats a device may deliver on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Grey,
    Yuyv,
    #[cfg(feature = "v4l2")]
    Mjpeg,
}

/// Decode `data` into `frame` without reallocating its storage
pub fn decode_into(data: &[u8], wire: WireFormat, frame: &mut Frame) -> Result<(), CaptureError> {
    match wire {
        WireFormat::Grey => frame.fill_from(data),
        WireFormat::Yuyv => yuyv_luma_into(data, frame),
        #[cfg(feature = "v4l2")]
        WireFormat::Mjpeg => mjpeg_into(data, frame),
    }
}

/// Keep the Y samples of packed YUYV (Y0 U Y1 V) as an 8-bit grey image
fn yuyv_luma_into(data: &[u8], frame: &mut Frame) -> Result<(), CaptureError> {
    if frame.meta.format != PixelFormat::Gray8 {
        return Err(CaptureError::Decode(format!(
            "YUYV luma needs a Gray8 slot, slot is {:?}",
            frame.meta.format
        )));
    }
    if data.len() != frame.data.len() * 2 {
        return Err(CaptureError::FrameSize {
            got: data.len() / 2,
            expected: frame.data.len(),
        });
    }
    for (dst, pair) in frame.data.iter_mut().zip(data.chunks_exact(2)) {
        *dst = pair[0];
    }
    Ok(())
}

#[cfg(feature = "v4l2")]
fn mjpeg_into(data: &[u8], frame: &mut Frame) -> Result<(), CaptureError> {
    use jpeg_decoder::Decoder;

    let mut decoder = Decoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| CaptureError::Decode(e.to_string()))?;

    match frame.meta.format {
        PixelFormat::Rgb24 => frame.fill_from(&pixels),
        PixelFormat::Bgr24 => {
            if pixels.len() != frame.data.len() {
                return Err(CaptureError::FrameSize {
                    got: pixels.len(),
                    expected: frame.data.len(),
                });
            }
            for (dst, src) in frame.data.chunks_exact_mut(3).zip(pixels.chunks_exact(3)) {
                dst[0] = src[2];
                dst[1] = src[1];
                dst[2] = src[0];
            }
            Ok(())
        }
        PixelFormat::Gray8 => Err(CaptureError::Decode(
            "MJPEG decodes to colour, slot is Gray8".into(),
        )),
    }
}
