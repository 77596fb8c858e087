//! Raw buffer to grayscale conversion for the pixel formats we negotiate.

use image::GrayImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("MJPEG decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("decoded frame is {actual_w}x{actual_h}, expected {width}x{height}")]
    SizeMismatch {
        width: u32,
        height: u32,
        actual_w: u32,
        actual_h: u32,
    },
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
    /// Motion JPEG, one JPEG image per buffer.
    Mjpeg,
}

impl PixelFormat {
    pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            b"MJPG" => Some(Self::Mjpeg),
            _ => None,
        }
    }
}

/// Convert one captured buffer to a `width` x `height` grayscale image.
pub fn to_grayscale(
    buf: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<GrayImage, FrameError> {
    let pixels = (width * height) as usize;
    let data = match format {
        PixelFormat::Grey => {
            check_len(buf, pixels)?;
            buf[..pixels].to_vec()
        }
        PixelFormat::Y16 => y16_to_grayscale(buf, pixels)?,
        PixelFormat::Yuyv => yuyv_to_grayscale(buf, width, height)?,
        PixelFormat::Mjpeg => {
            let img = image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)?
                .to_luma8();
            if img.dimensions() != (width, height) {
                return Err(FrameError::SizeMismatch {
                    width,
                    height,
                    actual_w: img.width(),
                    actual_h: img.height(),
                });
            }
            return Ok(img);
        }
    };
    GrayImage::from_raw(width, height, data).ok_or(FrameError::InvalidLength {
        expected: pixels,
        actual: 0,
    })
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len(yuyv, expected)?;
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Keep the high byte of each 16-bit little-endian sample.
pub fn y16_to_grayscale(buf: &[u8], pixels: usize) -> Result<Vec<u8>, FrameError> {
    check_len(buf, pixels * 2)?;
    Ok(buf[..pixels * 2].chunks_exact(2).map(|px| px[1]).collect())
}
