//! lineup-hw: V4L2 camera capture for enrollment and recognition sessions.
//!
//! Negotiates a capture format, converts every frame to 8-bit grayscale and
//! exposes the device through the `CameraDevice` port of `lineup-core`.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CameraStream, DeviceCamera, DeviceInfo};
pub use frame::{FrameError, PixelFormat};
