//! rollcall-hw: Webcam capture for the attendance station.
//!
//! Wraps V4L2 devices and converts their YUYV, MJPEG or GREY output into
//! RGB frames.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CaptureStream, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
