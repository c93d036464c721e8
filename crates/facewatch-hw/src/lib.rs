//! facewatch-hw — Hardware abstraction for webcam capture.
//!
//! Provides V4L2-based camera access behind the [`ImageSource`] trait,
//! plus grayscale frame handling (YUYV conversion, JPEG encoding).

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, ImageSource};
pub use frame::Frame;
