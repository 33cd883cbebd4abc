//! Contexts group the objects a frame is recorded and submitted with.

pub mod device_ctx;
pub mod frame_ctx;
