//! GPU resource and frame-submission layer: device and surface setup,
//! memory-backed buffers and images, pipelines, descriptor bindings, render
//! passes and the per-frame synchronization between CPU recording and GPU
//! execution.

pub mod renderer;

pub use renderer::backend::DeviceBackend;
pub use renderer::backend::headless::HeadlessDevice;
pub use renderer::config::ContextConfig;
pub use renderer::context::{Context, ContextState};
