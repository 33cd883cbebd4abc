//! "Resources" are the objects the renderer creates, binds and draws.
//! What a resource can do is expressed through the capability traits below.

pub mod descriptor_set;
pub mod element_buffer;
pub mod image;
pub mod pipeline;
pub mod render_pass;
pub mod sampler;
pub mod shader;
pub mod texture;
pub mod uniform_buffer;

use ash::prelude::VkResult;
use ash::vk;
use crate::renderer::contexts::device_ctx::command_buffer::Recorder;

/// Something that binds state into a recording command buffer
pub trait BindableResource {
    fn record_bind(&self, recorder: &Recorder) -> VkResult<()>;
}

/// Something that issues draw or dispatch commands
pub trait Drawer {
    fn record_draw(&self, recorder: &Recorder) -> VkResult<()>;
}

/// Something with host data that must be transferred before first use
pub trait UploadableResource {
    fn record_upload_commands(&mut self, recorder: &Recorder) -> VkResult<()>;

    /// Releases host staging memory; no-op when already released
    fn delete_host_data(&mut self);
}

/// Image-backed resource that can be written into a descriptor set
pub trait DescriptorImage: Send + Sync {
    fn image_view(&self) -> vk::ImageView;

    /// Layout the image is in when shaders access it
    fn image_layout(&self) -> vk::ImageLayout {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    }

    /// Filter written alongside the view for combined image-sampler bindings
    fn sampler(&self) -> vk::Sampler {
        vk::Sampler::null()
    }

    /// Whether the device-side image holds valid data
    fn is_ready(&self) -> bool;

    fn image_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler(),
            image_view: self.image_view(),
            image_layout: self.image_layout(),
        }
    }
}
