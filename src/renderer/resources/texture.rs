use ash::prelude::VkResult;
use ash::vk;
use crate::renderer::contexts::device_ctx::command_buffer::Recorder;
use crate::renderer::internals::resource_allocator::ResourceAllocator;
use crate::renderer::resources::image::ImageResource;
use crate::renderer::resources::{DescriptorImage, UploadableResource};

/// Uploaded image bound as a plain sampled image, without a filter
pub struct Texture {
    image: ImageResource,
}

impl Texture {
    pub fn new(allocator: &ResourceAllocator, name: &str) -> Self {
        Self {
            image: ImageResource::new(allocator, name),
        }
    }

    pub fn from_pixels(
        allocator: &ResourceAllocator,
        name: &str,
        host_data: &[u8],
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> Self {
        let mut texture = Self::new(allocator, name);
        // Failure stays readable through last_result
        let _ = texture.create_texture(host_data, extent, format);
        texture
    }

    /// Stages a decoded image as 8-bit sRGB RGBA
    pub fn from_image(allocator: &ResourceAllocator, name: &str, image: &::image::DynamicImage) -> Self {
        let rgba = image.to_rgba8();
        let extent = vk::Extent2D {
            width: rgba.width(),
            height: rgba.height(),
        };
        Self::from_pixels(allocator, name, rgba.as_raw(), extent, vk::Format::R8G8B8A8_SRGB)
    }

    pub fn create_texture(&mut self, host_data: &[u8], extent: vk::Extent2D, format: vk::Format) -> VkResult<()> {
        self.image.create_texture(host_data, extent, format)
    }

    pub fn delete_gpu_data(&mut self) {
        self.image.delete_gpu_data();
    }

    pub fn image(&self) -> &ImageResource {
        &self.image
    }

    pub fn is_valid(&self) -> bool {
        self.image.has_device_image()
    }

    pub fn last_result(&self) -> vk::Result {
        self.image.last_result()
    }
}

impl UploadableResource for Texture {
    fn record_upload_commands(&mut self, recorder: &Recorder) -> VkResult<()> {
        self.image.record_upload_commands(recorder)
    }

    fn delete_host_data(&mut self) {
        self.image.delete_host_data();
    }
}

impl DescriptorImage for Texture {
    fn image_view(&self) -> vk::ImageView {
        self.image.view()
    }

    fn is_ready(&self) -> bool {
        self.image.is_uploaded()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::*;
    use crate::renderer::backend::headless::HeadlessDevice;

    #[test]
    fn decoded_images_are_staged_as_rgba() {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = Arc::new(HeadlessDevice::new());
        let allocator = ResourceAllocator::new(device.clone()).unwrap();

        let gray = ::image::DynamicImage::new_luma8(3, 2);
        let texture = Texture::from_image(&allocator, "gray", &gray);
        assert!(texture.is_valid());
        assert_eq!(texture.image().format(), Some(vk::Format::R8G8B8A8_SRGB));
        assert_eq!(texture.image().extent(), Some(vk::Extent2D { width: 3, height: 2 }));
        assert_eq!(
            device.buffer_contents(texture.image().staging_buffer()).map(|bytes| bytes.len()),
            Some(3 * 2 * 4),
        );
        assert_eq!(texture.image_info().sampler, vk::Sampler::null());
    }
}
