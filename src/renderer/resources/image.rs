use ash::prelude::VkResult;
use ash::vk;
use crate::renderer::backend::ImageBarrier;
use crate::renderer::contexts::device_ctx::command_buffer::Recorder;
use crate::renderer::internals::format;
use crate::renderer::internals::resource_allocator::{AllocatedBuffer, AllocatedImage, ResourceAllocator};
use crate::renderer::internals::util::{LastResult, not_ready, validation_failed};

/// Host-uploaded 2D image: a staging buffer, the device image and the
/// transfer between them.
///
/// Device data is only valid once the upload commands have executed.
pub struct ImageResource {
    name: String,
    device_image: Option<AllocatedImage>,
    staging: Option<AllocatedBuffer>,
    uploaded: bool,
    last_result: LastResult,

    allocator: ResourceAllocator,
}

impl ImageResource {
    pub fn new(allocator: &ResourceAllocator, name: &str) -> Self {
        Self {
            name: name.to_string(),
            device_image: None,
            staging: None,
            uploaded: false,
            last_result: LastResult::default(),
            allocator: allocator.clone(),
        }
    }

    /// Stages `host_data` and allocates the device image; the transfer itself
    /// is recorded later by `record_upload_commands`
    pub fn create_texture(&mut self, host_data: &[u8], extent: vk::Extent2D, format: vk::Format) -> VkResult<()> {
        let result = self.try_create_texture(host_data, extent, format);
        self.last_result.record(result)
    }

    fn try_create_texture(&mut self, host_data: &[u8], extent: vk::Extent2D, format: vk::Format) -> VkResult<()> {
        if self.device_image.is_some() {
            return Err(validation_failed(format!("Image '{}' already has a device image", self.name)));
        }
        let required = format::image_byte_size(extent, format)
            .ok_or_else(|| validation_failed(format!("Format {:?} has no known texel size", format)))?;
        if (host_data.len() as u64) < required {
            return Err(validation_failed(format!(
                "Image '{}' needs {} bytes for {}x{} {:?}, got {}",
                self.name, required, extent.width, extent.height, format, host_data.len(),
            )));
        }

        let staging = AllocatedBuffer::staging(
            &self.allocator,
            &format!("{} staging", self.name),
            &host_data[..required as usize],
        )?;
        let image = AllocatedImage::new(
            &self.allocator,
            &self.name,
            extent,
            vk::SampleCountFlags::TYPE_1,
            format,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            format::aspect_flags(format),
        )?;

        self.staging = Some(staging);
        self.device_image = Some(image);
        self.uploaded = false;
        log::debug!("Staged image '{}' ({}x{} {:?})", self.name, extent.width, extent.height, format);
        Ok(())
    }

    pub fn record_upload_commands(&mut self, recorder: &Recorder) -> VkResult<()> {
        let (Some(staging), Some(image)) = (self.staging.as_ref(), self.device_image.as_ref()) else {
            let err = not_ready(format!("Image '{}' has no staged data to upload", self.name));
            self.last_result.set(err);
            return Err(err);
        };
        let aspect = format::aspect_flags(image.format);

        // Block the transfer until nothing still reads the image
        recorder.image_barrier(
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            ImageBarrier {
                image: image.handle,
                aspect,
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::TRANSFER_WRITE,
            },
        );

        let copy_region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: aspect,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D {
                width: image.extent.width,
                height: image.extent.height,
                depth: 1,
            },
        };
        recorder.device().cmd_copy_buffer_to_image(
            recorder.handle(),
            staging.handle,
            image.handle,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[copy_region],
        );

        // Shaders must not read before the copy lands
        recorder.image_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
            ImageBarrier {
                image: image.handle,
                aspect,
                old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
            },
        );

        self.uploaded = true;
        Ok(())
    }

    pub fn delete_host_data(&mut self) {
        self.staging = None;
    }

    pub fn delete_gpu_data(&mut self) {
        self.device_image = None;
        self.uploaded = false;
    }

    pub fn has_host_data(&self) -> bool {
        self.staging.is_some()
    }

    pub fn has_device_image(&self) -> bool {
        self.device_image.is_some()
    }

    pub fn is_uploaded(&self) -> bool {
        self.uploaded && self.device_image.is_some()
    }

    pub fn image(&self) -> vk::Image {
        self.device_image.as_ref().map_or(vk::Image::null(), |image| image.handle)
    }

    pub fn view(&self) -> vk::ImageView {
        self.device_image.as_ref().map_or(vk::ImageView::null(), |image| image.view)
    }

    pub fn staging_buffer(&self) -> vk::Buffer {
        self.staging.as_ref().map_or(vk::Buffer::null(), |buffer| buffer.handle)
    }

    pub fn extent(&self) -> Option<vk::Extent2D> {
        self.device_image.as_ref().map(|image| image.extent)
    }

    pub fn format(&self) -> Option<vk::Format> {
        self.device_image.as_ref().map(|image| image.format)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn last_result(&self) -> vk::Result {
        self.last_result.get()
    }
}
