use std::sync::Arc;
use ash::prelude::VkResult;
use ash::vk;
use crate::renderer::backend::{DeviceLimits, ImageBarrier, SamplerDesc};
use crate::renderer::contexts::device_ctx::command_buffer::Recorder;
use crate::renderer::internals::format;
use crate::renderer::internals::resource_allocator::{AllocatedImage, ResourceAllocator};
use crate::renderer::internals::util::{not_ready, LastResult};
use crate::renderer::resources::image::ImageResource;
use crate::renderer::resources::{DescriptorImage, UploadableResource};

/// Filter state of a sampler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerSettings {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    /// Requested anisotropy, clamped to the device limit on creation
    pub anisotropy: Option<f32>,
    pub compare_op: Option<vk::CompareOp>,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            anisotropy: None,
            compare_op: None,
        }
    }
}

impl SamplerSettings {
    pub fn nearest() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            ..Default::default()
        }
    }

    /// Depth-comparison sampler for shadow lookups
    pub fn shadow() -> Self {
        Self {
            address_mode: vk::SamplerAddressMode::CLAMP_TO_BORDER,
            compare_op: Some(vk::CompareOp::LESS_OR_EQUAL),
            ..Default::default()
        }
    }

    pub fn with_address_mode(mut self, address_mode: vk::SamplerAddressMode) -> Self {
        self.address_mode = address_mode;
        self
    }

    pub fn with_anisotropy(mut self, anisotropy: f32) -> Self {
        self.anisotropy = Some(anisotropy);
        self
    }

    pub fn with_compare_op(mut self, compare_op: vk::CompareOp) -> Self {
        self.compare_op = Some(compare_op);
        self
    }

    pub fn to_desc(&self, limits: &DeviceLimits) -> SamplerDesc {
        SamplerDesc {
            mag_filter: self.mag_filter,
            min_filter: self.min_filter,
            mipmap_mode: self.mipmap_mode,
            address_mode_u: self.address_mode,
            address_mode_v: self.address_mode,
            address_mode_w: self.address_mode,
            // A limit of 1.0 means the device lacks the anisotropy feature
            max_anisotropy: self
                .anisotropy
                .filter(|_| limits.max_sampler_anisotropy > 1.0)
                .map(|requested| requested.clamp(1.0, limits.max_sampler_anisotropy)),
            compare_op: self.compare_op,
            border_color: vk::BorderColor::FLOAT_OPAQUE_WHITE,
            max_lod: vk::LOD_CLAMP_NONE,
        }
    }
}

/// Filter-only sampler object
pub struct Sampler {
    handle: vk::Sampler,
    settings: SamplerSettings,
    last_result: LastResult,

    allocator: ResourceAllocator,
}

impl Sampler {
    pub fn new(allocator: &ResourceAllocator, settings: SamplerSettings) -> Self {
        let last_result = LastResult::default();
        let desc = settings.to_desc(&allocator.limits());
        let handle = last_result
            .record(allocator.device().create_sampler(&desc))
            .unwrap_or(vk::Sampler::null());
        Self {
            handle,
            settings,
            last_result,
            allocator: allocator.clone(),
        }
    }

    pub fn handle(&self) -> vk::Sampler {
        self.handle
    }

    pub fn settings(&self) -> &SamplerSettings {
        &self.settings
    }

    pub fn is_valid(&self) -> bool {
        self.handle != vk::Sampler::null()
    }

    pub fn last_result(&self) -> vk::Result {
        self.last_result.get()
    }

    pub fn destroy(&mut self) {
        if self.handle != vk::Sampler::null() {
            self.allocator.device().destroy_sampler(self.handle);
            self.handle = vk::Sampler::null();
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Device-resident image with its own filter and no host upload.
///
/// Used for render targets and storage images; its upload step is the single
/// transition into the layout shaders access it in.
pub struct DeviceSampler {
    image: Option<AllocatedImage>,
    sampler: Sampler,
    storage: bool,
    transitioned: bool,
    last_result: LastResult,
}

impl DeviceSampler {
    pub fn new(
        allocator: &ResourceAllocator,
        name: &str,
        extent: vk::Extent2D,
        format: vk::Format,
        settings: SamplerSettings,
        storage: bool,
    ) -> Self {
        let last_result = LastResult::default();
        let usage = if storage {
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC
        } else if format::is_depth_format(format) {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED
        } else {
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED
        };
        let image = last_result
            .record(AllocatedImage::new(
                allocator,
                name,
                extent,
                vk::SampleCountFlags::TYPE_1,
                format,
                usage,
                format::aspect_flags(format),
            ))
            .ok();
        let sampler = Sampler::new(allocator, settings);
        if !sampler.is_valid() {
            last_result.set(sampler.last_result());
        }
        Self {
            image,
            sampler,
            storage,
            transitioned: false,
            last_result,
        }
    }

    pub fn is_storage(&self) -> bool {
        self.storage
    }

    pub fn is_valid(&self) -> bool {
        self.image.is_some() && self.sampler.is_valid()
    }

    pub fn image(&self) -> vk::Image {
        self.image.as_ref().map_or(vk::Image::null(), |image| image.handle)
    }

    pub fn last_result(&self) -> vk::Result {
        self.last_result.get()
    }

    pub fn delete_gpu_data(&mut self) {
        self.image = None;
        self.transitioned = false;
    }
}

impl UploadableResource for DeviceSampler {
    fn record_upload_commands(&mut self, recorder: &Recorder) -> VkResult<()> {
        let Some(image) = self.image.as_ref() else {
            if !self.last_result.is_success() {
                return Err(self.last_result.get());
            }
            return self.last_result.record(Err(not_ready("Device sampler has no image to transition")));
        };
        let (dst_access, new_layout) = if self.storage {
            (vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE, vk::ImageLayout::GENERAL)
        } else {
            (vk::AccessFlags::SHADER_READ, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        };
        recorder.image_barrier(
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
            ImageBarrier {
                image: image.handle,
                aspect: format::aspect_flags(image.format),
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout,
                src_access: vk::AccessFlags::empty(),
                dst_access,
            },
        );
        self.transitioned = true;
        Ok(())
    }

    fn delete_host_data(&mut self) {}
}

impl DescriptorImage for DeviceSampler {
    fn image_view(&self) -> vk::ImageView {
        self.image.as_ref().map_or(vk::ImageView::null(), |image| image.view)
    }

    fn image_layout(&self) -> vk::ImageLayout {
        if self.storage {
            vk::ImageLayout::GENERAL
        } else {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        }
    }

    fn sampler(&self) -> vk::Sampler {
        self.sampler.handle()
    }

    fn is_ready(&self) -> bool {
        self.transitioned && self.image.is_some()
    }
}

/// Uploaded image fused with a filter it owns
pub struct UploadSampler {
    image: ImageResource,
    sampler: Sampler,
}

impl UploadSampler {
    pub fn new(allocator: &ResourceAllocator, name: &str, settings: SamplerSettings) -> Self {
        Self {
            image: ImageResource::new(allocator, name),
            sampler: Sampler::new(allocator, settings),
        }
    }

    pub fn from_pixels(
        allocator: &ResourceAllocator,
        name: &str,
        settings: SamplerSettings,
        host_data: &[u8],
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> Self {
        let mut sampler = Self::new(allocator, name, settings);
        // Failure stays readable through last_result
        let _ = sampler.create_texture(host_data, extent, format);
        sampler
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

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    pub fn is_valid(&self) -> bool {
        self.image.has_device_image() && self.sampler.is_valid()
    }

    pub fn last_result(&self) -> vk::Result {
        match self.image.last_result() {
            vk::Result::SUCCESS => self.sampler.last_result(),
            err => err,
        }
    }
}

impl UploadableResource for UploadSampler {
    fn record_upload_commands(&mut self, recorder: &Recorder) -> VkResult<()> {
        self.image.record_upload_commands(recorder)
    }

    fn delete_host_data(&mut self) {
        self.image.delete_host_data();
    }
}

impl DescriptorImage for UploadSampler {
    fn image_view(&self) -> vk::ImageView {
        self.image.view()
    }

    fn sampler(&self) -> vk::Sampler {
        self.sampler.handle()
    }

    fn is_ready(&self) -> bool {
        self.image.is_uploaded()
    }
}

/// Uploaded image bound together with a filter shared between many images
pub struct CombinedSampler {
    image: ImageResource,
    sampler: Arc<Sampler>,
}

impl CombinedSampler {
    pub fn new(allocator: &ResourceAllocator, name: &str, sampler: Arc<Sampler>) -> Self {
        Self {
            image: ImageResource::new(allocator, name),
            sampler,
        }
    }

    pub fn from_pixels(
        allocator: &ResourceAllocator,
        name: &str,
        sampler: Arc<Sampler>,
        host_data: &[u8],
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> Self {
        let mut combined = Self::new(allocator, name, sampler);
        // Failure stays readable through last_result
        let _ = combined.create_texture(host_data, extent, format);
        combined
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

    pub fn shared_sampler(&self) -> &Arc<Sampler> {
        &self.sampler
    }

    pub fn is_valid(&self) -> bool {
        self.image.has_device_image() && self.sampler.is_valid()
    }

    pub fn last_result(&self) -> vk::Result {
        self.image.last_result()
    }
}

impl UploadableResource for CombinedSampler {
    fn record_upload_commands(&mut self, recorder: &Recorder) -> VkResult<()> {
        self.image.record_upload_commands(recorder)
    }

    fn delete_host_data(&mut self) {
        self.image.delete_host_data();
    }
}

impl DescriptorImage for CombinedSampler {
    fn image_view(&self) -> vk::ImageView {
        self.image.view()
    }

    fn sampler(&self) -> vk::Sampler {
        self.sampler.handle()
    }

    fn is_ready(&self) -> bool {
        self.image.is_uploaded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::headless::{FailurePoint, HeadlessDevice, ObjectKind};
    use crate::renderer::internals::transfer_ctx::TransferContext;

    fn setup() -> (Arc<HeadlessDevice>, ResourceAllocator) {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = Arc::new(HeadlessDevice::with_limits(DeviceLimits {
            max_sampler_anisotropy: 8.0,
            ..Default::default()
        }));
        let allocator = ResourceAllocator::new(device.clone()).unwrap();
        (device, allocator)
    }

    #[test]
    fn anisotropy_is_clamped_to_device_limit() {
        let (device, allocator) = setup();
        let sampler = Sampler::new(&allocator, SamplerSettings::default().with_anisotropy(16.0));
        assert!(sampler.is_valid());
        let desc = device.sampler_desc(sampler.handle()).unwrap();
        assert_eq!(desc.max_anisotropy, Some(8.0));
    }

    #[test]
    fn anisotropy_stays_off_without_device_support() {
        let limits = DeviceLimits { max_sampler_anisotropy: 1.0, ..Default::default() };
        let desc = SamplerSettings::default().with_anisotropy(16.0).to_desc(&limits);
        assert_eq!(desc.max_anisotropy, None);

        let _ = env_logger::builder().is_test(true).try_init();
        let device = Arc::new(HeadlessDevice::with_limits(limits));
        let allocator = ResourceAllocator::new(device.clone()).unwrap();
        let sampler = Sampler::new(&allocator, SamplerSettings::default().with_anisotropy(4.0));
        assert!(sampler.is_valid());
        assert_eq!(device.sampler_desc(sampler.handle()).unwrap().max_anisotropy, None);
    }

    #[test]
    fn failed_sampler_keeps_result() {
        let (device, allocator) = setup();
        device.fail_next(FailurePoint::CreateSampler, vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        let mut sampler = Sampler::new(&allocator, SamplerSettings::shadow());
        assert!(!sampler.is_valid());
        assert_eq!(sampler.last_result(), vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        sampler.destroy();
    }

    #[test]
    fn storage_image_transitions_to_general() {
        let (device, allocator) = setup();
        let mut storage = DeviceSampler::new(
            &allocator,
            "particles",
            vk::Extent2D { width: 16, height: 16 },
            vk::Format::R16G16B16A16_SFLOAT,
            SamplerSettings::nearest(),
            true,
        );
        assert!(storage.is_valid());
        assert!(!storage.is_ready());

        let transfer = TransferContext::new(&allocator).unwrap();
        transfer.immediate_submit(|recorder| storage.record_upload_commands(recorder)).unwrap();
        assert!(storage.is_ready());
        assert_eq!(device.image_layout(storage.image()), Some(vk::ImageLayout::GENERAL));
        assert_eq!(storage.image_info().image_layout, vk::ImageLayout::GENERAL);
    }

    #[test]
    fn deleted_device_sampler_is_not_ready() {
        let (_device, allocator) = setup();
        let mut target = DeviceSampler::new(
            &allocator,
            "target",
            vk::Extent2D { width: 8, height: 8 },
            vk::Format::R8G8B8A8_UNORM,
            SamplerSettings::nearest(),
            false,
        );
        assert!(target.is_valid());
        target.delete_gpu_data();

        let transfer = TransferContext::new(&allocator).unwrap();
        let result = transfer.immediate_submit(|recorder| target.record_upload_commands(recorder));
        assert_eq!(result.err(), Some(vk::Result::NOT_READY));
        assert_eq!(target.last_result(), vk::Result::NOT_READY);
        assert!(!target.is_ready());
    }

    #[test]
    fn combined_samplers_share_one_filter() {
        let (device, allocator) = setup();
        let shared = Arc::new(Sampler::new(&allocator, SamplerSettings::default()));
        let pixels = [255u8; 4 * 4 * 4];
        let extent = vk::Extent2D { width: 4, height: 4 };
        let a = CombinedSampler::from_pixels(&allocator, "a", shared.clone(), &pixels, extent, vk::Format::R8G8B8A8_SRGB);
        let b = CombinedSampler::from_pixels(&allocator, "b", shared.clone(), &pixels, extent, vk::Format::R8G8B8A8_SRGB);

        assert_eq!(a.image_info().sampler, b.image_info().sampler);
        assert_eq!(device.live_objects(ObjectKind::Sampler), 1);
        drop(shared);
        drop(a);
        assert_eq!(device.live_objects(ObjectKind::Sampler), 1);
        drop(b);
        assert_eq!(device.live_objects(ObjectKind::Sampler), 0);
    }

    #[test]
    fn upload_sampler_owns_its_filter() {
        let (device, allocator) = setup();
        let mut upload = UploadSampler::from_pixels(
            &allocator,
            "albedo",
            SamplerSettings::default(),
            &[0; 4],
            vk::Extent2D { width: 1, height: 1 },
            vk::Format::R8G8B8A8_UNORM,
        );
        assert!(upload.is_valid());
        assert!(!upload.is_ready());

        let transfer = TransferContext::new(&allocator).unwrap();
        transfer.immediate_submit(|recorder| upload.record_upload_commands(recorder)).unwrap();
        upload.delete_host_data();
        assert!(upload.is_ready());
        assert_ne!(upload.image_info().sampler, vk::Sampler::null());

        drop(upload);
        assert_eq!(device.live_objects(ObjectKind::Sampler), 0);
        assert_eq!(allocator.outstanding_allocations(), 0);
    }
}
