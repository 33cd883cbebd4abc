use ash::prelude::VkResult;
use ash::vk;
use smallvec::SmallVec;
use crate::renderer::backend::{FramebufferDesc, RenderPassDesc};
use crate::renderer::internals::resource_allocator::{AllocatedImage, ResourceAllocator};
use crate::renderer::internals::util::LastResult;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderPassConfig {
    pub color_format: vk::Format,
    /// Requested sample count, lowered to what the device supports
    pub samples: vk::SampleCountFlags,
    pub depth_format: vk::Format,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
}

impl RenderPassConfig {
    pub fn new(color_format: vk::Format, samples: vk::SampleCountFlags) -> Self {
        Self {
            color_format,
            samples,
            depth_format: vk::Format::D32_SFLOAT,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            clear_depth: 1.0,
        }
    }

    pub fn with_depth_format(mut self, format: vk::Format) -> Self {
        self.depth_format = format;
        self
    }

    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    pub fn with_clear_depth(mut self, depth: f32) -> Self {
        self.clear_depth = depth;
        self
    }
}

/// Highest supported sample count not above `requested`
pub fn clamp_samples(requested: vk::SampleCountFlags, supported: vk::SampleCountFlags) -> vk::SampleCountFlags {
    [
        vk::SampleCountFlags::TYPE_64,
        vk::SampleCountFlags::TYPE_32,
        vk::SampleCountFlags::TYPE_16,
        vk::SampleCountFlags::TYPE_8,
        vk::SampleCountFlags::TYPE_4,
        vk::SampleCountFlags::TYPE_2,
    ]
    .into_iter()
    .find(|&count| count.as_raw() <= requested.as_raw() && supported.contains(count))
    .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

fn describe(config: &RenderPassConfig, samples: vk::SampleCountFlags) -> RenderPassDesc {
    let multisampled = samples != vk::SampleCountFlags::TYPE_1;

    // Multisampled color is resolved into the presented image and then discarded
    let color = vk::AttachmentDescription::default()
        .format(config.color_format)
        .samples(samples)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(if multisampled {
            vk::AttachmentStoreOp::DONT_CARE
        } else {
            vk::AttachmentStoreOp::STORE
        })
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(if multisampled {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::PRESENT_SRC_KHR
        });

    let depth = vk::AttachmentDescription::default()
        .format(config.depth_format)
        .samples(samples)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

    let mut attachments = vec![color, depth];
    let resolve = multisampled.then(|| {
        attachments.push(
            vk::AttachmentDescription::default()
                .format(config.color_format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::DONT_CARE)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::PRESENT_SRC_KHR),
        );
        vk::AttachmentReference {
            attachment: 2,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }
    });

    let dependency = vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );

    RenderPassDesc {
        attachments,
        color: vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        },
        depth: Some(vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        }),
        resolve,
        dependencies: vec![dependency],
    }
}

/// Render pass with a depth attachment, an optional multisampled color
/// target and one framebuffer per swapchain image.
///
/// Everything sized to the viewport is rebuilt by `recreate_for_new_viewport`;
/// the native render pass itself lives as long as this object.
pub struct RenderPass {
    handle: vk::RenderPass,
    config: RenderPassConfig,
    samples: vk::SampleCountFlags,
    extent: vk::Extent2D,
    depth: Option<AllocatedImage>,
    msaa_color: Option<AllocatedImage>,
    framebuffers: Vec<vk::Framebuffer>,
    last_result: LastResult,

    allocator: ResourceAllocator,
}

impl RenderPass {
    pub fn new(
        allocator: &ResourceAllocator,
        config: RenderPassConfig,
        extent: vk::Extent2D,
        swapchain_views: &[vk::ImageView],
    ) -> Self {
        let samples = clamp_samples(config.samples, allocator.limits().framebuffer_sample_counts);
        if samples != config.samples {
            log::warn!("Requested {:?} is not supported, using {:?}", config.samples, samples);
        }
        let mut render_pass = Self {
            handle: vk::RenderPass::null(),
            config,
            samples,
            extent,
            depth: None,
            msaa_color: None,
            framebuffers: Vec::new(),
            last_result: LastResult::default(),
            allocator: allocator.clone(),
        };

        let result = allocator
            .device()
            .create_render_pass(&describe(&config, samples))
            .and_then(|handle| {
                render_pass.handle = handle;
                render_pass.create_viewport_objects(swapchain_views)
            });
        if render_pass.last_result.record(result).is_err() {
            render_pass.destroy_viewport_objects();
        }
        render_pass
    }

    fn create_viewport_objects(&mut self, swapchain_views: &[vk::ImageView]) -> VkResult<()> {
        let depth = AllocatedImage::new(
            &self.allocator,
            "depth attachment",
            self.extent,
            self.samples,
            self.config.depth_format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
        )?;
        let depth_view = depth.view;
        self.depth = Some(depth);

        let msaa_view = if self.is_multisampled() {
            let color = AllocatedImage::new(
                &self.allocator,
                "msaa color attachment",
                self.extent,
                self.samples,
                self.config.color_format,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
                vk::ImageAspectFlags::COLOR,
            )?;
            let view = color.view;
            self.msaa_color = Some(color);
            Some(view)
        } else {
            None
        };

        let device = self.allocator.device();
        for &swapchain_view in swapchain_views {
            let attachments: SmallVec<[vk::ImageView; 3]> = match msaa_view {
                Some(msaa_view) => smallvec::smallvec![msaa_view, depth_view, swapchain_view],
                None => smallvec::smallvec![swapchain_view, depth_view],
            };
            let framebuffer = device.create_framebuffer(&FramebufferDesc {
                render_pass: self.handle,
                attachments: &attachments,
                extent: self.extent,
            })?;
            self.framebuffers.push(framebuffer);
        }
        log::debug!(
            "Created {} framebuffers at {}x{} ({:?})",
            self.framebuffers.len(), self.extent.width, self.extent.height, self.samples,
        );
        Ok(())
    }

    fn destroy_viewport_objects(&mut self) {
        let device = self.allocator.device();
        for framebuffer in self.framebuffers.drain(..) {
            device.destroy_framebuffer(framebuffer);
        }
        self.depth = None;
        self.msaa_color = None;
    }

    /// Rebuilds framebuffers and attachments at `extent` for the new swapchain views
    pub fn recreate_for_new_viewport(&mut self, extent: vk::Extent2D, swapchain_views: &[vk::ImageView]) -> VkResult<()> {
        self.destroy_viewport_objects();
        self.extent = extent;
        let result = self.create_viewport_objects(swapchain_views);
        if result.is_err() {
            self.destroy_viewport_objects();
        }
        self.last_result.record(result)
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn is_valid(&self) -> bool {
        self.handle != vk::RenderPass::null() && self.depth.is_some()
    }

    pub fn last_result(&self) -> vk::Result {
        self.last_result.get()
    }

    pub fn config(&self) -> &RenderPassConfig {
        &self.config
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.samples
    }

    pub fn is_multisampled(&self) -> bool {
        self.samples != vk::SampleCountFlags::TYPE_1
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn framebuffer(&self, frame_index: usize) -> Option<vk::Framebuffer> {
        self.framebuffers.get(frame_index).copied()
    }

    pub fn framebuffers(&self) -> &[vk::Framebuffer] {
        &self.framebuffers
    }

    pub fn depth_view(&self) -> vk::ImageView {
        self.depth.as_ref().map_or(vk::ImageView::null(), |image| image.view)
    }

    pub fn msaa_view(&self) -> Option<vk::ImageView> {
        self.msaa_color.as_ref().map(|image| image.view)
    }

    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.config.clear_color = color;
    }

    pub fn set_clear_depth(&mut self, depth: f32) {
        self.config.clear_depth = depth;
    }

    /// One value per attachment, in attachment order
    pub fn clear_values(&self) -> SmallVec<[vk::ClearValue; 3]> {
        let color = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.config.clear_color,
            },
        };
        let depth = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: self.config.clear_depth,
                stencil: 0,
            },
        };
        let mut values = smallvec::smallvec![color, depth];
        if self.is_multisampled() {
            values.push(color);
        }
        values
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.destroy_viewport_objects();
        self.allocator.device().destroy_render_pass(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::*;
    use crate::renderer::backend::DeviceLimits;
    use crate::renderer::backend::headless::{FailurePoint, HeadlessDevice, ObjectKind};

    const EXTENT: vk::Extent2D = vk::Extent2D { width: 320, height: 240 };

    fn setup(limits: DeviceLimits) -> (Arc<HeadlessDevice>, ResourceAllocator) {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = Arc::new(HeadlessDevice::with_limits(limits));
        let allocator = ResourceAllocator::new(device.clone()).unwrap();
        (device, allocator)
    }

    /// Stand-ins for swapchain image views
    fn views(allocator: &ResourceAllocator, count: usize) -> Vec<AllocatedImage> {
        (0..count)
            .map(|i| {
                AllocatedImage::new(
                    allocator,
                    &format!("swapchain {}", i),
                    EXTENT,
                    vk::SampleCountFlags::TYPE_1,
                    vk::Format::B8G8R8A8_SRGB,
                    vk::ImageUsageFlags::COLOR_ATTACHMENT,
                    vk::ImageAspectFlags::COLOR,
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn sample_counts_clamp_down() {
        let supported = vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_2 | vk::SampleCountFlags::TYPE_4;
        assert_eq!(clamp_samples(vk::SampleCountFlags::TYPE_8, supported), vk::SampleCountFlags::TYPE_4);
        assert_eq!(clamp_samples(vk::SampleCountFlags::TYPE_2, supported), vk::SampleCountFlags::TYPE_2);
        assert_eq!(clamp_samples(vk::SampleCountFlags::TYPE_1, supported), vk::SampleCountFlags::TYPE_1);
        assert_eq!(
            clamp_samples(vk::SampleCountFlags::TYPE_16, vk::SampleCountFlags::TYPE_1),
            vk::SampleCountFlags::TYPE_1,
        );
    }

    #[test]
    fn multisampled_framebuffers_resolve_into_swapchain_view() {
        let (device, allocator) = setup(DeviceLimits::default());
        let swapchain = views(&allocator, 3);
        let handles: Vec<_> = swapchain.iter().map(|image| image.view).collect();
        let pass = RenderPass::new(
            &allocator,
            RenderPassConfig::new(vk::Format::B8G8R8A8_SRGB, vk::SampleCountFlags::TYPE_4),
            EXTENT,
            &handles,
        );
        assert!(pass.is_valid());
        assert_eq!(pass.framebuffers().len(), 3);

        let attachments = device.framebuffer_attachments(pass.framebuffer(1).unwrap()).unwrap();
        assert_eq!(attachments, vec![pass.msaa_view().unwrap(), pass.depth_view(), handles[1]]);
        assert_eq!(pass.clear_values().len(), 3);

        let desc = device.render_pass_desc(pass.handle()).unwrap();
        assert_eq!(desc.attachments[2].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(desc.resolve.map(|r| r.attachment), Some(2));
    }

    #[test]
    fn single_sample_pass_presents_color_directly() {
        let (device, allocator) = setup(DeviceLimits {
            framebuffer_sample_counts: vk::SampleCountFlags::TYPE_1,
            ..DeviceLimits::default()
        });
        let swapchain = views(&allocator, 2);
        let handles: Vec<_> = swapchain.iter().map(|image| image.view).collect();
        let pass = RenderPass::new(
            &allocator,
            RenderPassConfig::new(vk::Format::B8G8R8A8_SRGB, vk::SampleCountFlags::TYPE_8),
            EXTENT,
            &handles,
        );
        assert_eq!(pass.samples(), vk::SampleCountFlags::TYPE_1);
        assert!(pass.msaa_view().is_none());
        assert_eq!(
            device.framebuffer_attachments(pass.framebuffer(0).unwrap()).unwrap(),
            vec![handles[0], pass.depth_view()],
        );
        let desc = device.render_pass_desc(pass.handle()).unwrap();
        assert_eq!(desc.attachments.len(), 2);
        assert_eq!(desc.attachments[0].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn resize_rebuilds_viewport_objects_only() {
        let (device, allocator) = setup(DeviceLimits::default());
        let swapchain = views(&allocator, 3);
        let handles: Vec<_> = swapchain.iter().map(|image| image.view).collect();
        let mut pass = RenderPass::new(
            &allocator,
            RenderPassConfig::new(vk::Format::B8G8R8A8_SRGB, vk::SampleCountFlags::TYPE_2),
            EXTENT,
            &handles,
        );
        let handle = pass.handle();
        let old_framebuffers = pass.framebuffers().to_vec();
        let old_depth = pass.depth_view();

        let resized = vk::Extent2D { width: 640, height: 480 };
        pass.recreate_for_new_viewport(resized, &handles).unwrap();

        assert_eq!(pass.handle(), handle);
        assert_eq!(pass.extent(), resized);
        assert_eq!(pass.framebuffers().len(), 3);
        assert!(pass.framebuffers().iter().all(|fb| !old_framebuffers.contains(fb)));
        assert_ne!(pass.depth_view(), old_depth);
        assert!(pass.framebuffers().iter().all(|&fb| device.framebuffer_extent(fb) == Some(resized)));
        assert_eq!(device.live_objects(ObjectKind::Framebuffer), 3);
        assert_eq!(device.live_objects(ObjectKind::RenderPass), 1);
        // Three swapchain stand-ins plus depth and msaa color
        assert_eq!(device.live_objects(ObjectKind::Image), 5);
    }

    #[test]
    fn failed_framebuffer_leaves_pass_invalid() {
        let (device, allocator) = setup(DeviceLimits::default());
        let swapchain = views(&allocator, 2);
        let handles: Vec<_> = swapchain.iter().map(|image| image.view).collect();
        device.fail_next(FailurePoint::CreateFramebuffer, vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        let pass = RenderPass::new(
            &allocator,
            RenderPassConfig::new(vk::Format::B8G8R8A8_SRGB, vk::SampleCountFlags::TYPE_1),
            EXTENT,
            &handles,
        );
        assert!(!pass.is_valid());
        assert_eq!(pass.last_result(), vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        assert_eq!(device.live_objects(ObjectKind::Framebuffer), 0);
        drop(pass);
        assert_eq!(device.live_objects(ObjectKind::RenderPass), 0);
    }
}
