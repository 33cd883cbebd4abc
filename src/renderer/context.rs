use std::sync::Arc;
use ash::prelude::VkResult;
use ash::vk;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use winit::window::Window;
use crate::renderer::backend::{DeviceBackend, DeviceLimits, SwapchainDesc};
use crate::renderer::backend::vulkan::VulkanDevice;
use crate::renderer::config::ContextConfig;
use crate::renderer::contexts::device_ctx::command_buffer::CommandBuffer;
use crate::renderer::contexts::frame_ctx::FrameSyncPool;
use crate::renderer::contexts::frame_ctx::frame::Frame;
use crate::renderer::internals::resource_allocator::ResourceAllocator;
use crate::renderer::internals::transfer_ctx::TransferContext;
use crate::renderer::internals::util::{not_ready, validation_failed};
use crate::renderer::resources::UploadableResource;
use crate::renderer::resources::pipeline::{ComputePipeline, Pipeline, PipelineSetup};
use crate::renderer::resources::render_pass::{RenderPass, RenderPassConfig};
use crate::renderer::resources::shader::{GraphicsShaders, ShaderBinary, ShaderStage};
use crate::renderer::resources::uniform_buffer::{UniformBuffer, UniformBuffering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Device, allocator and command pool exist; nothing to present to yet
    DeviceReady,
    /// Swapchain, image views, frames and frame sync exist
    SurfaceReady,
}

/// Everything whose lifetime is tied to one swapchain
struct SwapchainState {
    handle: vk::SwapchainKHR,
    format: vk::Format,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    frames: Vec<Frame>,
    sync: FrameSyncPool,

    allocator: ResourceAllocator,
}

impl SwapchainState {
    fn new(
        allocator: &ResourceAllocator,
        config: &ContextConfig,
        extent: vk::Extent2D,
        old_swapchain: vk::SwapchainKHR,
    ) -> VkResult<Self> {
        let device = allocator.device();
        let info = device.create_swapchain(&SwapchainDesc {
            extent,
            vsync: config.vsync,
            min_image_count: config.swapchain_image_count,
            old_swapchain,
        })?;
        let sync = match FrameSyncPool::new(allocator, info.images.len()) {
            Ok(sync) => sync,
            Err(err) => {
                device.destroy_swapchain(info.handle);
                return Err(err);
            }
        };

        let mut state = Self {
            handle: info.handle,
            format: info.format,
            extent: info.extent,
            images: info.images,
            views: Vec::new(),
            frames: Vec::new(),
            sync,
            allocator: allocator.clone(),
        };
        for (index, image) in state.images.iter().enumerate() {
            let view = device.create_image_view(*image, state.format, vk::ImageAspectFlags::COLOR)?;
            state.views.push(view);
            state.frames.push(Frame::new(allocator, state.handle, index as u32)?);
        }

        Ok(state)
    }

    /// Tears down everything except the native swapchain, which is returned so
    /// the replacement can be created from it
    fn retire(mut self) -> vk::SwapchainKHR {
        std::mem::replace(&mut self.handle, vk::SwapchainKHR::null())
    }
}

impl Drop for SwapchainState {
    fn drop(&mut self) {
        let device = self.allocator.device();
        self.frames.clear();
        for view in self.views.drain(..) {
            device.destroy_image_view(view);
        }
        device.destroy_swapchain(self.handle);
    }
}

/// Composition root: owns the device, the allocator facade with its command
/// pool, the one-shot transfer context and everything tied to the swapchain.
pub struct Context {
    config: ContextConfig,
    state: ContextState,
    swapchain: Option<SwapchainState>,
    transfer: TransferContext,
    allocator: ResourceAllocator,
    device: Arc<dyn DeviceBackend>,
}

impl Context {
    pub fn new(device: Arc<dyn DeviceBackend>, config: ContextConfig) -> Result<Self> {
        let allocator = ResourceAllocator::new(device.clone())
            .wrap_err("Failed to create the command pool")?;
        let transfer = TransferContext::new(&allocator)
            .wrap_err("Failed to create the transfer context")?;

        let limits = device.limits();
        log::info!(
            "Context on {} (uniform alignment {}, samples {:?})",
            device.name(),
            limits.min_uniform_buffer_offset_alignment,
            limits.framebuffer_sample_counts
        );

        Ok(Self {
            config,
            state: ContextState::DeviceReady,
            swapchain: None,
            transfer,
            allocator,
            device,
        })
    }

    /// Brings up Vulkan for `window` and creates a swapchain at its current size
    pub fn with_window(window: Arc<Window>, config: ContextConfig) -> Result<Self> {
        let size = window.inner_size();
        let device = VulkanDevice::new(window, &config)?;
        let mut context = Self::new(Arc::new(device), config)?;
        context.init_surface(vk::Extent2D { width: size.width, height: size.height })?;
        Ok(context)
    }

    pub fn init_surface(&mut self, extent: vk::Extent2D) -> Result<()> {
        if self.state == ContextState::SurfaceReady {
            return Err(eyre!("Surface is already initialized"));
        }
        let swapchain = SwapchainState::new(&self.allocator, &self.config, extent, vk::SwapchainKHR::null())
            .wrap_err("Failed to create the swapchain")?;
        log::debug!(
            "Surface ready: {}x{} with {} images",
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.images.len()
        );
        self.swapchain = Some(swapchain);
        self.state = ContextState::SurfaceReady;
        Ok(())
    }

    /// Rebuilds the swapchain and its frames at `extent`.
    ///
    /// Render passes created against the old views must be rebuilt by their
    /// owners with `RenderPass::recreate_for_new_viewport`.
    pub fn recreate_swapchain(&mut self, extent: vk::Extent2D) -> VkResult<()> {
        if self.state != ContextState::SurfaceReady {
            return Err(not_ready("Cannot recreate a swapchain before the surface is initialized"));
        }
        self.device.wait_idle()?;

        let old_swapchain = self
            .swapchain
            .take()
            .map_or(vk::SwapchainKHR::null(), SwapchainState::retire);
        let created = SwapchainState::new(&self.allocator, &self.config, extent, old_swapchain);
        self.device.destroy_swapchain(old_swapchain);

        match created {
            Ok(swapchain) => {
                log::debug!("Swapchain recreated at {}x{}", swapchain.extent.width, swapchain.extent.height);
                self.swapchain = Some(swapchain);
                Ok(())
            }
            Err(err) => {
                log::warn!("Swapchain recreation at {}x{} failed: {:?}", extent.width, extent.height, err);
                Err(err)
            }
        }
    }

    /// Waits until the next rotating sync slot is free and acquires a swapchain
    /// image with it.
    ///
    /// `ERROR_OUT_OF_DATE_KHR` means the swapchain must be recreated first.
    pub fn get_next_frame(&mut self) -> VkResult<&Frame> {
        let device = &self.device;
        let Some(swapchain) = self.swapchain.as_mut() else {
            return match self.state {
                ContextState::DeviceReady => Err(not_ready("No surface to acquire frames from")),
                // A previous recreation failed; the caller has to try again
                ContextState::SurfaceReady => Err(vk::Result::ERROR_OUT_OF_DATE_KHR),
            };
        };

        let sync = swapchain
            .sync
            .advance()
            .ok_or_else(|| validation_failed("Swapchain has no images"))?;
        device.wait_for_fence(sync.fence, u64::MAX)?;

        let (image_index, suboptimal) = device.acquire_next_image(swapchain.handle, u64::MAX, sync.image_available)?;
        let frame = swapchain
            .frames
            .get_mut(image_index as usize)
            .ok_or_else(|| validation_failed(format!("Acquired image {} has no frame", image_index)))?;
        frame.bind(sync, suboptimal);
        Ok(frame)
    }

    /// Frame for a swapchain image, as last handed out by `get_next_frame`
    pub fn frame(&self, image_index: usize) -> Option<&Frame> {
        self.swapchain.as_ref()?.frames.get(image_index)
    }

    pub fn create_command_buffer(
        &self,
        level: vk::CommandBufferLevel,
        frame_index: usize,
    ) -> VkResult<CommandBuffer> {
        CommandBuffer::new(&self.allocator, level, frame_index)
    }

    /// Records the resource's upload commands into a one-shot command buffer,
    /// submits it and waits until the device has executed it
    pub fn upload_resource(&self, resource: &mut dyn UploadableResource) -> VkResult<()> {
        self.transfer.immediate_submit(|recorder| resource.record_upload_commands(recorder))
    }

    /// Uploads several resources in one submission
    pub fn upload_resources(&self, resources: &mut [&mut dyn UploadableResource]) -> VkResult<()> {
        if resources.is_empty() {
            return Ok(());
        }
        self.transfer.immediate_submit(|recorder| {
            resources
                .iter_mut()
                .try_for_each(|resource| resource.record_upload_commands(recorder))
        })
    }

    pub fn allocator(&self) -> &ResourceAllocator {
        &self.allocator
    }

    pub fn device(&self) -> &Arc<dyn DeviceBackend> {
        &self.device
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn limits(&self) -> DeviceLimits {
        self.allocator.limits()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.as_ref().map_or(vk::Extent2D::default(), |swapchain| swapchain.extent)
    }

    pub fn swapchain_format(&self) -> vk::Format {
        self.swapchain.as_ref().map_or(vk::Format::UNDEFINED, |swapchain| swapchain.format)
    }

    pub fn swapchain_views(&self) -> &[vk::ImageView] {
        match self.swapchain.as_ref() {
            Some(swapchain) => &swapchain.views,
            None => &[],
        }
    }

    pub fn image_count(&self) -> usize {
        self.swapchain.as_ref().map_or(0, |swapchain| swapchain.images.len())
    }

    pub fn load_shaders(&self, name: &str) -> VkResult<GraphicsShaders> {
        GraphicsShaders::load(&self.config.shader_dir, name)
    }

    pub fn load_compute_shader(&self, name: &str) -> VkResult<ShaderBinary> {
        ShaderBinary::load(&self.config.shader_dir, name, ShaderStage::Compute)
    }

    /// Render pass over the swapchain views with the configured MSAA and clear color
    pub fn create_render_pass(&self) -> Option<RenderPass> {
        if self.state != ContextState::SurfaceReady {
            log::warn!("Render pass requested before the surface is initialized");
            return None;
        }
        let config = RenderPassConfig::new(self.swapchain_format(), self.config.msaa_samples)
            .with_clear_color(self.config.clear_color);
        let render_pass = RenderPass::new(&self.allocator, config, self.extent(), self.swapchain_views());
        if !render_pass.is_valid() {
            log::warn!("Render pass creation failed: {:?}", render_pass.last_result());
            return None;
        }
        Some(render_pass)
    }

    pub fn create_pipeline(
        &self,
        setup: &PipelineSetup,
        render_pass: &RenderPass,
        shaders: &GraphicsShaders,
    ) -> Option<Pipeline> {
        let pipeline = Pipeline::new(&self.allocator, setup, render_pass, shaders);
        if !pipeline.is_valid() {
            log::warn!("Graphics pipeline creation failed: {:?}", pipeline.last_result());
            return None;
        }
        Some(pipeline)
    }

    pub fn create_compute_pipeline(&self, setup: &PipelineSetup, shader: &ShaderBinary) -> Option<ComputePipeline> {
        let pipeline = ComputePipeline::new(&self.allocator, setup, shader);
        if !pipeline.is_valid() {
            log::warn!("Compute pipeline creation failed: {:?}", pipeline.last_result());
            return None;
        }
        Some(pipeline)
    }

    /// Uniform buffer with one slot per swapchain image
    pub fn create_uniform_buffer(
        &self,
        name: &str,
        payload_size: vk::DeviceSize,
        buffering: UniformBuffering,
    ) -> Option<UniformBuffer> {
        let frame_count = self.image_count().max(1);
        let uniform = UniformBuffer::new(&self.allocator, name, payload_size, frame_count, buffering);
        if !uniform.is_valid() {
            log::warn!("Uniform buffer '{}' creation failed: {:?}", name, uniform.last_result());
            return None;
        }
        Some(uniform)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(err) = self.device.wait_idle() {
            log::error!("Device wait idle failed during teardown: {:?}", err);
        }
        self.swapchain = None;
    }
}
