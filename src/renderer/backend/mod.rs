//! The native-API contract the resource layer is written against.
//!
//! Everything above this module talks to a `dyn DeviceBackend`. The contract
//! mirrors an explicitly synchronized, command-buffer based API: objects are
//! plain `vk` handles, fallible calls return `VkResult`, and recording calls
//! are fire-and-forget like their native counterparts.

pub mod headless;
pub mod vulkan;

use std::ptr::NonNull;
use ash::prelude::VkResult;
use ash::vk;
use gpu_allocator::MemoryLocation;
use smallvec::SmallVec;

/// Opaque handle to a block of device memory owned by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(pub u64);

#[derive(Debug, Clone, Copy)]
pub struct DeviceLimits {
    pub min_uniform_buffer_offset_alignment: u64,
    pub max_sampler_anisotropy: f32,
    /// Sample counts usable for both color and depth framebuffer attachments
    pub framebuffer_sample_counts: vk::SampleCountFlags,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_uniform_buffer_offset_alignment: 256,
            max_sampler_anisotropy: 16.0,
            framebuffer_sample_counts: vk::SampleCountFlags::TYPE_1
                | vk::SampleCountFlags::TYPE_2
                | vk::SampleCountFlags::TYPE_4
                | vk::SampleCountFlags::TYPE_8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

#[derive(Debug, Clone)]
pub struct ImageDesc<'a> {
    pub name: &'a str,
    pub extent: vk::Extent3D,
    pub samples: vk::SampleCountFlags,
    pub format: vk::Format,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub location: MemoryLocation,
}

/// Host pointer to a mapped allocation, valid until `unmap_memory`
#[derive(Debug, Clone, Copy)]
pub struct MappedRange {
    pub ptr: NonNull<u8>,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
    pub max_anisotropy: Option<f32>,
    pub compare_op: Option<vk::CompareOp>,
    pub border_color: vk::BorderColor,
    pub max_lod: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc<'a> {
    pub vertex_module: vk::ShaderModule,
    pub fragment_module: vk::ShaderModule,
    pub layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub vertex_bindings: &'a [vk::VertexInputBindingDescription],
    pub vertex_attributes: &'a [vk::VertexInputAttributeDescription],
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub samples: vk::SampleCountFlags,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub blend: vk::PipelineColorBlendAttachmentState,
}

#[derive(Debug, Clone, Copy)]
pub struct ComputePipelineDesc {
    pub module: vk::ShaderModule,
    pub layout: vk::PipelineLayout,
}

#[derive(Debug, Clone)]
pub enum DescriptorResources {
    Buffers(SmallVec<[vk::DescriptorBufferInfo; 1]>),
    Images(SmallVec<[vk::DescriptorImageInfo; 4]>),
}

impl DescriptorResources {
    pub fn len(&self) -> usize {
        match self {
            Self::Buffers(infos) => infos.len(),
            Self::Images(infos) => infos.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct DescriptorWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub array_element: u32,
    pub descriptor_type: vk::DescriptorType,
    pub resources: DescriptorResources,
}

#[derive(Debug, Clone)]
pub struct RenderPassDesc {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub color: vk::AttachmentReference,
    pub depth: Option<vk::AttachmentReference>,
    pub resolve: Option<vk::AttachmentReference>,
    pub dependencies: Vec<vk::SubpassDependency>,
}

#[derive(Debug, Clone, Copy)]
pub struct FramebufferDesc<'a> {
    pub render_pass: vk::RenderPass,
    pub attachments: &'a [vk::ImageView],
    pub extent: vk::Extent2D,
}

/// Render pass state a secondary command buffer continues from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBufferInheritance {
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub framebuffer: vk::Framebuffer,
}

#[derive(Clone, Copy)]
pub struct RenderPassBegin<'a> {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear_values: &'a [vk::ClearValue],
    pub contents: vk::SubpassContents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitDesc<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
}

#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    /// Desired extent; backends clamp it to what the surface allows
    pub extent: vk::Extent2D,
    pub vsync: bool,
    pub min_image_count: u32,
    pub old_swapchain: vk::SwapchainKHR,
}

#[derive(Debug, Clone)]
pub struct SwapchainInfo {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

/// Primitives of an explicit graphics API.
///
/// Destroy calls with a null handle are no-ops. Recording calls assume the
/// command buffer is in the recording state; enforcing that is the job of
/// `CommandBuffer`, not of the backend.
pub trait DeviceBackend: Send + Sync {
    fn name(&self) -> &str;
    fn limits(&self) -> DeviceLimits;
    fn wait_idle(&self) -> VkResult<()>;

    // Memory
    fn create_buffer(&self, desc: &BufferDesc) -> VkResult<(vk::Buffer, AllocationId)>;
    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: AllocationId);
    fn create_image(&self, desc: &ImageDesc) -> VkResult<(vk::Image, AllocationId)>;
    fn destroy_image(&self, image: vk::Image, allocation: AllocationId);
    fn map_memory(&self, allocation: AllocationId) -> VkResult<MappedRange>;
    fn unmap_memory(&self, allocation: AllocationId);

    // Objects
    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_sampler(&self, desc: &SamplerDesc) -> VkResult<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);
    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> VkResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> VkResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> VkResult<vk::Pipeline>;
    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> VkResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    // Descriptors
    fn create_descriptor_pool(
        &self,
        pool_sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> VkResult<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>>;
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);

    // Render passes
    fn create_render_pass(&self, desc: &RenderPassDesc) -> VkResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_framebuffer(&self, desc: &FramebufferDesc) -> VkResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    // Command buffers
    fn create_command_pool(&self) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> VkResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);
    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
        inheritance: Option<&CommandBufferInheritance>,
    ) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    // Recording
    fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, begin: &RenderPassBegin);
    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer);
    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    );
    fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    );
    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    );
    fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );
    fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: vk::Viewport);
    fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: vk::Rect2D);
    fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32);
    fn cmd_execute_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        secondaries: &[vk::CommandBuffer],
    );
    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[ImageBarrier],
    );
    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );
    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );
    fn cmd_begin_debug_label(&self, command_buffer: vk::CommandBuffer, name: &str, color: [f32; 4]);
    fn cmd_end_debug_label(&self, command_buffer: vk::CommandBuffer);

    // Synchronization and queues
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Returns `Err(vk::Result::TIMEOUT)` when the timeout elapses first
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool>;
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn queue_submit(&self, submit: &SubmitDesc, fence: vk::Fence) -> VkResult<()>;
    fn queue_wait_idle(&self) -> VkResult<()>;

    // Presentation
    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<SwapchainInfo>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    /// Returns the acquired image index and whether the swapchain is suboptimal
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;
    /// Returns whether the swapchain is suboptimal
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool>;
}
