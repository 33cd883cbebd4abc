//! Software implementation of the device contract.
//!
//! Memory is plain host bytes, command buffers record into a log, and
//! submission executes transfers and barriers synchronously before signaling.
//! Misuse that a validation layer would catch is logged and reported as
//! `ERROR_VALIDATION_FAILED_EXT`.

use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};
use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;
use gpu_allocator::MemoryLocation;
use crate::renderer::backend::{
    AllocationId, BufferDesc, CommandBufferInheritance, ComputePipelineDesc, DescriptorResources,
    DescriptorWrite, DeviceBackend, DeviceLimits, FramebufferDesc, GraphicsPipelineDesc,
    ImageBarrier, ImageDesc, LayoutBinding, MappedRange, RenderPassBegin, RenderPassDesc,
    SamplerDesc, SubmitDesc, SwapchainDesc, SwapchainInfo,
};
use crate::renderer::internals::format;

const SPIRV_MAGIC: u32 = 0x0723_0203;
const DEFAULT_SWAPCHAIN_IMAGES: u32 = 3;
const SURFACE_FORMAT: vk::Format = vk::Format::B8G8R8A8_SRGB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Buffer,
    Image,
    ImageView,
    Sampler,
    ShaderModule,
    DescriptorSetLayout,
    PipelineLayout,
    Pipeline,
    DescriptorPool,
    RenderPass,
    Framebuffer,
    CommandPool,
    CommandBuffer,
    Fence,
    Semaphore,
    Swapchain,
}

/// Operations that can be made to fail once with `HeadlessDevice::fail_next`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    CreateBuffer,
    CreateImage,
    MapMemory,
    CreateImageView,
    CreateSampler,
    CreateShaderModule,
    CreateDescriptorSetLayout,
    CreatePipelineLayout,
    CreatePipeline,
    CreateDescriptorPool,
    AllocateDescriptorSets,
    CreateRenderPass,
    CreateFramebuffer,
    AllocateCommandBuffer,
    QueueSubmit,
    CreateSwapchain,
    AcquireNextImage,
    QueuePresent,
}

#[derive(Debug, Clone)]
pub enum RecordedCommand {
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_value_count: usize,
        contents: vk::SubpassContents,
    },
    EndRenderPass,
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSets {
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
        dynamic_offsets: Vec<u32>,
    },
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<vk::Buffer>,
        offsets: Vec<vk::DeviceSize>,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    },
    PushConstants {
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    SetViewport(vk::Viewport),
    SetScissor(vk::Rect2D),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    ExecuteCommands(Vec<vk::CommandBuffer>),
    PipelineBarrier {
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: Vec<ImageBarrier>,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    BeginDebugLabel(String),
    EndDebugLabel,
}

/// Snapshot of a pipeline's creation parameters
#[derive(Debug, Clone)]
pub struct PipelineInfo {
    pub bind_point: vk::PipelineBindPoint,
    pub layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub samples: vk::SampleCountFlags,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Initial,
    Recording,
    Executable,
    Invalid,
}

struct AllocationRecord {
    bytes: Vec<u8>,
    host_visible: bool,
    mapped: bool,
}

struct BufferRecord {
    allocation: u64,
    size: vk::DeviceSize,
}

struct ImageRecord {
    allocation: Option<u64>,
    extent: vk::Extent3D,
    format: vk::Format,
    layout: vk::ImageLayout,
}

struct PoolRecord {
    sizes: Vec<vk::DescriptorPoolSize>,
    remaining: HashMap<vk::DescriptorType, u32>,
    max_sets: u32,
    sets: Vec<vk::DescriptorSet>,
}

struct SetRecord {
    layout: vk::DescriptorSetLayout,
    writes: Vec<DescriptorWrite>,
}

struct CommandBufferRecord {
    level: vk::CommandBufferLevel,
    state: RecordState,
    one_time: bool,
    inheritance: Option<CommandBufferInheritance>,
    commands: Vec<RecordedCommand>,
}

struct SwapchainRecord {
    images: Vec<vk::Image>,
    extent: vk::Extent2D,
    next_image: usize,
    retired: bool,
}

struct State {
    next_handle: u64,
    live: HashMap<ObjectKind, HashSet<u64>>,
    allocations: HashMap<u64, AllocationRecord>,
    buffers: HashMap<vk::Buffer, BufferRecord>,
    images: HashMap<vk::Image, ImageRecord>,
    samplers: HashMap<vk::Sampler, SamplerDesc>,
    set_layouts: HashMap<vk::DescriptorSetLayout, Vec<LayoutBinding>>,
    pipeline_layouts: HashMap<vk::PipelineLayout, (Vec<vk::DescriptorSetLayout>, Vec<vk::PushConstantRange>)>,
    pipelines: HashMap<vk::Pipeline, PipelineInfo>,
    pools: HashMap<vk::DescriptorPool, PoolRecord>,
    sets: HashMap<vk::DescriptorSet, SetRecord>,
    render_passes: HashMap<vk::RenderPass, RenderPassDesc>,
    framebuffers: HashMap<vk::Framebuffer, (Vec<vk::ImageView>, vk::Extent2D)>,
    command_buffers: HashMap<vk::CommandBuffer, CommandBufferRecord>,
    fences: HashMap<vk::Fence, bool>,
    semaphores: HashMap<vk::Semaphore, bool>,
    swapchains: HashMap<vk::SwapchainKHR, SwapchainRecord>,
    surface_extent: vk::Extent2D,
    swapchain_image_count: u32,
    failures: HashMap<FailurePoint, vk::Result>,
    submissions: usize,
    presents: usize,
    validation_errors: usize,
}

impl State {
    fn new() -> Self {
        Self {
            next_handle: 0,
            live: HashMap::new(),
            allocations: HashMap::new(),
            buffers: HashMap::new(),
            images: HashMap::new(),
            samplers: HashMap::new(),
            set_layouts: HashMap::new(),
            pipeline_layouts: HashMap::new(),
            pipelines: HashMap::new(),
            pools: HashMap::new(),
            sets: HashMap::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            command_buffers: HashMap::new(),
            fences: HashMap::new(),
            semaphores: HashMap::new(),
            swapchains: HashMap::new(),
            surface_extent: vk::Extent2D { width: 800, height: 600 },
            swapchain_image_count: DEFAULT_SWAPCHAIN_IMAGES,
            failures: HashMap::new(),
            submissions: 0,
            presents: 0,
            validation_errors: 0,
        }
    }

    fn next_raw(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn create<H: Handle>(&mut self, kind: ObjectKind) -> H {
        let raw = self.next_raw();
        self.live.entry(kind).or_default().insert(raw);
        H::from_raw(raw)
    }

    /// Returns false for handles that are null, unknown or already destroyed
    fn destroy<H: Handle>(&mut self, kind: ObjectKind, handle: H) -> bool {
        let raw = handle.as_raw();
        raw != 0 && self.live.get_mut(&kind).is_some_and(|set| set.remove(&raw))
    }

    fn check_failure(&mut self, point: FailurePoint) -> VkResult<()> {
        match self.failures.remove(&point) {
            Some(err) => {
                log::debug!("Injected failure at {:?}: {:?}", point, err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn invalid(&mut self, message: String) -> vk::Result {
        log::error!("[Headless validation] {}", message);
        self.validation_errors += 1;
        vk::Result::ERROR_VALIDATION_FAILED_EXT
    }

    fn allocate_memory(&mut self, size: vk::DeviceSize, location: MemoryLocation) -> u64 {
        let id = self.next_raw();
        self.allocations.insert(id, AllocationRecord {
            bytes: vec![0; size as usize],
            host_visible: location != MemoryLocation::GpuOnly,
            mapped: false,
        });
        id
    }

    fn record(&mut self, command_buffer: vk::CommandBuffer, command: RecordedCommand) {
        let recording = self
            .command_buffers
            .get(&command_buffer)
            .is_some_and(|cb| cb.state == RecordState::Recording);
        if !recording {
            self.invalid(format!("{:?} recorded outside of the recording state", command));
            return;
        }
        if let Some(cb) = self.command_buffers.get_mut(&command_buffer) {
            cb.commands.push(command);
        }
    }

    fn execute(&mut self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let commands = match self.command_buffers.get(&command_buffer) {
            Some(cb) if cb.state == RecordState::Executable => cb.commands.clone(),
            Some(cb) => {
                let state = cb.state;
                return Err(self.invalid(format!(
                    "Command buffer {:?} executed in state {:?}",
                    command_buffer, state,
                )));
            }
            None => return Err(self.invalid(format!("Unknown command buffer {:?}", command_buffer))),
        };

        for command in commands {
            match command {
                RecordedCommand::CopyBuffer { src, dst, regions } => {
                    for region in regions {
                        self.copy_buffer_region(src, dst, region)?;
                    }
                }
                RecordedCommand::CopyBufferToImage { src, dst, regions, .. } => {
                    for region in regions {
                        self.copy_buffer_to_image_region(src, dst, region)?;
                    }
                }
                RecordedCommand::PipelineBarrier { image_barriers, .. } => {
                    for barrier in image_barriers {
                        self.transition(barrier);
                    }
                }
                RecordedCommand::ExecuteCommands(secondaries) => {
                    for secondary in secondaries {
                        self.execute(secondary)?;
                    }
                }
                _ => {}
            }
        }

        if let Some(cb) = self.command_buffers.get_mut(&command_buffer) {
            if cb.one_time {
                cb.state = RecordState::Invalid;
            }
        }
        Ok(())
    }

    fn buffer_allocation(&mut self, buffer: vk::Buffer) -> VkResult<(u64, vk::DeviceSize)> {
        match self.buffers.get(&buffer) {
            Some(record) => Ok((record.allocation, record.size)),
            None => Err(self.invalid(format!("Unknown buffer {:?}", buffer))),
        }
    }

    fn copy_buffer_region(&mut self, src: vk::Buffer, dst: vk::Buffer, region: vk::BufferCopy) -> VkResult<()> {
        let (src_alloc, src_size) = self.buffer_allocation(src)?;
        let (dst_alloc, dst_size) = self.buffer_allocation(dst)?;
        if region.src_offset + region.size > src_size || region.dst_offset + region.size > dst_size {
            return Err(self.invalid(format!("Buffer copy {:?} out of bounds", region)));
        }
        let (from, len) = (region.src_offset as usize, region.size as usize);
        let bytes = self.allocations[&src_alloc].bytes[from..from + len].to_vec();
        let to = region.dst_offset as usize;
        if let Some(dst) = self.allocations.get_mut(&dst_alloc) {
            dst.bytes[to..to + len].copy_from_slice(&bytes);
        }
        Ok(())
    }

    fn copy_buffer_to_image_region(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        region: vk::BufferImageCopy,
    ) -> VkResult<()> {
        let (src_alloc, src_size) = self.buffer_allocation(src)?;
        let (dst_alloc, image_extent, texel, layout) = match self.images.get(&dst) {
            Some(ImageRecord { allocation: Some(alloc), extent, format: image_format, layout }) => {
                (*alloc, *extent, format::texel_size(*image_format).unwrap_or(4) as u64, *layout)
            }
            _ => return Err(self.invalid(format!("Copy into unknown image {:?}", dst))),
        };
        if layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL && layout != vk::ImageLayout::GENERAL {
            return Err(self.invalid(format!("Copy into image {:?} in layout {:?}", dst, layout)));
        }

        let row_texels = if region.buffer_row_length == 0 {
            region.image_extent.width
        } else {
            region.buffer_row_length
        } as u64;
        let row_bytes = region.image_extent.width as u64 * texel;
        let last_src = region.buffer_offset
            + (region.image_extent.height.max(1) as u64 - 1) * row_texels * texel
            + row_bytes;
        let fits_image = region.image_offset.x as u64 + region.image_extent.width as u64 <= image_extent.width as u64
            && region.image_offset.y as u64 + region.image_extent.height as u64 <= image_extent.height as u64;
        if last_src > src_size || !fits_image {
            return Err(self.invalid(format!("Buffer to image copy {:?} out of bounds", region)));
        }

        for row in 0..region.image_extent.height as u64 {
            let from = (region.buffer_offset + row * row_texels * texel) as usize;
            let to = (((region.image_offset.y as u64 + row) * image_extent.width as u64
                + region.image_offset.x as u64)
                * texel) as usize;
            let bytes = self.allocations[&src_alloc].bytes[from..from + row_bytes as usize].to_vec();
            if let Some(dst) = self.allocations.get_mut(&dst_alloc) {
                dst.bytes[to..to + bytes.len()].copy_from_slice(&bytes);
            }
        }
        Ok(())
    }

    fn transition(&mut self, barrier: ImageBarrier) {
        let current = match self.images.get(&barrier.image) {
            Some(record) => record.layout,
            None => return,
        };
        if barrier.old_layout != vk::ImageLayout::UNDEFINED && barrier.old_layout != current {
            self.invalid(format!(
                "Barrier on {:?} expects {:?} but image is in {:?}",
                barrier.image, barrier.old_layout, current,
            ));
        }
        if let Some(record) = self.images.get_mut(&barrier.image) {
            record.layout = barrier.new_layout;
        }
    }

    fn descriptor_demand(&self, layout: vk::DescriptorSetLayout) -> Option<Vec<(vk::DescriptorType, u32)>> {
        self.set_layouts
            .get(&layout)
            .map(|bindings| bindings.iter().map(|b| (b.descriptor_type, b.count)).collect())
    }
}

/// Software device used by tests and CI
pub struct HeadlessDevice {
    limits: DeviceLimits,
    state: Mutex<State>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::with_limits(DeviceLimits::default())
    }

    pub fn with_limits(limits: DeviceLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(State::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Changes the size the surface reports; swapchains of another size go out of date
    pub fn set_surface_extent(&self, extent: vk::Extent2D) {
        self.state().surface_extent = extent;
    }

    pub fn surface_extent(&self) -> vk::Extent2D {
        self.state().surface_extent
    }

    pub fn set_swapchain_image_count(&self, count: u32) {
        self.state().swapchain_image_count = count.max(1);
    }

    /// Makes the next call at `point` fail with `result`
    pub fn fail_next(&self, point: FailurePoint, result: vk::Result) {
        self.state().failures.insert(point, result);
    }

    pub fn live_objects(&self, kind: ObjectKind) -> usize {
        self.state().live.get(&kind).map_or(0, HashSet::len)
    }

    pub fn recorded_commands(&self, command_buffer: vk::CommandBuffer) -> Vec<RecordedCommand> {
        self.state()
            .command_buffers
            .get(&command_buffer)
            .map(|cb| cb.commands.clone())
            .unwrap_or_default()
    }

    /// Render pass state the buffer was last begun with, if it continues one
    pub fn command_buffer_inheritance(&self, command_buffer: vk::CommandBuffer) -> Option<CommandBufferInheritance> {
        self.state().command_buffers.get(&command_buffer).and_then(|cb| cb.inheritance)
    }

    pub fn descriptor_pool_sizes(&self, pool: vk::DescriptorPool) -> Vec<vk::DescriptorPoolSize> {
        self.state().pools.get(&pool).map(|p| p.sizes.clone()).unwrap_or_default()
    }

    pub fn descriptor_pool_max_sets(&self, pool: vk::DescriptorPool) -> u32 {
        self.state().pools.get(&pool).map_or(0, |p| p.max_sets)
    }

    /// Most recent write to `binding` of `set`
    pub fn descriptor_write(&self, set: vk::DescriptorSet, binding: u32) -> Option<DescriptorWrite> {
        self.state()
            .sets
            .get(&set)
            .and_then(|s| s.writes.iter().rev().find(|w| w.binding == binding).cloned())
    }

    pub fn descriptor_set_layout_bindings(&self, layout: vk::DescriptorSetLayout) -> Option<Vec<LayoutBinding>> {
        self.state().set_layouts.get(&layout).cloned()
    }

    pub fn pipeline_layout_set_layouts(&self, layout: vk::PipelineLayout) -> Option<Vec<vk::DescriptorSetLayout>> {
        self.state().pipeline_layouts.get(&layout).map(|(sets, _)| sets.clone())
    }

    pub fn pipeline_layout_push_constants(&self, layout: vk::PipelineLayout) -> Option<Vec<vk::PushConstantRange>> {
        self.state().pipeline_layouts.get(&layout).map(|(_, ranges)| ranges.clone())
    }

    pub fn pipeline_info(&self, pipeline: vk::Pipeline) -> Option<PipelineInfo> {
        self.state().pipelines.get(&pipeline).cloned()
    }

    pub fn sampler_desc(&self, sampler: vk::Sampler) -> Option<SamplerDesc> {
        self.state().samplers.get(&sampler).copied()
    }

    pub fn render_pass_desc(&self, render_pass: vk::RenderPass) -> Option<RenderPassDesc> {
        self.state().render_passes.get(&render_pass).cloned()
    }

    pub fn framebuffer_attachments(&self, framebuffer: vk::Framebuffer) -> Option<Vec<vk::ImageView>> {
        self.state().framebuffers.get(&framebuffer).map(|(views, _)| views.clone())
    }

    pub fn framebuffer_extent(&self, framebuffer: vk::Framebuffer) -> Option<vk::Extent2D> {
        self.state().framebuffers.get(&framebuffer).map(|(_, extent)| *extent)
    }

    pub fn image_layout(&self, image: vk::Image) -> Option<vk::ImageLayout> {
        self.state().images.get(&image).map(|record| record.layout)
    }

    pub fn image_extent(&self, image: vk::Image) -> Option<vk::Extent3D> {
        self.state().images.get(&image).map(|record| record.extent)
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        let state = self.state();
        let record = state.buffers.get(&buffer)?;
        state.allocations.get(&record.allocation).map(|a| a.bytes.clone())
    }

    pub fn image_contents(&self, image: vk::Image) -> Option<Vec<u8>> {
        let state = self.state();
        let allocation = state.images.get(&image)?.allocation?;
        state.allocations.get(&allocation).map(|a| a.bytes.clone())
    }

    pub fn read_allocation(&self, allocation: AllocationId) -> Option<Vec<u8>> {
        self.state().allocations.get(&allocation.0).map(|a| a.bytes.clone())
    }

    pub fn fence_is_signaled(&self, fence: vk::Fence) -> bool {
        self.state().fences.get(&fence).copied().unwrap_or(false)
    }

    pub fn submission_count(&self) -> usize {
        self.state().submissions
    }

    pub fn present_count(&self) -> usize {
        self.state().presents
    }

    pub fn validation_error_count(&self) -> usize {
        self.state().validation_errors
    }
}

impl DeviceBackend for HeadlessDevice {
    fn name(&self) -> &str {
        "Headless device"
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn wait_idle(&self) -> VkResult<()> {
        Ok(())
    }

    fn create_buffer(&self, desc: &BufferDesc) -> VkResult<(vk::Buffer, AllocationId)> {
        let mut state = self.state();
        state.check_failure(FailurePoint::CreateBuffer)?;
        if desc.size == 0 {
            return Err(state.invalid(format!("Buffer '{}' with zero size", desc.name)));
        }
        let allocation = state.allocate_memory(desc.size, desc.location);
        let buffer: vk::Buffer = state.create(ObjectKind::Buffer);
        state.buffers.insert(buffer, BufferRecord { allocation, size: desc.size });
        Ok((buffer, AllocationId(allocation)))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: AllocationId) {
        let mut state = self.state();
        if state.destroy(ObjectKind::Buffer, buffer) {
            state.buffers.remove(&buffer);
            state.allocations.remove(&allocation.0);
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> VkResult<(vk::Image, AllocationId)> {
        let mut state = self.state();
        state.check_failure(FailurePoint::CreateImage)?;
        let texel = format::texel_size(desc.format).unwrap_or(4) as u64;
        let size = desc.extent.width as u64 * desc.extent.height as u64 * desc.extent.depth.max(1) as u64 * texel;
        let allocation = state.allocate_memory(size, desc.location);
        let image: vk::Image = state.create(ObjectKind::Image);
        state.images.insert(image, ImageRecord {
            allocation: Some(allocation),
            extent: desc.extent,
            format: desc.format,
            layout: vk::ImageLayout::UNDEFINED,
        });
        Ok((image, AllocationId(allocation)))
    }

    fn destroy_image(&self, image: vk::Image, allocation: AllocationId) {
        let mut state = self.state();
        if state.destroy(ObjectKind::Image, image) {
            state.images.remove(&image);
            state.allocations.remove(&allocation.0);
        }
    }

    fn map_memory(&self, allocation: AllocationId) -> VkResult<MappedRange> {
        let mut state = self.state();
        state.check_failure(FailurePoint::MapMemory)?;
        let (host_visible, mapped) = match state.allocations.get(&allocation.0) {
            Some(record) => (record.host_visible, record.mapped),
            None => return Err(state.invalid(format!("Map of unknown allocation {:?}", allocation))),
        };
        if !host_visible {
            log::error!("Allocation {:?} is not host visible", allocation);
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        if mapped {
            return Err(state.invalid(format!("Allocation {:?} is already mapped", allocation)));
        }
        let record = state
            .allocations
            .get_mut(&allocation.0)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        record.mapped = true;
        let size = record.bytes.len();
        let ptr = NonNull::new(record.bytes.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Ok(MappedRange { ptr, size })
    }

    fn unmap_memory(&self, allocation: AllocationId) {
        if let Some(record) = self.state().allocations.get_mut(&allocation.0) {
            record.mapped = false;
        }
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView> {
        let mut state = self.state();
        state.check_failure(FailurePoint::CreateImageView)?;
        if !state.images.contains_key(&image) {
            return Err(state.invalid(format!("View of unknown image {:?}", image)));
        }
        Ok(state.create(ObjectKind::ImageView))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state().destroy(ObjectKind::ImageView, view);
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> VkResult<vk::Sampler> {
        let mut state = self.state();
        state.check_failure(FailurePoint::CreateSampler)?;
        if desc.max_anisotropy.is_some_and(|a| a > self.limits.max_sampler_anisotropy) {
            return Err(state.invalid(format!("Sampler anisotropy {:?} above device limit", desc.max_anisotropy)));
        }
        let sampler: vk::Sampler = state.create(ObjectKind::Sampler);
        state.samplers.insert(sampler, *desc);
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        let mut state = self.state();
        if state.destroy(ObjectKind::Sampler, sampler) {
            state.samplers.remove(&sampler);
        }
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let mut state = self.state();
        state.check_failure(FailurePoint::CreateShaderModule)?;
        if code.first() != Some(&SPIRV_MAGIC) {
            log::error!("Shader code does not start with the SPIR-V magic number");
            return Err(vk::Result::ERROR_INVALID_SHADER_NV);
        }
        Ok(state.create(ObjectKind::ShaderModule))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.state().destroy(ObjectKind::ShaderModule, module);
    }

    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> VkResult<vk::DescriptorSetLayout> {
        let mut state = self.state();
        state.check_failure(FailurePoint::CreateDescriptorSetLayout)?;
        let mut seen = HashSet::new();
        if let Some(dup) = bindings.iter().find(|b| !seen.insert(b.binding)) {
            return Err(state.invalid(format!("Duplicate layout binding {}", dup.binding)));
        }
        let layout: vk::DescriptorSetLayout = state.create(ObjectKind::DescriptorSetLayout);
        state.set_layouts.insert(layout, bindings.to_vec());
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        let mut state = self.state();
        if state.destroy(ObjectKind::DescriptorSetLayout, layout) {
            state.set_layouts.remove(&layout);
        }
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> VkResult<vk::PipelineLayout> {
        let mut state = self.state();
        state.check_failure(FailurePoint::CreatePipelineLayout)?;
        if let Some(unknown) = set_layouts.iter().find(|l| !state.set_layouts.contains_key(*l)) {
            let unknown = *unknown;
            return Err(state.invalid(format!("Unknown descriptor set layout {:?}", unknown)));
        }
        let layout: vk::PipelineLayout = state.create(ObjectKind::PipelineLayout);
        state.pipeline_layouts.insert(layout, (set_layouts.to_vec(), push_constant_ranges.to_vec()));
        Ok(layout)
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        let mut state = self.state();
        if state.destroy(ObjectKind::PipelineLayout, layout) {
            state.pipeline_layouts.remove(&layout);
        }
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> VkResult<vk::Pipeline> {
        let mut state = self.state();
        state.check_failure(FailurePoint::CreatePipeline)?;
        let modules = &state.live.get(&ObjectKind::ShaderModule);
        let modules_ok = modules.is_some_and(|m| {
            m.contains(&desc.vertex_module.as_raw()) && m.contains(&desc.fragment_module.as_raw())
        });
        if !modules_ok {
            return Err(state.invalid("Graphics pipeline with unknown shader modules".to_string()));
        }
        if !state.pipeline_layouts.contains_key(&desc.layout) {
            return Err(state.invalid(format!("Unknown pipeline layout {:?}", desc.layout)));
        }
        if !state.render_passes.contains_key(&desc.render_pass) {
            return Err(state.invalid(format!("Unknown render pass {:?}", desc.render_pass)));
        }
        let pipeline: vk::Pipeline = state.create(ObjectKind::Pipeline);
        state.pipelines.insert(pipeline, PipelineInfo {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            layout: desc.layout,
            render_pass: desc.render_pass,
            samples: desc.samples,
            vertex_bindings: desc.vertex_bindings.to_vec(),
            vertex_attributes: desc.vertex_attributes.to_vec(),
            topology: desc.topology,
        });
        Ok(pipeline)
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> VkResult<vk::Pipeline> {
        let mut state = self.state();
        state.check_failure(FailurePoint::CreatePipeline)?;
        let module_ok = state
            .live
            .get(&ObjectKind::ShaderModule)
            .is_some_and(|m| m.contains(&desc.module.as_raw()));
        if !module_ok || !state.pipeline_layouts.contains_key(&desc.layout) {
            return Err(state.invalid("Compute pipeline with unknown module or layout".to_string()));
        }
        let pipeline: vk::Pipeline = state.create(ObjectKind::Pipeline);
        state.pipelines.insert(pipeline, PipelineInfo {
            bind_point: vk::PipelineBindPoint::COMPUTE,
            layout: desc.layout,
            render_pass: vk::RenderPass::null(),
            samples: vk::SampleCountFlags::TYPE_1,
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::POINT_LIST,
        });
        Ok(pipeline)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        let mut state = self.state();
        if state.destroy(ObjectKind::Pipeline, pipeline) {
            state.pipelines.remove(&pipeline);
        }
    }

    fn create_descriptor_pool(
        &self,
        pool_sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> VkResult<vk::DescriptorPool> {
        let mut state = self.state();
        state.check_failure(FailurePoint::CreateDescriptorPool)?;
        if max_sets == 0 || pool_sizes.iter().any(|size| size.descriptor_count == 0) {
            return Err(state.invalid("Descriptor pool with zero capacity".to_string()));
        }
        let mut remaining = HashMap::new();
        for size in pool_sizes {
            *remaining.entry(size.ty).or_insert(0) += size.descriptor_count;
        }
        let pool: vk::DescriptorPool = state.create(ObjectKind::DescriptorPool);
        state.pools.insert(pool, PoolRecord {
            sizes: pool_sizes.to_vec(),
            remaining,
            max_sets,
            sets: Vec::new(),
        });
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state();
        if state.destroy(ObjectKind::DescriptorPool, pool) {
            if let Some(record) = state.pools.remove(&pool) {
                for set in record.sets {
                    state.sets.remove(&set);
                }
            }
        }
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let mut state = self.state();
        state.check_failure(FailurePoint::AllocateDescriptorSets)?;

        let mut demand: HashMap<vk::DescriptorType, u32> = HashMap::new();
        for layout in layouts {
            match state.descriptor_demand(*layout) {
                Some(bindings) => {
                    for (ty, count) in bindings {
                        *demand.entry(ty).or_insert(0) += count;
                    }
                }
                None => return Err(state.invalid(format!("Unknown descriptor set layout {:?}", layout))),
            }
        }
        let fits = match state.pools.get(&pool) {
            Some(record) => {
                record.sets.len() + layouts.len() <= record.max_sets as usize
                    && demand
                        .iter()
                        .all(|(ty, count)| record.remaining.get(ty).is_some_and(|left| left >= count))
            }
            None => return Err(state.invalid(format!("Unknown descriptor pool {:?}", pool))),
        };
        if !fits {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }

        let sets: Vec<vk::DescriptorSet> = layouts
            .iter()
            .map(|layout| {
                let raw = state.next_raw();
                let set = vk::DescriptorSet::from_raw(raw);
                state.sets.insert(set, SetRecord { layout: *layout, writes: Vec::new() });
                set
            })
            .collect();
        if let Some(record) = state.pools.get_mut(&pool) {
            for (ty, count) in demand {
                if let Some(left) = record.remaining.get_mut(&ty) {
                    *left -= count;
                }
            }
            record.sets.extend(sets.iter().copied());
        }
        Ok(sets)
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let mut state = self.state();
        for write in writes {
            let binding = state
                .sets
                .get(&write.set)
                .and_then(|set| state.set_layouts.get(&set.layout))
                .and_then(|bindings| bindings.iter().find(|b| b.binding == write.binding))
                .copied();
            let Some(binding) = binding else {
                state.invalid(format!("Write to missing binding {} of set {:?}", write.binding, write.set));
                continue;
            };
            if binding.descriptor_type != write.descriptor_type {
                state.invalid(format!(
                    "Binding {} expects {:?}, written as {:?}",
                    write.binding, binding.descriptor_type, write.descriptor_type,
                ));
                continue;
            }
            if write.array_element as usize + write.resources.len() > binding.count as usize {
                state.invalid(format!(
                    "Write of {} descriptors overflows binding {} with {} slots",
                    write.resources.len(), write.binding, binding.count,
                ));
                continue;
            }
            let kind_ok = match &write.resources {
                DescriptorResources::Buffers(_) => matches!(
                    write.descriptor_type,
                    vk::DescriptorType::UNIFORM_BUFFER
                        | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
                        | vk::DescriptorType::STORAGE_BUFFER
                        | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
                ),
                DescriptorResources::Images(_) => !matches!(
                    write.descriptor_type,
                    vk::DescriptorType::UNIFORM_BUFFER
                        | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
                        | vk::DescriptorType::STORAGE_BUFFER
                        | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
                ),
            };
            if !kind_ok {
                state.invalid(format!("Resource kind does not match {:?}", write.descriptor_type));
                continue;
            }
            if let Some(set) = state.sets.get_mut(&write.set) {
                set.writes.push(write.clone());
            }
        }
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> VkResult<vk::RenderPass> {
        let mut state = self.state();
        state.check_failure(FailurePoint::CreateRenderPass)?;
        let count = desc.attachments.len() as u32;
        let refs = [Some(desc.color), desc.depth, desc.resolve];
        if refs.iter().flatten().any(|r| r.attachment >= count) {
            return Err(state.invalid("Attachment reference out of range".to_string()));
        }
        let render_pass: vk::RenderPass = state.create(ObjectKind::RenderPass);
        state.render_passes.insert(render_pass, desc.clone());
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        let mut state = self.state();
        if state.destroy(ObjectKind::RenderPass, render_pass) {
            state.render_passes.remove(&render_pass);
        }
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> VkResult<vk::Framebuffer> {
        let mut state = self.state();
        state.check_failure(FailurePoint::CreateFramebuffer)?;
        let expected = match state.render_passes.get(&desc.render_pass) {
            Some(pass) => pass.attachments.len(),
            None => return Err(state.invalid(format!("Unknown render pass {:?}", desc.render_pass))),
        };
        if expected != desc.attachments.len() {
            return Err(state.invalid(format!(
                "Framebuffer has {} attachments, render pass expects {}",
                desc.attachments.len(), expected,
            )));
        }
        let framebuffer: vk::Framebuffer = state.create(ObjectKind::Framebuffer);
        state.framebuffers.insert(framebuffer, (desc.attachments.to_vec(), desc.extent));
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.state();
        if state.destroy(ObjectKind::Framebuffer, framebuffer) {
            state.framebuffers.remove(&framebuffer);
        }
    }

    fn create_command_pool(&self) -> VkResult<vk::CommandPool> {
        Ok(self.state().create(ObjectKind::CommandPool))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.state().destroy(ObjectKind::CommandPool, pool);
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> VkResult<vk::CommandBuffer> {
        let mut state = self.state();
        state.check_failure(FailurePoint::AllocateCommandBuffer)?;
        let pool_alive = state
            .live
            .get(&ObjectKind::CommandPool)
            .is_some_and(|pools| pools.contains(&pool.as_raw()));
        if !pool_alive {
            return Err(state.invalid(format!("Unknown command pool {:?}", pool)));
        }
        let command_buffer: vk::CommandBuffer = state.create(ObjectKind::CommandBuffer);
        state.command_buffers.insert(command_buffer, CommandBufferRecord {
            level,
            state: RecordState::Initial,
            one_time: false,
            inheritance: None,
            commands: Vec::new(),
        });
        Ok(command_buffer)
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        let mut state = self.state();
        if state.destroy(ObjectKind::CommandBuffer, command_buffer) {
            state.command_buffers.remove(&command_buffer);
        }
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
        inheritance: Option<&CommandBufferInheritance>,
    ) -> VkResult<()> {
        let mut state = self.state();
        let (level, current) = match state.command_buffers.get(&command_buffer) {
            Some(cb) => (cb.level, cb.state),
            None => return Err(state.invalid(format!("Unknown command buffer {:?}", command_buffer))),
        };
        if current == RecordState::Recording {
            return Err(state.invalid(format!("Command buffer {:?} is already recording", command_buffer)));
        }
        if level == vk::CommandBufferLevel::SECONDARY
            && usage.contains(vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE)
            && inheritance.is_none()
        {
            return Err(state.invalid("Render pass continuation without inheritance info".to_string()));
        }
        if let Some(cb) = state.command_buffers.get_mut(&command_buffer) {
            cb.state = RecordState::Recording;
            cb.one_time = usage.contains(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            cb.inheritance = inheritance.copied();
            cb.commands.clear();
        }
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state();
        match state.command_buffers.get_mut(&command_buffer) {
            Some(cb) if cb.state == RecordState::Recording => {
                cb.state = RecordState::Executable;
                Ok(())
            }
            _ => Err(state.invalid(format!("End of command buffer {:?} that is not recording", command_buffer))),
        }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state();
        match state.command_buffers.get_mut(&command_buffer) {
            Some(cb) => {
                cb.state = RecordState::Initial;
                cb.commands.clear();
                Ok(())
            }
            None => Err(state.invalid(format!("Reset of unknown command buffer {:?}", command_buffer))),
        }
    }

    fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, begin: &RenderPassBegin) {
        self.state().record(command_buffer, RecordedCommand::BeginRenderPass {
            render_pass: begin.render_pass,
            framebuffer: begin.framebuffer,
            extent: begin.extent,
            clear_value_count: begin.clear_values.len(),
            contents: begin.contents,
        });
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        self.state().record(command_buffer, RecordedCommand::EndRenderPass);
    }

    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.state().record(command_buffer, RecordedCommand::BindPipeline { bind_point, pipeline });
    }

    fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        self.state().record(command_buffer, RecordedCommand::BindDescriptorSets {
            bind_point,
            layout,
            first_set,
            sets: sets.to_vec(),
            dynamic_offsets: dynamic_offsets.to_vec(),
        });
    }

    fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        self.state().record(command_buffer, RecordedCommand::BindVertexBuffers {
            first_binding,
            buffers: buffers.to_vec(),
            offsets: offsets.to_vec(),
        });
    }

    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        self.state().record(command_buffer, RecordedCommand::BindIndexBuffer { buffer, offset, index_type });
    }

    fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.state().record(command_buffer, RecordedCommand::PushConstants {
            layout,
            stages,
            offset,
            data: data.to_vec(),
        });
    }

    fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: vk::Viewport) {
        self.state().record(command_buffer, RecordedCommand::SetViewport(viewport));
    }

    fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: vk::Rect2D) {
        self.state().record(command_buffer, RecordedCommand::SetScissor(scissor));
    }

    fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.state().record(command_buffer, RecordedCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.state().record(command_buffer, RecordedCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
    }

    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.state().record(command_buffer, RecordedCommand::Dispatch { x, y, z });
    }

    fn cmd_execute_commands(&self, command_buffer: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        let mut state = self.state();
        let all_secondary = secondaries.iter().all(|cb| {
            state
                .command_buffers
                .get(cb)
                .is_some_and(|record| record.level == vk::CommandBufferLevel::SECONDARY)
        });
        if !all_secondary {
            state.invalid("Executed command buffers must be secondary".to_string());
            return;
        }
        state.record(command_buffer, RecordedCommand::ExecuteCommands(secondaries.to_vec()));
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[ImageBarrier],
    ) {
        self.state().record(command_buffer, RecordedCommand::PipelineBarrier {
            src_stage,
            dst_stage,
            image_barriers: image_barriers.to_vec(),
        });
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.state().record(command_buffer, RecordedCommand::CopyBuffer {
            src,
            dst,
            regions: regions.to_vec(),
        });
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.state().record(command_buffer, RecordedCommand::CopyBufferToImage {
            src,
            dst,
            dst_layout,
            regions: regions.to_vec(),
        });
    }

    fn cmd_begin_debug_label(&self, command_buffer: vk::CommandBuffer, name: &str, _color: [f32; 4]) {
        self.state().record(command_buffer, RecordedCommand::BeginDebugLabel(name.to_string()));
    }

    fn cmd_end_debug_label(&self, command_buffer: vk::CommandBuffer) {
        self.state().record(command_buffer, RecordedCommand::EndDebugLabel);
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state();
        let fence: vk::Fence = state.create(ObjectKind::Fence);
        state.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state();
        if state.destroy(ObjectKind::Fence, fence) {
            state.fences.remove(&fence);
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> VkResult<()> {
        let mut state = self.state();
        match state.fences.get(&fence) {
            Some(true) => Ok(()),
            // Work executes at submit time, so an unsignaled fence never signals
            Some(false) => Err(vk::Result::TIMEOUT),
            None => Err(state.invalid(format!("Wait on unknown fence {:?}", fence))),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state();
        match state.fences.get_mut(&fence) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(state.invalid(format!("Reset of unknown fence {:?}", fence))),
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool> {
        let mut state = self.state();
        match state.fences.get(&fence) {
            Some(signaled) => Ok(*signaled),
            None => Err(state.invalid(format!("Query of unknown fence {:?}", fence))),
        }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state();
        let semaphore: vk::Semaphore = state.create(ObjectKind::Semaphore);
        state.semaphores.insert(semaphore, false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state();
        if state.destroy(ObjectKind::Semaphore, semaphore) {
            state.semaphores.remove(&semaphore);
        }
    }

    fn queue_submit(&self, submit: &SubmitDesc, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state();
        state.check_failure(FailurePoint::QueueSubmit)?;
        if submit.wait_semaphores.len() != submit.wait_stages.len() {
            return Err(state.invalid("Each wait semaphore needs a wait stage".to_string()));
        }
        if fence != vk::Fence::null() {
            match state.fences.get(&fence) {
                Some(false) => {}
                Some(true) => return Err(state.invalid(format!("Submit with fence {:?} already signaled", fence))),
                None => return Err(state.invalid(format!("Submit with unknown fence {:?}", fence))),
            }
        }
        for command_buffer in submit.command_buffers {
            let primary = state
                .command_buffers
                .get(command_buffer)
                .is_some_and(|cb| cb.level == vk::CommandBufferLevel::PRIMARY);
            if !primary {
                return Err(state.invalid(format!("Submitted {:?} is not a primary command buffer", command_buffer)));
            }
        }

        for semaphore in submit.wait_semaphores {
            match state.semaphores.get_mut(semaphore) {
                Some(signaled) if *signaled => *signaled = false,
                _ => log::warn!("Submission waits on semaphore {:?} that nothing signaled", semaphore),
            }
        }
        for command_buffer in submit.command_buffers {
            state.execute(*command_buffer)?;
        }
        for semaphore in submit.signal_semaphores {
            if let Some(signaled) = state.semaphores.get_mut(semaphore) {
                *signaled = true;
            }
        }
        if let Some(signaled) = state.fences.get_mut(&fence) {
            *signaled = true;
        }
        state.submissions += 1;
        Ok(())
    }

    fn queue_wait_idle(&self) -> VkResult<()> {
        Ok(())
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<SwapchainInfo> {
        let mut state = self.state();
        state.check_failure(FailurePoint::CreateSwapchain)?;
        if let Some(old) = state.swapchains.get_mut(&desc.old_swapchain) {
            old.retired = true;
        }

        let extent = state.surface_extent;
        let count = state.swapchain_image_count.max(desc.min_image_count);
        let images: Vec<vk::Image> = (0..count)
            .map(|_| {
                let image = vk::Image::from_raw(state.next_raw());
                state.images.insert(image, ImageRecord {
                    allocation: None,
                    extent: vk::Extent3D { width: extent.width, height: extent.height, depth: 1 },
                    format: SURFACE_FORMAT,
                    layout: vk::ImageLayout::UNDEFINED,
                });
                image
            })
            .collect();
        let handle: vk::SwapchainKHR = state.create(ObjectKind::Swapchain);
        state.swapchains.insert(handle, SwapchainRecord {
            images: images.clone(),
            extent,
            next_image: 0,
            retired: false,
        });
        log::debug!("Headless swapchain {}x{} with {} images", extent.width, extent.height, count);

        Ok(SwapchainInfo {
            handle,
            images,
            format: SURFACE_FORMAT,
            extent,
        })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state();
        if state.destroy(ObjectKind::Swapchain, swapchain) {
            if let Some(record) = state.swapchains.remove(&swapchain) {
                for image in record.images {
                    state.images.remove(&image);
                }
            }
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state();
        state.check_failure(FailurePoint::AcquireNextImage)?;
        let surface_extent = state.surface_extent;
        let index = match state.swapchains.get_mut(&swapchain) {
            Some(record) if record.retired || record.extent != surface_extent => {
                return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
            }
            Some(record) => {
                let index = record.next_image;
                record.next_image = (record.next_image + 1) % record.images.len();
                index as u32
            }
            None => return Err(state.invalid(format!("Acquire from unknown swapchain {:?}", swapchain))),
        };
        if let Some(signaled) = state.semaphores.get_mut(&signal) {
            *signaled = true;
        }
        Ok((index, false))
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let mut state = self.state();
        state.check_failure(FailurePoint::QueuePresent)?;
        for semaphore in wait_semaphores {
            if let Some(signaled) = state.semaphores.get_mut(semaphore) {
                *signaled = false;
            }
        }
        let surface_extent = state.surface_extent;
        match state.swapchains.get(&swapchain) {
            Some(record) if image_index as usize >= record.images.len() => {
                Err(state.invalid(format!("Present of image {} out of range", image_index)))
            }
            Some(record) if record.retired || record.extent != surface_extent => {
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
            }
            Some(_) => {
                state.presents += 1;
                Ok(false)
            }
            None => Err(state.invalid(format!("Present to unknown swapchain {:?}", swapchain))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> HeadlessDevice {
        let _ = env_logger::builder().is_test(true).try_init();
        HeadlessDevice::new()
    }

    fn host_buffer(device: &HeadlessDevice, size: u64) -> (vk::Buffer, AllocationId) {
        device
            .create_buffer(&BufferDesc {
                name: "host",
                size,
                usage: vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
                location: MemoryLocation::CpuToGpu,
            })
            .unwrap()
    }

    #[test]
    fn begin_while_recording_fails() {
        let device = device();
        let pool = device.create_command_pool().unwrap();
        let cb = device.allocate_command_buffer(pool, vk::CommandBufferLevel::PRIMARY).unwrap();
        device.begin_command_buffer(cb, vk::CommandBufferUsageFlags::empty(), None).unwrap();
        assert_eq!(
            device.begin_command_buffer(cb, vk::CommandBufferUsageFlags::empty(), None),
            Err(vk::Result::ERROR_VALIDATION_FAILED_EXT),
        );
    }

    #[test]
    fn submit_executes_copies_and_signals() {
        let device = device();
        let (src, src_alloc) = host_buffer(&device, 8);
        let (dst, _) = host_buffer(&device, 8);
        let range = device.map_memory(src_alloc).unwrap();
        unsafe { std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), range.ptr.as_ptr(), 4) };
        device.unmap_memory(src_alloc);

        let pool = device.create_command_pool().unwrap();
        let cb = device.allocate_command_buffer(pool, vk::CommandBufferLevel::PRIMARY).unwrap();
        device.begin_command_buffer(cb, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, None).unwrap();
        device.cmd_copy_buffer(cb, src, dst, &[vk::BufferCopy { src_offset: 0, dst_offset: 4, size: 4 }]);
        device.end_command_buffer(cb).unwrap();

        let fence = device.create_fence(false).unwrap();
        device
            .queue_submit(&SubmitDesc { command_buffers: &[cb], ..Default::default() }, fence)
            .unwrap();
        assert!(device.fence_is_signaled(fence));
        assert_eq!(device.buffer_contents(dst).unwrap(), vec![0, 0, 0, 0, 1, 2, 3, 4]);

        // a signaled fence must be reset before it is reused
        device.begin_command_buffer(cb, vk::CommandBufferUsageFlags::empty(), None).unwrap();
        device.end_command_buffer(cb).unwrap();
        assert_eq!(
            device.queue_submit(&SubmitDesc { command_buffers: &[cb], ..Default::default() }, fence),
            Err(vk::Result::ERROR_VALIDATION_FAILED_EXT),
        );
    }

    #[test]
    fn recording_outside_begin_is_flagged() {
        let device = device();
        let pool = device.create_command_pool().unwrap();
        let cb = device.allocate_command_buffer(pool, vk::CommandBufferLevel::PRIMARY).unwrap();
        device.cmd_draw(cb, 3, 1, 0, 0);
        assert!(device.recorded_commands(cb).is_empty());
        assert_eq!(device.validation_error_count(), 1);
    }

    #[test]
    fn resized_surface_makes_swapchain_out_of_date() {
        let device = device();
        let info = device
            .create_swapchain(&SwapchainDesc {
                extent: vk::Extent2D { width: 800, height: 600 },
                vsync: true,
                min_image_count: 2,
                old_swapchain: vk::SwapchainKHR::null(),
            })
            .unwrap();
        assert_eq!(info.images.len(), 3);
        let semaphore = device.create_semaphore().unwrap();
        assert_eq!(device.acquire_next_image(info.handle, u64::MAX, semaphore), Ok((0, false)));
        assert_eq!(device.acquire_next_image(info.handle, u64::MAX, semaphore), Ok((1, false)));

        device.set_surface_extent(vk::Extent2D { width: 1024, height: 768 });
        assert_eq!(
            device.acquire_next_image(info.handle, u64::MAX, semaphore),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR),
        );
        assert_eq!(device.queue_present(info.handle, 0, &[]), Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
    }

    #[test]
    fn gpu_only_memory_does_not_map() {
        let device = device();
        let (_, allocation) = device
            .create_buffer(&BufferDesc {
                name: "gpu",
                size: 4,
                usage: vk::BufferUsageFlags::VERTEX_BUFFER,
                location: MemoryLocation::GpuOnly,
            })
            .unwrap();
        assert_eq!(device.map_memory(allocation).err(), Some(vk::Result::ERROR_MEMORY_MAP_FAILED));
    }

    #[test]
    fn pool_capacity_is_enforced() {
        let device = device();
        let layout = device
            .create_descriptor_set_layout(&[LayoutBinding {
                binding: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                count: 1,
                stages: vk::ShaderStageFlags::VERTEX,
            }])
            .unwrap();
        let pool = device
            .create_descriptor_pool(
                &[vk::DescriptorPoolSize { ty: vk::DescriptorType::UNIFORM_BUFFER, descriptor_count: 2 }],
                2,
            )
            .unwrap();
        assert_eq!(device.allocate_descriptor_sets(pool, &[layout, layout]).unwrap().len(), 2);
        assert_eq!(
            device.allocate_descriptor_sets(pool, &[layout]),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY),
        );
    }

    #[test]
    fn shader_modules_need_spirv_magic() {
        let device = device();
        assert!(device.create_shader_module(&[SPIRV_MAGIC, 0x0001_0000]).is_ok());
        assert_eq!(device.create_shader_module(&[0xdead_beef]), Err(vk::Result::ERROR_INVALID_SHADER_NV));
        assert_eq!(device.create_shader_module(&[]), Err(vk::Result::ERROR_INVALID_SHADER_NV));
    }
}
