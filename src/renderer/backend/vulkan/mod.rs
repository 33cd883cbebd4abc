//! `DeviceBackend` on top of a real Vulkan device.

pub mod device;
pub mod instance;
pub mod swapchain;

use std::collections::HashMap;
use std::ffi::CString;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use ash::prelude::VkResult;
use ash::vk;
use color_eyre::Result;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::{AllocationError, MemoryLocation};
use winit::window::Window;
use crate::renderer::backend::{
    AllocationId, BufferDesc, CommandBufferInheritance, ComputePipelineDesc, DescriptorResources,
    DescriptorWrite, DeviceBackend, DeviceLimits, FramebufferDesc, GraphicsPipelineDesc, ImageBarrier,
    ImageDesc, LayoutBinding, MappedRange, RenderPassBegin, RenderPassDesc, SamplerDesc, SubmitDesc,
    SwapchainDesc, SwapchainInfo,
};
use crate::renderer::backend::vulkan::instance::VulkanInstance;
use crate::renderer::config::ContextConfig;

const SHADER_ENTRY: &std::ffi::CStr = c"main";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn allocation_failed(name: &str, err: AllocationError) -> vk::Result {
    log::error!("Allocation of '{}' failed: {}", name, err);
    match err {
        AllocationError::OutOfMemory => vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        _ => vk::Result::ERROR_INITIALIZATION_FAILED,
    }
}

fn full_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Vulkan device, graphics/present queue and surface for one window
pub struct VulkanDevice {
    name: String,
    limits: DeviceLimits,
    physical: vk::PhysicalDevice,
    queue_family: u32,

    logical: ash::Device,
    // vkQueueSubmit and vkQueuePresentKHR need external synchronization
    queue: Mutex<vk::Queue>,
    swapchain_loader: ash::khr::swapchain::Device,
    debug_utils: Option<ash::ext::debug_utils::Device>,

    memory_allocator: ManuallyDrop<Mutex<Allocator>>,
    allocations: Mutex<HashMap<AllocationId, Allocation>>,
    next_allocation: AtomicU64,

    surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
    _instance: VulkanInstance,
    _window: Arc<Window>,
}

impl VulkanDevice {
    pub fn new(window: Arc<Window>, config: &ContextConfig) -> Result<Self> {
        let instance = VulkanInstance::new(&config.app_name, &window, config.validation)?;
        let (surface, surface_loader) = instance.create_surface(&window)?;

        let selected = match device::select_physical_device(&instance.instance, surface, &surface_loader) {
            Ok(selected) => selected,
            Err(err) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                return Err(err);
            }
        };
        let (logical, queue) = match device::create_logical_device(&instance.instance, &selected) {
            Ok(created) => created,
            Err(err) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                return Err(err);
            }
        };

        let memory_allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: logical.clone(),
            physical_device: selected.physical,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: true,
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        });
        let memory_allocator = match memory_allocator {
            Ok(allocator) => allocator,
            Err(err) => {
                unsafe {
                    logical.destroy_device(None);
                    surface_loader.destroy_surface(surface, None);
                }
                return Err(err.into());
            }
        };

        let swapchain_loader = ash::khr::swapchain::Device::new(&instance.instance, &logical);
        let debug_utils = instance
            .validation_enabled()
            .then(|| ash::ext::debug_utils::Device::new(&instance.instance, &logical));

        Ok(Self {
            name: selected.name,
            limits: selected.limits,
            physical: selected.physical,
            queue_family: selected.queue_family,
            logical,
            queue: Mutex::new(queue),
            swapchain_loader,
            debug_utils,
            memory_allocator: ManuallyDrop::new(Mutex::new(memory_allocator)),
            allocations: Mutex::new(HashMap::new()),
            next_allocation: AtomicU64::new(1),
            surface,
            surface_loader,
            _instance: instance,
            _window: window,
        })
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> VkResult<(AllocationId, vk::DeviceMemory, vk::DeviceSize)> {
        let allocation = lock(&*self.memory_allocator)
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|err| allocation_failed(name, err))?;
        let memory = unsafe { allocation.memory() };
        let offset = allocation.offset();
        let id = AllocationId(self.next_allocation.fetch_add(1, Ordering::Relaxed));
        lock(&self.allocations).insert(id, allocation);
        Ok((id, memory, offset))
    }

    fn free(&self, id: AllocationId) {
        let allocation = lock(&self.allocations).remove(&id);
        if let Some(allocation) = allocation {
            if let Err(err) = lock(&*self.memory_allocator).free(allocation) {
                log::error!("Failed to free allocation {:?}: {}", id, err);
            }
        }
    }
}

impl DeviceBackend for VulkanDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.logical.device_wait_idle() }
    }

    fn create_buffer(&self, desc: &BufferDesc) -> VkResult<(vk::Buffer, AllocationId)> {
        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.logical.create_buffer(&info, None)? };
        let requirements = unsafe { self.logical.get_buffer_memory_requirements(buffer) };

        let (id, memory, offset) = match self.allocate(desc.name, requirements, desc.location, true) {
            Ok(allocated) => allocated,
            Err(err) => {
                unsafe { self.logical.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };
        if let Err(err) = unsafe { self.logical.bind_buffer_memory(buffer, memory, offset) } {
            self.free(id);
            unsafe { self.logical.destroy_buffer(buffer, None) };
            return Err(err);
        }

        Ok((buffer, id))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: AllocationId) {
        if buffer != vk::Buffer::null() {
            unsafe { self.logical.destroy_buffer(buffer, None) };
        }
        self.free(allocation);
    }

    fn create_image(&self, desc: &ImageDesc) -> VkResult<(vk::Image, AllocationId)> {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(desc.samples)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.logical.create_image(&info, None)? };
        let requirements = unsafe { self.logical.get_image_memory_requirements(image) };

        let linear = desc.tiling == vk::ImageTiling::LINEAR;
        let (id, memory, offset) = match self.allocate(desc.name, requirements, desc.location, linear) {
            Ok(allocated) => allocated,
            Err(err) => {
                unsafe { self.logical.destroy_image(image, None) };
                return Err(err);
            }
        };
        if let Err(err) = unsafe { self.logical.bind_image_memory(image, memory, offset) } {
            self.free(id);
            unsafe { self.logical.destroy_image(image, None) };
            return Err(err);
        }

        Ok((image, id))
    }

    fn destroy_image(&self, image: vk::Image, allocation: AllocationId) {
        if image != vk::Image::null() {
            unsafe { self.logical.destroy_image(image, None) };
        }
        self.free(allocation);
    }

    fn map_memory(&self, allocation: AllocationId) -> VkResult<MappedRange> {
        let allocations = lock(&self.allocations);
        let allocation = allocations.get(&allocation).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        // gpu-allocator keeps host-visible memory persistently mapped
        let ptr = allocation.mapped_ptr().ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        Ok(MappedRange {
            ptr: NonNull::new(ptr.as_ptr().cast::<u8>()).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?,
            size: allocation.size() as usize,
        })
    }

    fn unmap_memory(&self, _allocation: AllocationId) {}

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::default()
            .view_type(vk::ImageViewType::TYPE_2D)
            .image(image)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::R,
                g: vk::ComponentSwizzle::G,
                b: vk::ComponentSwizzle::B,
                a: vk::ComponentSwizzle::A,
            })
            .subresource_range(full_range(aspect));
        unsafe { self.logical.create_image_view(&info, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        if view != vk::ImageView::null() {
            unsafe { self.logical.destroy_image_view(view, None) };
        }
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> VkResult<vk::Sampler> {
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(desc.mag_filter)
            .min_filter(desc.min_filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_mode_u)
            .address_mode_v(desc.address_mode_v)
            .address_mode_w(desc.address_mode_w)
            .anisotropy_enable(desc.max_anisotropy.is_some())
            .max_anisotropy(desc.max_anisotropy.unwrap_or(1.0))
            .compare_enable(desc.compare_op.is_some())
            .compare_op(desc.compare_op.unwrap_or(vk::CompareOp::ALWAYS))
            .border_color(desc.border_color)
            .min_lod(0.0)
            .max_lod(desc.max_lod);
        unsafe { self.logical.create_sampler(&info, None) }
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        if sampler != vk::Sampler::null() {
            unsafe { self.logical.destroy_sampler(sampler, None) };
        }
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.logical.create_shader_module(&info, None) }
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        if module != vk::ShaderModule::null() {
            unsafe { self.logical.destroy_shader_module(module, None) };
        }
    }

    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> VkResult<vk::DescriptorSetLayout> {
        let bindings = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(binding.descriptor_type)
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stages)
            })
            .collect::<Vec<_>>();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        unsafe { self.logical.create_descriptor_set_layout(&info, None) }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        if layout != vk::DescriptorSetLayout::null() {
            unsafe { self.logical.destroy_descriptor_set_layout(layout, None) };
        }
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> VkResult<vk::PipelineLayout> {
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);
        unsafe { self.logical.create_pipeline_layout(&info, None) }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        if layout != vk::PipelineLayout::null() {
            unsafe { self.logical.destroy_pipeline_layout(layout, None) };
        }
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> VkResult<vk::Pipeline> {
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(desc.vertex_module)
                .name(SHADER_ENTRY),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(desc.fragment_module)
                .name(SHADER_ENTRY),
        ];
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(desc.vertex_bindings)
            .vertex_attribute_descriptions(desc.vertex_attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(desc.topology);
        // Viewport and scissor are dynamic so pipelines survive a resize
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(desc.polygon_mode)
            .cull_mode(desc.cull_mode)
            .front_face(desc.front_face)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(desc.samples);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_write)
            .depth_compare_op(desc.depth_compare)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0);
        let blend_attachments = [desc.blend];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .attachments(&blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default()
            .dynamic_states(&dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(desc.layout)
            .render_pass(desc.render_pass)
            .subpass(desc.subpass);

        let pipelines = unsafe {
            self.logical
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, err)| err)?
        };
        pipelines.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> VkResult<vk::Pipeline> {
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(desc.module)
            .name(SHADER_ENTRY);
        let info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(desc.layout);
        let pipelines = unsafe {
            self.logical
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, err)| err)?
        };
        pipelines.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        if pipeline != vk::Pipeline::null() {
            unsafe { self.logical.destroy_pipeline(pipeline, None) };
        }
    }

    fn create_descriptor_pool(
        &self,
        pool_sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> VkResult<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(pool_sizes)
            .max_sets(max_sets);
        unsafe { self.logical.create_descriptor_pool(&info, None) }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        if pool != vk::DescriptorPool::null() {
            unsafe { self.logical.destroy_descriptor_pool(pool, None) };
        }
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(layouts);
        unsafe { self.logical.allocate_descriptor_sets(&info) }
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let writes = writes
            .iter()
            .map(|write| {
                let info = vk::WriteDescriptorSet::default()
                    .dst_set(write.set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(write.descriptor_type);
                match &write.resources {
                    DescriptorResources::Buffers(buffers) => info.buffer_info(buffers),
                    DescriptorResources::Images(images) => info.image_info(images),
                }
            })
            .collect::<Vec<_>>();
        unsafe { self.logical.update_descriptor_sets(&writes, &[]) };
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> VkResult<vk::RenderPass> {
        let color = [desc.color];
        let resolve = desc.resolve.map(|resolve| [resolve]);
        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color);
        if let Some(depth) = desc.depth.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth);
        }
        if let Some(resolve) = resolve.as_ref() {
            subpass = subpass.resolve_attachments(resolve);
        }
        let subpasses = [subpass];

        let info = vk::RenderPassCreateInfo::default()
            .attachments(&desc.attachments)
            .subpasses(&subpasses)
            .dependencies(&desc.dependencies);
        unsafe { self.logical.create_render_pass(&info, None) }
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        if render_pass != vk::RenderPass::null() {
            unsafe { self.logical.destroy_render_pass(render_pass, None) };
        }
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> VkResult<vk::Framebuffer> {
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(desc.render_pass)
            .attachments(desc.attachments)
            .width(desc.extent.width)
            .height(desc.extent.height)
            .layers(1);
        unsafe { self.logical.create_framebuffer(&info, None) }
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        if framebuffer != vk::Framebuffer::null() {
            unsafe { self.logical.destroy_framebuffer(framebuffer, None) };
        }
    }

    fn create_command_pool(&self) -> VkResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.queue_family);
        unsafe { self.logical.create_command_pool(&info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        if pool != vk::CommandPool::null() {
            unsafe { self.logical.destroy_command_pool(pool, None) };
        }
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> VkResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);
        let buffers = unsafe { self.logical.allocate_command_buffers(&info)? };
        buffers.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        if command_buffer != vk::CommandBuffer::null() {
            unsafe { self.logical.free_command_buffers(pool, &[command_buffer]) };
        }
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
        inheritance: Option<&CommandBufferInheritance>,
    ) -> VkResult<()> {
        let inheritance_info = inheritance.map(|inheritance| {
            vk::CommandBufferInheritanceInfo::default()
                .render_pass(inheritance.render_pass)
                .subpass(inheritance.subpass)
                .framebuffer(inheritance.framebuffer)
        });
        let mut info = vk::CommandBufferBeginInfo::default().flags(usage);
        if let Some(inheritance_info) = inheritance_info.as_ref() {
            info = info.inheritance_info(inheritance_info);
        }
        unsafe { self.logical.begin_command_buffer(command_buffer, &info) }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.logical.end_command_buffer(command_buffer) }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.logical
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
    }

    fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, begin: &RenderPassBegin) {
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(begin.render_pass)
            .framebuffer(begin.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: begin.extent,
            })
            .clear_values(begin.clear_values);
        unsafe { self.logical.cmd_begin_render_pass(command_buffer, &info, begin.contents) };
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        unsafe { self.logical.cmd_end_render_pass(command_buffer) };
    }

    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe { self.logical.cmd_bind_pipeline(command_buffer, bind_point, pipeline) };
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
        unsafe {
            self.logical.cmd_bind_descriptor_sets(
                command_buffer,
                bind_point,
                layout,
                first_set,
                sets,
                dynamic_offsets,
            )
        };
    }

    fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        unsafe { self.logical.cmd_bind_vertex_buffers(command_buffer, first_binding, buffers, offsets) };
    }

    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        unsafe { self.logical.cmd_bind_index_buffer(command_buffer, buffer, offset, index_type) };
    }

    fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe { self.logical.cmd_push_constants(command_buffer, layout, stages, offset, data) };
    }

    fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: vk::Viewport) {
        unsafe { self.logical.cmd_set_viewport(command_buffer, 0, &[viewport]) };
    }

    fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: vk::Rect2D) {
        unsafe { self.logical.cmd_set_scissor(command_buffer, 0, &[scissor]) };
    }

    fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.logical
                .cmd_draw(command_buffer, vertex_count, instance_count, first_vertex, first_instance)
        };
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
        unsafe {
            self.logical.cmd_draw_indexed(
                command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }

    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.logical.cmd_dispatch(command_buffer, x, y, z) };
    }

    fn cmd_execute_commands(&self, command_buffer: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        unsafe { self.logical.cmd_execute_commands(command_buffer, secondaries) };
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[ImageBarrier],
    ) {
        let barriers = image_barriers
            .iter()
            .map(|barrier| {
                vk::ImageMemoryBarrier::default()
                    .src_access_mask(barrier.src_access)
                    .dst_access_mask(barrier.dst_access)
                    .old_layout(barrier.old_layout)
                    .new_layout(barrier.new_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(barrier.image)
                    .subresource_range(full_range(barrier.aspect))
            })
            .collect::<Vec<_>>();
        unsafe {
            self.logical.cmd_pipeline_barrier(
                command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &barriers,
            )
        };
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.logical.cmd_copy_buffer(command_buffer, src, dst, regions) };
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe { self.logical.cmd_copy_buffer_to_image(command_buffer, src, dst, dst_layout, regions) };
    }

    fn cmd_begin_debug_label(&self, command_buffer: vk::CommandBuffer, name: &str, color: [f32; 4]) {
        let Some(debug_utils) = self.debug_utils.as_ref() else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let label = vk::DebugUtilsLabelEXT::default()
            .label_name(&name)
            .color(color);
        unsafe { debug_utils.cmd_begin_debug_utils_label(command_buffer, &label) };
    }

    fn cmd_end_debug_label(&self, command_buffer: vk::CommandBuffer) {
        if let Some(debug_utils) = self.debug_utils.as_ref() {
            unsafe { debug_utils.cmd_end_debug_utils_label(command_buffer) };
        }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        unsafe { self.logical.create_fence(&info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        if fence != vk::Fence::null() {
            unsafe { self.logical.destroy_fence(fence, None) };
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        unsafe { self.logical.wait_for_fences(&[fence], true, timeout_ns) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.logical.reset_fences(&[fence]) }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.logical.get_fence_status(fence) }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        unsafe { self.logical.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        if semaphore != vk::Semaphore::null() {
            unsafe { self.logical.destroy_semaphore(semaphore, None) };
        }
    }

    fn queue_submit(&self, submit: &SubmitDesc, fence: vk::Fence) -> VkResult<()> {
        let info = vk::SubmitInfo::default()
            .command_buffers(submit.command_buffers)
            .wait_semaphores(submit.wait_semaphores)
            .wait_dst_stage_mask(submit.wait_stages)
            .signal_semaphores(submit.signal_semaphores);
        let queue = lock(&self.queue);
        unsafe { self.logical.queue_submit(*queue, &[info], fence) }
    }

    fn queue_wait_idle(&self) -> VkResult<()> {
        let queue = lock(&self.queue);
        unsafe { self.logical.queue_wait_idle(*queue) }
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<SwapchainInfo> {
        let (capabilities, formats, present_modes) = unsafe {
            (
                self.surface_loader
                    .get_physical_device_surface_capabilities(self.physical, self.surface)?,
                self.surface_loader
                    .get_physical_device_surface_formats(self.physical, self.surface)?,
                self.surface_loader
                    .get_physical_device_surface_present_modes(self.physical, self.surface)?,
            )
        };

        let surface_format = swapchain::choose_surface_format(&formats)
            .ok_or(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)?;
        let extent = swapchain::choose_extent(&capabilities, desc.extent);
        if extent.width == 0 || extent.height == 0 {
            // Minimized windows have nothing to present to
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        let present_mode = swapchain::choose_present_mode(&present_modes, desc.vsync);

        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(swapchain::choose_image_count(&capabilities, desc.min_image_count))
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(swapchain::choose_pre_transform(&capabilities))
            .composite_alpha(swapchain::choose_composite_alpha(capabilities.supported_composite_alpha))
            .present_mode(present_mode)
            .clipped(true)
            .image_array_layers(1)
            .old_swapchain(desc.old_swapchain);

        let handle = unsafe { self.swapchain_loader.create_swapchain(&info, None)? };
        let images = match unsafe { self.swapchain_loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(err) => {
                unsafe { self.swapchain_loader.destroy_swapchain(handle, None) };
                return Err(err);
            }
        };
        log::info!(
            "Swapchain {}x{} {:?} {:?} with {} images",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            images.len()
        );

        Ok(SwapchainInfo {
            handle,
            images,
            format: surface_format.format,
            extent,
        })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if swapchain != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout_ns, signal, vk::Fence::null())
        }
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let queue = lock(&self.queue);
        unsafe { self.swapchain_loader.queue_present(*queue, &info) }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.logical.device_wait_idle() {
                log::error!("Device wait idle failed during teardown: {:?}", err);
            }

            let leaked: Vec<Allocation> = lock(&self.allocations).drain().map(|(_, a)| a).collect();
            if !leaked.is_empty() {
                log::warn!("{} allocations still alive at device teardown", leaked.len());
            }
            {
                let mut allocator = lock(&*self.memory_allocator);
                for allocation in leaked {
                    let _ = allocator.free(allocation);
                }
            }
            // The allocator frees its memory blocks through the logical device
            ManuallyDrop::drop(&mut self.memory_allocator);

            self.logical.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}
