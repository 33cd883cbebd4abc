use std::sync::Arc;
use ash::prelude::VkResult;
use ash::vk;
use crate::renderer::backend::{ComputePipelineDesc, GraphicsPipelineDesc, LayoutBinding};
use crate::renderer::contexts::device_ctx::command_buffer::Recorder;
use crate::renderer::internals::descriptor_set_layout_builder::DescriptorSetLayoutBuilder;
use crate::renderer::internals::resource_allocator::ResourceAllocator;
use crate::renderer::internals::util::{LastResult, validation_failed};
use crate::renderer::resources::descriptor_set::DescriptorSet;
use crate::renderer::resources::render_pass::RenderPass;
use crate::renderer::resources::shader::{GraphicsShaders, ShaderBinary, ShaderModule, ShaderStage};
use crate::renderer::resources::{BindableResource, Drawer};

/// Fixed-function state, vertex inputs and descriptor reservations for a
/// pipeline, accumulated before creation
#[derive(Clone)]
pub struct PipelineSetup {
    topology: vk::PrimitiveTopology,
    polygon_mode: vk::PolygonMode,
    cull_mode: vk::CullModeFlags,
    front_face: vk::FrontFace,
    depth_test: bool,
    depth_write: bool,
    depth_compare: vk::CompareOp,
    blend: vk::PipelineColorBlendAttachmentState,
    vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    layout: DescriptorSetLayoutBuilder,
    push_constants: Option<vk::PushConstantRange>,
}

impl Default for PipelineSetup {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            blend: Self::disabled_blend(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            layout: DescriptorSetLayoutBuilder::new(),
            push_constants: None,
        }
    }
}

impl PipelineSetup {
    pub fn new() -> Self {
        Self::default()
    }

    fn disabled_blend() -> vk::PipelineColorBlendAttachmentState {
        vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
    }

    pub fn with_input_topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_polygon_mode(mut self, mode: vk::PolygonMode) -> Self {
        self.polygon_mode = mode;
        self
    }

    pub fn with_cull_mode(mut self, cull_mode: vk::CullModeFlags, front_face: vk::FrontFace) -> Self {
        self.cull_mode = cull_mode;
        self.front_face = front_face;
        self
    }

    /// `compare` defaults to `LESS_OR_EQUAL`; disabling also disables writes
    pub fn with_depth_test(mut self, enable: bool, compare: Option<vk::CompareOp>) -> Self {
        self.depth_test = enable;
        self.depth_write = enable;
        self.depth_compare = match (enable, compare) {
            (true, Some(compare)) => compare,
            (true, None) => vk::CompareOp::LESS_OR_EQUAL,
            (false, _) => vk::CompareOp::ALWAYS,
        };
        self
    }

    pub fn with_depth_write(mut self, enable: bool) -> Self {
        self.depth_write = enable;
        self
    }

    pub fn with_blending_disabled(mut self) -> Self {
        self.blend = Self::disabled_blend();
        self
    }

    // Transparent objects must be drawn after the opaque ones
    pub fn with_alpha_blending_enabled(self) -> Self {
        self.with_blend(
            (vk::BlendFactor::SRC_ALPHA, vk::BlendFactor::ONE_MINUS_SRC_ALPHA, vk::BlendOp::ADD),
            (vk::BlendFactor::ONE, vk::BlendFactor::ZERO, vk::BlendOp::ADD),
        )
    }

    pub fn with_additive_blending_enabled(self) -> Self {
        self.with_blend(
            (vk::BlendFactor::ONE, vk::BlendFactor::DST_ALPHA, vk::BlendOp::ADD),
            (vk::BlendFactor::ONE, vk::BlendFactor::ZERO, vk::BlendOp::ADD),
        )
    }

    /// Separate `(src, dst, op)` for the color and alpha channels
    pub fn with_blend(
        mut self,
        color: (vk::BlendFactor, vk::BlendFactor, vk::BlendOp),
        alpha: (vk::BlendFactor, vk::BlendFactor, vk::BlendOp),
    ) -> Self {
        self.blend = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(true)
            .src_color_blend_factor(color.0)
            .dst_color_blend_factor(color.1)
            .color_blend_op(color.2)
            .src_alpha_blend_factor(alpha.0)
            .dst_alpha_blend_factor(alpha.1)
            .alpha_blend_op(alpha.2);
        self
    }

    /// Adds one vertex attribute. Its location is the number of attributes
    /// added before it; the binding's stride grows by `size`.
    pub fn add_vertex_input(
        &mut self,
        format: vk::Format,
        offset: u32,
        size: u32,
        binding: u32,
        is_instanced: bool,
    ) -> u32 {
        let location = self.vertex_attributes.len() as u32;
        self.vertex_attributes.push(vk::VertexInputAttributeDescription {
            location,
            binding,
            format,
            offset,
        });

        let input_rate = if is_instanced {
            vk::VertexInputRate::INSTANCE
        } else {
            vk::VertexInputRate::VERTEX
        };
        match self.vertex_bindings.iter_mut().find(|b| b.binding == binding) {
            Some(existing) => {
                existing.stride += size;
                if is_instanced {
                    existing.input_rate = input_rate;
                }
            }
            None => self.vertex_bindings.push(vk::VertexInputBindingDescription {
                binding,
                stride: size,
                input_rate,
            }),
        }
        location
    }

    fn reserve(&mut self, descriptor_type: vk::DescriptorType, stages: vk::ShaderStageFlags, count: u32) -> u32 {
        self.layout.push_next(descriptor_type, count.max(1), stages)
    }

    pub fn reserve_uniform_buffer(&mut self, stages: vk::ShaderStageFlags, count: u32) -> u32 {
        self.reserve(vk::DescriptorType::UNIFORM_BUFFER, stages, count)
    }

    pub fn reserve_dynamic_uniform_buffer(&mut self, stages: vk::ShaderStageFlags, count: u32) -> u32 {
        self.reserve(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, stages, count)
    }

    pub fn reserve_combined_sampler(&mut self, stages: vk::ShaderStageFlags, count: u32) -> u32 {
        self.reserve(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stages, count)
    }

    pub fn reserve_sampler(&mut self, stages: vk::ShaderStageFlags, count: u32) -> u32 {
        self.reserve(vk::DescriptorType::SAMPLER, stages, count)
    }

    pub fn reserve_texture(&mut self, stages: vk::ShaderStageFlags, count: u32) -> u32 {
        self.reserve(vk::DescriptorType::SAMPLED_IMAGE, stages, count)
    }

    pub fn reserve_storage_image(&mut self, stages: vk::ShaderStageFlags, count: u32) -> u32 {
        self.reserve(vk::DescriptorType::STORAGE_IMAGE, stages, count)
    }

    /// Single push constant range starting at offset 0
    pub fn enable_push_constants(&mut self, stages: vk::ShaderStageFlags, size: u32) {
        self.push_constants = Some(vk::PushConstantRange {
            stage_flags: stages,
            offset: 0,
            size,
        });
    }

    pub fn bindings(&self) -> &[LayoutBinding] {
        self.layout.bindings()
    }

    pub fn vertex_bindings(&self) -> &[vk::VertexInputBindingDescription] {
        &self.vertex_bindings
    }

    pub fn vertex_attributes(&self) -> &[vk::VertexInputAttributeDescription] {
        &self.vertex_attributes
    }

    pub fn blend(&self) -> vk::PipelineColorBlendAttachmentState {
        self.blend
    }
}

/// Descriptor-set layout plus pipeline layout, shared by a pipeline and every
/// descriptor set minted from it
pub struct PipelineLayout {
    handle: vk::PipelineLayout,
    set_layout: vk::DescriptorSetLayout,
    bindings: Vec<LayoutBinding>,
    push_constant_range: Option<vk::PushConstantRange>,
    bind_point: vk::PipelineBindPoint,

    allocator: ResourceAllocator,
}

impl PipelineLayout {
    /// The set layout is only created when at least one binding was reserved
    pub fn new(
        allocator: &ResourceAllocator,
        setup: &PipelineSetup,
        bind_point: vk::PipelineBindPoint,
    ) -> VkResult<Self> {
        let device = allocator.device();
        let set_layout = if setup.layout.is_empty() {
            vk::DescriptorSetLayout::null()
        } else {
            setup.layout.build(device.as_ref())?
        };

        let set_layouts: &[vk::DescriptorSetLayout] = if set_layout == vk::DescriptorSetLayout::null() {
            &[]
        } else {
            std::slice::from_ref(&set_layout)
        };
        let push_ranges: &[vk::PushConstantRange] = setup.push_constants.as_slice();
        let handle = match device.create_pipeline_layout(set_layouts, push_ranges) {
            Ok(handle) => handle,
            Err(err) => {
                device.destroy_descriptor_set_layout(set_layout);
                return Err(err);
            }
        };

        Ok(Self {
            handle,
            set_layout,
            bindings: setup.layout.bindings().to_vec(),
            push_constant_range: setup.push_constants,
            bind_point,
            allocator: allocator.clone(),
        })
    }

    pub fn handle(&self) -> vk::PipelineLayout {
        self.handle
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    pub fn has_set_layout(&self) -> bool {
        self.set_layout != vk::DescriptorSetLayout::null()
    }

    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    pub fn binding(&self, index: u32) -> Option<&LayoutBinding> {
        self.bindings.iter().find(|b| b.binding == index)
    }

    pub fn push_constant_range(&self) -> Option<vk::PushConstantRange> {
        self.push_constant_range
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        let device = self.allocator.device();
        device.destroy_pipeline_layout(self.handle);
        device.destroy_descriptor_set_layout(self.set_layout);
    }
}

/// Graphics pipeline bound to one render pass.
///
/// Creation failures leave the object half-built with the failing code in
/// `last_result()`; such a pipeline must not be bound.
pub struct Pipeline {
    handle: vk::Pipeline,
    layout: Option<Arc<PipelineLayout>>,
    modules: Vec<ShaderModule>,
    samples: vk::SampleCountFlags,
    last_result: LastResult,

    allocator: ResourceAllocator,
}

impl Pipeline {
    pub fn new(
        allocator: &ResourceAllocator,
        setup: &PipelineSetup,
        render_pass: &RenderPass,
        shaders: &GraphicsShaders,
    ) -> Self {
        let mut pipeline = Self {
            handle: vk::Pipeline::null(),
            layout: None,
            modules: Vec::with_capacity(2),
            samples: render_pass.samples(),
            last_result: LastResult::default(),
            allocator: allocator.clone(),
        };
        let result = pipeline.build(setup, render_pass, shaders);
        let _ = pipeline.last_result.record(result);
        pipeline
    }

    fn build(&mut self, setup: &PipelineSetup, render_pass: &RenderPass, shaders: &GraphicsShaders) -> VkResult<()> {
        if shaders.vertex.stage != ShaderStage::Vertex || shaders.fragment.stage != ShaderStage::Fragment {
            return Err(validation_failed("Graphics pipeline needs a vertex and a fragment shader"));
        }
        let vertex = ShaderModule::new(&self.allocator, &shaders.vertex)?;
        let vertex_module = vertex.handle();
        self.modules.push(vertex);
        let fragment = ShaderModule::new(&self.allocator, &shaders.fragment)?;
        let fragment_module = fragment.handle();
        self.modules.push(fragment);

        let layout = Arc::new(PipelineLayout::new(&self.allocator, setup, vk::PipelineBindPoint::GRAPHICS)?);
        let layout_handle = layout.handle();
        self.layout = Some(layout);

        self.handle = self.allocator.device().create_graphics_pipeline(&GraphicsPipelineDesc {
            vertex_module,
            fragment_module,
            layout: layout_handle,
            render_pass: render_pass.handle(),
            subpass: 0,
            vertex_bindings: &setup.vertex_bindings,
            vertex_attributes: &setup.vertex_attributes,
            topology: setup.topology,
            polygon_mode: setup.polygon_mode,
            cull_mode: setup.cull_mode,
            front_face: setup.front_face,
            samples: self.samples,
            depth_test: setup.depth_test,
            depth_write: setup.depth_write,
            depth_compare: setup.depth_compare,
            blend: setup.blend,
        })?;
        log::debug!(
            "Created graphics pipeline with {} bindings and {} vertex attributes",
            setup.bindings().len(),
            setup.vertex_attributes.len(),
        );
        Ok(())
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn is_valid(&self) -> bool {
        self.handle != vk::Pipeline::null()
    }

    pub fn last_result(&self) -> vk::Result {
        self.last_result.get()
    }

    pub fn layout(&self) -> Option<&Arc<PipelineLayout>> {
        self.layout.as_ref()
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.samples
    }

    /// Mints a descriptor set with one native set per swapchain image
    pub fn create_descriptor_set(&self, image_count: usize) -> VkResult<DescriptorSet> {
        mint_descriptor_set(&self.allocator, self.layout.as_ref(), image_count)
    }
}

fn mint_descriptor_set(
    allocator: &ResourceAllocator,
    layout: Option<&Arc<PipelineLayout>>,
    image_count: usize,
) -> VkResult<DescriptorSet> {
    match layout {
        Some(layout) if layout.has_set_layout() => Ok(DescriptorSet::new(allocator, layout.clone(), image_count)),
        Some(_) => Err(validation_failed("Pipeline reserved no descriptor bindings")),
        None => Err(validation_failed("Pipeline layout was never created")),
    }
}

fn bind_pipeline(
    recorder: &Recorder,
    bind_point: vk::PipelineBindPoint,
    pipeline: vk::Pipeline,
    last_result: &LastResult,
) -> VkResult<()> {
    if pipeline == vk::Pipeline::null() {
        let err = validation_failed("Cannot bind a pipeline that failed to build");
        last_result.set(err);
        return Err(err);
    }
    recorder.device().cmd_bind_pipeline(recorder.handle(), bind_point, pipeline);
    Ok(())
}

impl BindableResource for Pipeline {
    fn record_bind(&self, recorder: &Recorder) -> VkResult<()> {
        bind_pipeline(recorder, vk::PipelineBindPoint::GRAPHICS, self.handle, &self.last_result)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.allocator.device().destroy_pipeline(self.handle);
    }
}

/// Single compute stage dispatched with a fixed work group count
pub struct ComputePipeline {
    handle: vk::Pipeline,
    layout: Option<Arc<PipelineLayout>>,
    module: Option<ShaderModule>,
    work_groups: [u32; 3],
    last_result: LastResult,

    allocator: ResourceAllocator,
}

impl ComputePipeline {
    pub fn new(allocator: &ResourceAllocator, setup: &PipelineSetup, shader: &ShaderBinary) -> Self {
        let mut pipeline = Self {
            handle: vk::Pipeline::null(),
            layout: None,
            module: None,
            work_groups: [1, 1, 1],
            last_result: LastResult::default(),
            allocator: allocator.clone(),
        };
        let result = pipeline.build(setup, shader);
        let _ = pipeline.last_result.record(result);
        pipeline
    }

    fn build(&mut self, setup: &PipelineSetup, shader: &ShaderBinary) -> VkResult<()> {
        if shader.stage != ShaderStage::Compute {
            return Err(validation_failed("Compute pipeline needs a compute shader"));
        }
        let module = ShaderModule::new(&self.allocator, shader)?;
        let module_handle = module.handle();
        self.module = Some(module);

        let layout = Arc::new(PipelineLayout::new(&self.allocator, setup, vk::PipelineBindPoint::COMPUTE)?);
        let layout_handle = layout.handle();
        self.layout = Some(layout);

        self.handle = self.allocator.device().create_compute_pipeline(&ComputePipelineDesc {
            module: module_handle,
            layout: layout_handle,
        })?;
        Ok(())
    }

    pub fn set_work_group_xyz(&mut self, x: u32, y: u32, z: u32) {
        self.work_groups = [x, y, z];
    }

    pub fn work_groups(&self) -> [u32; 3] {
        self.work_groups
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn is_valid(&self) -> bool {
        self.handle != vk::Pipeline::null()
    }

    pub fn last_result(&self) -> vk::Result {
        self.last_result.get()
    }

    pub fn layout(&self) -> Option<&Arc<PipelineLayout>> {
        self.layout.as_ref()
    }

    pub fn create_descriptor_set(&self, image_count: usize) -> VkResult<DescriptorSet> {
        mint_descriptor_set(&self.allocator, self.layout.as_ref(), image_count)
    }
}

impl BindableResource for ComputePipeline {
    fn record_bind(&self, recorder: &Recorder) -> VkResult<()> {
        bind_pipeline(recorder, vk::PipelineBindPoint::COMPUTE, self.handle, &self.last_result)
    }
}

impl Drawer for ComputePipeline {
    fn record_draw(&self, recorder: &Recorder) -> VkResult<()> {
        if self.handle == vk::Pipeline::null() {
            return self.last_result.record(Err(validation_failed(
                "Cannot dispatch a pipeline that failed to build",
            )));
        }
        let [x, y, z] = self.work_groups;
        recorder.device().cmd_dispatch(recorder.handle(), x, y, z);
        Ok(())
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        self.allocator.device().destroy_pipeline(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use crate::renderer::backend::DeviceBackend;
    use super::*;
    use crate::renderer::backend::headless::{FailurePoint, HeadlessDevice, ObjectKind, RecordedCommand};
    use crate::renderer::resources::render_pass::RenderPassConfig;
    use crate::renderer::resources::shader::tests::spirv_stub;

    fn setup() -> (Arc<HeadlessDevice>, ResourceAllocator) {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = Arc::new(HeadlessDevice::new());
        let allocator = ResourceAllocator::new(device.clone()).unwrap();
        (device, allocator)
    }

    fn shaders() -> GraphicsShaders {
        GraphicsShaders {
            vertex: ShaderBinary::from_words(ShaderStage::Vertex, spirv_stub()),
            fragment: ShaderBinary::from_words(ShaderStage::Fragment, spirv_stub()),
        }
    }

    fn render_pass(allocator: &ResourceAllocator, views: &[vk::ImageView]) -> RenderPass {
        RenderPass::new(
            allocator,
            RenderPassConfig::new(vk::Format::B8G8R8A8_SRGB, vk::SampleCountFlags::TYPE_4),
            vk::Extent2D { width: 64, height: 64 },
            views,
        )
    }

    #[test]
    fn vertex_inputs_accumulate_stride_per_binding() {
        let mut setup = PipelineSetup::new();
        assert_eq!(setup.add_vertex_input(vk::Format::R32G32B32_SFLOAT, 0, 12, 0, false), 0);
        assert_eq!(setup.add_vertex_input(vk::Format::R32G32_SFLOAT, 12, 8, 0, false), 1);
        assert_eq!(setup.add_vertex_input(vk::Format::R32G32B32A32_SFLOAT, 0, 16, 1, true), 2);

        let bindings = setup.vertex_bindings();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].stride, 20);
        assert_eq!(bindings[0].input_rate, vk::VertexInputRate::VERTEX);
        assert_eq!(bindings[1].stride, 16);
        assert_eq!(bindings[1].input_rate, vk::VertexInputRate::INSTANCE);
        assert_eq!(setup.vertex_attributes()[2].binding, 1);
    }

    #[test]
    fn reservations_bind_in_call_order() {
        let mut setup = PipelineSetup::new();
        let ubo = setup.reserve_uniform_buffer(vk::ShaderStageFlags::VERTEX, 1);
        let sampler = setup.reserve_combined_sampler(vk::ShaderStageFlags::FRAGMENT, 1);
        let textures = setup.reserve_texture(vk::ShaderStageFlags::FRAGMENT, 4);
        assert_eq!((ubo, sampler, textures), (0, 1, 2));
        assert_eq!(setup.bindings()[2].descriptor_type, vk::DescriptorType::SAMPLED_IMAGE);
        assert_eq!(setup.bindings()[2].count, 4);
    }

    #[test]
    fn blend_presets() {
        let alpha = PipelineSetup::new().with_alpha_blending_enabled().blend();
        assert_eq!(alpha.blend_enable, vk::TRUE);
        assert_eq!(alpha.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
        let additive = PipelineSetup::new().with_additive_blending_enabled().blend();
        assert_eq!(additive.src_color_blend_factor, vk::BlendFactor::ONE);
        assert_eq!(PipelineSetup::new().blend().blend_enable, vk::FALSE);
    }

    #[test]
    fn pipeline_follows_render_pass_samples() {
        let (device, allocator) = setup();
        let pass = render_pass(&allocator, &[]);

        let mut setup = PipelineSetup::new();
        setup.reserve_uniform_buffer(vk::ShaderStageFlags::VERTEX, 1);
        setup.enable_push_constants(vk::ShaderStageFlags::VERTEX, 64);
        let pipeline = Pipeline::new(&allocator, &setup, &pass, &shaders());
        assert!(pipeline.is_valid(), "{:?}", pipeline.last_result());

        let info = device.pipeline_info(pipeline.handle()).unwrap();
        assert_eq!(info.samples, vk::SampleCountFlags::TYPE_4);
        assert_eq!(info.render_pass, pass.handle());

        let layout = pipeline.layout().unwrap();
        assert_eq!(device.pipeline_layout_set_layouts(layout.handle()).unwrap(), vec![layout.set_layout()]);
        assert_eq!(device.pipeline_layout_push_constants(layout.handle()).unwrap()[0].size, 64);
    }

    #[test]
    fn no_reservations_means_no_set_layout() {
        let (device, allocator) = setup();
        let pass = render_pass(&allocator, &[]);
        let pipeline = Pipeline::new(&allocator, &PipelineSetup::new(), &pass, &shaders());
        assert!(pipeline.is_valid());
        assert_eq!(device.live_objects(ObjectKind::DescriptorSetLayout), 0);
        assert_eq!(
            pipeline.create_descriptor_set(3).err(),
            Some(vk::Result::ERROR_VALIDATION_FAILED_EXT),
        );
    }

    #[test]
    fn failure_is_sticky_and_leaks_nothing() {
        let (device, allocator) = setup();
        let pass = render_pass(&allocator, &[]);
        device.fail_next(FailurePoint::CreatePipeline, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);

        let mut setup = PipelineSetup::new();
        setup.reserve_combined_sampler(vk::ShaderStageFlags::FRAGMENT, 1);
        let pipeline = Pipeline::new(&allocator, &setup, &pass, &shaders());
        assert!(!pipeline.is_valid());
        assert_eq!(pipeline.last_result(), vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);

        let cb = device
            .allocate_command_buffer(allocator.command_pool(), vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        device.begin_command_buffer(cb, vk::CommandBufferUsageFlags::empty(), None).unwrap();
        assert!(pipeline.record_bind(&Recorder::new(&*device, cb, 0)).is_err());

        drop(pipeline);
        assert_eq!(device.live_objects(ObjectKind::ShaderModule), 0);
        assert_eq!(device.live_objects(ObjectKind::PipelineLayout), 0);
        assert_eq!(device.live_objects(ObjectKind::DescriptorSetLayout), 0);
    }

    #[test]
    fn compute_pipeline_dispatches_its_work_groups() {
        let (device, allocator) = setup();
        let mut setup = PipelineSetup::new();
        setup.reserve_storage_image(vk::ShaderStageFlags::COMPUTE, 1);
        let mut compute = ComputePipeline::new(
            &allocator,
            &setup,
            &ShaderBinary::from_words(ShaderStage::Compute, spirv_stub()),
        );
        assert!(compute.is_valid());
        compute.set_work_group_xyz(8, 4, 1);

        let cb = device
            .allocate_command_buffer(allocator.command_pool(), vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        device.begin_command_buffer(cb, vk::CommandBufferUsageFlags::empty(), None).unwrap();
        let recorder = Recorder::new(&*device, cb, 0);
        compute.record_bind(&recorder).unwrap();
        compute.record_draw(&recorder).unwrap();

        let commands = device.recorded_commands(cb);
        assert!(matches!(
            commands[0],
            RecordedCommand::BindPipeline { bind_point, .. } if bind_point == vk::PipelineBindPoint::COMPUTE,
        ));
        assert!(matches!(commands[1], RecordedCommand::Dispatch { x: 8, y: 4, z: 1 }));
    }

    #[test]
    fn failed_compute_pipeline_does_not_dispatch() {
        let (device, allocator) = setup();
        device.fail_next(FailurePoint::CreatePipeline, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let compute = ComputePipeline::new(
            &allocator,
            &PipelineSetup::new(),
            &ShaderBinary::from_words(ShaderStage::Compute, spirv_stub()),
        );
        assert!(!compute.is_valid());
        assert_eq!(compute.last_result(), vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);

        let cb = device
            .allocate_command_buffer(allocator.command_pool(), vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        device.begin_command_buffer(cb, vk::CommandBufferUsageFlags::empty(), None).unwrap();
        let recorder = Recorder::new(&*device, cb, 0);
        assert_eq!(compute.record_draw(&recorder), Err(vk::Result::ERROR_VALIDATION_FAILED_EXT));
        assert_eq!(compute.last_result(), vk::Result::ERROR_VALIDATION_FAILED_EXT);
        assert!(!device
            .recorded_commands(cb)
            .iter()
            .any(|c| matches!(c, RecordedCommand::Dispatch { .. })));
    }

    #[test]
    fn wrong_shader_stage_is_rejected() {
        let (_device, allocator) = setup();
        let compute = ComputePipeline::new(
            &allocator,
            &PipelineSetup::new(),
            &ShaderBinary::from_words(ShaderStage::Vertex, spirv_stub()),
        );
        assert_eq!(compute.last_result(), vk::Result::ERROR_VALIDATION_FAILED_EXT);
        assert!(compute.layout().is_none());
    }
}
