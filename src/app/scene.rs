use std::sync::Arc;
use std::time::Instant;
use ash::prelude::VkResult;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use color_eyre::eyre::OptionExt;
use color_eyre::Result;
use glam::{Mat4, Vec3};
use ironframe::Context;
use ironframe::renderer::contexts::device_ctx::command_buffer::CommandBuffer;
use ironframe::renderer::resources::UploadableResource;
use ironframe::renderer::resources::descriptor_set::DescriptorSet;
use ironframe::renderer::resources::element_buffer::ElementBuffer;
use ironframe::renderer::resources::pipeline::{Pipeline, PipelineSetup};
use ironframe::renderer::resources::render_pass::RenderPass;
use ironframe::renderer::resources::sampler::{CombinedSampler, Sampler, SamplerSettings};
use ironframe::renderer::resources::uniform_buffer::{UniformBuffer, UniformBuffering};

const SHADER_NAME: &str = "textured_quad";
const CHECKER_SIZE: u32 = 64;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct QuadVertex {
    position: [f32; 2],
    uv: [f32; 2],
}

const QUAD_VERTICES: [QuadVertex; 4] = [
    QuadVertex { position: [-0.5, -0.5], uv: [0.0, 0.0] },
    QuadVertex { position: [0.5, -0.5], uv: [1.0, 0.0] },
    QuadVertex { position: [0.5, 0.5], uv: [1.0, 1.0] },
    QuadVertex { position: [-0.5, 0.5], uv: [0.0, 1.0] },
];
const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

fn checkerboard() -> Vec<u8> {
    (0..CHECKER_SIZE * CHECKER_SIZE)
        .flat_map(|i| {
            let (x, y) = (i % CHECKER_SIZE, i / CHECKER_SIZE);
            if (x / 8 + y / 8) % 2 == 0 {
                [230, 230, 230, 255]
            } else {
                [40, 90, 200, 255]
            }
        })
        .collect()
}

/// GPU objects needed to draw the spinning quad
struct QuadResources {
    pipeline: Pipeline,
    descriptor_set: DescriptorSet,
    quad: ElementBuffer,
    transform: Arc<UniformBuffer>,
}

impl QuadResources {
    fn new(ctx: &Context, render_pass: &RenderPass) -> Option<Self> {
        let shaders = match ctx.load_shaders(SHADER_NAME) {
            Ok(shaders) => shaders,
            Err(err) => {
                log::warn!(
                    "No '{}' shaders in {} ({:?}), only clearing the screen",
                    SHADER_NAME,
                    ctx.config().shader_dir.display(),
                    err
                );
                return None;
            }
        };

        let mut setup = PipelineSetup::new();
        setup.add_vertex_input(vk::Format::R32G32_SFLOAT, 0, 8, 0, false);
        setup.add_vertex_input(vk::Format::R32G32_SFLOAT, 8, 8, 0, false);
        setup.reserve_uniform_buffer(vk::ShaderStageFlags::VERTEX, 1);
        setup.reserve_combined_sampler(vk::ShaderStageFlags::FRAGMENT, 1);
        let pipeline = ctx.create_pipeline(&setup, render_pass, &shaders)?;

        let transform = Arc::new(ctx.create_uniform_buffer(
            "transform",
            size_of::<Mat4>() as vk::DeviceSize,
            UniformBuffering::PerImage,
        )?);

        let allocator = ctx.allocator();
        let sampler = Arc::new(Sampler::new(allocator, SamplerSettings::nearest()));
        let extent = vk::Extent2D { width: CHECKER_SIZE, height: CHECKER_SIZE };
        let mut texture = CombinedSampler::from_pixels(
            allocator,
            "checkerboard",
            sampler,
            &checkerboard(),
            extent,
            vk::Format::R8G8B8A8_SRGB,
        );
        let mut quad = ElementBuffer::new(allocator, "quad", &QUAD_VERTICES, &QUAD_INDICES);

        if let Err(err) = ctx.upload_resources(&mut [&mut quad, &mut texture]) {
            log::warn!("Quad upload failed: {:?}", err);
            return None;
        }
        quad.delete_host_data();
        texture.delete_host_data();
        let texture = Arc::new(texture);

        let descriptor_set = (|| -> VkResult<DescriptorSet> {
            let mut set = pipeline.create_descriptor_set(ctx.image_count())?;
            set.assign_uniform_buffer(transform.clone(), false)?;
            set.assign_combined_sampler(texture.clone())?;
            set.update_device()?;
            Ok(set)
        })();
        let descriptor_set = match descriptor_set {
            Ok(set) => set,
            Err(err) => {
                log::warn!("Quad descriptor set failed: {:?}", err);
                return None;
            }
        };

        Some(Self { pipeline, descriptor_set, quad, transform })
    }
}

/// Clears the screen and, when its shaders are available, draws a textured
/// quad spinning around the view axis
pub struct DemoScene {
    render_pass: RenderPass,
    quad: Option<QuadResources>,
    command_buffers: Vec<CommandBuffer>,
    started: Instant,
}

impl DemoScene {
    pub fn new(ctx: &Context) -> Result<Self> {
        let render_pass = ctx.create_render_pass().ok_or_eyre("Failed to create the render pass")?;
        let quad = QuadResources::new(ctx, &render_pass);
        let command_buffers = Self::create_command_buffers(ctx)?;
        Ok(Self {
            render_pass,
            quad,
            command_buffers,
            started: Instant::now(),
        })
    }

    fn create_command_buffers(ctx: &Context) -> VkResult<Vec<CommandBuffer>> {
        (0..ctx.image_count())
            .map(|index| ctx.create_command_buffer(vk::CommandBufferLevel::PRIMARY, index))
            .collect()
    }

    pub fn resize(&mut self, ctx: &mut Context, extent: vk::Extent2D) -> VkResult<()> {
        let image_count = ctx.image_count();
        ctx.recreate_swapchain(extent)?;
        self.render_pass.recreate_for_new_viewport(ctx.extent(), ctx.swapchain_views())?;

        if ctx.image_count() != image_count {
            // Per-image descriptor sets and command buffers follow the image count
            self.command_buffers = Self::create_command_buffers(ctx)?;
            self.quad = QuadResources::new(ctx, &self.render_pass);
        }
        Ok(())
    }

    pub fn draw(&mut self, ctx: &mut Context) -> VkResult<()> {
        let extent = ctx.extent();
        let frame = ctx.get_next_frame()?;
        let index = frame.frame_index();
        let cmd = self
            .command_buffers
            .get_mut(index)
            .ok_or(vk::Result::ERROR_OUT_OF_DATE_KHR)?;

        cmd.reset()?;
        cmd.begin_rendering(&self.render_pass)?;
        if let Some(quad) = self.quad.as_ref() {
            let aspect = extent.width as f32 / extent.height.max(1) as f32;
            let angle = self.started.elapsed().as_secs_f32();
            let transform = Mat4::from_scale(Vec3::new(1.0 / aspect, 1.0, 1.0)) * Mat4::from_rotation_z(angle);
            quad.transform.write_data(&transform, index)?;

            cmd.bind_resource(&quad.pipeline)?;
            cmd.bind_resource(&quad.descriptor_set)?;
            cmd.bind_resource(&quad.quad)?;
            cmd.draw_resource(&quad.quad)?;
        }
        cmd.close_rendering()?;

        frame.submit_and_present(cmd)
    }
}
