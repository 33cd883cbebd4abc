use ash::prelude::VkResult;
use ash::vk;
use crate::renderer::backend::{CommandBufferInheritance, DeviceBackend, ImageBarrier, RenderPassBegin};
use crate::renderer::internals::resource_allocator::ResourceAllocator;
use crate::renderer::internals::util::{LastResult, not_ready, validation_failed};
use crate::renderer::resources::pipeline::PipelineLayout;
use crate::renderer::resources::render_pass::RenderPass;
use crate::renderer::resources::{BindableResource, Drawer};

const DEBUG_SCOPE_COLOR: [f32; 4] = [0.3, 0.6, 1.0, 1.0];

/// Short-lived view of a command buffer that is currently recording
#[derive(Clone, Copy)]
pub struct Recorder<'a> {
    device: &'a dyn DeviceBackend,
    handle: vk::CommandBuffer,
    frame_index: usize,
}

impl<'a> Recorder<'a> {
    pub fn new(device: &'a dyn DeviceBackend, handle: vk::CommandBuffer, frame_index: usize) -> Self {
        Self { device, handle, frame_index }
    }

    pub fn device(&self) -> &'a dyn DeviceBackend {
        self.device
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    /// Swapchain image the recorded work targets; selects per-image resources
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn image_barrier(
        &self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: ImageBarrier,
    ) {
        self.device.cmd_pipeline_barrier(self.handle, src_stage, dst_stage, &[barrier]);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    New,
    Open,
    ComputeOpen,
    Closed,
    Destroyed,
}

/// Recording state machine over one native command buffer.
///
/// Recording calls are refused with `NOT_READY` unless the buffer is open, so
/// misuse never reaches the native handle.
pub struct CommandBuffer {
    handle: vk::CommandBuffer,
    level: vk::CommandBufferLevel,
    state: CommandBufferState,
    frame_index: usize,
    in_render_pass: bool,
    open_scopes: u32,
    last_result: LastResult,

    allocator: ResourceAllocator,
}

impl CommandBuffer {
    pub fn new(
        allocator: &ResourceAllocator,
        level: vk::CommandBufferLevel,
        frame_index: usize,
    ) -> VkResult<Self> {
        let handle = allocator.allocate_command_buffer(level)?;
        Ok(Self {
            handle,
            level,
            state: CommandBufferState::New,
            frame_index,
            in_render_pass: false,
            open_scopes: 0,
            last_result: LastResult::default(),
            allocator: allocator.clone(),
        })
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }

    pub fn is_secondary(&self) -> bool {
        self.level == vk::CommandBufferLevel::SECONDARY
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn last_result(&self) -> vk::Result {
        self.last_result.get()
    }

    /// Rebinds the buffer to another swapchain image; only before recording starts
    pub fn set_frame_index(&mut self, frame_index: usize) -> VkResult<()> {
        self.expect_state(&[CommandBufferState::New], "set_frame_index")?;
        self.frame_index = frame_index;
        Ok(())
    }

    fn device(&self) -> &dyn DeviceBackend {
        self.allocator.device().as_ref()
    }

    fn recorder(&self) -> Recorder<'_> {
        Recorder::new(self.device(), self.handle, self.frame_index)
    }

    fn expect_state(&self, allowed: &[CommandBufferState], operation: &str) -> VkResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            let err = not_ready(format!(
                "Command buffer cannot {} in state {:?}",
                operation, self.state,
            ));
            self.last_result.set(err);
            Err(err)
        }
    }

    fn expect_recording(&self, operation: &str) -> VkResult<()> {
        self.expect_state(&[CommandBufferState::Open, CommandBufferState::ComputeOpen], operation)
    }

    fn set_viewport_and_scissor(&self, extent: vk::Extent2D) {
        let device = self.device();
        device.cmd_set_viewport(self.handle, vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        device.cmd_set_scissor(self.handle, vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        });
    }

    fn framebuffer_for_frame(&self, render_pass: &RenderPass) -> VkResult<vk::Framebuffer> {
        render_pass.framebuffer(self.frame_index).ok_or_else(|| {
            validation_failed(format!(
                "Render pass has no framebuffer for frame {}",
                self.frame_index,
            ))
        })
    }

    /// Opens the render pass for this buffer's frame and sets viewport and
    /// scissor to the pass extent. Secondary buffers continue the pass through
    /// an inheritance structure instead.
    pub fn begin_rendering(&mut self, render_pass: &RenderPass) -> VkResult<()> {
        self.expect_state(&[CommandBufferState::New], "begin rendering")?;
        let framebuffer = self.last_result.record(self.framebuffer_for_frame(render_pass))?;
        let device = self.device();

        if self.is_secondary() {
            let inheritance = CommandBufferInheritance {
                render_pass: render_pass.handle(),
                subpass: 0,
                framebuffer,
            };
            self.last_result.record(device.begin_command_buffer(
                self.handle,
                vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE
                    | vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                Some(&inheritance),
            ))?;
        } else {
            self.last_result.record(device.begin_command_buffer(
                self.handle,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                None,
            ))?;
            self.begin_pass(render_pass, framebuffer, vk::SubpassContents::INLINE);
            self.in_render_pass = true;
        }
        self.set_viewport_and_scissor(render_pass.extent());

        self.state = CommandBufferState::Open;
        Ok(())
    }

    /// Opens the render pass of a primary buffer whose contents will come
    /// from secondary buffers via `execute_secondaries`
    pub fn begin_rendering_for_secondaries(&mut self, render_pass: &RenderPass) -> VkResult<()> {
        self.expect_state(&[CommandBufferState::New], "begin rendering")?;
        if self.is_secondary() {
            let err = validation_failed("Secondary command buffers cannot host secondary contents");
            self.last_result.set(err);
            return Err(err);
        }
        let framebuffer = self.last_result.record(self.framebuffer_for_frame(render_pass))?;
        self.last_result.record(self.device().begin_command_buffer(
            self.handle,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            None,
        ))?;
        self.begin_pass(render_pass, framebuffer, vk::SubpassContents::SECONDARY_COMMAND_BUFFERS);
        self.in_render_pass = true;

        self.state = CommandBufferState::Open;
        Ok(())
    }

    fn begin_pass(&self, render_pass: &RenderPass, framebuffer: vk::Framebuffer, contents: vk::SubpassContents) {
        let clear_values = render_pass.clear_values();
        self.device().cmd_begin_render_pass(self.handle, &RenderPassBegin {
            render_pass: render_pass.handle(),
            framebuffer,
            extent: render_pass.extent(),
            clear_values: &clear_values,
            contents,
        });
    }

    /// Opens the buffer for compute or transfer work outside any render pass
    pub fn begin_commands(&mut self) -> VkResult<()> {
        self.expect_state(&[CommandBufferState::New], "begin commands")?;
        self.last_result.record(self.device().begin_command_buffer(
            self.handle,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            None,
        ))?;
        self.state = CommandBufferState::ComputeOpen;
        Ok(())
    }

    fn close_open_scopes(&mut self) {
        while self.open_scopes > 0 {
            self.device().cmd_end_debug_label(self.handle);
            self.open_scopes -= 1;
        }
    }

    pub fn close_rendering(&mut self) -> VkResult<()> {
        self.expect_state(&[CommandBufferState::Open], "close rendering")?;
        self.close_open_scopes();
        if self.in_render_pass {
            self.device().cmd_end_render_pass(self.handle);
            self.in_render_pass = false;
        }
        self.last_result.record(self.device().end_command_buffer(self.handle))?;
        self.state = CommandBufferState::Closed;
        Ok(())
    }

    pub fn close_commands(&mut self) -> VkResult<()> {
        self.expect_state(&[CommandBufferState::ComputeOpen], "close commands")?;
        self.close_open_scopes();
        self.last_result.record(self.device().end_command_buffer(self.handle))?;
        self.state = CommandBufferState::Closed;
        Ok(())
    }

    pub fn bind_resource(&mut self, resource: &dyn BindableResource) -> VkResult<()> {
        self.expect_recording("bind a resource")?;
        self.last_result.record(resource.record_bind(&self.recorder()))
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) -> VkResult<()> {
        self.expect_recording("draw")?;
        self.device().cmd_draw(self.handle, vertex_count, instance_count, 0, 0);
        Ok(())
    }

    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32, vertex_offset: i32) -> VkResult<()> {
        self.expect_recording("draw")?;
        self.device().cmd_draw_indexed(self.handle, index_count, instance_count, 0, vertex_offset, 0);
        Ok(())
    }

    pub fn draw_resource(&mut self, drawer: &dyn Drawer) -> VkResult<()> {
        self.expect_recording("draw a resource")?;
        self.last_result.record(drawer.record_draw(&self.recorder()))
    }

    pub fn push_constants(&mut self, layout: &PipelineLayout, offset: u32, data: &[u8]) -> VkResult<()> {
        self.expect_recording("push constants")?;
        let Some(range) = layout.push_constant_range() else {
            let err = validation_failed("Pipeline layout has no push constant range");
            self.last_result.set(err);
            return Err(err);
        };
        if offset as usize + data.len() > range.size as usize {
            let err = validation_failed(format!(
                "Push constants of {} bytes at offset {} exceed the {} byte range",
                data.len(), offset, range.size,
            ));
            self.last_result.set(err);
            return Err(err);
        }
        self.device().cmd_push_constants(self.handle, layout.handle(), range.stage_flags, offset, data);
        Ok(())
    }

    pub fn execute_secondaries(&mut self, secondaries: &[&CommandBuffer]) -> VkResult<()> {
        self.expect_recording("execute secondaries")?;
        let all_closed = secondaries
            .iter()
            .all(|cb| cb.is_secondary() && cb.state == CommandBufferState::Closed);
        if self.is_secondary() || !all_closed {
            let err = validation_failed("Only closed secondary buffers can run inside a primary buffer");
            self.last_result.set(err);
            return Err(err);
        }
        let handles: smallvec::SmallVec<[vk::CommandBuffer; 8]> =
            secondaries.iter().map(|cb| cb.handle).collect();
        self.device().cmd_execute_commands(self.handle, &handles);
        Ok(())
    }

    pub fn begin_debug_scope(&mut self, name: &str) -> VkResult<()> {
        self.expect_recording("begin a debug scope")?;
        self.device().cmd_begin_debug_label(self.handle, name, DEBUG_SCOPE_COLOR);
        self.open_scopes += 1;
        Ok(())
    }

    pub fn end_debug_scope(&mut self) -> VkResult<()> {
        self.expect_recording("end a debug scope")?;
        if self.open_scopes == 0 {
            return self.last_result.record(Err(validation_failed("No debug scope is open")));
        }
        self.device().cmd_end_debug_label(self.handle);
        self.open_scopes -= 1;
        Ok(())
    }

    /// Returns a closed (or never begun) buffer to `New` so it can be recorded again
    pub fn reset(&mut self) -> VkResult<()> {
        self.expect_state(&[CommandBufferState::New, CommandBufferState::Closed], "reset")?;
        self.last_result.record(self.device().reset_command_buffer(self.handle))?;
        self.state = CommandBufferState::New;
        Ok(())
    }

    pub fn destroy(&mut self) {
        if self.state == CommandBufferState::Destroyed {
            return;
        }
        if matches!(self.state, CommandBufferState::Open | CommandBufferState::ComputeOpen) {
            log::warn!("Destroying a command buffer that is still recording");
        }
        self.allocator.free_command_buffer(self.handle);
        self.handle = vk::CommandBuffer::null();
        self.state = CommandBufferState::Destroyed;
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        self.destroy();
    }
}
