use ash::prelude::VkResult;
use ash::vk;
use crate::renderer::backend::{DeviceBackend, SubmitDesc};
use crate::renderer::contexts::device_ctx::command_buffer::{CommandBuffer, CommandBufferState};
use crate::renderer::contexts::frame_ctx::FrameSync;
use crate::renderer::internals::resource_allocator::ResourceAllocator;
use crate::renderer::internals::util::{not_ready, validation_failed};

/// One swapchain image and the synchronization needed to render into it
pub struct Frame {
    image_index: u32,
    swapchain: vk::SwapchainKHR,

    // Signals when rendering commands for this image have executed; present waits on it
    render_done: vk::Semaphore,

    // Lent by the rotating pool for the current acquire
    sync: Option<FrameSync>,
    acquired_suboptimal: bool,

    allocator: ResourceAllocator,
}

impl Frame {
    pub fn new(
        allocator: &ResourceAllocator,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
    ) -> VkResult<Self> {
        let render_done = allocator.device().create_semaphore()?;
        Ok(Self {
            image_index,
            swapchain,
            render_done,
            sync: None,
            acquired_suboptimal: false,
            allocator: allocator.clone(),
        })
    }

    fn device(&self) -> &dyn DeviceBackend {
        self.allocator.device().as_ref()
    }

    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    /// Index used to select per-image resources while recording
    pub fn frame_index(&self) -> usize {
        self.image_index as usize
    }

    pub fn render_done(&self) -> vk::Semaphore {
        self.render_done
    }

    pub fn fence(&self) -> vk::Fence {
        self.sync.map_or(vk::Fence::null(), |sync| sync.fence)
    }

    pub fn image_available(&self) -> vk::Semaphore {
        self.sync.map_or(vk::Semaphore::null(), |sync| sync.image_available)
    }

    /// Attaches the pool slot that acquired this image
    pub(crate) fn bind(&mut self, sync: FrameSync, suboptimal: bool) {
        self.sync = Some(sync);
        self.acquired_suboptimal = suboptimal;
    }

    /// Submits a closed primary command buffer for this image, presents it and
    /// blocks until the submitted work has finished.
    ///
    /// A suboptimal or out-of-date swapchain is reported as
    /// `ERROR_OUT_OF_DATE_KHR` once the work is done, so the caller can rebuild
    /// the swapchain before the next frame.
    pub fn submit_and_present(&self, cmd: &CommandBuffer) -> VkResult<()> {
        if cmd.is_secondary() {
            return Err(validation_failed("Only primary command buffers can be submitted"));
        }
        if cmd.state() != CommandBufferState::Closed {
            return Err(not_ready(format!(
                "Command buffer must be closed before submission, it is {:?}",
                cmd.state()
            )));
        }
        let Some(sync) = self.sync else {
            return Err(not_ready(format!("Frame {} was not acquired", self.image_index)));
        };
        if cmd.frame_index() != self.frame_index() {
            log::warn!(
                "Command buffer recorded for image {} submitted on image {}",
                cmd.frame_index(),
                self.image_index
            );
        }

        let device = self.device();
        device.reset_fence(sync.fence)?;

        let command_buffers = [cmd.handle()];
        let wait_semaphores = [sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [self.render_done];
        let submitted = device.queue_submit(
            &SubmitDesc {
                command_buffers: &command_buffers,
                wait_semaphores: &wait_semaphores,
                wait_stages: &wait_stages,
                signal_semaphores: &signal_semaphores,
            },
            sync.fence,
        );
        if let Err(err) = submitted {
            log::error!("Frame {} submission failed: {:?}", self.image_index, err);
            // Re-arm the fence with an empty batch so the slot does not stall the next acquire
            device.queue_submit(&SubmitDesc::default(), sync.fence)?;
            return Err(err);
        }

        let presented = device.queue_present(self.swapchain, self.image_index, &signal_semaphores);

        device.wait_for_fence(sync.fence, u64::MAX)?;

        match presented {
            Ok(false) if !self.acquired_suboptimal => Ok(()),
            Ok(_) => {
                log::debug!("Swapchain is suboptimal after presenting image {}", self.image_index);
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
            }
            Err(vk::Result::SUBOPTIMAL_KHR) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
            }
            Err(err) => {
                log::error!("Present of image {} failed: {:?}", self.image_index, err);
                Err(err)
            }
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.allocator.device().destroy_semaphore(self.render_done);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::*;
    use crate::renderer::backend::SwapchainDesc;
    use crate::renderer::backend::headless::{FailurePoint, HeadlessDevice};
    use crate::renderer::contexts::frame_ctx::FrameSyncPool;

    struct Fixture {
        device: Arc<HeadlessDevice>,
        allocator: ResourceAllocator,
        swapchain: vk::SwapchainKHR,
        pool: FrameSyncPool,
    }

    impl Fixture {
        fn new() -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let device = Arc::new(HeadlessDevice::new());
            let allocator = ResourceAllocator::new(device.clone()).unwrap();
            let swapchain = device
                .create_swapchain(&SwapchainDesc {
                    extent: vk::Extent2D { width: 800, height: 600 },
                    vsync: true,
                    min_image_count: 3,
                    old_swapchain: vk::SwapchainKHR::null(),
                })
                .unwrap()
                .handle;
            let pool = FrameSyncPool::new(&allocator, 3).unwrap();
            Self { device, allocator, swapchain, pool }
        }

        fn acquire(&mut self) -> Frame {
            let sync = self.pool.advance().unwrap();
            self.device.wait_for_fence(sync.fence, u64::MAX).unwrap();
            let (index, suboptimal) = self
                .device
                .acquire_next_image(self.swapchain, u64::MAX, sync.image_available)
                .unwrap();
            let mut frame = Frame::new(&self.allocator, self.swapchain, index).unwrap();
            frame.bind(sync, suboptimal);
            frame
        }

        fn closed_buffer(&self, frame_index: usize) -> CommandBuffer {
            let mut cmd = CommandBuffer::new(&self.allocator, vk::CommandBufferLevel::PRIMARY, frame_index).unwrap();
            cmd.begin_commands().unwrap();
            cmd.close_commands().unwrap();
            cmd
        }
    }

    #[test]
    fn submits_presents_and_signals_fence() {
        let mut fixture = Fixture::new();
        let frame = fixture.acquire();
        let cmd = fixture.closed_buffer(frame.frame_index());

        frame.submit_and_present(&cmd).unwrap();
        assert!(fixture.device.fence_is_signaled(frame.fence()));
        assert_eq!(fixture.device.submission_count(), 1);
        assert_eq!(fixture.device.present_count(), 1);
    }

    #[test]
    fn open_buffer_is_not_submitted() {
        let mut fixture = Fixture::new();
        let frame = fixture.acquire();
        let mut cmd = CommandBuffer::new(&fixture.allocator, vk::CommandBufferLevel::PRIMARY, 0).unwrap();
        cmd.begin_commands().unwrap();

        assert_eq!(frame.submit_and_present(&cmd), Err(vk::Result::NOT_READY));
        assert_eq!(fixture.device.submission_count(), 0);
        // fence untouched
        assert!(fixture.device.fence_is_signaled(frame.fence()));
    }

    #[test]
    fn unacquired_frame_refuses_submission() {
        let fixture = Fixture::new();
        let frame = Frame::new(&fixture.allocator, fixture.swapchain, 0).unwrap();
        let cmd = fixture.closed_buffer(0);
        assert_eq!(frame.submit_and_present(&cmd), Err(vk::Result::NOT_READY));
    }

    #[test]
    fn stale_swapchain_reports_out_of_date_after_work_completes() {
        let mut fixture = Fixture::new();
        let frame = fixture.acquire();
        let cmd = fixture.closed_buffer(frame.frame_index());

        fixture.device.set_surface_extent(vk::Extent2D { width: 1024, height: 768 });
        assert_eq!(frame.submit_and_present(&cmd), Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        assert!(fixture.device.fence_is_signaled(frame.fence()));
        assert_eq!(fixture.device.present_count(), 0);
    }

    #[test]
    fn failed_submit_rearms_fence() {
        let mut fixture = Fixture::new();
        let frame = fixture.acquire();
        let cmd = fixture.closed_buffer(frame.frame_index());

        fixture.device.fail_next(FailurePoint::QueueSubmit, vk::Result::ERROR_DEVICE_LOST);
        assert_eq!(frame.submit_and_present(&cmd), Err(vk::Result::ERROR_DEVICE_LOST));
        assert!(fixture.device.fence_is_signaled(frame.fence()));
    }
}
