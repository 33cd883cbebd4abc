use ash::prelude::VkResult;
use ash::vk;
use crate::renderer::backend::{DeviceBackend, SubmitDesc};
use crate::renderer::contexts::device_ctx::command_buffer::Recorder;
use crate::renderer::internals::resource_allocator::ResourceAllocator;

/// One-shot submission of recorded work outside the frame loop
pub struct TransferContext {
    transfer_fence: vk::Fence,
    command_buffer: vk::CommandBuffer,

    allocator: ResourceAllocator,
}

impl TransferContext {
    pub fn new(allocator: &ResourceAllocator) -> VkResult<Self> {
        let device = allocator.device();
        let transfer_fence = device.create_fence(false)?;
        let command_buffer = match allocator.allocate_command_buffer(vk::CommandBufferLevel::PRIMARY) {
            Ok(cmd) => cmd,
            Err(err) => {
                device.destroy_fence(transfer_fence);
                return Err(err);
            }
        };

        Ok(Self {
            transfer_fence,
            command_buffer,
            allocator: allocator.clone(),
        })
    }

    fn device(&self) -> &dyn DeviceBackend {
        self.allocator.device().as_ref()
    }

    /// Records `func` into the transfer command buffer, submits it and blocks
    /// until the device has executed it
    pub fn immediate_submit<F>(&self, func: F) -> VkResult<()>
    where
        F: FnOnce(&Recorder) -> VkResult<()>,
    {
        let device = self.device();
        let cmd = self.command_buffer;

        // This command buffer will be used exactly once before resetting
        device.begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, None)?;

        let recorder = Recorder::new(device, cmd, 0);
        let recorded = func(&recorder);
        let ended = device.end_command_buffer(cmd);
        if let Err(err) = recorded.and(ended) {
            device.reset_command_buffer(cmd)?;
            return Err(err);
        }

        let command_buffers = [cmd];
        device.queue_submit(
            &SubmitDesc {
                command_buffers: &command_buffers,
                ..Default::default()
            },
            self.transfer_fence,
        )?;

        // Uploads are synchronous: wait for the queue as well as the fence
        device.wait_for_fence(self.transfer_fence, u64::MAX)?;
        device.queue_wait_idle()?;
        device.reset_fence(self.transfer_fence)?;
        device.reset_command_buffer(cmd)?;

        Ok(())
    }
}

impl Drop for TransferContext {
    fn drop(&mut self) {
        self.allocator.free_command_buffer(self.command_buffer);
        self.allocator.device().destroy_fence(self.transfer_fence);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::*;
    use crate::renderer::backend::headless::HeadlessDevice;

    #[test]
    fn submits_and_waits() {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = Arc::new(HeadlessDevice::new());
        let allocator = ResourceAllocator::new(device.clone()).unwrap();
        let transfer = TransferContext::new(&allocator).unwrap();

        transfer.immediate_submit(|_| Ok(())).unwrap();
        transfer.immediate_submit(|_| Ok(())).unwrap();
        assert_eq!(device.submission_count(), 2);
    }

    #[test]
    fn failed_recording_is_not_submitted() {
        let device = Arc::new(HeadlessDevice::new());
        let allocator = ResourceAllocator::new(device.clone()).unwrap();
        let transfer = TransferContext::new(&allocator).unwrap();

        let result = transfer.immediate_submit(|_| Err(vk::Result::ERROR_VALIDATION_FAILED_EXT));
        assert_eq!(result, Err(vk::Result::ERROR_VALIDATION_FAILED_EXT));
        assert_eq!(device.submission_count(), 0);

        // the command buffer is reusable afterwards
        transfer.immediate_submit(|_| Ok(())).unwrap();
        assert_eq!(device.submission_count(), 1);
    }
}
