pub mod frame;

use ash::prelude::VkResult;
use ash::vk;
use crate::renderer::internals::resource_allocator::ResourceAllocator;

/// Fence and acquire semaphore lent to whichever frame is acquired next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSync {
    // Signals when all rendering commands submitted with this slot have finished
    pub fence: vk::Fence,

    // Signals when the acquired swapchain image can be rendered to
    pub image_available: vk::Semaphore,
}

/// Responsibilities:
/// - Own one fence/semaphore slot per swapchain image
/// - Rotate through the slots, one per acquired frame
pub struct FrameSyncPool {
    slots: Vec<FrameSync>,
    cursor: usize,

    allocator: ResourceAllocator,
}

impl FrameSyncPool {
    pub fn new(allocator: &ResourceAllocator, count: usize) -> VkResult<Self> {
        let mut pool = Self {
            slots: Vec::with_capacity(count),
            // The first advance lands on slot 0
            cursor: count.saturating_sub(1),
            allocator: allocator.clone(),
        };

        let device = allocator.device();
        for _ in 0..count {
            // Signaled so the first wait on each slot returns immediately
            let fence = device.create_fence(true)?;
            let image_available = match device.create_semaphore() {
                Ok(semaphore) => semaphore,
                Err(err) => {
                    device.destroy_fence(fence);
                    return Err(err);
                }
            };
            pool.slots.push(FrameSync { fence, image_available });
        }

        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Moves to the next slot and returns it
    pub fn advance(&mut self) -> Option<FrameSync> {
        if self.slots.is_empty() {
            return None;
        }
        self.cursor = (self.cursor + 1) % self.slots.len();
        Some(self.slots[self.cursor])
    }

    pub fn slot(&self, index: usize) -> Option<FrameSync> {
        self.slots.get(index).copied()
    }
}

impl Drop for FrameSyncPool {
    fn drop(&mut self) {
        let device = self.allocator.device();
        for slot in self.slots.drain(..) {
            device.destroy_semaphore(slot.image_available);
            device.destroy_fence(slot.fence);
        }
    }
}
