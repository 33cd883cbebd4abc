use std::fmt::Display;
use std::sync::atomic::{AtomicI32, Ordering};
use ash::prelude::VkResult;
use ash::vk;

/// Sticky native result of the last failing operation on an object.
///
/// Stays `SUCCESS` until something fails, then keeps that code until it is
/// explicitly cleared.
#[derive(Debug)]
pub struct LastResult(AtomicI32);

impl Default for LastResult {
    fn default() -> Self {
        Self(AtomicI32::new(vk::Result::SUCCESS.as_raw()))
    }
}

impl LastResult {
    pub fn get(&self) -> vk::Result {
        vk::Result::from_raw(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, result: vk::Result) {
        self.0.store(result.as_raw(), Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.set(vk::Result::SUCCESS);
    }

    pub fn is_success(&self) -> bool {
        self.get() == vk::Result::SUCCESS
    }

    /// Passes `result` through, remembering the code if it is an error
    pub fn record<T>(&self, result: VkResult<T>) -> VkResult<T> {
        if let Err(err) = &result {
            self.set(*err);
        }
        result
    }
}

/// Logs a misuse diagnostic and returns the code reported for it
pub fn validation_failed(message: impl Display) -> vk::Result {
    log::error!("{}", message);
    vk::Result::ERROR_VALIDATION_FAILED_EXT
}

/// Logs why an operation cannot run yet and returns `NOT_READY`
pub fn not_ready(message: impl Display) -> vk::Result {
    log::warn!("{}", message);
    vk::Result::NOT_READY
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Converts a host-side length into a native device size
pub fn device_size(len: usize) -> vk::DeviceSize {
    len as vk::DeviceSize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_next_multiple() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(12, 16), 16);
        assert_eq!(align_up(7, 0), 7);
    }

    #[test]
    fn last_result_is_sticky() {
        let last = LastResult::default();
        assert!(last.is_success());

        let ok: VkResult<u32> = Ok(3);
        assert_eq!(last.record(ok), Ok(3));
        assert!(last.is_success());

        let err: VkResult<u32> = Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(last.record(err).is_err());
        assert_eq!(last.get(), vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);

        // a later success does not wipe the failure
        let _ = last.record(Ok(()));
        assert_eq!(last.get(), vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);

        last.clear();
        assert!(last.is_success());
    }
}
