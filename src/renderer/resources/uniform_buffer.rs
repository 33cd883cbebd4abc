use ash::prelude::VkResult;
use ash::vk;
use crate::renderer::internals::resource_allocator::{AllocatedBuffer, ResourceAllocator};
use crate::renderer::internals::util::{LastResult, align_up, validation_failed};

/// How the per-frame copies of a uniform payload are laid out in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniformBuffering {
    /// One buffer with a slot per frame, each slot padded to the device's
    /// uniform offset alignment
    Shared,
    /// One buffer per frame
    PerImage,
}

/// Where a frame's copy of the payload lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformSlot {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub range: vk::DeviceSize,
}

/// Per-frame copies of a fixed-size uniform payload, written from the host
pub struct UniformBuffer {
    name: String,
    buffering: UniformBuffering,
    payload_size: vk::DeviceSize,
    alignment: vk::DeviceSize,
    stride: vk::DeviceSize,
    frame_count: usize,
    buffers: Vec<AllocatedBuffer>,
    last_result: LastResult,
}

impl UniformBuffer {
    pub fn new(
        allocator: &ResourceAllocator,
        name: &str,
        payload_size: vk::DeviceSize,
        frame_count: usize,
        buffering: UniformBuffering,
    ) -> Self {
        let alignment = allocator.limits().min_uniform_buffer_offset_alignment;
        let stride = align_up(payload_size, alignment);
        let mut uniform = Self {
            name: name.to_string(),
            buffering,
            payload_size,
            alignment,
            stride,
            frame_count,
            buffers: Vec::new(),
            last_result: LastResult::default(),
        };
        let result = uniform.allocate(allocator);
        if uniform.last_result.record(result).is_err() {
            uniform.buffers.clear();
        }
        uniform
    }

    /// Sized for one `T` per frame
    pub fn for_type<T: bytemuck::Pod>(
        allocator: &ResourceAllocator,
        name: &str,
        frame_count: usize,
        buffering: UniformBuffering,
    ) -> Self {
        Self::new(allocator, name, size_of::<T>() as vk::DeviceSize, frame_count, buffering)
    }

    fn allocate(&mut self, allocator: &ResourceAllocator) -> VkResult<()> {
        if self.payload_size == 0 || self.frame_count == 0 {
            return Err(validation_failed(format!(
                "Uniform buffer '{}' needs a non-empty payload and at least one frame",
                self.name,
            )));
        }
        let memory = vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT
            | vk::MemoryPropertyFlags::DEVICE_LOCAL;
        match self.buffering {
            UniformBuffering::Shared => {
                self.buffers.push(AllocatedBuffer::new(
                    allocator,
                    &self.name,
                    self.stride * self.frame_count as vk::DeviceSize,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    memory,
                )?);
            }
            UniformBuffering::PerImage => {
                for frame in 0..self.frame_count {
                    self.buffers.push(AllocatedBuffer::new(
                        allocator,
                        &format!("{} [{}]", self.name, frame),
                        self.stride,
                        vk::BufferUsageFlags::UNIFORM_BUFFER,
                        memory,
                    )?);
                }
            }
        }
        log::debug!(
            "Created uniform buffer '{}': {} frames of {} bytes (stride {}, {:?})",
            self.name, self.frame_count, self.payload_size, self.stride, self.buffering,
        );
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        !self.buffers.is_empty()
    }

    pub fn last_result(&self) -> vk::Result {
        self.last_result.get()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buffering(&self) -> UniformBuffering {
        self.buffering
    }

    pub fn payload_size(&self) -> vk::DeviceSize {
        self.payload_size
    }

    /// Distance between frame slots in the shared layout
    pub fn stride(&self) -> vk::DeviceSize {
        self.stride
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn slot(&self, frame_index: usize) -> VkResult<UniformSlot> {
        if !self.is_valid() {
            return Err(validation_failed(format!("Uniform buffer '{}' was never allocated", self.name)));
        }
        if frame_index >= self.frame_count {
            return Err(validation_failed(format!(
                "Frame {} is out of range for uniform buffer '{}' with {} frames",
                frame_index, self.name, self.frame_count,
            )));
        }
        let slot = match self.buffering {
            UniformBuffering::Shared => UniformSlot {
                buffer: self.buffers[0].handle,
                offset: frame_index as vk::DeviceSize * self.stride,
                range: self.payload_size,
            },
            UniformBuffering::PerImage => UniformSlot {
                buffer: self.buffers[frame_index].handle,
                offset: 0,
                range: self.payload_size,
            },
        };
        Ok(slot)
    }

    /// Descriptor contents for a frame. Dynamic bindings on shared backing
    /// point at slot 0 and select the frame through the dynamic offset.
    pub fn descriptor_info(&self, frame_index: usize, dynamic: bool) -> VkResult<vk::DescriptorBufferInfo> {
        let slot = self.slot(frame_index)?;
        let offset = if dynamic { 0 } else { slot.offset };
        Ok(vk::DescriptorBufferInfo {
            buffer: slot.buffer,
            offset,
            range: slot.range,
        })
    }

    pub fn dynamic_offset(&self, frame_index: usize) -> u32 {
        match self.buffering {
            UniformBuffering::Shared => (frame_index as vk::DeviceSize * self.stride) as u32,
            UniformBuffering::PerImage => 0,
        }
    }

    fn backing(&self, frame_index: usize) -> VkResult<(&AllocatedBuffer, vk::DeviceSize)> {
        let slot = self.slot(frame_index)?;
        let buffer = match self.buffering {
            UniformBuffering::Shared => &self.buffers[0],
            UniformBuffering::PerImage => &self.buffers[frame_index],
        };
        Ok((buffer, slot.offset))
    }

    /// Copies raw bytes into the start of one frame's slot
    pub fn write_bytes(&self, bytes: &[u8], frame_index: usize) -> VkResult<()> {
        let result = self.try_write_bytes(bytes, frame_index);
        self.last_result.record(result)
    }

    fn try_write_bytes(&self, bytes: &[u8], frame_index: usize) -> VkResult<()> {
        if bytes.len() as vk::DeviceSize > self.payload_size {
            return Err(validation_failed(format!(
                "{} bytes do not fit the {} byte payload of uniform buffer '{}'",
                bytes.len(), self.payload_size, self.name,
            )));
        }
        let (buffer, offset) = self.backing(frame_index)?;
        buffer.write_bytes(offset, bytes)
    }

    pub fn write_data<T: bytemuck::Pod>(&self, value: &T, frame_index: usize) -> VkResult<()> {
        self.write_bytes(bytemuck::bytes_of(value), frame_index)
    }

    /// Writes `values` into one slot with `stride` bytes between elements.
    /// The default stride is the element size rounded up to the device's
    /// uniform offset alignment.
    pub fn write_slice<T: bytemuck::Pod>(
        &self,
        values: &[T],
        frame_index: usize,
        stride: Option<usize>,
    ) -> VkResult<()> {
        let element = size_of::<T>();
        let stride = stride.unwrap_or(align_up(element as vk::DeviceSize, self.alignment) as usize);
        if stride < element {
            let err = validation_failed(format!(
                "Stride {} is smaller than the {} byte element",
                stride, element,
            ));
            self.last_result.set(err);
            return Err(err);
        }
        let mut packed = vec![0u8; stride * values.len()];
        for (chunk, value) in packed.chunks_exact_mut(stride).zip(values) {
            chunk[..element].copy_from_slice(bytemuck::bytes_of(value));
        }
        // Padding after the last element is not part of the payload
        if let Some(last_padding) = stride.checked_sub(element).filter(|_| !values.is_empty()) {
            packed.truncate(packed.len() - last_padding);
        }
        self.write_bytes(&packed, frame_index)
    }

    /// Reads one frame's payload back from mapped memory
    pub fn read_data(&self, frame_index: usize) -> VkResult<Vec<u8>> {
        let (buffer, offset) = self.backing(frame_index)?;
        buffer.read_bytes(offset, self.payload_size as usize)
    }

    pub fn read<T: bytemuck::Pod>(&self, frame_index: usize) -> VkResult<T> {
        let bytes = self.read_data(frame_index)?;
        if bytes.len() < size_of::<T>() {
            return Err(validation_failed(format!(
                "Uniform buffer '{}' payload is smaller than the requested type",
                self.name,
            )));
        }
        Ok(bytemuck::pod_read_unaligned(&bytes[..size_of::<T>()]))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::*;
    use crate::renderer::backend::DeviceLimits;
    use crate::renderer::backend::headless::{HeadlessDevice, ObjectKind};

    fn setup() -> (Arc<HeadlessDevice>, ResourceAllocator) {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = Arc::new(HeadlessDevice::with_limits(DeviceLimits {
            min_uniform_buffer_offset_alignment: 256,
            ..DeviceLimits::default()
        }));
        let allocator = ResourceAllocator::new(device.clone()).unwrap();
        (device, allocator)
    }

    #[test]
    fn shared_slots_are_isolated() {
        let (device, allocator) = setup();
        let uniform = UniformBuffer::new(&allocator, "camera", 64, 3, UniformBuffering::Shared);
        assert!(uniform.is_valid());
        assert_eq!(uniform.stride(), 256);
        assert_eq!(device.live_objects(ObjectKind::Buffer), 1);

        uniform.write_data(&[1.0f32; 16], 1).unwrap();
        assert_eq!(uniform.read_data(0).unwrap(), vec![0u8; 64]);
        assert_eq!(uniform.read::<[f32; 16]>(1).unwrap(), [1.0f32; 16]);
        assert_eq!(uniform.read_data(2).unwrap(), vec![0u8; 64]);

        let slot = uniform.slot(2).unwrap();
        assert_eq!(slot.offset, 512);
        assert_eq!(device.buffer_contents(slot.buffer).map(|bytes| bytes.len()), Some(768));
        assert_eq!(uniform.dynamic_offset(2), 512);
    }

    #[test]
    fn per_image_backing_has_one_buffer_per_frame() {
        let (device, allocator) = setup();
        let uniform = UniformBuffer::new(&allocator, "lights", 16, 2, UniformBuffering::PerImage);
        assert_eq!(device.live_objects(ObjectKind::Buffer), 2);
        assert_ne!(uniform.slot(0).unwrap().buffer, uniform.slot(1).unwrap().buffer);
        assert_eq!(uniform.slot(1).unwrap().offset, 0);
        assert_eq!(uniform.dynamic_offset(1), 0);

        uniform.write_data(&7u32, 0).unwrap();
        assert_eq!(uniform.read::<u32>(0).unwrap(), 7);
        assert_eq!(uniform.read::<u32>(1).unwrap(), 0);
    }

    #[test]
    fn out_of_range_and_oversize_writes_are_rejected() {
        let (_device, allocator) = setup();
        let uniform = UniformBuffer::new(&allocator, "small", 8, 2, UniformBuffering::Shared);

        assert_eq!(uniform.write_data(&1u32, 2), Err(vk::Result::ERROR_VALIDATION_FAILED_EXT));
        assert_eq!(uniform.write_data(&[0u32; 4], 0), Err(vk::Result::ERROR_VALIDATION_FAILED_EXT));
        assert_eq!(uniform.last_result(), vk::Result::ERROR_VALIDATION_FAILED_EXT);
        assert_eq!(uniform.read_data(0).unwrap(), vec![0u8; 8]);
    }

    #[test]
    fn slices_default_to_aligned_element_stride() {
        let (_device, allocator) = setup();
        // Two 12 byte elements, the second one a full alignment step in
        let uniform = UniformBuffer::new(&allocator, "positions", 256 + 12, 1, UniformBuffering::Shared);
        uniform.write_slice(&[[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]], 0, None).unwrap();

        let bytes = uniform.read_data(0).unwrap();
        let read = |offset: usize| f32::from_ne_bytes(bytes[offset..offset + 4].try_into().unwrap());
        assert_eq!(read(0), 1.0);
        assert_eq!(read(8), 3.0);
        assert_eq!(read(12), 0.0);
        assert_eq!(read(256), 4.0);
        assert_eq!(read(264), 6.0);

        // Three elements at the default stride overflow the payload
        assert_eq!(
            uniform.write_slice(&[[0.0f32; 3]; 3], 0, None),
            Err(vk::Result::ERROR_VALIDATION_FAILED_EXT)
        );
    }

    #[test]
    fn slices_accept_an_explicit_stride() {
        let (_device, allocator) = setup();
        let uniform = UniformBuffer::new(&allocator, "weights", 48, 1, UniformBuffering::Shared);
        uniform.write_slice(&[1.0f32, 2.0, 3.0], 0, Some(16)).unwrap();

        let bytes = uniform.read_data(0).unwrap();
        let read = |offset: usize| f32::from_ne_bytes(bytes[offset..offset + 4].try_into().unwrap());
        assert_eq!(read(16), 2.0);
        assert_eq!(read(32), 3.0);

        uniform.write_slice(&[5.0f32, 6.0], 0, Some(4)).unwrap();
        assert_eq!(uniform.read::<[f32; 2]>(0).unwrap(), [5.0, 6.0]);
        assert!(uniform.write_slice(&[1u32], 0, Some(2)).is_err());
    }

    #[test]
    fn empty_payload_leaves_buffer_invalid() {
        let (device, allocator) = setup();
        let uniform = UniformBuffer::new(&allocator, "empty", 0, 3, UniformBuffering::PerImage);
        assert!(!uniform.is_valid());
        assert_eq!(uniform.last_result(), vk::Result::ERROR_VALIDATION_FAILED_EXT);
        assert_eq!(device.live_objects(ObjectKind::Buffer), 0);
        assert!(uniform.slot(0).is_err());
    }
}
