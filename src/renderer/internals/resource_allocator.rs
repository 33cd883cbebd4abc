use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use ash::prelude::VkResult;
use ash::vk;
use gpu_allocator::MemoryLocation;
use crate::renderer::backend::{AllocationId, BufferDesc, DeviceBackend, DeviceLimits, ImageDesc};
use crate::renderer::internals::util::validation_failed;

/// Placement policy derived from the memory-property flags a caller asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUsage {
    /// Device-local, not host visible
    GpuOnly,
    /// Host visible staging memory
    CpuOnly,
    /// Host visible and device local
    CpuToGpu,
}

impl MemoryUsage {
    pub fn from_property_flags(flags: vk::MemoryPropertyFlags) -> Self {
        let host_visible = flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        let device_local = flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL);
        match (host_visible, device_local) {
            (true, true) => Self::CpuToGpu,
            (true, false) => Self::CpuOnly,
            (false, _) => Self::GpuOnly,
        }
    }

    pub fn location(self) -> MemoryLocation {
        match self {
            Self::GpuOnly => MemoryLocation::GpuOnly,
            // Upload staging: host written, read once by a transfer
            Self::CpuOnly => MemoryLocation::CpuToGpu,
            Self::CpuToGpu => MemoryLocation::CpuToGpu,
        }
    }

    pub fn is_host_visible(self) -> bool {
        self != Self::GpuOnly
    }
}

struct AllocatorShared {
    device: Arc<dyn DeviceBackend>,
    command_pool: vk::CommandPool,
    limits: DeviceLimits,
    outstanding: AtomicUsize,
}

impl Drop for AllocatorShared {
    fn drop(&mut self) {
        let outstanding = self.outstanding.load(Ordering::Relaxed);
        if outstanding > 0 {
            log::warn!("Resource allocator dropped with {} outstanding allocations", outstanding);
        }
        self.device.destroy_command_pool(self.command_pool);
    }
}

/// Thin facade over the device for memory-backed objects and command buffers.
///
/// Cloning is cheap; every resource keeps a clone so the device and the
/// command pool outlive everything allocated from them.
#[derive(Clone)]
pub struct ResourceAllocator {
    shared: Arc<AllocatorShared>,
}

impl ResourceAllocator {
    pub fn new(device: Arc<dyn DeviceBackend>) -> VkResult<Self> {
        let command_pool = device.create_command_pool()?;
        let limits = device.limits();
        Ok(Self {
            shared: Arc::new(AllocatorShared {
                device,
                command_pool,
                limits,
                outstanding: AtomicUsize::new(0),
            }),
        })
    }

    pub fn device(&self) -> &Arc<dyn DeviceBackend> {
        &self.shared.device
    }

    pub fn limits(&self) -> DeviceLimits {
        self.shared.limits
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.shared.command_pool
    }

    /// Buffers and images created through this allocator and not yet destroyed
    pub fn outstanding_allocations(&self) -> usize {
        self.shared.outstanding.load(Ordering::Relaxed)
    }

    pub fn create_buffer(
        &self,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> VkResult<(vk::Buffer, AllocationId)> {
        if size == 0 {
            return Err(validation_failed(format!("Buffer '{}' requested with zero size", name)));
        }
        let memory = MemoryUsage::from_property_flags(memory_flags);
        let created = self.shared.device.create_buffer(&BufferDesc {
            name,
            size,
            usage,
            location: memory.location(),
        })?;
        self.shared.outstanding.fetch_add(1, Ordering::Relaxed);
        log::trace!("Allocated buffer '{}' ({} bytes, {:?})", name, size, memory);
        Ok(created)
    }

    pub fn destroy_buffer(&self, buffer: vk::Buffer, allocation: AllocationId) {
        if buffer == vk::Buffer::null() {
            return;
        }
        self.shared.device.destroy_buffer(buffer, allocation);
        self.shared.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_image(
        &self,
        name: &str,
        extent: vk::Extent2D,
        samples: vk::SampleCountFlags,
        format: vk::Format,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> VkResult<(vk::Image, AllocationId)> {
        if extent.width == 0 || extent.height == 0 {
            return Err(validation_failed(format!(
                "Image '{}' requested with empty extent {}x{}",
                name, extent.width, extent.height,
            )));
        }
        let created = self.shared.device.create_image(&ImageDesc {
            name,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            samples,
            format,
            tiling,
            usage,
            location: MemoryUsage::from_property_flags(memory_flags).location(),
        })?;
        self.shared.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(created)
    }

    pub fn destroy_image(&self, image: vk::Image, allocation: AllocationId) {
        if image == vk::Image::null() {
            return;
        }
        self.shared.device.destroy_image(image, allocation);
        self.shared.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn allocate_command_buffer(&self, level: vk::CommandBufferLevel) -> VkResult<vk::CommandBuffer> {
        self.shared.device.allocate_command_buffer(self.shared.command_pool, level)
    }

    pub fn free_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        if command_buffer == vk::CommandBuffer::null() {
            return;
        }
        self.shared.device.free_command_buffer(self.shared.command_pool, command_buffer);
    }

    /// Copies `bytes` into an allocation at `offset` through a temporary mapping
    pub fn write_allocation(&self, allocation: AllocationId, offset: usize, bytes: &[u8]) -> VkResult<()> {
        let device = &self.shared.device;
        let range = device.map_memory(allocation)?;
        let copied = unsafe {
            let mut raw = presser::RawAllocation::from_raw_parts(range.ptr, range.size);
            let mut slab = raw.borrow_as_slab();
            presser::copy_from_slice_to_offset(bytes, &mut slab, offset)
        };
        device.unmap_memory(allocation);
        copied.map(|_| ()).map_err(|err| {
            validation_failed(format!(
                "Write of {} bytes at offset {} does not fit the allocation: {:?}",
                bytes.len(), offset, err,
            ))
        })
    }

    /// Reads `len` bytes of an allocation starting at `offset`
    pub fn read_allocation(&self, allocation: AllocationId, offset: usize, len: usize) -> VkResult<Vec<u8>> {
        let device = &self.shared.device;
        let range = device.map_memory(allocation)?;
        let fits = offset.checked_add(len).is_some_and(|end| end <= range.size);
        let bytes = if fits {
            // Safety: range stays mapped until unmap_memory below and the read is bounds checked
            let mapped = unsafe { std::slice::from_raw_parts(range.ptr.as_ptr().add(offset), len) };
            Ok(mapped.to_vec())
        } else {
            Err(validation_failed(format!(
                "Read of {} bytes at offset {} exceeds the {} byte allocation",
                len, offset, range.size,
            )))
        };
        device.unmap_memory(allocation);
        bytes
    }
}

/// Buffer handle plus its memory, destroyed on drop
pub struct AllocatedBuffer {
    pub handle: vk::Buffer,
    pub allocation: AllocationId,
    pub size: vk::DeviceSize,
    pub memory: MemoryUsage,
    allocator: ResourceAllocator,
}

impl AllocatedBuffer {
    pub fn new(
        allocator: &ResourceAllocator,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> VkResult<Self> {
        let (handle, allocation) = allocator.create_buffer(name, size, usage, memory_flags)?;
        Ok(Self {
            handle,
            allocation,
            size,
            memory: MemoryUsage::from_property_flags(memory_flags),
            allocator: allocator.clone(),
        })
    }

    pub fn staging(allocator: &ResourceAllocator, name: &str, bytes: &[u8]) -> VkResult<Self> {
        let buffer = Self::new(
            allocator,
            name,
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        buffer.write_bytes(0, bytes)?;
        Ok(buffer)
    }

    pub fn is_null(&self) -> bool {
        self.handle == vk::Buffer::null()
    }

    pub fn write_bytes(&self, offset: vk::DeviceSize, bytes: &[u8]) -> VkResult<()> {
        if self.is_null() {
            return Err(validation_failed("Write into a destroyed buffer"));
        }
        self.allocator.write_allocation(self.allocation, offset as usize, bytes)
    }

    pub fn write<T: bytemuck::Pod>(&self, offset: vk::DeviceSize, data: &[T]) -> VkResult<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    pub fn read_bytes(&self, offset: vk::DeviceSize, len: usize) -> VkResult<Vec<u8>> {
        if self.is_null() {
            return Err(validation_failed("Read from a destroyed buffer"));
        }
        self.allocator.read_allocation(self.allocation, offset as usize, len)
    }

    pub fn destroy(&mut self) {
        self.allocator.destroy_buffer(self.handle, self.allocation);
        self.handle = vk::Buffer::null();
    }
}

impl Drop for AllocatedBuffer {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Image handle, its memory and a full view, destroyed on drop
pub struct AllocatedImage {
    pub handle: vk::Image,
    pub view: vk::ImageView,
    pub allocation: AllocationId,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    allocator: ResourceAllocator,
}

impl AllocatedImage {
    pub fn new(
        allocator: &ResourceAllocator,
        name: &str,
        extent: vk::Extent2D,
        samples: vk::SampleCountFlags,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> VkResult<Self> {
        let (handle, allocation) = allocator.create_image(
            name,
            extent,
            samples,
            format,
            vk::ImageTiling::OPTIMAL,
            usage,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let mut image = Self {
            handle,
            view: vk::ImageView::null(),
            allocation,
            extent,
            format,
            samples,
            allocator: allocator.clone(),
        };
        // On failure the image is released by drop
        image.view = allocator.device().create_image_view(handle, format, aspect)?;
        Ok(image)
    }

    pub fn is_null(&self) -> bool {
        self.handle == vk::Image::null()
    }

    pub fn destroy(&mut self) {
        if self.view != vk::ImageView::null() {
            self.allocator.device().destroy_image_view(self.view);
            self.view = vk::ImageView::null();
        }
        self.allocator.destroy_image(self.handle, self.allocation);
        self.handle = vk::Image::null();
    }
}

impl Drop for AllocatedImage {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::headless::{FailurePoint, HeadlessDevice, ObjectKind};

    fn allocator() -> (Arc<HeadlessDevice>, ResourceAllocator) {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = Arc::new(HeadlessDevice::new());
        let allocator = ResourceAllocator::new(device.clone()).unwrap();
        (device, allocator)
    }

    #[test]
    fn memory_flags_select_policy() {
        assert_eq!(
            MemoryUsage::from_property_flags(vk::MemoryPropertyFlags::DEVICE_LOCAL),
            MemoryUsage::GpuOnly,
        );
        assert_eq!(
            MemoryUsage::from_property_flags(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            ),
            MemoryUsage::CpuOnly,
        );
        assert_eq!(
            MemoryUsage::from_property_flags(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::DEVICE_LOCAL
            ),
            MemoryUsage::CpuToGpu,
        );

        assert_eq!(MemoryUsage::GpuOnly.location(), MemoryLocation::GpuOnly);
        assert_eq!(MemoryUsage::CpuOnly.location(), MemoryLocation::CpuToGpu);
        assert_eq!(MemoryUsage::CpuToGpu.location(), MemoryLocation::CpuToGpu);
        assert!(MemoryUsage::CpuOnly.is_host_visible());
        assert!(!MemoryUsage::GpuOnly.is_host_visible());
    }

    #[test]
    fn create_then_destroy_leaves_nothing_outstanding() {
        let (device, allocator) = allocator();
        let (buffer, allocation) = allocator
            .create_buffer(
                "scratch",
                64,
                vk::BufferUsageFlags::TRANSFER_SRC,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
            )
            .unwrap();
        assert_eq!(allocator.outstanding_allocations(), 1);
        assert_eq!(device.live_objects(ObjectKind::Buffer), 1);

        allocator.destroy_buffer(buffer, allocation);
        assert_eq!(allocator.outstanding_allocations(), 0);
        assert_eq!(device.live_objects(ObjectKind::Buffer), 0);

        // null handles are ignored
        allocator.destroy_buffer(vk::Buffer::null(), allocation);
        assert_eq!(allocator.outstanding_allocations(), 0);
    }

    #[test]
    fn allocated_buffer_destroy_is_idempotent() {
        let (device, allocator) = allocator();
        let mut buffer = AllocatedBuffer::staging(&allocator, "staging", &[1, 2, 3, 4]).unwrap();
        assert_eq!(buffer.read_bytes(0, 4).unwrap(), vec![1, 2, 3, 4]);

        buffer.destroy();
        buffer.destroy();
        drop(buffer);
        assert_eq!(allocator.outstanding_allocations(), 0);
        assert_eq!(device.live_objects(ObjectKind::Buffer), 0);
    }

    #[test]
    fn writes_are_bounds_checked() {
        let (_device, allocator) = allocator();
        let buffer = AllocatedBuffer::new(
            &allocator,
            "small",
            8,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();
        buffer.write(4, &[7u8, 8, 9, 10]).unwrap();
        assert_eq!(buffer.read_bytes(4, 4).unwrap(), vec![7, 8, 9, 10]);
        assert_eq!(buffer.write_bytes(6, &[0; 4]), Err(vk::Result::ERROR_VALIDATION_FAILED_EXT));
        assert_eq!(buffer.read_bytes(6, 4), Err(vk::Result::ERROR_VALIDATION_FAILED_EXT));
    }

    #[test]
    fn gpu_only_memory_cannot_be_mapped() {
        let (_device, allocator) = allocator();
        let buffer = AllocatedBuffer::new(
            &allocator,
            "device",
            16,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();
        assert!(buffer.write_bytes(0, &[1]).is_err());
    }

    #[test]
    fn failed_creation_is_not_counted() {
        let (device, allocator) = allocator();
        device.fail_next(FailurePoint::CreateBuffer, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let result = allocator.create_buffer(
            "doomed",
            16,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        assert_eq!(result.err(), Some(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        assert_eq!(allocator.outstanding_allocations(), 0);
    }

    #[test]
    fn image_view_is_released_with_image() {
        let (device, allocator) = allocator();
        let image = AllocatedImage::new(
            &allocator,
            "depth",
            vk::Extent2D { width: 8, height: 8 },
            vk::SampleCountFlags::TYPE_1,
            vk::Format::D32_SFLOAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
        )
        .unwrap();
        assert_eq!(device.live_objects(ObjectKind::ImageView), 1);
        drop(image);
        assert_eq!(device.live_objects(ObjectKind::ImageView), 0);
        assert_eq!(device.live_objects(ObjectKind::Image), 0);
    }
}
