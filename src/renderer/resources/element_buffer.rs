use ash::prelude::VkResult;
use ash::vk;
use crate::renderer::contexts::device_ctx::command_buffer::Recorder;
use crate::renderer::internals::resource_allocator::{AllocatedBuffer, ResourceAllocator};
use crate::renderer::internals::util::{LastResult, device_size, not_ready, validation_failed};
use crate::renderer::resources::{BindableResource, Drawer, UploadableResource};

/// Index element types a draw can consume
pub trait Index: bytemuck::Pod {
    const INDEX_TYPE: vk::IndexType;
}

impl Index for u16 {
    const INDEX_TYPE: vk::IndexType = vk::IndexType::UINT16;
}

impl Index for u32 {
    const INDEX_TYPE: vk::IndexType = vk::IndexType::UINT32;
}

/// Vertex data followed by optional index data in one device-local buffer.
///
/// Layout on the device is `[vertices | indices]`; indices start at
/// `vertex_bytes()`.
pub struct ElementBuffer {
    name: String,
    staging: Option<AllocatedBuffer>,
    device_buffer: Option<AllocatedBuffer>,
    vertex_bytes: vk::DeviceSize,
    index_bytes: vk::DeviceSize,
    vertex_count: u32,
    index_count: u32,
    index_type: Option<vk::IndexType>,
    uploaded: bool,
    last_result: LastResult,
}

impl ElementBuffer {
    pub fn new<V: bytemuck::Pod, I: Index>(
        allocator: &ResourceAllocator,
        name: &str,
        vertices: &[V],
        indices: &[I],
    ) -> Self {
        let index_type = (!indices.is_empty()).then_some(I::INDEX_TYPE);
        Self::from_bytes(
            allocator,
            name,
            bytemuck::cast_slice(vertices),
            vertices.len() as u32,
            bytemuck::cast_slice(indices),
            indices.len() as u32,
            index_type,
        )
    }

    /// Non-indexed geometry; drawn as a plain vertex range
    pub fn from_vertices<V: bytemuck::Pod>(allocator: &ResourceAllocator, name: &str, vertices: &[V]) -> Self {
        Self::new::<V, u32>(allocator, name, vertices, &[])
    }

    fn from_bytes(
        allocator: &ResourceAllocator,
        name: &str,
        vertex_data: &[u8],
        vertex_count: u32,
        index_data: &[u8],
        index_count: u32,
        index_type: Option<vk::IndexType>,
    ) -> Self {
        let mut buffer = Self {
            name: name.to_string(),
            staging: None,
            device_buffer: None,
            vertex_bytes: device_size(vertex_data.len()),
            index_bytes: device_size(index_data.len()),
            vertex_count,
            index_count,
            index_type,
            uploaded: false,
            last_result: LastResult::default(),
        };
        let result = buffer.stage(allocator, vertex_data, index_data);
        let _ = buffer.last_result.record(result);
        buffer
    }

    fn stage(&mut self, allocator: &ResourceAllocator, vertex_data: &[u8], index_data: &[u8]) -> VkResult<()> {
        if vertex_data.is_empty() {
            return Err(validation_failed(format!("Element buffer '{}' has no vertices", self.name)));
        }
        let total = self.vertex_bytes + self.index_bytes;

        let staging = AllocatedBuffer::new(
            allocator,
            &format!("{} staging", self.name),
            total,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        staging.write_bytes(0, vertex_data)?;
        if !index_data.is_empty() {
            staging.write_bytes(self.vertex_bytes, index_data)?;
        }

        let device_buffer = AllocatedBuffer::new(
            allocator,
            &self.name,
            total,
            vk::BufferUsageFlags::VERTEX_BUFFER
                | vk::BufferUsageFlags::INDEX_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        self.staging = Some(staging);
        self.device_buffer = Some(device_buffer);
        log::debug!(
            "Staged element buffer '{}': {} vertex bytes, {} index bytes",
            self.name, self.vertex_bytes, self.index_bytes,
        );
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.device_buffer.is_some()
    }

    pub fn is_uploaded(&self) -> bool {
        self.uploaded && self.device_buffer.is_some()
    }

    pub fn last_result(&self) -> vk::Result {
        self.last_result.get()
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.device_buffer.as_ref().map_or(vk::Buffer::null(), |buffer| buffer.handle)
    }

    pub fn vertex_bytes(&self) -> vk::DeviceSize {
        self.vertex_bytes
    }

    pub fn index_bytes(&self) -> vk::DeviceSize {
        self.index_bytes
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn is_indexed(&self) -> bool {
        self.index_type.is_some()
    }

    pub fn has_host_data(&self) -> bool {
        self.staging.is_some()
    }

    pub fn delete_gpu_data(&mut self) {
        self.device_buffer = None;
        self.uploaded = false;
    }

    fn ready_buffer(&self, operation: &str) -> VkResult<&AllocatedBuffer> {
        match self.device_buffer.as_ref() {
            Some(buffer) if self.uploaded => Ok(buffer),
            _ => {
                let err = not_ready(format!(
                    "Element buffer '{}' cannot {} before its upload",
                    self.name, operation,
                ));
                self.last_result.set(err);
                Err(err)
            }
        }
    }
}

impl UploadableResource for ElementBuffer {
    fn record_upload_commands(&mut self, recorder: &Recorder) -> VkResult<()> {
        let (Some(staging), Some(device_buffer)) = (self.staging.as_ref(), self.device_buffer.as_ref()) else {
            let err = not_ready(format!("Element buffer '{}' has no staged data", self.name));
            self.last_result.set(err);
            return Err(err);
        };
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: self.vertex_bytes + self.index_bytes,
        };
        recorder.device().cmd_copy_buffer(recorder.handle(), staging.handle, device_buffer.handle, &[region]);
        self.uploaded = true;
        Ok(())
    }

    fn delete_host_data(&mut self) {
        self.staging = None;
    }
}

impl BindableResource for ElementBuffer {
    fn record_bind(&self, recorder: &Recorder) -> VkResult<()> {
        let buffer = self.ready_buffer("bind")?;
        let device = recorder.device();
        device.cmd_bind_vertex_buffers(recorder.handle(), 0, &[buffer.handle], &[0]);
        if let Some(index_type) = self.index_type {
            device.cmd_bind_index_buffer(recorder.handle(), buffer.handle, self.vertex_bytes, index_type);
        }
        Ok(())
    }
}

impl Drawer for ElementBuffer {
    fn record_draw(&self, recorder: &Recorder) -> VkResult<()> {
        self.ready_buffer("draw")?;
        let device = recorder.device();
        if self.is_indexed() {
            device.cmd_draw_indexed(recorder.handle(), self.index_count, 1, 0, 0, 0);
        } else {
            device.cmd_draw(recorder.handle(), self.vertex_count, 1, 0, 0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use crate::renderer::backend::DeviceBackend;
    use super::*;
    use crate::renderer::backend::headless::{HeadlessDevice, ObjectKind, RecordedCommand};
    use crate::renderer::internals::transfer_ctx::TransferContext;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    struct Vertex {
        position: [f32; 2],
        uv: [f32; 2],
    }

    const QUAD: [Vertex; 4] = [
        Vertex { position: [-1.0, -1.0], uv: [0.0, 0.0] },
        Vertex { position: [1.0, -1.0], uv: [1.0, 0.0] },
        Vertex { position: [1.0, 1.0], uv: [1.0, 1.0] },
        Vertex { position: [-1.0, 1.0], uv: [0.0, 1.0] },
    ];
    const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

    fn setup() -> (Arc<HeadlessDevice>, ResourceAllocator) {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = Arc::new(HeadlessDevice::new());
        let allocator = ResourceAllocator::new(device.clone()).unwrap();
        (device, allocator)
    }

    #[test]
    fn device_layout_is_vertices_then_indices() {
        let (device, allocator) = setup();
        let mut quad = ElementBuffer::new(&allocator, "quad", &QUAD, &QUAD_INDICES);
        assert!(quad.is_valid());
        assert_eq!(quad.vertex_bytes(), size_of_val(&QUAD) as u64);

        let transfer = TransferContext::new(&allocator).unwrap();
        transfer.immediate_submit(|recorder| quad.record_upload_commands(recorder)).unwrap();
        quad.delete_host_data();

        let contents = device.buffer_contents(quad.buffer()).unwrap();
        let vertex_bytes = quad.vertex_bytes() as usize;
        assert_eq!(&contents[..vertex_bytes], bytemuck::cast_slice::<_, u8>(&QUAD));
        assert_eq!(&contents[vertex_bytes..], bytemuck::cast_slice::<_, u8>(&QUAD_INDICES));
        assert_eq!(device.live_objects(ObjectKind::Buffer), 1);
    }

    #[test]
    fn bind_and_draw_use_index_offset() {
        let (device, allocator) = setup();
        let mut quad = ElementBuffer::new(&allocator, "quad", &QUAD, &QUAD_INDICES);
        let cb = device
            .allocate_command_buffer(allocator.command_pool(), vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        device.begin_command_buffer(cb, vk::CommandBufferUsageFlags::empty(), None).unwrap();
        let recorder = Recorder::new(&*device, cb, 0);

        assert_eq!(quad.record_bind(&recorder), Err(vk::Result::NOT_READY));
        assert_eq!(quad.record_draw(&recorder), Err(vk::Result::NOT_READY));
        assert!(device.recorded_commands(cb).is_empty());

        quad.record_upload_commands(&recorder).unwrap();
        quad.record_bind(&recorder).unwrap();
        quad.record_draw(&recorder).unwrap();

        let commands = device.recorded_commands(cb);
        assert!(matches!(
            &commands[1],
            RecordedCommand::BindVertexBuffers { first_binding: 0, offsets, .. } if offsets == &[0],
        ));
        assert!(matches!(
            commands[2],
            RecordedCommand::BindIndexBuffer { offset, index_type, .. }
                if offset == size_of_val(&QUAD) as u64 && index_type == vk::IndexType::UINT16,
        ));
        assert!(matches!(commands[3], RecordedCommand::DrawIndexed { index_count: 6, instance_count: 1, .. }));
    }

    #[test]
    fn vertex_only_buffers_draw_without_indices() {
        let (device, allocator) = setup();
        let mut triangle = ElementBuffer::from_vertices(&allocator, "triangle", &QUAD[..3]);
        assert!(!triangle.is_indexed());

        let cb = device
            .allocate_command_buffer(allocator.command_pool(), vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        device.begin_command_buffer(cb, vk::CommandBufferUsageFlags::empty(), None).unwrap();
        let recorder = Recorder::new(&*device, cb, 0);
        triangle.record_upload_commands(&recorder).unwrap();
        triangle.record_bind(&recorder).unwrap();
        triangle.record_draw(&recorder).unwrap();

        let commands = device.recorded_commands(cb);
        assert_eq!(commands.len(), 3);
        assert!(matches!(commands[2], RecordedCommand::Draw { vertex_count: 3, .. }));
    }

    #[test]
    fn empty_vertices_are_rejected() {
        let (device, allocator) = setup();
        let empty = ElementBuffer::new::<Vertex, u32>(&allocator, "empty", &[], &[0, 1, 2]);
        assert!(!empty.is_valid());
        assert_eq!(empty.last_result(), vk::Result::ERROR_VALIDATION_FAILED_EXT);
        assert_eq!(device.live_objects(ObjectKind::Buffer), 0);
    }
}
