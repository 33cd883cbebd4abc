use std::collections::BTreeMap;
use std::sync::Arc;
use ash::prelude::VkResult;
use ash::vk;
use smallvec::{SmallVec, smallvec};
use crate::renderer::backend::{DescriptorResources, DescriptorWrite};
use crate::renderer::contexts::device_ctx::command_buffer::Recorder;
use crate::renderer::internals::resource_allocator::ResourceAllocator;
use crate::renderer::internals::util::{LastResult, not_ready, validation_failed};
use crate::renderer::resources::pipeline::PipelineLayout;
use crate::renderer::resources::sampler::Sampler;
use crate::renderer::resources::uniform_buffer::UniformBuffer;
use crate::renderer::resources::{BindableResource, DescriptorImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    UniformBuffer,
    DynamicUniformBuffer,
    CombinedSampler,
    Sampler,
    StorageImage,
    Texture,
}

impl BindingKind {
    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::DynamicUniformBuffer => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            Self::CombinedSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::Sampler => vk::DescriptorType::SAMPLER,
            Self::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            Self::Texture => vk::DescriptorType::SAMPLED_IMAGE,
        }
    }
}

/// One layout slot: its kind and the entries of the matching typed list it holds
#[derive(Debug, Clone)]
pub struct BindingSlot {
    pub kind: BindingKind,
    pub binding: u32,
    pub indices: SmallVec<[usize; 4]>,
}

/// Resources bound against a pipeline layout, with one native set per
/// swapchain image.
///
/// All `assign_*` calls come before the first `update_device`; binding
/// before that update is refused with `NOT_READY`.
pub struct DescriptorSet {
    layout: Arc<PipelineLayout>,
    image_count: usize,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,

    uniform_buffers: Vec<Arc<UniformBuffer>>,
    combined_samplers: Vec<Arc<dyn DescriptorImage>>,
    samplers: Vec<Arc<Sampler>>,
    storage_images: Vec<Arc<dyn DescriptorImage>>,
    textures: Vec<Arc<dyn DescriptorImage>>,
    bindings: Vec<BindingSlot>,

    updated: bool,
    last_result: LastResult,
    allocator: ResourceAllocator,
}

impl DescriptorSet {
    pub fn new(allocator: &ResourceAllocator, layout: Arc<PipelineLayout>, image_count: usize) -> Self {
        Self {
            layout,
            image_count,
            pool: vk::DescriptorPool::null(),
            sets: Vec::new(),
            uniform_buffers: Vec::new(),
            combined_samplers: Vec::new(),
            samplers: Vec::new(),
            storage_images: Vec::new(),
            textures: Vec::new(),
            bindings: Vec::new(),
            updated: false,
            last_result: LastResult::default(),
            allocator: allocator.clone(),
        }
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    pub fn bindings(&self) -> &[BindingSlot] {
        &self.bindings
    }

    pub fn pool(&self) -> vk::DescriptorPool {
        self.pool
    }

    pub fn set(&self, image_index: usize) -> Option<vk::DescriptorSet> {
        self.sets.get(image_index).copied()
    }

    pub fn is_updated(&self) -> bool {
        self.updated
    }

    pub fn last_result(&self) -> vk::Result {
        self.last_result.get()
    }

    fn fail(&self, message: String) -> vk::Result {
        let err = validation_failed(message);
        self.last_result.set(err);
        err
    }

    fn next_binding(&self) -> u32 {
        self.bindings.iter().map(|slot| slot.binding + 1).max().unwrap_or(0)
    }

    /// Checks a new entry against the layout and returns the slot it joins,
    /// if one is already open
    fn check_slot(&self, kind: BindingKind, binding: u32, extends: bool) -> VkResult<Option<usize>> {
        if self.updated {
            return Err(self.fail(format!(
                "Cannot assign binding {} after the descriptor set was written to the device",
                binding,
            )));
        }
        let Some(reserved) = self.layout.binding(binding).copied() else {
            return Err(self.fail(format!("Binding {} is not part of the pipeline layout", binding)));
        };
        if reserved.descriptor_type != kind.descriptor_type() {
            return Err(self.fail(format!(
                "Binding {} was reserved as {:?}, assigned as {:?}",
                binding, reserved.descriptor_type, kind.descriptor_type(),
            )));
        }

        let open = extends
            .then(|| self.bindings.iter().position(|slot| slot.binding == binding))
            .flatten();
        let length = open.map_or(0, |slot| self.bindings[slot].indices.len()) + 1;
        if length > reserved.count as usize {
            return Err(self.fail(format!(
                "Binding {} holds {} descriptors, assignment would make {}",
                binding, reserved.count, length,
            )));
        }
        if open.is_none() && self.bindings.iter().any(|slot| slot.binding == binding) {
            return Err(self.fail(format!("Binding {} is already assigned", binding)));
        }
        Ok(open)
    }

    fn push_slot(&mut self, kind: BindingKind, binding: u32, index: usize, open: Option<usize>) {
        match open {
            Some(slot) => self.bindings[slot].indices.push(index),
            None => self.bindings.push(BindingSlot {
                kind,
                binding,
                indices: smallvec![index],
            }),
        }
    }

    pub fn assign_uniform_buffer(&mut self, buffer: Arc<UniformBuffer>, dynamic: bool) -> VkResult<()> {
        let kind = if dynamic {
            BindingKind::DynamicUniformBuffer
        } else {
            BindingKind::UniformBuffer
        };
        let binding = self.next_binding();
        let open = self.check_slot(kind, binding, false)?;
        if !buffer.is_valid() || buffer.frame_count() < self.image_count {
            return Err(self.fail(format!(
                "Uniform buffer '{}' needs {} valid frames to back binding {}",
                buffer.name(), self.image_count, binding,
            )));
        }
        self.uniform_buffers.push(buffer);
        self.push_slot(kind, binding, self.uniform_buffers.len() - 1, open);
        Ok(())
    }

    pub fn assign_combined_sampler(&mut self, image: Arc<dyn DescriptorImage>) -> VkResult<()> {
        let binding = self.next_binding();
        let open = self.check_slot(BindingKind::CombinedSampler, binding, false)?;
        if image.sampler() == vk::Sampler::null() {
            return Err(self.fail(format!("Combined sampler at binding {} has no filter", binding)));
        }
        self.combined_samplers.push(image);
        self.push_slot(BindingKind::CombinedSampler, binding, self.combined_samplers.len() - 1, open);
        Ok(())
    }

    pub fn assign_sampler(&mut self, sampler: Arc<Sampler>) -> VkResult<()> {
        let binding = self.next_binding();
        let open = self.check_slot(BindingKind::Sampler, binding, false)?;
        if !sampler.is_valid() {
            return Err(self.fail(format!("Sampler at binding {} failed to create", binding)));
        }
        self.samplers.push(sampler);
        self.push_slot(BindingKind::Sampler, binding, self.samplers.len() - 1, open);
        Ok(())
    }

    pub fn assign_storage_image(&mut self, image: Arc<dyn DescriptorImage>) -> VkResult<()> {
        let binding = self.next_binding();
        let open = self.check_slot(BindingKind::StorageImage, binding, false)?;
        self.storage_images.push(image);
        self.push_slot(BindingKind::StorageImage, binding, self.storage_images.len() - 1, open);
        Ok(())
    }

    /// With an explicit binding, textures group into one array slot: the first
    /// assignment opens it, later ones append to it
    pub fn assign_texture(&mut self, image: Arc<dyn DescriptorImage>, explicit_binding: Option<u32>) -> VkResult<()> {
        let (binding, extends) = match explicit_binding {
            Some(binding) => (binding, true),
            None => (self.next_binding(), false),
        };
        let open = self.check_slot(BindingKind::Texture, binding, extends)?;
        self.textures.push(image);
        self.push_slot(BindingKind::Texture, binding, self.textures.len() - 1, open);
        Ok(())
    }

    /// Descriptor counts per type for one set, from the assigned resources
    fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        let mut per_type: BTreeMap<i32, u32> = BTreeMap::new();
        for slot in &self.bindings {
            *per_type.entry(slot.kind.descriptor_type().as_raw()).or_insert(0) += slot.indices.len() as u32;
        }
        per_type
            .into_iter()
            .map(|(ty, count)| vk::DescriptorPoolSize {
                ty: vk::DescriptorType::from_raw(ty),
                descriptor_count: self.image_count as u32 * count,
            })
            .collect()
    }

    /// Every reserved binding must hold exactly its reserved descriptor count
    fn check_complete(&self) -> VkResult<()> {
        for reserved in self.layout.bindings() {
            let assigned = self
                .bindings
                .iter()
                .find(|slot| slot.binding == reserved.binding)
                .map_or(0, |slot| slot.indices.len());
            if assigned != reserved.count as usize {
                return Err(self.fail(format!(
                    "Binding {} reserves {} descriptors but {} were assigned",
                    reserved.binding, reserved.count, assigned,
                )));
            }
        }
        Ok(())
    }

    fn create_pool(&mut self) -> VkResult<()> {
        if self.image_count == 0 {
            return Err(validation_failed("Descriptor set needs at least one swapchain image"));
        }
        let device = self.allocator.device();
        let pool = device.create_descriptor_pool(&self.pool_sizes(), self.image_count as u32)?;
        let layouts = vec![self.layout.set_layout(); self.image_count];
        match device.allocate_descriptor_sets(pool, &layouts) {
            Ok(sets) => {
                self.pool = pool;
                self.sets = sets;
                Ok(())
            }
            Err(err) => {
                device.destroy_descriptor_pool(pool);
                Err(err)
            }
        }
    }

    fn resources_for(&self, slot: &BindingSlot, image_index: usize) -> VkResult<DescriptorResources> {
        let images = |list: &[Arc<dyn DescriptorImage>]| -> VkResult<DescriptorResources> {
            let mut infos = SmallVec::new();
            for &index in &slot.indices {
                let image = &list[index];
                if !image.is_ready() {
                    return Err(not_ready(format!("Image at binding {} has not been uploaded", slot.binding)));
                }
                infos.push(image.image_info());
            }
            Ok(DescriptorResources::Images(infos))
        };

        match slot.kind {
            BindingKind::UniformBuffer | BindingKind::DynamicUniformBuffer => {
                let dynamic = slot.kind == BindingKind::DynamicUniformBuffer;
                let mut infos = SmallVec::new();
                for &index in &slot.indices {
                    infos.push(self.uniform_buffers[index].descriptor_info(image_index, dynamic)?);
                }
                Ok(DescriptorResources::Buffers(infos))
            }
            BindingKind::CombinedSampler => images(&self.combined_samplers),
            BindingKind::StorageImage => images(&self.storage_images),
            BindingKind::Texture => images(&self.textures),
            BindingKind::Sampler => Ok(DescriptorResources::Images(
                slot.indices
                    .iter()
                    .map(|&index| vk::DescriptorImageInfo {
                        sampler: self.samplers[index].handle(),
                        image_view: vk::ImageView::null(),
                        image_layout: vk::ImageLayout::UNDEFINED,
                    })
                    .collect(),
            )),
        }
    }

    /// Creates the pool and sets on first use, then writes every assigned
    /// binding for every swapchain image
    pub fn update_device(&mut self) -> VkResult<()> {
        let result = self.try_update_device();
        self.last_result.record(result)
    }

    fn try_update_device(&mut self) -> VkResult<()> {
        if self.pool == vk::DescriptorPool::null() {
            self.check_complete()?;
            self.create_pool()?;
        }

        let mut writes = Vec::with_capacity(self.sets.len() * self.bindings.len());
        for (image_index, &set) in self.sets.iter().enumerate() {
            for slot in &self.bindings {
                writes.push(DescriptorWrite {
                    set,
                    binding: slot.binding,
                    array_element: 0,
                    descriptor_type: slot.kind.descriptor_type(),
                    resources: self.resources_for(slot, image_index)?,
                });
            }
        }
        self.allocator.device().update_descriptor_sets(&writes);
        self.updated = true;
        Ok(())
    }

    /// Offsets for every dynamic uniform buffer, in binding order
    pub fn dynamic_offsets(&self, frame_index: usize) -> SmallVec<[u32; 4]> {
        let mut slots: SmallVec<[&BindingSlot; 8]> = self
            .bindings
            .iter()
            .filter(|slot| slot.kind == BindingKind::DynamicUniformBuffer)
            .collect();
        slots.sort_by_key(|slot| slot.binding);
        slots
            .iter()
            .flat_map(|slot| slot.indices.iter())
            .map(|&index| self.uniform_buffers[index].dynamic_offset(frame_index))
            .collect()
    }
}

impl BindableResource for DescriptorSet {
    fn record_bind(&self, recorder: &Recorder) -> VkResult<()> {
        if !self.updated {
            let err = not_ready("Descriptor set was bound before update_device");
            self.last_result.set(err);
            return Err(err);
        }
        let frame_index = recorder.frame_index();
        let Some(set) = self.set(frame_index) else {
            return Err(self.fail(format!("Descriptor set has no set for frame {}", frame_index)));
        };
        recorder.device().cmd_bind_descriptor_sets(
            recorder.handle(),
            self.layout.bind_point(),
            self.layout.handle(),
            0,
            &[set],
            &self.dynamic_offsets(frame_index),
        );
        Ok(())
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        // Sets are freed with their pool
        self.allocator.device().destroy_descriptor_pool(self.pool);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use crate::renderer::backend::DeviceBackend;
    use super::*;
    use crate::renderer::backend::headless::{FailurePoint, HeadlessDevice, ObjectKind, RecordedCommand};
    use crate::renderer::internals::transfer_ctx::TransferContext;
    use crate::renderer::resources::UploadableResource;
    use crate::renderer::resources::pipeline::PipelineSetup;
    use crate::renderer::resources::sampler::{CombinedSampler, SamplerSettings};
    use crate::renderer::resources::texture::Texture;
    use crate::renderer::resources::uniform_buffer::UniformBuffering;

    const IMAGES: usize = 3;
    const EXTENT: vk::Extent2D = vk::Extent2D { width: 1, height: 1 };

    fn setup() -> (Arc<HeadlessDevice>, ResourceAllocator) {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = Arc::new(HeadlessDevice::new());
        let allocator = ResourceAllocator::new(device.clone()).unwrap();
        (device, allocator)
    }

    fn layout(allocator: &ResourceAllocator, build: impl FnOnce(&mut PipelineSetup)) -> Arc<PipelineLayout> {
        let mut setup = PipelineSetup::new();
        build(&mut setup);
        Arc::new(PipelineLayout::new(allocator, &setup, vk::PipelineBindPoint::GRAPHICS).unwrap())
    }

    fn uploaded_texture(allocator: &ResourceAllocator, transfer: &TransferContext) -> Arc<Texture> {
        let mut texture = Texture::from_pixels(allocator, "texel", &[255; 4], EXTENT, vk::Format::R8G8B8A8_UNORM);
        transfer.immediate_submit(|recorder| texture.record_upload_commands(recorder)).unwrap();
        Arc::new(texture)
    }

    fn uploaded_combined(allocator: &ResourceAllocator, transfer: &TransferContext) -> Arc<CombinedSampler> {
        let sampler = Arc::new(Sampler::new(allocator, SamplerSettings::default()));
        let mut combined = CombinedSampler::from_pixels(
            allocator,
            "albedo",
            sampler,
            &[0; 4],
            EXTENT,
            vk::Format::R8G8B8A8_SRGB,
        );
        transfer.immediate_submit(|recorder| combined.record_upload_commands(recorder)).unwrap();
        Arc::new(combined)
    }

    #[test]
    fn pool_is_sized_per_image() {
        let (device, allocator) = setup();
        let transfer = TransferContext::new(&allocator).unwrap();
        let layout = layout(&allocator, |setup| {
            setup.reserve_uniform_buffer(vk::ShaderStageFlags::VERTEX, 1);
            setup.reserve_combined_sampler(vk::ShaderStageFlags::FRAGMENT, 1);
            setup.reserve_texture(vk::ShaderStageFlags::FRAGMENT, 4);
        });
        let mut set = DescriptorSet::new(&allocator, layout, IMAGES);

        let uniform = Arc::new(UniformBuffer::new(&allocator, "camera", 64, IMAGES, UniformBuffering::Shared));
        set.assign_uniform_buffer(uniform.clone(), false).unwrap();
        set.assign_combined_sampler(uploaded_combined(&allocator, &transfer)).unwrap();
        for _ in 0..4 {
            set.assign_texture(uploaded_texture(&allocator, &transfer), Some(2)).unwrap();
        }
        assert_eq!(set.bindings().len(), 3);
        assert_eq!(set.bindings()[2].indices.len(), 4);

        set.update_device().unwrap();
        let mut sizes: Vec<_> = device
            .descriptor_pool_sizes(set.pool())
            .into_iter()
            .map(|size| (size.ty, size.descriptor_count))
            .collect();
        sizes.sort_by_key(|(ty, _)| ty.as_raw());
        assert_eq!(sizes, vec![
            (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 3),
            (vk::DescriptorType::SAMPLED_IMAGE, 12),
            (vk::DescriptorType::UNIFORM_BUFFER, 3),
        ]);
        assert_eq!(device.descriptor_pool_max_sets(set.pool()), IMAGES as u32);

        // Static uniform bindings point each image at its own slot
        let write = device.descriptor_write(set.set(2).unwrap(), 0).unwrap();
        match write.resources {
            DescriptorResources::Buffers(infos) => assert_eq!(infos[0].offset, 2 * uniform.stride()),
            other => panic!("expected buffers, got {:?}", other),
        }
        assert_eq!(device.validation_error_count(), 0);
    }

    #[test]
    fn over_assignment_is_rejected_before_any_native_call() {
        let (device, allocator) = setup();
        let transfer = TransferContext::new(&allocator).unwrap();
        let layout = layout(&allocator, |setup| {
            setup.reserve_texture(vk::ShaderStageFlags::FRAGMENT, 2);
        });
        let mut set = DescriptorSet::new(&allocator, layout, IMAGES);
        let texture = uploaded_texture(&allocator, &transfer);

        set.assign_texture(texture.clone(), Some(0)).unwrap();
        set.assign_texture(texture.clone(), Some(0)).unwrap();
        assert_eq!(set.assign_texture(texture.clone(), Some(0)), Err(vk::Result::ERROR_VALIDATION_FAILED_EXT));
        // Binding 1 was never reserved
        assert_eq!(set.assign_texture(texture.clone(), Some(1)), Err(vk::Result::ERROR_VALIDATION_FAILED_EXT));
        assert_eq!(device.live_objects(ObjectKind::DescriptorPool), 0);
    }

    #[test]
    fn partially_assigned_set_is_not_written() {
        let (device, allocator) = setup();
        let transfer = TransferContext::new(&allocator).unwrap();
        let layout = layout(&allocator, |setup| {
            setup.reserve_uniform_buffer(vk::ShaderStageFlags::VERTEX, 1);
            setup.reserve_combined_sampler(vk::ShaderStageFlags::FRAGMENT, 1);
        });
        let uniform = Arc::new(UniformBuffer::new(&allocator, "camera", 64, IMAGES, UniformBuffering::Shared));
        let mut set = DescriptorSet::new(&allocator, layout, IMAGES);
        set.assign_uniform_buffer(uniform, false).unwrap();

        assert_eq!(set.update_device(), Err(vk::Result::ERROR_VALIDATION_FAILED_EXT));
        assert!(!set.is_updated());
        assert_eq!(set.pool(), vk::DescriptorPool::null());
        assert_eq!(device.live_objects(ObjectKind::DescriptorPool), 0);

        // Completing the set lets the same object be written
        set.assign_combined_sampler(uploaded_combined(&allocator, &transfer)).unwrap();
        set.update_device().unwrap();
        let mut sizes: Vec<_> = device
            .descriptor_pool_sizes(set.pool())
            .into_iter()
            .map(|size| (size.ty, size.descriptor_count))
            .collect();
        sizes.sort_by_key(|(ty, _)| ty.as_raw());
        assert_eq!(sizes, vec![
            (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, IMAGES as u32),
            (vk::DescriptorType::UNIFORM_BUFFER, IMAGES as u32),
        ]);
    }

    #[test]
    fn partially_filled_texture_array_is_rejected() {
        let (_device, allocator) = setup();
        let transfer = TransferContext::new(&allocator).unwrap();
        let layout = layout(&allocator, |setup| {
            setup.reserve_texture(vk::ShaderStageFlags::FRAGMENT, 2);
        });
        let mut set = DescriptorSet::new(&allocator, layout, IMAGES);
        set.assign_texture(uploaded_texture(&allocator, &transfer), Some(0)).unwrap();
        assert_eq!(set.update_device(), Err(vk::Result::ERROR_VALIDATION_FAILED_EXT));
        assert_eq!(set.last_result(), vk::Result::ERROR_VALIDATION_FAILED_EXT);
    }

    #[test]
    fn type_mismatch_and_late_assignment_are_rejected() {
        let (_device, allocator) = setup();
        let layout = layout(&allocator, |setup| {
            setup.reserve_uniform_buffer(vk::ShaderStageFlags::VERTEX, 1);
            setup.reserve_dynamic_uniform_buffer(vk::ShaderStageFlags::VERTEX, 1);
        });
        let uniform = Arc::new(UniformBuffer::new(&allocator, "ubo", 16, IMAGES, UniformBuffering::Shared));
        let mut set = DescriptorSet::new(&allocator, layout, IMAGES);

        assert_eq!(
            set.assign_uniform_buffer(uniform.clone(), true),
            Err(vk::Result::ERROR_VALIDATION_FAILED_EXT),
        );
        set.assign_uniform_buffer(uniform.clone(), false).unwrap();
        set.assign_uniform_buffer(uniform.clone(), true).unwrap();
        set.update_device().unwrap();
        assert_eq!(
            set.assign_uniform_buffer(uniform, true),
            Err(vk::Result::ERROR_VALIDATION_FAILED_EXT),
        );
    }

    #[test]
    fn binding_requires_update_and_supplies_dynamic_offsets() {
        let (device, allocator) = setup();
        let layout = layout(&allocator, |setup| {
            setup.reserve_dynamic_uniform_buffer(vk::ShaderStageFlags::VERTEX, 1);
        });
        let uniform = Arc::new(UniformBuffer::new(&allocator, "model", 64, IMAGES, UniformBuffering::Shared));
        let mut set = DescriptorSet::new(&allocator, layout.clone(), IMAGES);
        set.assign_uniform_buffer(uniform.clone(), true).unwrap();

        let cb = device
            .allocate_command_buffer(allocator.command_pool(), vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        device.begin_command_buffer(cb, vk::CommandBufferUsageFlags::empty(), None).unwrap();
        let recorder = Recorder::new(&*device, cb, 1);
        assert_eq!(set.record_bind(&recorder), Err(vk::Result::NOT_READY));
        assert!(device.recorded_commands(cb).is_empty());

        set.update_device().unwrap();
        set.record_bind(&recorder).unwrap();
        match &device.recorded_commands(cb)[0] {
            RecordedCommand::BindDescriptorSets { layout: bound, sets, dynamic_offsets, .. } => {
                assert_eq!(*bound, layout.handle());
                assert_eq!(sets, &vec![set.set(1).unwrap()]);
                assert_eq!(dynamic_offsets, &vec![uniform.stride() as u32]);
            }
            other => panic!("expected descriptor bind, got {:?}", other),
        }
        let write = device.descriptor_write(set.set(1).unwrap(), 0).unwrap();
        match write.resources {
            DescriptorResources::Buffers(infos) => assert_eq!(infos[0].offset, 0),
            other => panic!("expected buffers, got {:?}", other),
        }
    }

    #[test]
    fn per_image_uniforms_resolve_to_their_own_buffer() {
        let (device, allocator) = setup();
        let layout = layout(&allocator, |setup| {
            setup.reserve_uniform_buffer(vk::ShaderStageFlags::FRAGMENT, 1);
        });
        let uniform = Arc::new(UniformBuffer::new(&allocator, "lights", 32, IMAGES, UniformBuffering::PerImage));
        let mut set = DescriptorSet::new(&allocator, layout, IMAGES);
        set.assign_uniform_buffer(uniform.clone(), false).unwrap();
        set.update_device().unwrap();

        for image in 0..IMAGES {
            let write = device.descriptor_write(set.set(image).unwrap(), 0).unwrap();
            match write.resources {
                DescriptorResources::Buffers(infos) => {
                    assert_eq!(infos[0].buffer, uniform.slot(image).unwrap().buffer);
                }
                other => panic!("expected buffers, got {:?}", other),
            }
        }
    }

    #[test]
    fn unuploaded_images_and_failed_pools_surface_codes() {
        let (device, allocator) = setup();
        let layout = layout(&allocator, |setup| {
            setup.reserve_texture(vk::ShaderStageFlags::FRAGMENT, 1);
        });
        let texture = Arc::new(Texture::from_pixels(&allocator, "raw", &[0; 4], EXTENT, vk::Format::R8G8B8A8_UNORM));

        let mut set = DescriptorSet::new(&allocator, layout.clone(), IMAGES);
        set.assign_texture(texture.clone(), None).unwrap();
        assert_eq!(set.update_device(), Err(vk::Result::NOT_READY));
        assert!(!set.is_updated());

        let mut failing = DescriptorSet::new(&allocator, layout, IMAGES);
        failing.assign_texture(texture, None).unwrap();
        device.fail_next(FailurePoint::AllocateDescriptorSets, vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        assert_eq!(failing.update_device(), Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        assert_eq!(failing.last_result(), vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        assert_eq!(failing.pool(), vk::DescriptorPool::null());
    }
}
