use ash::prelude::VkResult;
use ash::vk;
use crate::renderer::backend::{DeviceBackend, LayoutBinding};

#[derive(Default, Clone)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<LayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        descriptor_count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.push_binding(binding, descriptor_type, descriptor_count, stages);
        self
    }

    pub fn push_binding(
        &mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        descriptor_count: u32,
        stages: vk::ShaderStageFlags,
    ) {
        self.bindings.push(LayoutBinding {
            binding,
            descriptor_type,
            count: descriptor_count,
            stages,
        });
    }

    /// Appends a binding whose index is the number of bindings added so far
    pub fn push_next(
        &mut self,
        descriptor_type: vk::DescriptorType,
        descriptor_count: u32,
        stages: vk::ShaderStageFlags,
    ) -> u32 {
        let binding = self.bindings.len() as u32;
        self.push_binding(binding, descriptor_type, descriptor_count, stages);
        binding
    }

    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn build(&self, device: &dyn DeviceBackend) -> VkResult<vk::DescriptorSetLayout> {
        device.create_descriptor_set_layout(&self.bindings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_follow_call_order() {
        let mut builder = DescriptorSetLayoutBuilder::new();
        let ubo = builder.push_next(vk::DescriptorType::UNIFORM_BUFFER, 1, vk::ShaderStageFlags::VERTEX);
        let tex = builder.push_next(
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            4,
            vk::ShaderStageFlags::FRAGMENT,
        );
        assert_eq!((ubo, tex), (0, 1));
        assert_eq!(builder.bindings()[1].count, 4);

        let chained = DescriptorSetLayoutBuilder::new()
            .add_binding(3, vk::DescriptorType::SAMPLER, 1, vk::ShaderStageFlags::ALL);
        assert_eq!(chained.bindings()[0].binding, 3);
    }
}
