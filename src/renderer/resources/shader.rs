use std::io::Cursor;
use std::path::{Path, PathBuf};
use ash::prelude::VkResult;
use ash::vk;
use crate::renderer::internals::resource_allocator::ResourceAllocator;
use crate::renderer::internals::util::validation_failed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Vertex => "vert",
            Self::Fragment => "frag",
            Self::Compute => "comp",
        }
    }

    pub fn flags(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// SPIR-V words for one shader stage
#[derive(Debug, Clone)]
pub struct ShaderBinary {
    pub stage: ShaderStage,
    pub words: Vec<u32>,
}

impl ShaderBinary {
    pub fn from_words(stage: ShaderStage, words: Vec<u32>) -> Self {
        Self { stage, words }
    }

    pub fn from_bytes(stage: ShaderStage, bytes: &[u8]) -> VkResult<Self> {
        let words = ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|err| {
            validation_failed(format!("Invalid {} shader binary: {}", stage.extension(), err))
        })?;
        Ok(Self { stage, words })
    }

    /// `<dir>/<name>.<vert|frag|comp>.spv`
    pub fn path(dir: &Path, name: &str, stage: ShaderStage) -> PathBuf {
        dir.join(format!("{}.{}.spv", name, stage.extension()))
    }

    pub fn load(dir: &Path, name: &str, stage: ShaderStage) -> VkResult<Self> {
        let path = Self::path(dir, name, stage);
        let bytes = std::fs::read(&path).map_err(|err| {
            log::error!("Failed to read shader {}: {}", path.display(), err);
            vk::Result::ERROR_INITIALIZATION_FAILED
        })?;
        Self::from_bytes(stage, &bytes)
    }
}

/// Vertex and fragment binaries for a graphics pipeline
#[derive(Debug, Clone)]
pub struct GraphicsShaders {
    pub vertex: ShaderBinary,
    pub fragment: ShaderBinary,
}

impl GraphicsShaders {
    pub fn load(dir: &Path, name: &str) -> VkResult<Self> {
        Ok(Self {
            vertex: ShaderBinary::load(dir, name, ShaderStage::Vertex)?,
            fragment: ShaderBinary::load(dir, name, ShaderStage::Fragment)?,
        })
    }
}

/// Native shader module, destroyed on drop
pub struct ShaderModule {
    handle: vk::ShaderModule,
    stage: ShaderStage,
    allocator: ResourceAllocator,
}

impl ShaderModule {
    pub fn new(allocator: &ResourceAllocator, binary: &ShaderBinary) -> VkResult<Self> {
        let handle = allocator.device().create_shader_module(&binary.words)?;
        Ok(Self {
            handle,
            stage: binary.stage,
            allocator: allocator.clone(),
        })
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        self.allocator.device().destroy_shader_module(self.handle);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use super::*;
    use crate::renderer::backend::headless::{HeadlessDevice, ObjectKind};

    /// Smallest blob the headless device accepts as SPIR-V
    pub(crate) fn spirv_stub() -> Vec<u32> {
        vec![0x0723_0203, 0x0001_0000, 0, 1, 0]
    }

    #[test]
    fn paths_follow_naming_convention() {
        let path = ShaderBinary::path(Path::new("shaders"), "triangle", ShaderStage::Fragment);
        assert_eq!(path, PathBuf::from("shaders/triangle.frag.spv"));
    }

    #[test]
    fn bytes_must_be_word_aligned() {
        let words = spirv_stub();
        let bytes: &[u8] = bytemuck::cast_slice(&words);
        let binary = ShaderBinary::from_bytes(ShaderStage::Vertex, bytes).unwrap();
        assert_eq!(binary.words, words);

        assert_eq!(
            ShaderBinary::from_bytes(ShaderStage::Vertex, &bytes[..7]).err(),
            Some(vk::Result::ERROR_VALIDATION_FAILED_EXT),
        );
    }

    #[test]
    fn missing_file_is_an_initialization_failure() {
        let result = ShaderBinary::load(Path::new("does-not-exist"), "nothing", ShaderStage::Compute);
        assert_eq!(result.err(), Some(vk::Result::ERROR_INITIALIZATION_FAILED));
    }

    #[test]
    fn modules_are_destroyed_on_drop() {
        let device = Arc::new(HeadlessDevice::new());
        let allocator = ResourceAllocator::new(device.clone()).unwrap();
        let module = ShaderModule::new(&allocator, &ShaderBinary::from_words(ShaderStage::Vertex, spirv_stub())).unwrap();
        assert_eq!(device.live_objects(ObjectKind::ShaderModule), 1);
        drop(module);
        assert_eq!(device.live_objects(ObjectKind::ShaderModule), 0);
    }
}
