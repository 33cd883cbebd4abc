use ash::vk;

/// Bytes per texel for the uncompressed formats the resource layer uploads
pub fn texel_size(format: vk::Format) -> Option<u32> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB | vk::Format::R8_UINT | vk::Format::S8_UINT => 1,
        vk::Format::R8G8_UNORM | vk::Format::R8G8_SRGB | vk::Format::R16_SFLOAT
        | vk::Format::R16_UNORM | vk::Format::R16_UINT | vk::Format::D16_UNORM => 2,
        vk::Format::R8G8B8_UNORM | vk::Format::R8G8B8_SRGB | vk::Format::B8G8R8_UNORM
        | vk::Format::B8G8R8_SRGB => 3,
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB | vk::Format::R16G16_SFLOAT | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT | vk::Format::A2B10G10R10_UNORM_PACK32 | vk::Format::D32_SFLOAT
        | vk::Format::D24_UNORM_S8_UINT | vk::Format::X8_D24_UNORM_PACK32 => 4,
        vk::Format::D32_SFLOAT_S8_UINT => 5,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R16G16B16A16_UNORM
        | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32_SFLOAT => 12,
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => 16,
        _ => return None,
    };
    Some(size)
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Aspect a full-image view or barrier of `format` covers
pub fn aspect_flags(format: vk::Format) -> vk::ImageAspectFlags {
    if is_depth_format(format) {
        // Views sampled or attached as depth only use the depth aspect
        vk::ImageAspectFlags::DEPTH
    } else if format == vk::Format::S8_UINT {
        vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Byte size of a tightly packed 2D image, `None` for unknown formats
pub fn image_byte_size(extent: vk::Extent2D, format: vk::Format) -> Option<u64> {
    texel_size(format).map(|texel| extent.width as u64 * extent.height as u64 * texel as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texel_sizes() {
        assert_eq!(texel_size(vk::Format::R8G8B8A8_SRGB), Some(4));
        assert_eq!(texel_size(vk::Format::R8_UNORM), Some(1));
        assert_eq!(texel_size(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        assert_eq!(texel_size(vk::Format::BC1_RGB_UNORM_BLOCK), None);
    }

    #[test]
    fn depth_formats_use_depth_aspect() {
        assert_eq!(aspect_flags(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(aspect_flags(vk::Format::D24_UNORM_S8_UINT), vk::ImageAspectFlags::DEPTH);
        assert!(has_stencil(vk::Format::D24_UNORM_S8_UINT));
        assert_eq!(aspect_flags(vk::Format::B8G8R8A8_SRGB), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn packed_image_size() {
        let extent = vk::Extent2D { width: 4, height: 3 };
        assert_eq!(image_byte_size(extent, vk::Format::R8G8B8A8_UNORM), Some(48));
    }
}
