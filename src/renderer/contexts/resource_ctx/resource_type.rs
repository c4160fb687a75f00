use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::eyre;

/// Abstract kind of a reflected shader resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ShaderResourceType {
    Input,
    InputAttachment,
    Output,
    Image,
    ImageSampler,
    ImageStorage,
    Sampler,
    BufferUniform,
    BufferStorage,
    PushConstant,
    SpecializationConstant,
    All,
}

/// How a descriptor binding is updated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ShaderResourceMode {
    #[default]
    Static,
    Dynamic,
    UpdateAfterBind,
}

impl ShaderResourceType {
    const ALL: &'static [Self] = &[
        Self::Input,
        Self::InputAttachment,
        Self::Output,
        Self::Image,
        Self::ImageSampler,
        Self::ImageStorage,
        Self::Sampler,
        Self::BufferUniform,
        Self::BufferStorage,
        Self::PushConstant,
        Self::SpecializationConstant,
        Self::All,
    ];

    pub fn from_raw(raw: u8) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    /// Whether resources of this kind occupy a slot in a descriptor set layout.
    pub fn has_descriptor(&self) -> bool {
        !matches!(
            self,
            Self::Input | Self::Output | Self::PushConstant | Self::SpecializationConstant | Self::All
        )
    }

    pub fn descriptor_type(&self, dynamic: bool) -> Result<vk::DescriptorType> {
        match self {
            Self::InputAttachment => Ok(vk::DescriptorType::INPUT_ATTACHMENT),
            Self::Image => Ok(vk::DescriptorType::SAMPLED_IMAGE),
            Self::ImageSampler => Ok(vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
            Self::ImageStorage => Ok(vk::DescriptorType::STORAGE_IMAGE),
            Self::Sampler => Ok(vk::DescriptorType::SAMPLER),
            Self::BufferUniform if dynamic => Ok(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC),
            Self::BufferUniform => Ok(vk::DescriptorType::UNIFORM_BUFFER),
            Self::BufferStorage if dynamic => Ok(vk::DescriptorType::STORAGE_BUFFER_DYNAMIC),
            Self::BufferStorage => Ok(vk::DescriptorType::STORAGE_BUFFER),
            other => Err(eyre!("No descriptor type for shader resource type {:?}", other)),
        }
    }
}

impl ShaderResourceMode {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Static),
            1 => Some(Self::Dynamic),
            2 => Some(Self::UpdateAfterBind),
            _ => None,
        }
    }

    pub fn descriptor_binding_flags(&self) -> vk::DescriptorBindingFlags {
        match self {
            Self::UpdateAfterBind => vk::DescriptorBindingFlags::UPDATE_AFTER_BIND,
            Self::Static | Self::Dynamic => vk::DescriptorBindingFlags::empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_flag_selects_dynamic_buffer_types() {
        assert_eq!(
            ShaderResourceType::BufferUniform.descriptor_type(true).unwrap(),
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        );
        assert_eq!(
            ShaderResourceType::BufferStorage.descriptor_type(false).unwrap(),
            vk::DescriptorType::STORAGE_BUFFER,
        );
        // images ignore the dynamic flag
        assert_eq!(
            ShaderResourceType::Image.descriptor_type(true).unwrap(),
            vk::DescriptorType::SAMPLED_IMAGE,
        );
    }

    #[test]
    fn non_descriptor_kinds_are_rejected() {
        for ty in [
            ShaderResourceType::Input,
            ShaderResourceType::Output,
            ShaderResourceType::PushConstant,
            ShaderResourceType::SpecializationConstant,
        ] {
            assert!(!ty.has_descriptor());
            assert!(ty.descriptor_type(false).is_err());
        }
    }

    #[test]
    fn raw_values_map_back() {
        for ty in ShaderResourceType::ALL {
            assert_eq!(ShaderResourceType::from_raw(*ty as u8), Some(*ty));
        }
        assert_eq!(ShaderResourceType::from_raw(200), None);
        assert_eq!(ShaderResourceMode::from_raw(2), Some(ShaderResourceMode::UpdateAfterBind));
        assert_eq!(ShaderResourceMode::from_raw(3), None);
    }
}
