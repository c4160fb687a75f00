use std::collections::HashMap;
use std::sync::Arc;
use ash::vk;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use crate::renderer::contexts::device_ctx::RenderDevice;
use crate::renderer::contexts::resource_ctx::resource_type::ShaderResourceMode;
use crate::renderer::resources::ResourceId;
use crate::renderer::resources::shader::{ShaderModule, ShaderResource};

/// One binding slot of a descriptor set layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub descriptor_count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

pub struct DescriptorSetLayout {
    id: ResourceId,
    key: u64,
    handle: vk::DescriptorSetLayout,
    set_index: u32,
    shader_modules: Vec<Arc<ShaderModule>>,

    bindings: Vec<LayoutBinding>,
    binding_flags: Vec<vk::DescriptorBindingFlags>,
    bindings_lookup: HashMap<u32, LayoutBinding>,
    binding_flags_lookup: HashMap<u32, vk::DescriptorBindingFlags>,
    resources_lookup: HashMap<String, u32>,

    device: Arc<dyn RenderDevice>,
}

impl DescriptorSetLayout {
    pub(crate) fn new(
        device: Arc<dyn RenderDevice>,
        key: u64,
        set_index: u32,
        shader_modules: &[Arc<ShaderModule>],
        resources: &[ShaderResource],
    ) -> Result<Self> {
        let mut bindings = Vec::with_capacity(resources.len());
        let mut binding_flags = Vec::with_capacity(resources.len());
        let mut bindings_lookup = HashMap::new();
        let mut binding_flags_lookup = HashMap::new();
        let mut resources_lookup = HashMap::new();

        for resource in resources {
            // Stage inputs/outputs, push constants and specialization constants have no descriptor
            if !resource.ty.has_descriptor() {
                continue;
            }

            let dynamic = resource.mode == ShaderResourceMode::Dynamic;
            let layout_binding = LayoutBinding {
                binding: resource.binding,
                descriptor_type: resource.ty.descriptor_type(dynamic)?,
                descriptor_count: resource.array_size,
                stage_flags: resource.stages,
            };
            let flags = resource.mode.descriptor_binding_flags();

            bindings.push(layout_binding);
            binding_flags.push(flags);
            bindings_lookup.insert(resource.binding, layout_binding);
            binding_flags_lookup.insert(resource.binding, flags);
            resources_lookup.insert(resource.name.clone(), resource.binding);
        }

        let has_update_after_bind = binding_flags
            .iter()
            .any(|flags| flags.contains(vk::DescriptorBindingFlags::UPDATE_AFTER_BIND));
        let has_dynamic = resources
            .iter()
            .any(|resource| resource.ty.has_descriptor() && resource.mode == ShaderResourceMode::Dynamic);
        if has_update_after_bind && has_dynamic {
            return Err(eyre!(
                "Descriptor set layout {} mixes update-after-bind and dynamic bindings",
                set_index,
            ));
        }

        if bindings.len() != binding_flags.len() {
            return Err(eyre!(
                "Binding count ({}) has to match binding flag count ({})",
                bindings.len(),
                binding_flags.len(),
            ));
        }

        let vk_bindings = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(binding.descriptor_type)
                    .descriptor_count(binding.descriptor_count)
                    .stage_flags(binding.stage_flags)
            })
            .collect::<Vec<_>>();

        // Binding flags are only chained when one of them is set
        let (create_flags, chained_flags) = if has_update_after_bind {
            (vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL, binding_flags.as_slice())
        } else {
            (vk::DescriptorSetLayoutCreateFlags::empty(), &[][..])
        };

        let handle = device.create_descriptor_set_layout(&vk_bindings, chained_flags, create_flags)?;

        Ok(Self {
            id: ResourceId::next(),
            key,
            handle,
            set_index,
            shader_modules: shader_modules.to_vec(),
            bindings,
            binding_flags,
            bindings_lookup,
            binding_flags_lookup,
            resources_lookup,
            device,
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    pub fn set_index(&self) -> u32 {
        self.set_index
    }

    pub fn shader_modules(&self) -> &[Arc<ShaderModule>] {
        &self.shader_modules
    }

    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    pub fn binding_flags(&self) -> &[vk::DescriptorBindingFlags] {
        &self.binding_flags
    }

    pub fn layout_binding(&self, binding_index: u32) -> Option<&LayoutBinding> {
        self.bindings_lookup.get(&binding_index)
    }

    pub fn layout_binding_by_name(&self, name: &str) -> Option<&LayoutBinding> {
        self.resources_lookup
            .get(name)
            .and_then(|binding_index| self.layout_binding(*binding_index))
    }

    /// Empty for unknown bindings.
    pub fn layout_binding_flag(&self, binding_index: u32) -> vk::DescriptorBindingFlags {
        self.binding_flags_lookup
            .get(&binding_index)
            .copied()
            .unwrap_or_default()
    }

    pub fn has_update_after_bind(&self) -> bool {
        self.binding_flags
            .iter()
            .any(|flags| flags.contains(vk::DescriptorBindingFlags::UPDATE_AFTER_BIND))
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.device.destroy_descriptor_set_layout(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::contexts::resource_ctx::resource_type::ShaderResourceType;
    use crate::renderer::testing::MockDevice;

    fn resources() -> Vec<ShaderResource> {
        vec![
            ShaderResource::new("in_position", ShaderResourceType::Input, vk::ShaderStageFlags::VERTEX),
            ShaderResource::new("camera", ShaderResourceType::BufferUniform, vk::ShaderStageFlags::VERTEX)
                .with_binding(0, 0),
            ShaderResource::new("albedo", ShaderResourceType::ImageSampler, vk::ShaderStageFlags::FRAGMENT)
                .with_binding(0, 1)
                .with_array_size(4),
            ShaderResource::new("push", ShaderResourceType::PushConstant, vk::ShaderStageFlags::VERTEX)
                .with_range(0, 64),
        ]
    }

    #[test]
    fn skips_resources_without_descriptors() {
        let device = MockDevice::new();
        let layout = DescriptorSetLayout::new(device.clone(), 1, 0, &[], &resources()).unwrap();

        assert_eq!(layout.bindings().len(), 2);
        assert_eq!(layout.binding_flags().len(), 2);

        let albedo = layout.layout_binding_by_name("albedo").unwrap();
        assert_eq!(albedo.binding, 1);
        assert_eq!(albedo.descriptor_type, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(albedo.descriptor_count, 4);
        assert_eq!(
            layout.layout_binding(0).unwrap().descriptor_type,
            vk::DescriptorType::UNIFORM_BUFFER,
        );
        assert!(layout.layout_binding(5).is_none());
        assert!(layout.layout_binding_by_name("push").is_none());
        assert!(!layout.has_update_after_bind());
    }

    #[test]
    fn dynamic_mode_selects_dynamic_type() {
        let device = MockDevice::new();
        let resources = [
            ShaderResource::new("lights", ShaderResourceType::BufferStorage, vk::ShaderStageFlags::FRAGMENT)
                .with_binding(0, 2)
                .with_mode(ShaderResourceMode::Dynamic),
        ];
        let layout = DescriptorSetLayout::new(device, 1, 0, &[], &resources).unwrap();
        assert_eq!(
            layout.layout_binding(2).unwrap().descriptor_type,
            vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
        );
    }

    #[test]
    fn update_after_bind_sets_pool_flag() {
        let device = MockDevice::new();
        let resources = [
            ShaderResource::new("textures", ShaderResourceType::Image, vk::ShaderStageFlags::FRAGMENT)
                .with_binding(0, 0)
                .with_mode(ShaderResourceMode::UpdateAfterBind),
            ShaderResource::new("camera", ShaderResourceType::BufferUniform, vk::ShaderStageFlags::VERTEX)
                .with_binding(0, 1),
        ];
        let layout = DescriptorSetLayout::new(device.clone(), 1, 0, &[], &resources).unwrap();

        assert!(layout.has_update_after_bind());
        assert_eq!(layout.layout_binding_flag(0), vk::DescriptorBindingFlags::UPDATE_AFTER_BIND);
        assert_eq!(layout.layout_binding_flag(1), vk::DescriptorBindingFlags::empty());
        assert_eq!(
            device.last_set_layout_flags(),
            Some(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL),
        );
    }

    #[test]
    fn update_after_bind_with_dynamic_fails() {
        let device = MockDevice::new();
        let resources = [
            ShaderResource::new("textures", ShaderResourceType::Image, vk::ShaderStageFlags::FRAGMENT)
                .with_binding(0, 0)
                .with_mode(ShaderResourceMode::UpdateAfterBind),
            ShaderResource::new("camera", ShaderResourceType::BufferUniform, vk::ShaderStageFlags::VERTEX)
                .with_binding(0, 1)
                .with_mode(ShaderResourceMode::Dynamic),
        ];

        assert!(DescriptorSetLayout::new(device.clone(), 1, 0, &[], &resources).is_err());
        assert_eq!(device.set_layouts_created(), 0);
    }
}
