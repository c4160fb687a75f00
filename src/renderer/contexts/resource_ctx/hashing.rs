//! Structural cache keys. Every key is an xxh3 digest of the parameters that
//! identify a resource. Referenced cached objects contribute their own key.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use ash::vk;
use crate::renderer::contexts::resource_ctx::descriptor_set::{BindingMap, BufferBinding, ImageBinding};
use crate::renderer::contexts::resource_ctx::descriptor_set_layout::DescriptorSetLayout;
use crate::renderer::resources::framebuffer::RenderTarget;
use crate::renderer::resources::pipeline::PipelineState;
use crate::renderer::resources::render_pass::{Attachment, LoadStoreInfo, RenderPass, SubpassInfo};
use crate::renderer::resources::shader::{ShaderModule, ShaderResource, ShaderSource, ShaderVariant};

pub fn hash_key<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = xxhash_rust::xxh3::Xxh3::new();
    value.hash(&mut hasher);
    hasher.finish()
}

fn module_keys(shader_modules: &[Arc<ShaderModule>]) -> Vec<u64> {
    shader_modules.iter().map(|module| module.key()).collect()
}

pub fn shader_module_key(
    stage: vk::ShaderStageFlags,
    source: &ShaderSource,
    entry_point: &str,
    variant: &ShaderVariant,
) -> u64 {
    hash_key(&(stage, source, entry_point, variant))
}

pub fn descriptor_set_layout_key(
    set_index: u32,
    shader_modules: &[Arc<ShaderModule>],
    resources: &[ShaderResource],
) -> u64 {
    hash_key(&(set_index, module_keys(shader_modules), resources))
}

pub fn pipeline_layout_key(shader_modules: &[Arc<ShaderModule>]) -> u64 {
    hash_key(&module_keys(shader_modules))
}

pub fn descriptor_pool_key(layout: &DescriptorSetLayout) -> u64 {
    hash_key(&layout.key())
}

pub fn descriptor_set_key(
    layout: &DescriptorSetLayout,
    buffer_infos: &BindingMap<BufferBinding>,
    image_infos: &BindingMap<ImageBinding>,
) -> u64 {
    hash_key(&(layout.key(), buffer_infos, image_infos))
}

pub fn render_pass_key(
    attachments: &[Attachment],
    load_store_infos: &[LoadStoreInfo],
    subpasses: &[SubpassInfo],
) -> u64 {
    hash_key(&(attachments, load_store_infos, subpasses))
}

pub fn graphics_pipeline_key(state: &PipelineState) -> u64 {
    hash_key(state)
}

/// Fixed-function state does not apply to compute pipelines.
pub fn compute_pipeline_key(state: &PipelineState) -> u64 {
    hash_key(&(
        state.pipeline_layout().map(|layout| layout.key()),
        state.specialization_constants(),
    ))
}

pub fn framebuffer_key(render_target: &RenderTarget, render_pass: &RenderPass) -> u64 {
    hash_key(&(render_target, render_pass.key()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use ash::vk::Handle;

    #[test]
    fn identical_shader_parameters_hash_identically() {
        let mut variant_a = ShaderVariant::new();
        variant_a.add_define("HAS_UV");
        let mut variant_b = ShaderVariant::new();
        variant_b.add_define("HAS_UV");

        let a = shader_module_key(
            vk::ShaderStageFlags::VERTEX,
            &ShaderSource::new(String::from("void main() {}")),
            "main",
            &variant_a,
        );
        let b = shader_module_key(
            vk::ShaderStageFlags::VERTEX,
            &ShaderSource::new("void main() {}".to_string()),
            &String::from("main"),
            &variant_b,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn every_shader_field_perturbs_the_key() {
        let source = ShaderSource::new("void main() {}");
        let variant = ShaderVariant::new();
        let base = shader_module_key(vk::ShaderStageFlags::VERTEX, &source, "main", &variant);

        let mut defined = ShaderVariant::new();
        defined.add_define("FOG");

        let perturbed = [
            shader_module_key(vk::ShaderStageFlags::FRAGMENT, &source, "main", &variant),
            shader_module_key(vk::ShaderStageFlags::VERTEX, &ShaderSource::new("void main(){}"), "main", &variant),
            shader_module_key(vk::ShaderStageFlags::VERTEX, &source, "entry", &variant),
            shader_module_key(vk::ShaderStageFlags::VERTEX, &source, "main", &defined),
        ];
        for key in perturbed {
            assert_ne!(base, key);
        }
    }

    #[test]
    fn binding_map_key_ignores_insertion_order() {
        let view_a = vk::ImageView::from_raw(10);
        let view_b = vk::ImageView::from_raw(11);
        let image = |view| ImageBinding::new(vk::Sampler::null(), view, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        let mut first: BindingMap<ImageBinding> = BTreeMap::new();
        first.entry(1).or_default().insert(0, image(view_a));
        first.entry(0).or_default().insert(0, image(view_b));

        let mut second: BindingMap<ImageBinding> = BTreeMap::new();
        second.entry(0).or_default().insert(0, image(view_b));
        second.entry(1).or_default().insert(0, image(view_a));

        assert_eq!(hash_key(&first), hash_key(&second));

        second.entry(1).or_default().insert(0, image(view_b));
        assert_ne!(hash_key(&first), hash_key(&second));
    }

    #[test]
    fn attachment_order_is_significant() {
        let color = Attachment::new(vk::Format::B8G8R8A8_SRGB, vk::ImageUsageFlags::COLOR_ATTACHMENT);
        let depth = Attachment::new(vk::Format::D32_SFLOAT, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT);

        assert_ne!(
            render_pass_key(&[color, depth], &[], &[]),
            render_pass_key(&[depth, color], &[], &[]),
        );
        assert_eq!(
            render_pass_key(&[color, depth], &[LoadStoreInfo::default()], &[]),
            render_pass_key(&[color, depth], &[LoadStoreInfo::default()], &[]),
        );
    }
}
