pub mod codec;
pub mod descriptor_pool;
pub mod descriptor_set;
pub mod descriptor_set_layout;
pub mod hashing;
pub mod record;
pub mod replay;
pub mod resource_type;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use ash::vk;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use crate::renderer::config::CacheConfig;
use crate::renderer::contexts::device_ctx::RenderDevice;
use crate::renderer::contexts::resource_ctx::descriptor_pool::DescriptorPool;
use crate::renderer::contexts::resource_ctx::descriptor_set::{BindingMap, BufferBinding, DescriptorSet, ImageBinding};
use crate::renderer::contexts::resource_ctx::descriptor_set_layout::DescriptorSetLayout;
use crate::renderer::contexts::resource_ctx::record::{ResourceRecord, ResourceType};
use crate::renderer::contexts::resource_ctx::replay::ResourceReplay;
use crate::renderer::resources::framebuffer::{Framebuffer, RenderTarget};
use crate::renderer::resources::pipeline::{ComputePipeline, GraphicsPipeline, PipelineLayout, PipelineState};
use crate::renderer::resources::render_pass::{Attachment, LoadStoreInfo, RenderPass, SubpassInfo};
use crate::renderer::resources::shader::{ShaderModule, ShaderResource, ShaderSource, ShaderVariant};

type ResourceMap<T> = Mutex<HashMap<u64, T>>;

/// Responsibilities:
/// - Hand out one shared instance per distinct set of creation parameters
/// - Record every creation so a later run can warm up from the stream
/// - Rebind cached descriptor sets when image views are recreated
///
/// Every resource type has its own lock. The recorder lock is only ever taken
/// while holding a single resource type lock, never the other way around.
pub struct ResourceCache {
    device: Arc<dyn RenderDevice>,
    config: CacheConfig,
    pipeline_cache: Mutex<vk::PipelineCache>,
    recorder: Mutex<ResourceRecord>,

    shader_modules: ResourceMap<Arc<ShaderModule>>,
    descriptor_set_layouts: ResourceMap<Arc<DescriptorSetLayout>>,
    pipeline_layouts: ResourceMap<Arc<PipelineLayout>>,
    render_passes: ResourceMap<Arc<RenderPass>>,
    graphics_pipelines: ResourceMap<Arc<GraphicsPipeline>>,
    compute_pipelines: ResourceMap<Arc<ComputePipeline>>,
    descriptor_pools: ResourceMap<Arc<Mutex<DescriptorPool>>>,
    descriptor_sets: ResourceMap<Arc<Mutex<DescriptorSet>>>,
    framebuffers: ResourceMap<Arc<Framebuffer>>,
}

impl ResourceCache {
    pub fn new(device: Arc<dyn RenderDevice>, config: CacheConfig) -> Self {
        Self {
            device,
            config,
            pipeline_cache: Mutex::new(config.pipeline_cache),
            recorder: Mutex::new(ResourceRecord::new()),
            shader_modules: Mutex::default(),
            descriptor_set_layouts: Mutex::default(),
            pipeline_layouts: Mutex::default(),
            render_passes: Mutex::default(),
            graphics_pipelines: Mutex::default(),
            compute_pipelines: Mutex::default(),
            descriptor_pools: Mutex::default(),
            descriptor_sets: Mutex::default(),
            framebuffers: Mutex::default(),
        }
    }

    pub fn device(&self) -> &Arc<dyn RenderDevice> {
        &self.device
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get-or-create under the lock of one resource type. `create` and
    /// `record` only run on a miss.
    fn request_resource<T: Clone>(
        &self,
        resources: &ResourceMap<T>,
        key: u64,
        create: impl FnOnce() -> Result<T>,
        record: impl FnOnce(&mut ResourceRecord, &T) -> Result<()>,
    ) -> Result<T> {
        let mut resources = resources.lock().map_err(|e| eyre!(e.to_string()))?;
        if let Some(resource) = resources.get(&key) {
            return Ok(resource.clone());
        }

        let resource = create()?;
        {
            let mut recorder = self.recorder.lock().map_err(|e| eyre!(e.to_string()))?;
            record(&mut recorder, &resource)?;
        }

        resources.insert(key, resource.clone());
        Ok(resource)
    }

    pub fn request_shader_module(
        &self,
        stage: vk::ShaderStageFlags,
        source: &ShaderSource,
        entry_point: &str,
        variant: &ShaderVariant,
    ) -> Result<Arc<ShaderModule>> {
        let key = hashing::shader_module_key(stage, source, entry_point, variant);
        self.request_resource(
            &self.shader_modules,
            key,
            || {
                let module = ShaderModule::new(self.device.clone(), key, stage, source, entry_point, variant)?;
                Ok(Arc::new(module))
            },
            |recorder, module| {
                let index = recorder.register_shader_module(stage, source, entry_point, variant)?;
                recorder.set_resource(index, &**module)
            },
        )
    }

    pub fn request_descriptor_set_layout(
        &self,
        set_index: u32,
        shader_modules: &[Arc<ShaderModule>],
        resources: &[ShaderResource],
    ) -> Result<Arc<DescriptorSetLayout>> {
        let key = hashing::descriptor_set_layout_key(set_index, shader_modules, resources);
        self.request_resource(
            &self.descriptor_set_layouts,
            key,
            || {
                let layout = DescriptorSetLayout::new(
                    self.device.clone(),
                    key,
                    set_index,
                    shader_modules,
                    resources,
                )?;
                Ok(Arc::new(layout))
            },
            |recorder, layout| {
                let index = recorder.register_descriptor_set_layout(set_index, shader_modules, resources)?;
                recorder.set_resource(index, &**layout)
            },
        )
    }

    /// Requests one descriptor set layout per set the modules use, then the
    /// pipeline layout over them.
    pub fn request_pipeline_layout(&self, shader_modules: &[Arc<ShaderModule>]) -> Result<Arc<PipelineLayout>> {
        let key = hashing::pipeline_layout_key(shader_modules);

        let existing = self.pipeline_layouts
            .lock()
            .map_err(|e| eyre!(e.to_string()))?
            .get(&key)
            .cloned();
        if let Some(layout) = existing {
            return Ok(layout);
        }

        let shader_resources = PipelineLayout::collect_resources(shader_modules);
        let mut descriptor_set_layouts = Vec::new();
        for (set_index, resources) in PipelineLayout::group_by_set(&shader_resources) {
            descriptor_set_layouts.push(self.request_descriptor_set_layout(set_index, shader_modules, &resources)?);
        }

        self.request_resource(
            &self.pipeline_layouts,
            key,
            || {
                let layout = PipelineLayout::new(self.device.clone(), key, shader_modules, descriptor_set_layouts)?;
                Ok(Arc::new(layout))
            },
            |recorder, layout| {
                let index = recorder.register_pipeline_layout(shader_modules)?;
                recorder.set_resource(index, &**layout)
            },
        )
    }

    pub fn request_render_pass(
        &self,
        attachments: &[Attachment],
        load_store_infos: &[LoadStoreInfo],
        subpasses: &[SubpassInfo],
    ) -> Result<Arc<RenderPass>> {
        let key = hashing::render_pass_key(attachments, load_store_infos, subpasses);
        self.request_resource(
            &self.render_passes,
            key,
            || {
                let render_pass = RenderPass::new(
                    self.device.clone(),
                    key,
                    attachments,
                    load_store_infos,
                    subpasses,
                )?;
                Ok(Arc::new(render_pass))
            },
            |recorder, render_pass| {
                let index = recorder.register_render_pass(attachments, load_store_infos, subpasses)?;
                recorder.set_resource(index, &**render_pass)
            },
        )
    }

    pub fn request_graphics_pipeline(&self, state: &PipelineState) -> Result<Arc<GraphicsPipeline>> {
        let key = hashing::graphics_pipeline_key(state);
        let pipeline_cache = self.pipeline_cache()?;
        self.request_resource(
            &self.graphics_pipelines,
            key,
            || {
                let pipeline = GraphicsPipeline::new(self.device.clone(), key, pipeline_cache, state)?;
                Ok(Arc::new(pipeline))
            },
            |recorder, pipeline| {
                let index = recorder.register_graphics_pipeline(state)?;
                recorder.set_resource(index, &**pipeline)
            },
        )
    }

    pub fn request_compute_pipeline(&self, state: &PipelineState) -> Result<Arc<ComputePipeline>> {
        let key = hashing::compute_pipeline_key(state);
        let pipeline_cache = self.pipeline_cache()?;
        self.request_resource(
            &self.compute_pipelines,
            key,
            || {
                let pipeline = ComputePipeline::new(self.device.clone(), key, pipeline_cache, state)?;
                Ok(Arc::new(pipeline))
            },
            |recorder, pipeline| {
                let index = recorder.register_compute_pipeline(state)?;
                recorder.set_resource(index, &**pipeline)
            },
        )
    }

    pub fn request_descriptor_pool(&self, layout: &Arc<DescriptorSetLayout>) -> Result<Arc<Mutex<DescriptorPool>>> {
        let key = hashing::descriptor_pool_key(layout);
        self.request_resource(
            &self.descriptor_pools,
            key,
            || {
                let pool = DescriptorPool::new(self.device.clone(), layout.clone(), self.config.max_sets_per_pool);
                Ok(Arc::new(Mutex::new(pool)))
            },
            |recorder, pool| {
                let index = recorder.register_descriptor_pool(layout)?;
                let pool = pool.lock().map_err(|e| eyre!(e.to_string()))?;
                recorder.set_resource(index, &*pool)
            },
        )
    }

    /// Resolves the pool for `layout` first, then the set itself. Both are
    /// recorded on a miss.
    pub fn request_descriptor_set(
        &self,
        layout: &Arc<DescriptorSetLayout>,
        buffer_infos: &BindingMap<BufferBinding>,
        image_infos: &BindingMap<ImageBinding>,
    ) -> Result<Arc<Mutex<DescriptorSet>>> {
        let pool = self.request_descriptor_pool(layout)?;

        let key = hashing::descriptor_set_key(layout, buffer_infos, image_infos);
        self.request_resource(
            &self.descriptor_sets,
            key,
            || {
                let descriptor_set = DescriptorSet::new(
                    self.device.clone(),
                    layout.clone(),
                    pool,
                    buffer_infos.clone(),
                    image_infos.clone(),
                )?;
                Ok(Arc::new(Mutex::new(descriptor_set)))
            },
            |recorder, descriptor_set| {
                let index = recorder.register_descriptor_set(layout, buffer_infos, image_infos)?;
                let descriptor_set = descriptor_set.lock().map_err(|e| eyre!(e.to_string()))?;
                recorder.set_resource(index, &*descriptor_set)
            },
        )
    }

    pub fn request_framebuffer(
        &self,
        render_target: &RenderTarget,
        render_pass: &Arc<RenderPass>,
    ) -> Result<Arc<Framebuffer>> {
        let key = hashing::framebuffer_key(render_target, render_pass);
        self.request_resource(
            &self.framebuffers,
            key,
            || {
                let framebuffer = Framebuffer::new(self.device.clone(), key, render_target, render_pass.clone())?;
                Ok(Arc::new(framebuffer))
            },
            |recorder, framebuffer| {
                let index = recorder.register_framebuffer(render_target, render_pass)?;
                recorder.set_resource(index, &**framebuffer)
            },
        )
    }

    /// Points every cached image binding that uses `old_views[i]` at
    /// `new_views[i]`, pushes all changed bindings in one batch, and re-keys
    /// the touched sets by their new contents. When two sets end up with the
    /// same key the last one re-keyed wins.
    pub fn update_descriptor_sets(&self, old_views: &[vk::ImageView], new_views: &[vk::ImageView]) -> Result<()> {
        if old_views.len() != new_views.len() {
            return Err(eyre!(
                "Got {} old image views but {} new ones",
                old_views.len(),
                new_views.len(),
            ));
        }

        let mut descriptor_sets = self.descriptor_sets.lock().map_err(|e| eyre!(e.to_string()))?;

        let mut writes = Vec::new();
        let mut rekeyed = Vec::new();
        for (&key, descriptor_set) in descriptor_sets.iter() {
            let mut descriptor_set = descriptor_set.lock().map_err(|e| eyre!(e.to_string()))?;
            let set_writes = descriptor_set.replace_image_views(old_views, new_views);
            if !set_writes.is_empty() {
                writes.extend(set_writes);
                rekeyed.push((key, descriptor_set.structural_key()));
            }
        }

        if !writes.is_empty() {
            self.device.update_descriptor_sets(&writes);
        }

        let moved = rekeyed
            .into_iter()
            .filter_map(|(old_key, new_key)| {
                descriptor_sets
                    .remove(&old_key)
                    .map(|descriptor_set| (new_key, descriptor_set))
            })
            .collect::<Vec<_>>();
        descriptor_sets.extend(moved);

        Ok(())
    }

    pub fn clear_pipelines(&self) -> Result<()> {
        self.graphics_pipelines.lock().map_err(|e| eyre!(e.to_string()))?.clear();
        self.compute_pipelines.lock().map_err(|e| eyre!(e.to_string()))?.clear();
        self.forget_recorded(&[ResourceType::GraphicsPipeline, ResourceType::ComputePipeline])
    }

    pub fn clear_framebuffers(&self) -> Result<()> {
        self.framebuffers.lock().map_err(|e| eyre!(e.to_string()))?.clear();
        self.forget_recorded(&[ResourceType::Framebuffer])
    }

    /// Drops every cached object. Users first, so native objects are
    /// destroyed before what they were built from.
    pub fn clear(&self) -> Result<()> {
        self.descriptor_sets.lock().map_err(|e| eyre!(e.to_string()))?.clear();
        self.descriptor_pools.lock().map_err(|e| eyre!(e.to_string()))?.clear();
        self.clear_framebuffers()?;
        self.clear_pipelines()?;
        self.pipeline_layouts.lock().map_err(|e| eyre!(e.to_string()))?.clear();
        self.descriptor_set_layouts.lock().map_err(|e| eyre!(e.to_string()))?.clear();
        self.render_passes.lock().map_err(|e| eyre!(e.to_string()))?.clear();
        self.shader_modules.lock().map_err(|e| eyre!(e.to_string()))?.clear();
        self.forget_recorded(&[ResourceType::DescriptorSet, ResourceType::DescriptorPool])
    }

    /// Stops tracking the record indices of dropped objects. Their entries
    /// stay in the stream. Only types no other entry refers to are
    /// forgotten, since callers may still hold modules, layouts and render
    /// passes and pass them into later requests.
    fn forget_recorded(&self, types: &[ResourceType]) -> Result<()> {
        let mut recorder = self.recorder.lock().map_err(|e| eyre!(e.to_string()))?;
        for &ty in types {
            recorder.forget(ty);
        }
        Ok(())
    }

    /// Objects the recorder still maps to a record index.
    pub fn recorded_object_count(&self) -> Result<usize> {
        Ok(self.recorder.lock().map_err(|e| eyre!(e.to_string()))?.tracked_count())
    }

    /// The record of every creation so far.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let recorder = self.recorder.lock().map_err(|e| eyre!(e.to_string()))?;
        Ok(recorder.data().to_vec())
    }

    /// Replays a stream produced by [`Self::serialize`]. Objects the replay
    /// creates are recorded again, so on an empty cache the record afterwards
    /// matches the replayed part of `data`. Returns the number of entries
    /// replayed.
    pub fn warmup(&self, data: &[u8]) -> Result<usize> {
        let mut replay = ResourceReplay::new();
        let replayed = replay.play(self, data)?;
        log::debug!("Warmed up resource cache from {} record entries", replayed);
        Ok(replayed)
    }

    pub fn set_pipeline_cache(&self, pipeline_cache: vk::PipelineCache) -> Result<()> {
        *self.pipeline_cache.lock().map_err(|e| eyre!(e.to_string()))? = pipeline_cache;
        Ok(())
    }

    fn pipeline_cache(&self) -> Result<vk::PipelineCache> {
        Ok(*self.pipeline_cache.lock().map_err(|e| eyre!(e.to_string()))?)
    }

    /// Keys currently cached for one resource type, sorted.
    pub fn cached_keys(&self, ty: ResourceType) -> Result<Vec<u64>> {
        fn keys<T>(resources: &ResourceMap<T>) -> Result<Vec<u64>> {
            let resources = resources.lock().map_err(|e| eyre!(e.to_string()))?;
            let mut keys = resources.keys().copied().collect::<Vec<_>>();
            keys.sort_unstable();
            Ok(keys)
        }

        match ty {
            ResourceType::ShaderModule => keys(&self.shader_modules),
            ResourceType::DescriptorSetLayout => keys(&self.descriptor_set_layouts),
            ResourceType::PipelineLayout => keys(&self.pipeline_layouts),
            ResourceType::RenderPass => keys(&self.render_passes),
            ResourceType::GraphicsPipeline => keys(&self.graphics_pipelines),
            ResourceType::ComputePipeline => keys(&self.compute_pipelines),
            ResourceType::DescriptorPool => keys(&self.descriptor_pools),
            ResourceType::DescriptorSet => keys(&self.descriptor_sets),
            ResourceType::Framebuffer => keys(&self.framebuffers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use crate::renderer::contexts::resource_ctx::codec::RecordError;
    use crate::renderer::contexts::resource_ctx::resource_type::ShaderResourceType;
    use crate::renderer::testing::{init_logging, MockDevice};

    const VERTEX: &str = "layout(set = 0, binding = 0) uniform Camera { mat4 view_proj; };";
    const FRAGMENT: &str = "layout(set = 0, binding = 1) uniform sampler2D albedo;";
    const COMPUTE: &str = "layout(set = 0, binding = 0) buffer Particles { vec4 p[]; };";

    fn device() -> Arc<MockDevice> {
        init_logging();
        let device = MockDevice::new();
        device.add_reflection(VERTEX, vec![
            ShaderResource::new("camera", ShaderResourceType::BufferUniform, vk::ShaderStageFlags::VERTEX)
                .with_binding(0, 0),
            ShaderResource::new("position", ShaderResourceType::Input, vk::ShaderStageFlags::VERTEX),
        ]);
        device.add_reflection(FRAGMENT, vec![
            ShaderResource::new("albedo", ShaderResourceType::ImageSampler, vk::ShaderStageFlags::FRAGMENT)
                .with_binding(0, 1),
            ShaderResource::new("tint", ShaderResourceType::PushConstant, vk::ShaderStageFlags::FRAGMENT)
                .with_range(0, 16),
        ]);
        device.add_reflection(COMPUTE, vec![
            ShaderResource::new("particles", ShaderResourceType::BufferStorage, vk::ShaderStageFlags::COMPUTE)
                .with_binding(0, 0),
        ]);
        device
    }

    fn cache(device: &Arc<MockDevice>) -> ResourceCache {
        ResourceCache::new(device.clone(), CacheConfig::default())
    }

    fn buffer_infos() -> BindingMap<BufferBinding> {
        let mut infos = BindingMap::new();
        infos.entry(0).or_default().insert(0, BufferBinding::new(vk::Buffer::from_raw(0x10), 0, 64));
        infos
    }

    fn image_infos(view: vk::ImageView) -> BindingMap<ImageBinding> {
        let mut infos = BindingMap::new();
        infos.entry(1).or_default().insert(0, ImageBinding::new(
            vk::Sampler::from_raw(0x20),
            view,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ));
        infos
    }

    fn shader_modules(cache: &ResourceCache) -> Result<Vec<Arc<ShaderModule>>> {
        let variant = ShaderVariant::new();
        Ok(vec![
            cache.request_shader_module(vk::ShaderStageFlags::VERTEX, &ShaderSource::new(VERTEX), "main", &variant)?,
            cache.request_shader_module(vk::ShaderStageFlags::FRAGMENT, &ShaderSource::new(FRAGMENT), "main", &variant)?,
        ])
    }

    /// Touches every cacheable type once.
    fn build_scene(cache: &ResourceCache) -> Result<()> {
        let pipeline_layout = cache.request_pipeline_layout(&shader_modules(cache)?)?;

        let color = Attachment::new(vk::Format::B8G8R8A8_SRGB, vk::ImageUsageFlags::COLOR_ATTACHMENT);
        let subpass = SubpassInfo {
            output_attachments: vec![0],
            ..Default::default()
        };
        let render_pass = cache.request_render_pass(&[color], &[LoadStoreInfo::default()], &[subpass])?;

        let state = PipelineState::new()
            .with_pipeline_layout(pipeline_layout.clone())
            .with_render_pass(render_pass.clone())
            .with_cull_mode(vk::CullModeFlags::BACK, vk::FrontFace::COUNTER_CLOCKWISE)
            .with_alpha_blending_enabled()
            .with_specialization_constant(0, &1u32);
        cache.request_graphics_pipeline(&state)?;

        let compute = cache.request_shader_module(
            vk::ShaderStageFlags::COMPUTE,
            &ShaderSource::new(COMPUTE),
            "main",
            &ShaderVariant::new(),
        )?;
        let compute_layout = cache.request_pipeline_layout(&[compute])?;
        cache.request_compute_pipeline(&PipelineState::new().with_pipeline_layout(compute_layout))?;

        let set_layout = pipeline_layout.descriptor_set_layout(0)?;
        cache.request_descriptor_set(set_layout, &buffer_infos(), &image_infos(vk::ImageView::from_raw(0x30)))?;

        let target = RenderTarget::new(
            vk::Extent2D { width: 1280, height: 720 },
            vec![vk::ImageView::from_raw(0x40)],
            vec![color],
        );
        cache.request_framebuffer(&target, &render_pass)?;

        Ok(())
    }

    #[test]
    fn repeated_request_returns_the_same_instance() {
        let device = device();
        let cache = cache(&device);
        let source = ShaderSource::new(VERTEX);
        let variant = ShaderVariant::new();

        let first = cache.request_shader_module(vk::ShaderStageFlags::VERTEX, &source, "main", &variant).unwrap();
        let recorded = cache.serialize().unwrap();
        let second = cache
            .request_shader_module(vk::ShaderStageFlags::VERTEX, &ShaderSource::new(VERTEX), "main", &ShaderVariant::new())
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(device.shader_modules_created(), 1);
        assert_eq!(cache.serialize().unwrap(), recorded);
    }

    #[test]
    fn different_variant_is_a_different_module() {
        let device = device();
        let cache = cache(&device);
        let source = ShaderSource::new(VERTEX);
        let mut variant = ShaderVariant::new();

        let plain = cache.request_shader_module(vk::ShaderStageFlags::VERTEX, &source, "main", &variant).unwrap();
        variant.add_define("SKINNED");
        let skinned = cache.request_shader_module(vk::ShaderStageFlags::VERTEX, &source, "main", &variant).unwrap();

        assert!(!Arc::ptr_eq(&plain, &skinned));
        assert_eq!(cache.cached_keys(ResourceType::ShaderModule).unwrap().len(), 2);
    }

    #[test]
    fn pipeline_layout_requests_its_set_layouts() {
        let device = device();
        let cache = cache(&device);
        let modules = shader_modules(&cache).unwrap();

        let layout = cache.request_pipeline_layout(&modules).unwrap();
        let again = cache.request_pipeline_layout(&modules).unwrap();

        assert!(Arc::ptr_eq(&layout, &again));
        assert_eq!(cache.cached_keys(ResourceType::DescriptorSetLayout).unwrap().len(), 1);
        assert_eq!(device.set_layouts_created(), 1);

        let set_layout = layout.descriptor_set_layout(0).unwrap();
        assert_eq!(set_layout.bindings().len(), 2);
        assert_eq!(layout.push_constant_ranges().len(), 1);
    }

    #[test]
    fn descriptor_set_request_resolves_pool_first() {
        let device = device();
        let cache = cache(&device);
        let layout = cache.request_pipeline_layout(&shader_modules(&cache).unwrap()).unwrap();
        let set_layout = layout.descriptor_set_layout(0).unwrap();
        let view = vk::ImageView::from_raw(0x30);

        let first = cache.request_descriptor_set(set_layout, &buffer_infos(), &image_infos(view)).unwrap();
        let second = cache.request_descriptor_set(set_layout, &buffer_infos(), &image_infos(view)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        cache
            .request_descriptor_set(set_layout, &buffer_infos(), &image_infos(vk::ImageView::from_raw(0x31)))
            .unwrap();
        assert_eq!(cache.cached_keys(ResourceType::DescriptorPool).unwrap().len(), 1);
        assert_eq!(cache.cached_keys(ResourceType::DescriptorSet).unwrap().len(), 2);
        assert_eq!(device.descriptor_pools().len(), 1);
    }

    #[test]
    fn warmup_reproduces_the_cache() {
        let device = device();
        let original = cache(&device);
        build_scene(&original).unwrap();
        let stream = original.serialize().unwrap();

        let fresh = cache(&device);
        let replayed = fresh.warmup(&stream).unwrap();

        // 3 modules, 2 set layouts, 2 pipeline layouts, render pass, 2 pipelines,
        // descriptor pool and set, framebuffer
        assert_eq!(replayed, 13);
        for ty in ResourceType::ALL {
            assert_eq!(original.cached_keys(ty).unwrap(), fresh.cached_keys(ty).unwrap(), "{:?}", ty);
        }
        assert_eq!(fresh.serialize().unwrap(), stream);
    }

    #[test]
    fn warmup_on_a_warm_cache_creates_nothing() {
        let device = device();
        let cache = cache(&device);
        build_scene(&cache).unwrap();
        let stream = cache.serialize().unwrap();
        let modules = device.shader_modules_created();

        assert_eq!(cache.warmup(&stream).unwrap(), 13);
        assert_eq!(device.shader_modules_created(), modules);
        assert_eq!(cache.serialize().unwrap(), stream);
    }

    #[test]
    fn truncated_stream_replays_its_complete_prefix() {
        let device = device();
        let original = cache(&device);
        build_scene(&original).unwrap();
        let stream = original.serialize().unwrap();

        let fresh = cache(&device);
        assert_eq!(fresh.warmup(&stream[..stream.len() - 1]).unwrap(), 12);
        assert!(fresh.cached_keys(ResourceType::Framebuffer).unwrap().is_empty());
        assert_eq!(fresh.cached_keys(ResourceType::DescriptorSet).unwrap().len(), 1);
        assert!(stream.starts_with(&fresh.serialize().unwrap()));
    }

    #[test]
    fn unknown_tag_fails_warmup() {
        let device = device();
        let cache = cache(&device);

        let error = cache.warmup(&[42]).unwrap_err();
        assert!(matches!(error.downcast_ref::<RecordError>(), Some(RecordError::UnknownTag(42))));
    }

    #[test]
    fn forward_reference_fails_warmup() {
        let device = device();
        let cache = cache(&device);

        // A pipeline layout over shader module #0, which was never recorded
        let stream = [ResourceType::PipelineLayout.tag(), 1, 0, 0, 0, 0, 0, 0, 0];
        let error = cache.warmup(&stream).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<RecordError>(),
            Some(RecordError::UnresolvedIndex { ty: ResourceType::ShaderModule, index: 0 })
        ));
        assert!(cache.cached_keys(ResourceType::PipelineLayout).unwrap().is_empty());
    }

    #[test]
    fn clear_empties_every_map() {
        let device = device();
        let cache = cache(&device);
        build_scene(&cache).unwrap();

        cache.clear().unwrap();
        for ty in ResourceType::ALL {
            assert!(cache.cached_keys(ty).unwrap().is_empty(), "{:?}", ty);
        }

        let modules = device.shader_modules_created();
        build_scene(&cache).unwrap();
        assert_eq!(device.shader_modules_created(), modules + 3);
    }

    #[test]
    fn partial_clears_leave_other_maps() {
        let device = device();
        let cache = cache(&device);
        build_scene(&cache).unwrap();

        cache.clear_pipelines().unwrap();
        assert!(cache.cached_keys(ResourceType::GraphicsPipeline).unwrap().is_empty());
        assert!(cache.cached_keys(ResourceType::ComputePipeline).unwrap().is_empty());
        assert_eq!(cache.cached_keys(ResourceType::Framebuffer).unwrap().len(), 1);

        cache.clear_framebuffers().unwrap();
        assert!(cache.cached_keys(ResourceType::Framebuffer).unwrap().is_empty());
        assert_eq!(cache.cached_keys(ResourceType::PipelineLayout).unwrap().len(), 2);
    }

    #[test]
    fn view_substitution_rekeys_the_set() {
        let device = device();
        let cache = cache(&device);
        let layout = cache.request_pipeline_layout(&shader_modules(&cache).unwrap()).unwrap();
        let set_layout = layout.descriptor_set_layout(0).unwrap();
        let old_view = vk::ImageView::from_raw(0x30);
        let new_view = vk::ImageView::from_raw(0x50);

        let descriptor_set = cache.request_descriptor_set(set_layout, &buffer_infos(), &image_infos(old_view)).unwrap();
        let old_key = descriptor_set.lock().unwrap().structural_key();
        let write_calls = device.descriptor_write_calls();

        cache.update_descriptor_sets(&[old_view], &[new_view]).unwrap();

        assert_eq!(device.descriptor_write_calls(), write_calls + 1);
        assert_eq!(device.last_write_batch().len(), 1);

        let new_key = descriptor_set.lock().unwrap().structural_key();
        assert_eq!(descriptor_set.lock().unwrap().image_infos()[&1][&0].image_view, new_view);
        assert_eq!(cache.cached_keys(ResourceType::DescriptorSet).unwrap(), vec![new_key]);
        assert_ne!(old_key, new_key);

        let found = cache.request_descriptor_set(set_layout, &buffer_infos(), &image_infos(new_view)).unwrap();
        assert!(Arc::ptr_eq(&found, &descriptor_set));

        // The old contents are a miss now
        let recreated = cache.request_descriptor_set(set_layout, &buffer_infos(), &image_infos(old_view)).unwrap();
        assert!(!Arc::ptr_eq(&recreated, &descriptor_set));
    }

    #[test]
    fn warmup_after_view_substitution_rebuilds_the_recorded_contents() {
        let device = device();
        let original = cache(&device);
        let layout = original.request_pipeline_layout(&shader_modules(&original).unwrap()).unwrap();
        let set_layout = layout.descriptor_set_layout(0).unwrap();
        let old_view = vk::ImageView::from_raw(0x30);
        let new_view = vk::ImageView::from_raw(0x50);

        let descriptor_set = original.request_descriptor_set(set_layout, &buffer_infos(), &image_infos(old_view)).unwrap();
        let old_key = descriptor_set.lock().unwrap().structural_key();
        original.update_descriptor_sets(&[old_view], &[new_view]).unwrap();
        let new_key = descriptor_set.lock().unwrap().structural_key();

        // The stream keeps the contents the set was created with
        let fresh = cache(&device);
        fresh.warmup(&original.serialize().unwrap()).unwrap();
        assert_eq!(original.cached_keys(ResourceType::DescriptorSet).unwrap(), vec![new_key]);
        assert_eq!(fresh.cached_keys(ResourceType::DescriptorSet).unwrap(), vec![old_key]);
    }

    #[test]
    fn clears_stop_tracking_dropped_objects() {
        let device = device();
        let cache = cache(&device);
        build_scene(&cache).unwrap();
        assert_eq!(cache.recorded_object_count().unwrap(), 13);

        cache.clear_pipelines().unwrap();
        assert_eq!(cache.recorded_object_count().unwrap(), 11);
        cache.clear_framebuffers().unwrap();
        assert_eq!(cache.recorded_object_count().unwrap(), 10);

        build_scene(&cache).unwrap();
        assert_eq!(cache.recorded_object_count().unwrap(), 13);
        cache.clear().unwrap();
        assert_eq!(cache.recorded_object_count().unwrap(), 8);
    }

    #[test]
    fn held_render_pass_still_records_after_clear() {
        let device = device();
        let cache = cache(&device);
        let color = Attachment::new(vk::Format::B8G8R8A8_SRGB, vk::ImageUsageFlags::COLOR_ATTACHMENT);
        let render_pass = cache.request_render_pass(&[color], &[], &[]).unwrap();

        cache.clear().unwrap();

        let target = RenderTarget::new(
            vk::Extent2D { width: 64, height: 64 },
            vec![vk::ImageView::from_raw(0x40)],
            vec![color],
        );
        assert!(cache.request_framebuffer(&target, &render_pass).is_ok());
        assert_eq!(cache.cached_keys(ResourceType::Framebuffer).unwrap().len(), 1);
    }

    #[test]
    fn mismatched_view_lists_are_rejected() {
        let device = device();
        let cache = cache(&device);
        assert!(cache.update_descriptor_sets(&[vk::ImageView::from_raw(1)], &[]).is_err());
    }

    #[test]
    fn concurrent_requests_share_one_instance() {
        let device = device();
        let cache = cache(&device);

        let modules = std::thread::scope(|scope| {
            let handles = (0..8)
                .map(|_| scope.spawn(|| shader_modules(&cache).unwrap()))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });

        for pair in modules.windows(2) {
            assert!(Arc::ptr_eq(&pair[0][0], &pair[1][0]));
            assert!(Arc::ptr_eq(&pair[0][1], &pair[1][1]));
        }
        assert_eq!(device.shader_modules_created(), 2);
    }
}
