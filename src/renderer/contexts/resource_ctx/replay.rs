use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use ash::vk;
use color_eyre::Result;
use crate::renderer::contexts::resource_ctx::codec::{RecordCodec, RecordError};
use crate::renderer::contexts::resource_ctx::descriptor_pool::DescriptorPool;
use crate::renderer::contexts::resource_ctx::descriptor_set::{BindingMap, BufferBinding, DescriptorSet, ImageBinding};
use crate::renderer::contexts::resource_ctx::descriptor_set_layout::DescriptorSetLayout;
use crate::renderer::contexts::resource_ctx::record::ResourceType;
use crate::renderer::contexts::resource_ctx::ResourceCache;
use crate::renderer::resources::framebuffer::{Framebuffer, RenderTarget};
use crate::renderer::resources::pipeline::{
    ColorBlendState, ComputePipeline, DepthStencilState, GraphicsPipeline, InputAssemblyState,
    MultisampleState, PipelineLayout, PipelineState, RasterizationState, VertexInputState,
    ViewportState,
};
use crate::renderer::resources::render_pass::{Attachment, LoadStoreInfo, RenderPass, SubpassInfo};
use crate::renderer::resources::shader::{ShaderModule, ShaderResource, ShaderSource, ShaderVariant};

/// One decoded record entry. References to earlier objects are still indices.
enum RecordEntry {
    ShaderModule {
        stage: vk::ShaderStageFlags,
        source: ShaderSource,
        entry_point: String,
        variant: ShaderVariant,
    },
    DescriptorSetLayout {
        set_index: u32,
        shader_modules: Vec<u32>,
        resources: Vec<ShaderResource>,
    },
    PipelineLayout {
        shader_modules: Vec<u32>,
    },
    RenderPass {
        attachments: Vec<Attachment>,
        load_store_infos: Vec<LoadStoreInfo>,
        subpasses: Vec<SubpassInfo>,
    },
    GraphicsPipeline {
        pipeline_layout: u32,
        render_pass: u32,
        subpass_index: u32,
        specialization_constants: BTreeMap<u32, Vec<u8>>,
        vertex_input: VertexInputState,
        input_assembly: InputAssemblyState,
        rasterization: RasterizationState,
        viewport: ViewportState,
        multisample: MultisampleState,
        depth_stencil: DepthStencilState,
        color_blend: ColorBlendState,
    },
    ComputePipeline {
        pipeline_layout: u32,
        specialization_constants: BTreeMap<u32, Vec<u8>>,
    },
    DescriptorPool {
        layout: u32,
    },
    DescriptorSet {
        layout: u32,
        buffer_infos: BindingMap<BufferBinding>,
        image_infos: BindingMap<ImageBinding>,
    },
    Framebuffer {
        render_target: RenderTarget,
        render_pass: u32,
    },
}

impl RecordEntry {
    /// Reads a whole entry, so a cut stream never issues a partial request.
    fn decode(input: &mut Cursor<&[u8]>) -> Result<Self, RecordError> {
        let tag = u8::decode(input)?;
        let ty = ResourceType::from_tag(tag).ok_or(RecordError::UnknownTag(tag))?;

        let entry = match ty {
            ResourceType::ShaderModule => Self::ShaderModule {
                stage: RecordCodec::decode(input)?,
                source: RecordCodec::decode(input)?,
                entry_point: RecordCodec::decode(input)?,
                variant: RecordCodec::decode(input)?,
            },
            ResourceType::DescriptorSetLayout => Self::DescriptorSetLayout {
                set_index: RecordCodec::decode(input)?,
                shader_modules: RecordCodec::decode(input)?,
                resources: RecordCodec::decode(input)?,
            },
            ResourceType::PipelineLayout => Self::PipelineLayout {
                shader_modules: RecordCodec::decode(input)?,
            },
            ResourceType::RenderPass => Self::RenderPass {
                attachments: RecordCodec::decode(input)?,
                load_store_infos: RecordCodec::decode(input)?,
                subpasses: RecordCodec::decode(input)?,
            },
            ResourceType::GraphicsPipeline => Self::GraphicsPipeline {
                pipeline_layout: RecordCodec::decode(input)?,
                render_pass: RecordCodec::decode(input)?,
                subpass_index: RecordCodec::decode(input)?,
                specialization_constants: RecordCodec::decode(input)?,
                vertex_input: RecordCodec::decode(input)?,
                input_assembly: RecordCodec::decode(input)?,
                rasterization: RecordCodec::decode(input)?,
                viewport: RecordCodec::decode(input)?,
                multisample: RecordCodec::decode(input)?,
                depth_stencil: RecordCodec::decode(input)?,
                color_blend: RecordCodec::decode(input)?,
            },
            ResourceType::ComputePipeline => Self::ComputePipeline {
                pipeline_layout: RecordCodec::decode(input)?,
                specialization_constants: RecordCodec::decode(input)?,
            },
            ResourceType::DescriptorPool => Self::DescriptorPool {
                layout: RecordCodec::decode(input)?,
            },
            ResourceType::DescriptorSet => Self::DescriptorSet {
                layout: RecordCodec::decode(input)?,
                buffer_infos: RecordCodec::decode(input)?,
                image_infos: RecordCodec::decode(input)?,
            },
            ResourceType::Framebuffer => Self::Framebuffer {
                render_target: RecordCodec::decode(input)?,
                render_pass: RecordCodec::decode(input)?,
            },
        };

        Ok(entry)
    }
}

fn resolve<T: Clone>(resources: &[T], ty: ResourceType, index: u32) -> Result<T, RecordError> {
    resources
        .get(index as usize)
        .cloned()
        .ok_or(RecordError::UnresolvedIndex { ty, index })
}

fn resolve_all<T: Clone>(resources: &[T], ty: ResourceType, indices: &[u32]) -> Result<Vec<T>, RecordError> {
    indices
        .iter()
        .map(|&index| resolve(resources, ty, index))
        .collect()
}

/// Rebuilds cache contents from a record stream by issuing the recorded
/// requests in their original order.
///
/// Holds every object it rebuilt, indexed the way the record indexed them.
#[derive(Default)]
pub struct ResourceReplay {
    shader_modules: Vec<Arc<ShaderModule>>,
    descriptor_set_layouts: Vec<Arc<DescriptorSetLayout>>,
    pipeline_layouts: Vec<Arc<PipelineLayout>>,
    render_passes: Vec<Arc<RenderPass>>,
    graphics_pipelines: Vec<Arc<GraphicsPipeline>>,
    compute_pipelines: Vec<Arc<ComputePipeline>>,
    descriptor_pools: Vec<Arc<Mutex<DescriptorPool>>>,
    descriptor_sets: Vec<Arc<Mutex<DescriptorSet>>>,
    framebuffers: Vec<Arc<Framebuffer>>,
}

impl ResourceReplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replays every complete entry of `data` against `cache` and returns how
    /// many were replayed. A cut-off final entry ends the replay early, any
    /// other malformed entry is an error.
    pub fn play(&mut self, cache: &ResourceCache, data: &[u8]) -> Result<usize> {
        let mut input = Cursor::new(data);
        let mut replayed = 0;

        while (input.position() as usize) < data.len() {
            let entry_start = input.position() as usize;
            let entry = match RecordEntry::decode(&mut input) {
                Ok(entry) => entry,
                Err(RecordError::Truncated) => {
                    log::warn!(
                        "Resource record ends mid-entry after {} entries, ignoring the remaining {} bytes",
                        replayed,
                        data.len() - entry_start,
                    );
                    break;
                }
                Err(error) => return Err(error.into()),
            };

            self.apply(cache, entry)?;
            replayed += 1;
        }

        Ok(replayed)
    }

    fn apply(&mut self, cache: &ResourceCache, entry: RecordEntry) -> Result<()> {
        match entry {
            RecordEntry::ShaderModule { stage, source, entry_point, variant } => {
                let module = cache.request_shader_module(stage, &source, &entry_point, &variant)?;
                self.shader_modules.push(module);
            }
            RecordEntry::DescriptorSetLayout { set_index, shader_modules, resources } => {
                let modules = resolve_all(&self.shader_modules, ResourceType::ShaderModule, &shader_modules)?;
                let layout = cache.request_descriptor_set_layout(set_index, &modules, &resources)?;
                self.descriptor_set_layouts.push(layout);
            }
            RecordEntry::PipelineLayout { shader_modules } => {
                let modules = resolve_all(&self.shader_modules, ResourceType::ShaderModule, &shader_modules)?;
                let layout = cache.request_pipeline_layout(&modules)?;
                self.pipeline_layouts.push(layout);
            }
            RecordEntry::RenderPass { attachments, load_store_infos, subpasses } => {
                let render_pass = cache.request_render_pass(&attachments, &load_store_infos, &subpasses)?;
                self.render_passes.push(render_pass);
            }
            RecordEntry::GraphicsPipeline {
                pipeline_layout,
                render_pass,
                subpass_index,
                specialization_constants,
                vertex_input,
                input_assembly,
                rasterization,
                viewport,
                multisample,
                depth_stencil,
                color_blend,
            } => {
                let pipeline_layout = resolve(&self.pipeline_layouts, ResourceType::PipelineLayout, pipeline_layout)?;
                let render_pass = resolve(&self.render_passes, ResourceType::RenderPass, render_pass)?;
                let state = PipelineState::new()
                    .with_pipeline_layout(pipeline_layout)
                    .with_render_pass(render_pass)
                    .with_subpass_index(subpass_index)
                    .with_specialization_constants(specialization_constants)
                    .with_vertex_input(vertex_input)
                    .with_input_assembly(input_assembly)
                    .with_rasterization(rasterization)
                    .with_viewport(viewport)
                    .with_multisample(multisample)
                    .with_depth_stencil(depth_stencil)
                    .with_color_blend(color_blend);
                let pipeline = cache.request_graphics_pipeline(&state)?;
                self.graphics_pipelines.push(pipeline);
            }
            RecordEntry::ComputePipeline { pipeline_layout, specialization_constants } => {
                let pipeline_layout = resolve(&self.pipeline_layouts, ResourceType::PipelineLayout, pipeline_layout)?;
                let state = PipelineState::new()
                    .with_pipeline_layout(pipeline_layout)
                    .with_specialization_constants(specialization_constants);
                let pipeline = cache.request_compute_pipeline(&state)?;
                self.compute_pipelines.push(pipeline);
            }
            RecordEntry::DescriptorPool { layout } => {
                let layout = resolve(&self.descriptor_set_layouts, ResourceType::DescriptorSetLayout, layout)?;
                let pool = cache.request_descriptor_pool(&layout)?;
                self.descriptor_pools.push(pool);
            }
            RecordEntry::DescriptorSet { layout, buffer_infos, image_infos } => {
                let layout = resolve(&self.descriptor_set_layouts, ResourceType::DescriptorSetLayout, layout)?;
                let descriptor_set = cache.request_descriptor_set(&layout, &buffer_infos, &image_infos)?;
                self.descriptor_sets.push(descriptor_set);
            }
            RecordEntry::Framebuffer { render_target, render_pass } => {
                let render_pass = resolve(&self.render_passes, ResourceType::RenderPass, render_pass)?;
                let framebuffer = cache.request_framebuffer(&render_target, &render_pass)?;
                self.framebuffers.push(framebuffer);
            }
        }

        Ok(())
    }

    pub fn replayed_count(&self, ty: ResourceType) -> usize {
        match ty {
            ResourceType::ShaderModule => self.shader_modules.len(),
            ResourceType::DescriptorSetLayout => self.descriptor_set_layouts.len(),
            ResourceType::PipelineLayout => self.pipeline_layouts.len(),
            ResourceType::RenderPass => self.render_passes.len(),
            ResourceType::GraphicsPipeline => self.graphics_pipelines.len(),
            ResourceType::ComputePipeline => self.compute_pipelines.len(),
            ResourceType::DescriptorPool => self.descriptor_pools.len(),
            ResourceType::DescriptorSet => self.descriptor_sets.len(),
            ResourceType::Framebuffer => self.framebuffers.len(),
        }
    }
}
