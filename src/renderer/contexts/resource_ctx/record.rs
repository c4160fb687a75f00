use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use ash::vk;
use color_eyre::eyre::{eyre, OptionExt};
use color_eyre::Result;
use crate::renderer::contexts::resource_ctx::codec::RecordCodec;
use crate::renderer::contexts::resource_ctx::descriptor_pool::DescriptorPool;
use crate::renderer::contexts::resource_ctx::descriptor_set::{BindingMap, BufferBinding, DescriptorSet, ImageBinding};
use crate::renderer::contexts::resource_ctx::descriptor_set_layout::DescriptorSetLayout;
use crate::renderer::resources::framebuffer::{Framebuffer, RenderTarget};
use crate::renderer::resources::pipeline::{ComputePipeline, GraphicsPipeline, PipelineLayout, PipelineState};
use crate::renderer::resources::render_pass::{Attachment, LoadStoreInfo, RenderPass, SubpassInfo};
use crate::renderer::resources::shader::{ShaderModule, ShaderResource, ShaderSource, ShaderVariant};
use crate::renderer::resources::ResourceId;

/// Tag written in front of every record entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResourceType {
    ShaderModule = 0,
    DescriptorSetLayout = 1,
    PipelineLayout = 2,
    RenderPass = 3,
    GraphicsPipeline = 4,
    ComputePipeline = 5,
    DescriptorPool = 6,
    DescriptorSet = 7,
    Framebuffer = 8,
}

impl ResourceType {
    pub const COUNT: usize = 9;

    pub const ALL: [Self; Self::COUNT] = [
        Self::ShaderModule,
        Self::DescriptorSetLayout,
        Self::PipelineLayout,
        Self::RenderPass,
        Self::GraphicsPipeline,
        Self::ComputePipeline,
        Self::DescriptorPool,
        Self::DescriptorSet,
        Self::Framebuffer,
    ];

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    pub fn tag(&self) -> u8 {
        *self as u8
    }
}

/// A cached object that can appear in a record.
pub trait Recorded {
    const TYPE: ResourceType;

    fn id(&self) -> ResourceId;
}

macro_rules! impl_recorded {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl Recorded for $ty {
                const TYPE: ResourceType = ResourceType::$variant;

                fn id(&self) -> ResourceId {
                    <$ty>::id(self)
                }
            }
        )*
    };
}

impl_recorded!(
    ShaderModule => ShaderModule,
    DescriptorSetLayout => DescriptorSetLayout,
    PipelineLayout => PipelineLayout,
    RenderPass => RenderPass,
    GraphicsPipeline => GraphicsPipeline,
    ComputePipeline => ComputePipeline,
    DescriptorPool => DescriptorPool,
    DescriptorSet => DescriptorSet,
    Framebuffer => Framebuffer,
);

/// Append-only log of resource creations.
///
/// Each entry is a type tag followed by the creation arguments. Objects an
/// entry depends on are written as their per-type registration index, so a
/// replay can resolve them against what it rebuilt earlier in the stream.
#[derive(Default)]
pub struct ResourceRecord {
    data: Vec<u8>,
    counts: [u32; ResourceType::COUNT],
    indices: HashMap<ResourceId, (ResourceType, u32)>,
}

impl ResourceRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn count(&self, ty: ResourceType) -> u32 {
        self.counts[ty as usize]
    }

    /// Associates a live object with the index its registration returned.
    pub fn set_resource<T: Recorded>(&mut self, index: u32, resource: &T) -> Result<()> {
        if index >= self.count(T::TYPE) {
            return Err(eyre!("{:?} index {} was never registered", T::TYPE, index));
        }
        self.indices.insert(resource.id(), (T::TYPE, index));
        Ok(())
    }

    pub fn index_of<T: Recorded>(&self, resource: &T) -> Result<u32> {
        match self.indices.get(&resource.id()) {
            Some(&(ty, index)) if ty == T::TYPE => Ok(index),
            _ => Err(eyre!("{:?} {:?} is not part of the record", T::TYPE, resource.id())),
        }
    }

    /// Drops the index of every tracked object of type `ty`.
    pub fn forget(&mut self, ty: ResourceType) {
        self.indices.retain(|_, (tracked, _)| *tracked != ty);
    }

    pub fn tracked_count(&self) -> usize {
        self.indices.len()
    }

    fn indices_of<T: Recorded>(&self, resources: &[Arc<T>]) -> Result<Vec<u32>> {
        resources
            .iter()
            .map(|resource| self.index_of(&**resource))
            .collect()
    }

    /// Writes one entry. A failed encode leaves the stream untouched.
    fn append(
        &mut self,
        ty: ResourceType,
        encode: impl FnOnce(&mut Vec<u8>) -> io::Result<()>,
    ) -> Result<u32> {
        let start = self.data.len();
        self.data.push(ty.tag());
        if let Err(error) = encode(&mut self.data) {
            self.data.truncate(start);
            return Err(error.into());
        }

        let count = &mut self.counts[ty as usize];
        let index = *count;
        *count += 1;
        Ok(index)
    }

    pub fn register_shader_module(
        &mut self,
        stage: vk::ShaderStageFlags,
        source: &ShaderSource,
        entry_point: &str,
        variant: &ShaderVariant,
    ) -> Result<u32> {
        self.append(ResourceType::ShaderModule, |out| {
            stage.encode(out)?;
            source.encode(out)?;
            entry_point.to_owned().encode(out)?;
            variant.encode(out)
        })
    }

    pub fn register_descriptor_set_layout(
        &mut self,
        set_index: u32,
        shader_modules: &[Arc<ShaderModule>],
        resources: &[ShaderResource],
    ) -> Result<u32> {
        let modules = self.indices_of(shader_modules)?;
        let resources = resources.to_vec();
        self.append(ResourceType::DescriptorSetLayout, |out| {
            set_index.encode(out)?;
            modules.encode(out)?;
            resources.encode(out)
        })
    }

    pub fn register_pipeline_layout(&mut self, shader_modules: &[Arc<ShaderModule>]) -> Result<u32> {
        let modules = self.indices_of(shader_modules)?;
        self.append(ResourceType::PipelineLayout, |out| modules.encode(out))
    }

    pub fn register_render_pass(
        &mut self,
        attachments: &[Attachment],
        load_store_infos: &[LoadStoreInfo],
        subpasses: &[SubpassInfo],
    ) -> Result<u32> {
        let attachments = attachments.to_vec();
        let load_store_infos = load_store_infos.to_vec();
        let subpasses = subpasses.to_vec();
        self.append(ResourceType::RenderPass, |out| {
            attachments.encode(out)?;
            load_store_infos.encode(out)?;
            subpasses.encode(out)
        })
    }

    pub fn register_graphics_pipeline(&mut self, state: &PipelineState) -> Result<u32> {
        let layout = state
            .pipeline_layout()
            .ok_or_eyre("Graphics pipeline state has no pipeline layout")?;
        let layout = self.index_of(&**layout)?;
        let render_pass = state
            .render_pass()
            .ok_or_eyre("Graphics pipeline state has no render pass")?;
        let render_pass = self.index_of(&**render_pass)?;

        self.append(ResourceType::GraphicsPipeline, |out| {
            layout.encode(out)?;
            render_pass.encode(out)?;
            state.subpass_index().encode(out)?;
            state.specialization_constants().encode(out)?;
            state.vertex_input().encode(out)?;
            state.input_assembly().encode(out)?;
            state.rasterization().encode(out)?;
            state.viewport().encode(out)?;
            state.multisample().encode(out)?;
            state.depth_stencil().encode(out)?;
            state.color_blend().encode(out)
        })
    }

    pub fn register_compute_pipeline(&mut self, state: &PipelineState) -> Result<u32> {
        let layout = state
            .pipeline_layout()
            .ok_or_eyre("Compute pipeline state has no pipeline layout")?;
        let layout = self.index_of(&**layout)?;

        self.append(ResourceType::ComputePipeline, |out| {
            layout.encode(out)?;
            state.specialization_constants().encode(out)
        })
    }

    pub fn register_descriptor_pool(&mut self, layout: &DescriptorSetLayout) -> Result<u32> {
        let layout = self.index_of(layout)?;
        self.append(ResourceType::DescriptorPool, |out| layout.encode(out))
    }

    pub fn register_descriptor_set(
        &mut self,
        layout: &DescriptorSetLayout,
        buffer_infos: &BindingMap<BufferBinding>,
        image_infos: &BindingMap<ImageBinding>,
    ) -> Result<u32> {
        let layout = self.index_of(layout)?;
        self.append(ResourceType::DescriptorSet, |out| {
            layout.encode(out)?;
            buffer_infos.encode(out)?;
            image_infos.encode(out)
        })
    }

    pub fn register_framebuffer(
        &mut self,
        render_target: &RenderTarget,
        render_pass: &RenderPass,
    ) -> Result<u32> {
        let render_pass = self.index_of(render_pass)?;
        self.append(ResourceType::Framebuffer, |out| {
            render_target.encode(out)?;
            render_pass.encode(out)
        })
    }
}
