use std::sync::Arc;
use ash::vk;
use color_eyre::Result;
use crate::renderer::contexts::device_ctx::RenderDevice;
use crate::renderer::resources::ResourceId;

/// Description of one render target image as seen by a render pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Attachment {
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
    pub initial_layout: vk::ImageLayout,
}

impl Attachment {
    pub fn new(format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            usage,
            initial_layout: vk::ImageLayout::UNDEFINED,
        }
    }

    pub fn is_depth_stencil(&self) -> bool {
        is_depth_format(self.format)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LoadStoreInfo {
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
}

impl Default for LoadStoreInfo {
    fn default() -> Self {
        Self {
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
        }
    }
}

/// Attachment indices read and written by one subpass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SubpassInfo {
    pub input_attachments: Vec<u32>,
    pub output_attachments: Vec<u32>,
    pub color_resolve_attachments: Vec<u32>,
    pub disable_depth_stencil_attachment: bool,
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub struct RenderPass {
    id: ResourceId,
    key: u64,
    handle: vk::RenderPass,
    color_output_counts: Vec<u32>,
    device: Arc<dyn RenderDevice>,
}

impl RenderPass {
    pub(crate) fn new(
        device: Arc<dyn RenderDevice>,
        key: u64,
        attachments: &[Attachment],
        load_store_infos: &[LoadStoreInfo],
        subpasses: &[SubpassInfo],
    ) -> Result<Self> {
        let handle = device.create_render_pass(attachments, load_store_infos, subpasses)?;

        let color_output_counts = if subpasses.is_empty() {
            vec![attachments.iter().filter(|a| !a.is_depth_stencil()).count() as u32]
        } else {
            subpasses
                .iter()
                .map(|subpass| {
                    subpass.output_attachments
                        .iter()
                        .filter(|&&index| {
                            attachments
                                .get(index as usize)
                                .is_some_and(|a| !a.is_depth_stencil())
                        })
                        .count() as u32
                })
                .collect()
        };

        Ok(Self {
            id: ResourceId::next(),
            key,
            handle,
            color_output_counts,
            device,
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn subpass_count(&self) -> usize {
        self.color_output_counts.len()
    }

    pub fn color_output_count(&self, subpass_index: u32) -> u32 {
        self.color_output_counts
            .get(subpass_index as usize)
            .copied()
            .unwrap_or(0)
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.device.destroy_render_pass(self.handle);
    }
}
