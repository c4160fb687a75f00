use std::hash::{Hash, Hasher};
use std::sync::Arc;
use ash::vk;
use color_eyre::Result;
use crate::renderer::contexts::device_ctx::RenderDevice;
use crate::renderer::resources::ResourceId;
use crate::renderer::resources::render_pass::{Attachment, RenderPass};

/// The image views a frame renders into. The images themselves are owned
/// by whoever manages the swapchain.
#[derive(Clone, Debug)]
pub struct RenderTarget {
    pub extent: vk::Extent2D,
    pub views: Vec<vk::ImageView>,
    pub attachments: Vec<Attachment>,
}

impl RenderTarget {
    pub fn new(
        extent: vk::Extent2D,
        views: Vec<vk::ImageView>,
        attachments: Vec<Attachment>,
    ) -> Self {
        Self {
            extent,
            views,
            attachments,
        }
    }
}

impl PartialEq for RenderTarget {
    fn eq(&self, other: &Self) -> bool {
        self.extent.width == other.extent.width
            && self.extent.height == other.extent.height
            && self.views == other.views
            && self.attachments == other.attachments
    }
}

impl Eq for RenderTarget {}

impl Hash for RenderTarget {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.extent.width.hash(state);
        self.extent.height.hash(state);
        self.views.hash(state);
        self.attachments.hash(state);
    }
}

pub struct Framebuffer {
    id: ResourceId,
    key: u64,
    handle: vk::Framebuffer,
    extent: vk::Extent2D,
    render_pass: Arc<RenderPass>,
    device: Arc<dyn RenderDevice>,
}

impl Framebuffer {
    pub(crate) fn new(
        device: Arc<dyn RenderDevice>,
        key: u64,
        render_target: &RenderTarget,
        render_pass: Arc<RenderPass>,
    ) -> Result<Self> {
        let handle = device.create_framebuffer(
            render_pass.handle(),
            &render_target.views,
            render_target.extent,
        )?;

        Ok(Self {
            id: ResourceId::next(),
            key,
            handle,
            extent: render_target.extent,
            render_pass,
            device,
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn handle(&self) -> vk::Framebuffer {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn render_pass(&self) -> &Arc<RenderPass> {
        &self.render_pass
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        self.device.destroy_framebuffer(self.handle);
    }
}
