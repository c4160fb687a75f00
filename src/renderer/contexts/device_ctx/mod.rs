pub mod command_pool;
pub mod device;
pub mod queue;

use ash::vk;
use color_eyre::Result;
use gpu_descriptor::{CreatePoolError, DescriptorTotalCount, DeviceAllocationError};
use crate::renderer::contexts::resource_ctx::descriptor_set::DescriptorWrite;
use crate::renderer::resources::pipeline::PipelineState;
use crate::renderer::resources::render_pass::{Attachment, LoadStoreInfo, SubpassInfo};
use crate::renderer::resources::shader::{ShaderResource, ShaderSource, ShaderVariant};

pub use device::AshRenderDevice;

/// SPIR-V and reflection produced by an external shader compiler.
pub struct CompiledSpirv {
    pub code: Vec<u32>,
    pub resources: Vec<ShaderResource>,
}

/// Compiles and reflects shader text. Supplied by the application.
pub trait ShaderCompiler: Send + Sync {
    fn compile(
        &self,
        stage: vk::ShaderStageFlags,
        source: &ShaderSource,
        entry_point: &str,
        variant: &ShaderVariant,
    ) -> Result<CompiledSpirv>;
}

/// Responsibilities:
/// - Create and destroy every native object the cache and frames hand out
/// - Report the device limits that descriptor writes and buffer blocks depend on
/// - Batch descriptor writes into a single native update call
///
/// Destruction entry points never fail.
pub trait RenderDevice: Send + Sync {
    fn limits(&self) -> vk::PhysicalDeviceLimits;

    fn create_shader_module(
        &self,
        stage: vk::ShaderStageFlags,
        source: &ShaderSource,
        entry_point: &str,
        variant: &ShaderVariant,
    ) -> Result<(vk::ShaderModule, Vec<ShaderResource>)>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
        binding_flags: &[vk::DescriptorBindingFlags],
        flags: vk::DescriptorSetLayoutCreateFlags,
    ) -> Result<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    fn create_descriptor_pool(
        &self,
        descriptor_count: &DescriptorTotalCount,
        max_sets: u32,
        flags: vk::DescriptorPoolCreateFlags,
    ) -> std::result::Result<vk::DescriptorPool, CreatePoolError>;
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> std::result::Result<vk::DescriptorSet, DeviceAllocationError>;
    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) -> Result<()>;
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);

    fn create_render_pass(
        &self,
        attachments: &[Attachment],
        load_store_infos: &[LoadStoreInfo],
        subpasses: &[SubpassInfo],
    ) -> Result<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    fn create_graphics_pipeline(
        &self,
        pipeline_cache: vk::PipelineCache,
        state: &PipelineState,
    ) -> Result<vk::Pipeline>;
    fn create_compute_pipeline(
        &self,
        pipeline_cache: vk::PipelineCache,
        state: &PipelineState,
    ) -> Result<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    /// Host visible, persistently mapped.
    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<vk::Buffer>;
    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> Result<()>;
    fn destroy_buffer(&self, buffer: vk::Buffer);

    fn create_command_pool(
        &self,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool>;
    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer>;
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;
    fn free_command_buffers(&self, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]);

    fn create_fence(&self) -> Result<vk::Fence>;
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> Result<()>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()>;
    fn destroy_fence(&self, fence: vk::Fence);

    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn wait_idle(&self) -> Result<()>;
}
