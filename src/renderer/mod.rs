pub mod config;
pub mod contexts;
pub mod resources;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{
    BufferAllocationStrategy,
    CacheConfig,
    DescriptorManagementStrategy,
    FrameConfig,
};
pub use contexts::device_ctx::{AshRenderDevice, CompiledSpirv, RenderDevice, ShaderCompiler};
pub use contexts::frame_ctx::RenderFrame;
pub use contexts::resource_ctx::ResourceCache;
