//! Recording stand-in for the native device, shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use ash::vk;
use ash::vk::Handle;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use gpu_descriptor::{CreatePoolError, DescriptorTotalCount, DeviceAllocationError};
use crate::renderer::contexts::device_ctx::RenderDevice;
use crate::renderer::contexts::resource_ctx::descriptor_set::DescriptorWrite;
use crate::renderer::resources::pipeline::PipelineState;
use crate::renderer::resources::render_pass::{Attachment, LoadStoreInfo, SubpassInfo};
use crate::renderer::resources::shader::{ShaderResource, ShaderSource, ShaderVariant};

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct CreatedPool {
    pub handle: vk::DescriptorPool,
    pub max_sets: u32,
    pub uniform_buffers: u32,
    pub combined_image_samplers: u32,
    pub flags: vk::DescriptorPoolCreateFlags,
}

#[derive(Default)]
pub(crate) struct MockDevice {
    next_handle: AtomicU64,
    reflections: Mutex<HashMap<String, Vec<ShaderResource>>>,

    shader_modules_created: AtomicUsize,
    set_layouts_created: AtomicUsize,
    last_set_layout_flags: Mutex<Option<vk::DescriptorSetLayoutCreateFlags>>,
    pipelines_created: AtomicUsize,
    framebuffers_created: AtomicUsize,

    descriptor_pools: Mutex<Vec<CreatedPool>>,
    pool_allocations: Mutex<HashMap<vk::DescriptorPool, u32>>,
    descriptor_pool_resets: AtomicUsize,
    fail_set_allocations: AtomicBool,
    descriptor_write_calls: AtomicUsize,
    descriptor_writes_issued: AtomicUsize,
    last_write_batch: Mutex<Vec<DescriptorWrite>>,

    buffers: Mutex<HashMap<vk::Buffer, Vec<u8>>>,
    command_buffers_allocated: AtomicUsize,
    command_pool_resets: AtomicUsize,
    fence_waits: AtomicUsize,
    fence_resets: AtomicUsize,
    fences_created: AtomicUsize,
    semaphores_created: AtomicUsize,
    wait_idle_calls: AtomicUsize,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_handle: AtomicU64::new(1),
            ..Default::default()
        })
    }

    /// Reflection returned for shaders whose text is exactly `source`.
    pub fn add_reflection(&self, source: &str, resources: Vec<ShaderResource>) {
        self.reflections
            .lock()
            .unwrap()
            .insert(source.to_owned(), resources);
    }

    fn handle<T: Handle>(&self) -> T {
        T::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    pub fn shader_modules_created(&self) -> usize {
        self.shader_modules_created.load(Ordering::SeqCst)
    }

    pub fn set_layouts_created(&self) -> usize {
        self.set_layouts_created.load(Ordering::SeqCst)
    }

    pub fn last_set_layout_flags(&self) -> Option<vk::DescriptorSetLayoutCreateFlags> {
        *self.last_set_layout_flags.lock().unwrap()
    }

    pub fn pipelines_created(&self) -> usize {
        self.pipelines_created.load(Ordering::SeqCst)
    }

    pub fn framebuffers_created(&self) -> usize {
        self.framebuffers_created.load(Ordering::SeqCst)
    }

    pub fn descriptor_pools(&self) -> Vec<CreatedPool> {
        self.descriptor_pools.lock().unwrap().clone()
    }

    pub fn descriptor_pool_resets(&self) -> usize {
        self.descriptor_pool_resets.load(Ordering::SeqCst)
    }

    pub fn fail_set_allocations(&self, fail: bool) {
        self.fail_set_allocations.store(fail, Ordering::SeqCst);
    }

    pub fn descriptor_write_calls(&self) -> usize {
        self.descriptor_write_calls.load(Ordering::SeqCst)
    }

    pub fn descriptor_writes_issued(&self) -> usize {
        self.descriptor_writes_issued.load(Ordering::SeqCst)
    }

    pub fn last_write_batch(&self) -> Vec<DescriptorWrite> {
        self.last_write_batch.lock().unwrap().clone()
    }

    pub fn buffers_created(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Vec<u8> {
        self.buffers.lock().unwrap()[&buffer].clone()
    }

    pub fn command_buffers_allocated(&self) -> usize {
        self.command_buffers_allocated.load(Ordering::SeqCst)
    }

    pub fn command_pool_resets(&self) -> usize {
        self.command_pool_resets.load(Ordering::SeqCst)
    }

    pub fn fences_created(&self) -> usize {
        self.fences_created.load(Ordering::SeqCst)
    }

    pub fn fence_waits(&self) -> usize {
        self.fence_waits.load(Ordering::SeqCst)
    }

    pub fn fence_resets(&self) -> usize {
        self.fence_resets.load(Ordering::SeqCst)
    }

    pub fn semaphores_created(&self) -> usize {
        self.semaphores_created.load(Ordering::SeqCst)
    }

    pub fn wait_idle_calls(&self) -> usize {
        self.wait_idle_calls.load(Ordering::SeqCst)
    }
}

impl RenderDevice for MockDevice {
    fn limits(&self) -> vk::PhysicalDeviceLimits {
        vk::PhysicalDeviceLimits {
            max_uniform_buffer_range: 65536,
            max_storage_buffer_range: 1 << 27,
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 64,
            min_texel_buffer_offset_alignment: 16,
            ..Default::default()
        }
    }

    fn create_shader_module(
        &self,
        _stage: vk::ShaderStageFlags,
        source: &ShaderSource,
        _entry_point: &str,
        _variant: &ShaderVariant,
    ) -> Result<(vk::ShaderModule, Vec<ShaderResource>)> {
        let resources = self.reflections
            .lock()
            .map_err(|e| eyre!(e.to_string()))?
            .get(source.source())
            .cloned()
            .unwrap_or_default();
        self.shader_modules_created.fetch_add(1, Ordering::SeqCst);
        Ok((self.handle(), resources))
    }

    fn destroy_shader_module(&self, _module: vk::ShaderModule) {}

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding<'_>],
        _binding_flags: &[vk::DescriptorBindingFlags],
        flags: vk::DescriptorSetLayoutCreateFlags,
    ) -> Result<vk::DescriptorSetLayout> {
        self.set_layouts_created.fetch_add(1, Ordering::SeqCst);
        *self.last_set_layout_flags.lock().map_err(|e| eyre!(e.to_string()))? = Some(flags);
        Ok(self.handle())
    }

    fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {}

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        Ok(self.handle())
    }

    fn destroy_pipeline_layout(&self, _layout: vk::PipelineLayout) {}

    fn create_descriptor_pool(
        &self,
        descriptor_count: &DescriptorTotalCount,
        max_sets: u32,
        flags: vk::DescriptorPoolCreateFlags,
    ) -> std::result::Result<vk::DescriptorPool, CreatePoolError> {
        let handle = self.handle();
        self.descriptor_pools.lock().unwrap().push(CreatedPool {
            handle,
            max_sets,
            uniform_buffers: descriptor_count.uniform_buffer,
            combined_image_samplers: descriptor_count.combined_image_sampler,
            flags,
        });
        self.pool_allocations.lock().unwrap().insert(handle, 0);
        Ok(handle)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()> {
        self.descriptor_pool_resets.fetch_add(1, Ordering::SeqCst);
        self.pool_allocations
            .lock()
            .map_err(|e| eyre!(e.to_string()))?
            .insert(pool, 0);
        Ok(())
    }

    fn destroy_descriptor_pool(&self, _pool: vk::DescriptorPool) {}

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> std::result::Result<vk::DescriptorSet, DeviceAllocationError> {
        if self.fail_set_allocations.load(Ordering::SeqCst) {
            return Err(DeviceAllocationError::OutOfPoolMemory);
        }

        let max_sets = self.descriptor_pools
            .lock()
            .unwrap()
            .iter()
            .find(|created| created.handle == pool)
            .map(|created| created.max_sets)
            .unwrap_or(0);
        let mut allocations = self.pool_allocations.lock().unwrap();
        let allocated = allocations.entry(pool).or_default();
        assert!(*allocated < max_sets, "native pool {:?} asked beyond its capacity", pool);
        *allocated += 1;

        Ok(self.handle())
    }

    fn free_descriptor_set(&self, pool: vk::DescriptorPool, _set: vk::DescriptorSet) -> Result<()> {
        let mut allocations = self.pool_allocations.lock().map_err(|e| eyre!(e.to_string()))?;
        let allocated = allocations.entry(pool).or_default();
        *allocated = allocated.saturating_sub(1);
        Ok(())
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        self.descriptor_write_calls.fetch_add(1, Ordering::SeqCst);
        self.descriptor_writes_issued.fetch_add(writes.len(), Ordering::SeqCst);
        *self.last_write_batch.lock().unwrap() = writes.to_vec();
    }

    fn create_render_pass(
        &self,
        _attachments: &[Attachment],
        _load_store_infos: &[LoadStoreInfo],
        _subpasses: &[SubpassInfo],
    ) -> Result<vk::RenderPass> {
        Ok(self.handle())
    }

    fn destroy_render_pass(&self, _render_pass: vk::RenderPass) {}

    fn create_graphics_pipeline(
        &self,
        _pipeline_cache: vk::PipelineCache,
        _state: &PipelineState,
    ) -> Result<vk::Pipeline> {
        self.pipelines_created.fetch_add(1, Ordering::SeqCst);
        Ok(self.handle())
    }

    fn create_compute_pipeline(
        &self,
        _pipeline_cache: vk::PipelineCache,
        _state: &PipelineState,
    ) -> Result<vk::Pipeline> {
        self.pipelines_created.fetch_add(1, Ordering::SeqCst);
        Ok(self.handle())
    }

    fn destroy_pipeline(&self, _pipeline: vk::Pipeline) {}

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _attachments: &[vk::ImageView],
        _extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        self.framebuffers_created.fetch_add(1, Ordering::SeqCst);
        Ok(self.handle())
    }

    fn destroy_framebuffer(&self, _framebuffer: vk::Framebuffer) {}

    fn create_buffer(&self, size: u64, _usage: vk::BufferUsageFlags) -> Result<vk::Buffer> {
        let buffer = self.handle();
        self.buffers
            .lock()
            .map_err(|e| eyre!(e.to_string()))?
            .insert(buffer, vec![0; size as usize]);
        Ok(buffer)
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut buffers = self.buffers.lock().map_err(|e| eyre!(e.to_string()))?;
        let contents = buffers
            .get_mut(&buffer)
            .ok_or_else(|| eyre!("Unknown buffer {:?}", buffer))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > contents.len() {
            return Err(eyre!("Write of {} bytes at {} overflows buffer", data.len(), offset));
        }
        contents[start..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, _buffer: vk::Buffer) {}

    fn create_command_pool(
        &self,
        _queue_family_index: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool> {
        Ok(self.handle())
    }

    fn reset_command_pool(&self, _pool: vk::CommandPool) -> Result<()> {
        self.command_pool_resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn destroy_command_pool(&self, _pool: vk::CommandPool) {}

    fn allocate_command_buffer(
        &self,
        _pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer> {
        self.command_buffers_allocated.fetch_add(1, Ordering::SeqCst);
        Ok(self.handle())
    }

    fn reset_command_buffer(&self, _command_buffer: vk::CommandBuffer) -> Result<()> {
        Ok(())
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, _command_buffers: &[vk::CommandBuffer]) {}

    fn create_fence(&self) -> Result<vk::Fence> {
        self.fences_created.fetch_add(1, Ordering::SeqCst);
        Ok(self.handle())
    }

    fn wait_for_fences(&self, _fences: &[vk::Fence], _timeout: u64) -> Result<()> {
        self.fence_waits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reset_fences(&self, _fences: &[vk::Fence]) -> Result<()> {
        self.fence_resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn destroy_fence(&self, _fence: vk::Fence) {}

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        self.semaphores_created.fetch_add(1, Ordering::SeqCst);
        Ok(self.handle())
    }

    fn destroy_semaphore(&self, _semaphore: vk::Semaphore) {}

    fn wait_idle(&self) -> Result<()> {
        self.wait_idle_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
