use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use ash::vk;
use color_eyre::eyre::{eyre, OptionExt};
use color_eyre::Result;
use crate::renderer::config::{BufferAllocationStrategy, DescriptorManagementStrategy, FrameConfig, MAX_SETS_PER_POOL};
use crate::renderer::contexts::device_ctx::command_pool::{CommandBufferResetMode, CommandPool};
use crate::renderer::contexts::device_ctx::queue::Queue;
use crate::renderer::contexts::device_ctx::RenderDevice;
use crate::renderer::contexts::frame_ctx::buffer_pool::{BufferAllocation, BufferPool};
use crate::renderer::contexts::frame_ctx::sync::{FencePool, SemaphorePool};
use crate::renderer::contexts::resource_ctx::descriptor_pool::DescriptorPool;
use crate::renderer::contexts::resource_ctx::descriptor_set::{BindingMap, BufferBinding, DescriptorSet, ImageBinding};
use crate::renderer::contexts::resource_ctx::descriptor_set_layout::DescriptorSetLayout;
use crate::renderer::contexts::resource_ctx::hashing;
use crate::renderer::resources::framebuffer::RenderTarget;

/// Buffer usages a frame keeps pools for, with their block size multiplier.
/// Storage buffers tend to be larger than the rest.
const SUPPORTED_USAGES: [(vk::BufferUsageFlags, u64); 4] = [
    (vk::BufferUsageFlags::UNIFORM_BUFFER, 1),
    (vk::BufferUsageFlags::STORAGE_BUFFER, 2),
    (vk::BufferUsageFlags::VERTEX_BUFFER, 1),
    (vk::BufferUsageFlags::INDEX_BUFFER, 1),
];

/// A buffer pool and the block allocations currently come from.
struct FrameBufferPool {
    pool: BufferPool,
    active_block: Option<usize>,
}

/// Bindings that must be written before the set is bound, i.e. every bound
/// binding that is not update-after-bind.
fn collect_bindings_to_update(
    layout: &DescriptorSetLayout,
    buffer_infos: &BindingMap<BufferBinding>,
    image_infos: &BindingMap<ImageBinding>,
) -> Vec<u32> {
    let mut bindings_to_update = Vec::with_capacity(buffer_infos.len() + image_infos.len());

    for &binding_index in buffer_infos.keys().chain(image_infos.keys()) {
        if !layout.layout_binding_flag(binding_index).contains(vk::DescriptorBindingFlags::UPDATE_AFTER_BIND)
            && !bindings_to_update.contains(&binding_index)
        {
            bindings_to_update.push(binding_index);
        }
    }

    bindings_to_update
}

/// Everything one worker thread uses during a frame. Threads never share
/// these, so none of it is locked.
pub struct FrameThreadResources {
    thread_index: usize,
    buffer_pools: HashMap<vk::BufferUsageFlags, FrameBufferPool>,
    descriptor_pools: HashMap<u64, Arc<Mutex<DescriptorPool>>>,
    descriptor_sets: HashMap<u64, DescriptorSet>,
    config: FrameConfig,
    device: Arc<dyn RenderDevice>,
}

impl FrameThreadResources {
    fn new(device: Arc<dyn RenderDevice>, thread_index: usize, config: FrameConfig) -> Self {
        let buffer_pools = SUPPORTED_USAGES
            .iter()
            .map(|&(usage, multiplier)| {
                let block_size = config.buffer_pool_block_size * 1024 * multiplier;
                let pool = FrameBufferPool {
                    pool: BufferPool::new(device.clone(), block_size, usage),
                    active_block: None,
                };
                (usage, pool)
            })
            .collect();

        Self {
            thread_index,
            buffer_pools,
            descriptor_pools: HashMap::new(),
            descriptor_sets: HashMap::new(),
            config,
            device,
        }
    }

    pub fn thread_index(&self) -> usize {
        self.thread_index
    }

    /// Sub-allocates from the current block for `usage`, moving to another
    /// block only when the current one is full or the strategy asks for one
    /// block per allocation.
    pub fn allocate_buffer(&mut self, usage: vk::BufferUsageFlags, size: u64) -> Result<BufferAllocation> {
        if size == 0 {
            log::error!("Requested a zero sized allocation for buffer usage {:?}", usage);
            return Err(eyre!("Cannot allocate zero bytes for buffer usage {:?}", usage));
        }

        let Some(frame_pool) = self.buffer_pools.get_mut(&usage) else {
            log::error!("No buffer pool for buffer usage {:?}", usage);
            return Err(eyre!("No buffer pool for buffer usage {:?}", usage));
        };

        let want_minimal_block =
            self.config.buffer_allocation_strategy == BufferAllocationStrategy::OneAllocationPerBuffer;

        let current = frame_pool.active_block.filter(|&index| {
            frame_pool.pool.block(index).is_some_and(|block| block.can_allocate(size))
        });
        let block_index = match current {
            Some(index) if !want_minimal_block => index,
            _ => frame_pool.pool.request_buffer_block(size, want_minimal_block)?,
        };
        frame_pool.active_block = Some(block_index);

        frame_pool.pool
            .block_mut(block_index)
            .and_then(|block| block.allocate(size))
            .ok_or_else(|| eyre!("Failed to allocate {} bytes for buffer usage {:?}", size, usage))
    }

    /// Returns a descriptor set written with the given bindings. Under
    /// `StoreInCache` the set is kept and only changed bindings are written,
    /// skipping update-after-bind bindings when `update_after_bind` is set.
    /// Under `CreateDirectly` a fresh set is allocated and fully written.
    pub fn request_descriptor_set(
        &mut self,
        layout: &Arc<DescriptorSetLayout>,
        buffer_infos: &BindingMap<BufferBinding>,
        image_infos: &BindingMap<ImageBinding>,
        update_after_bind: bool,
    ) -> Result<vk::DescriptorSet> {
        let device = self.device.clone();

        let pool = self.descriptor_pools
            .entry(hashing::descriptor_pool_key(layout))
            .or_insert_with(|| {
                Arc::new(Mutex::new(DescriptorPool::new(device.clone(), layout.clone(), MAX_SETS_PER_POOL)))
            })
            .clone();

        match self.config.descriptor_management_strategy {
            DescriptorManagementStrategy::StoreInCache => {
                let bindings_to_update = if update_after_bind {
                    collect_bindings_to_update(layout, buffer_infos, image_infos)
                } else {
                    Vec::new()
                };

                let key = hashing::descriptor_set_key(layout, buffer_infos, image_infos);
                let descriptor_set = match self.descriptor_sets.entry(key) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => entry.insert(DescriptorSet::new(
                        device,
                        layout.clone(),
                        pool,
                        buffer_infos.clone(),
                        image_infos.clone(),
                    )?),
                };

                descriptor_set.update(&bindings_to_update);
                Ok(descriptor_set.handle())
            }
            DescriptorManagementStrategy::CreateDirectly => {
                let descriptor_set = DescriptorSet::new(
                    device,
                    layout.clone(),
                    pool,
                    buffer_infos.clone(),
                    image_infos.clone(),
                )?;
                descriptor_set.apply_writes();
                Ok(descriptor_set.handle())
            }
        }
    }

    /// Pushes pending writes of every cached set. Returns the number of
    /// writes issued.
    pub fn update_descriptor_sets(&mut self) -> usize {
        self.descriptor_sets
            .values_mut()
            .map(|descriptor_set| descriptor_set.update(&[]))
            .sum()
    }

    pub fn clear_descriptors(&mut self) -> Result<()> {
        self.descriptor_sets.clear();
        for pool in self.descriptor_pools.values() {
            pool.lock().map_err(|e| eyre!(e.to_string()))?.reset()?;
        }
        Ok(())
    }

    pub fn descriptor_set_count(&self) -> usize {
        self.descriptor_sets.len()
    }

    pub fn descriptor_pool_count(&self) -> usize {
        self.descriptor_pools.len()
    }

    fn reset_buffer_pools(&mut self) {
        for frame_pool in self.buffer_pools.values_mut() {
            frame_pool.pool.reset();
            frame_pool.active_block = None;
        }
    }
}

/// Responsibilities:
/// - Own the per-thread buffer, descriptor and command pools of one frame slot
/// - Hand out fences and semaphores for the frame's submissions
/// - Rewind all of it when the frame slot comes around again
///
/// Per-thread state is reached either through the `thread_index` methods or
/// by splitting [`Self::threads_mut`] across worker threads.
pub struct RenderFrame {
    fence_pool: FencePool,
    semaphore_pool: SemaphorePool,
    render_target: RenderTarget,
    command_pools: HashMap<u32, Vec<CommandPool>>,
    threads: Vec<FrameThreadResources>,
    config: FrameConfig,
    device: Arc<dyn RenderDevice>,
}

impl RenderFrame {
    pub fn new(device: Arc<dyn RenderDevice>, render_target: RenderTarget, config: FrameConfig) -> Result<Self> {
        if config.thread_count == 0 {
            return Err(eyre!("A render frame needs at least one thread"));
        }

        let threads = (0..config.thread_count)
            .map(|thread_index| FrameThreadResources::new(device.clone(), thread_index, config))
            .collect();

        Ok(Self {
            fence_pool: FencePool::new(device.clone()),
            semaphore_pool: SemaphorePool::new(device.clone()),
            render_target,
            command_pools: HashMap::new(),
            threads,
            config,
            device,
        })
    }

    pub fn device(&self) -> &Arc<dyn RenderDevice> {
        &self.device
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn thread_mut(&mut self, thread_index: usize) -> Result<&mut FrameThreadResources> {
        let thread_count = self.threads.len();
        self.threads
            .get_mut(thread_index)
            .ok_or_else(|| eyre!("Thread index {} is out of bounds for {} threads", thread_index, thread_count))
    }

    pub fn threads_mut(&mut self) -> &mut [FrameThreadResources] {
        &mut self.threads
    }

    pub fn render_target(&self) -> &RenderTarget {
        &self.render_target
    }

    pub fn update_render_target(&mut self, render_target: RenderTarget) {
        self.render_target = render_target;
    }

    pub fn set_buffer_allocation_strategy(&mut self, strategy: BufferAllocationStrategy) {
        self.config.buffer_allocation_strategy = strategy;
        for thread in &mut self.threads {
            thread.config.buffer_allocation_strategy = strategy;
        }
    }

    pub fn set_descriptor_management_strategy(&mut self, strategy: DescriptorManagementStrategy) {
        self.config.descriptor_management_strategy = strategy;
        for thread in &mut self.threads {
            thread.config.descriptor_management_strategy = strategy;
        }
    }

    /// Waits for the frame's fences, then rewinds every pool. Descriptors
    /// survive unless they are created directly.
    pub fn reset(&mut self) -> Result<()> {
        self.fence_pool.wait(u64::MAX)?;
        self.fence_pool.reset()?;

        for command_pools in self.command_pools.values_mut() {
            for command_pool in command_pools {
                command_pool.reset_pool()?;
            }
        }

        for thread in &mut self.threads {
            thread.reset_buffer_pools();
        }

        self.semaphore_pool.reset();

        if self.config.descriptor_management_strategy == DescriptorManagementStrategy::CreateDirectly {
            self.clear_descriptors()?;
        }

        Ok(())
    }

    /// Command pools of `queue`'s family, one per thread. Asking for another
    /// reset mode waits for the device to go idle and recreates them.
    pub fn command_pools(
        &mut self,
        queue: &Queue,
        reset_mode: CommandBufferResetMode,
    ) -> Result<&mut Vec<CommandPool>> {
        let family_index = queue.family_index();

        let mode_changed = self.command_pools
            .get(&family_index)
            .is_some_and(|pools| pools.first().map(CommandPool::reset_mode) != Some(reset_mode));
        if mode_changed {
            self.device.wait_idle()?;
            self.command_pools.remove(&family_index);
        }

        if !self.command_pools.contains_key(&family_index) {
            let pools = (0..self.threads.len())
                .map(|thread_index| CommandPool::new(self.device.clone(), family_index, thread_index, reset_mode))
                .collect::<Result<Vec<_>>>()?;
            self.command_pools.insert(family_index, pools);
        }

        self.command_pools
            .get_mut(&family_index)
            .ok_or_eyre("Command pools missing after creation")
    }

    pub fn request_command_buffer(
        &mut self,
        queue: &Queue,
        reset_mode: CommandBufferResetMode,
        level: vk::CommandBufferLevel,
        thread_index: usize,
    ) -> Result<vk::CommandBuffer> {
        if thread_index >= self.threads.len() {
            return Err(eyre!("Thread index {} is out of bounds", thread_index));
        }

        self.command_pools(queue, reset_mode)?
            .iter_mut()
            .find(|command_pool| command_pool.thread_index() == thread_index)
            .ok_or_eyre("No command pool for thread")?
            .request_command_buffer(level)
    }

    pub fn request_descriptor_set(
        &mut self,
        layout: &Arc<DescriptorSetLayout>,
        buffer_infos: &BindingMap<BufferBinding>,
        image_infos: &BindingMap<ImageBinding>,
        update_after_bind: bool,
        thread_index: usize,
    ) -> Result<vk::DescriptorSet> {
        self.thread_mut(thread_index)?
            .request_descriptor_set(layout, buffer_infos, image_infos, update_after_bind)
    }

    pub fn update_descriptor_sets(&mut self, thread_index: usize) -> Result<usize> {
        Ok(self.thread_mut(thread_index)?.update_descriptor_sets())
    }

    pub fn clear_descriptors(&mut self) -> Result<()> {
        for thread in &mut self.threads {
            thread.clear_descriptors()?;
        }
        Ok(())
    }

    pub fn allocate_buffer(
        &mut self,
        usage: vk::BufferUsageFlags,
        size: u64,
        thread_index: usize,
    ) -> Result<BufferAllocation> {
        self.thread_mut(thread_index)?.allocate_buffer(usage, size)
    }

    pub fn fence_pool(&self) -> &FencePool {
        &self.fence_pool
    }

    pub fn request_fence(&mut self) -> Result<vk::Fence> {
        self.fence_pool.request_fence()
    }

    pub fn semaphore_pool(&self) -> &SemaphorePool {
        &self.semaphore_pool
    }

    pub fn request_semaphore(&mut self) -> Result<vk::Semaphore> {
        self.semaphore_pool.request_semaphore()
    }

    pub fn request_semaphore_with_ownership(&mut self) -> Result<vk::Semaphore> {
        self.semaphore_pool.request_semaphore_with_ownership()
    }

    pub fn release_owned_semaphore(&mut self, semaphore: vk::Semaphore) {
        self.semaphore_pool.release_owned_semaphore(semaphore);
    }
}
