use ash::vk;

/// Number of descriptor sets one native descriptor pool can hand out.
pub const MAX_SETS_PER_POOL: u32 = 16;

/// Size of one buffer pool block, in KiB.
pub const BUFFER_POOL_BLOCK_SIZE: u64 = 256;

/// Contains configuration options for the resource cache
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    pub max_sets_per_pool: u32,
    pub pipeline_cache: vk::PipelineCache,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_sets_per_pool: MAX_SETS_PER_POOL,
            pipeline_cache: vk::PipelineCache::null(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BufferAllocationStrategy {
    /// Every allocation gets a block sized exactly to the request.
    OneAllocationPerBuffer,
    #[default]
    MultipleAllocationsPerBuffer,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DescriptorManagementStrategy {
    #[default]
    StoreInCache,
    /// Descriptor sets are allocated and written every request, never cached.
    CreateDirectly,
}

/// Contains configuration options for a render frame: worker thread count,
/// buffer pool sizing, and the allocation strategies
#[derive(Clone, Copy, Debug)]
pub struct FrameConfig {
    pub thread_count: usize,
    /// In KiB
    pub buffer_pool_block_size: u64,
    pub buffer_allocation_strategy: BufferAllocationStrategy,
    pub descriptor_management_strategy: DescriptorManagementStrategy,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            thread_count: 1,
            buffer_pool_block_size: BUFFER_POOL_BLOCK_SIZE,
            buffer_allocation_strategy: BufferAllocationStrategy::default(),
            descriptor_management_strategy: DescriptorManagementStrategy::default(),
        }
    }
}
