use std::collections::HashMap;
use std::sync::Arc;
use ash::vk;
use color_eyre::Result;
use gpu_descriptor::DescriptorTotalCount;
use crate::renderer::contexts::device_ctx::RenderDevice;
use crate::renderer::contexts::resource_ctx::descriptor_set_layout::DescriptorSetLayout;
use crate::renderer::resources::ResourceId;

/// Per-type descriptor counts of one set of `layout`.
pub(crate) fn descriptor_counts(layout: &DescriptorSetLayout) -> DescriptorTotalCount {
    let mut counts = DescriptorTotalCount::default();

    for binding in layout.bindings() {
        let count = binding.descriptor_count;
        match binding.descriptor_type {
            vk::DescriptorType::SAMPLER => counts.sampler += count,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER => counts.combined_image_sampler += count,
            vk::DescriptorType::SAMPLED_IMAGE => counts.sampled_image += count,
            vk::DescriptorType::STORAGE_IMAGE => counts.storage_image += count,
            vk::DescriptorType::UNIFORM_TEXEL_BUFFER => counts.uniform_texel_buffer += count,
            vk::DescriptorType::STORAGE_TEXEL_BUFFER => counts.storage_texel_buffer += count,
            vk::DescriptorType::UNIFORM_BUFFER => counts.uniform_buffer += count,
            vk::DescriptorType::STORAGE_BUFFER => counts.storage_buffer += count,
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC => counts.uniform_buffer_dynamic += count,
            vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => counts.storage_buffer_dynamic += count,
            vk::DescriptorType::INPUT_ATTACHMENT => counts.input_attachment += count,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR => counts.acceleration_structure += count,
            other => log::warn!("Descriptor type {:?} is not pooled", other),
        }
    }

    counts
}

fn scale_counts(counts: &DescriptorTotalCount, factor: u32) -> DescriptorTotalCount {
    DescriptorTotalCount {
        sampler: counts.sampler.saturating_mul(factor),
        combined_image_sampler: counts.combined_image_sampler.saturating_mul(factor),
        sampled_image: counts.sampled_image.saturating_mul(factor),
        storage_image: counts.storage_image.saturating_mul(factor),
        uniform_texel_buffer: counts.uniform_texel_buffer.saturating_mul(factor),
        storage_texel_buffer: counts.storage_texel_buffer.saturating_mul(factor),
        uniform_buffer: counts.uniform_buffer.saturating_mul(factor),
        storage_buffer: counts.storage_buffer.saturating_mul(factor),
        uniform_buffer_dynamic: counts.uniform_buffer_dynamic.saturating_mul(factor),
        storage_buffer_dynamic: counts.storage_buffer_dynamic.saturating_mul(factor),
        input_attachment: counts.input_attachment.saturating_mul(factor),
        acceleration_structure: counts.acceleration_structure.saturating_mul(factor),
        inline_uniform_block_bytes: counts.inline_uniform_block_bytes.saturating_mul(factor),
        inline_uniform_block_bindings: counts.inline_uniform_block_bindings.saturating_mul(factor),
    }
}

/// Growable list of fixed capacity native pools serving one layout.
pub struct DescriptorPool {
    id: ResourceId,
    layout: Arc<DescriptorSetLayout>,

    pool_sizes: DescriptorTotalCount,
    pool_max_sets: u32,
    pool_flags: vk::DescriptorPoolCreateFlags,

    pools: Vec<vk::DescriptorPool>,
    pool_sets_count: Vec<u32>,
    // Owning pool of every set handed out
    set_pool_mapping: HashMap<vk::DescriptorSet, usize>,
    pool_index: usize,

    device: Arc<dyn RenderDevice>,
}

impl DescriptorPool {
    pub fn new(
        device: Arc<dyn RenderDevice>,
        layout: Arc<DescriptorSetLayout>,
        pool_size: u32,
    ) -> Self {
        let pool_max_sets = pool_size.max(1);
        let pool_sizes = scale_counts(&descriptor_counts(&layout), pool_max_sets);

        let mut pool_flags = vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET;
        if layout.has_update_after_bind() {
            pool_flags |= vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND;
        }

        Self {
            id: ResourceId::next(),
            layout,
            pool_sizes,
            pool_max_sets,
            pool_flags,
            pools: Vec::new(),
            pool_sets_count: Vec::new(),
            set_pool_mapping: HashMap::new(),
            pool_index: 0,
            device,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn max_sets_per_pool(&self) -> u32 {
        self.pool_max_sets
    }

    pub fn allocated_set_count(&self) -> usize {
        self.set_pool_mapping.len()
    }

    /// Returns `None` when no set could be allocated.
    pub fn allocate_descriptor_set(&mut self) -> Option<vk::DescriptorSet> {
        let pool_index = match self.find_available_pool(self.pool_index) {
            Ok(pool_index) => pool_index,
            Err(err) => {
                log::error!("Failed to create descriptor pool: {}", err);
                return None;
            }
        };
        self.pool_index = pool_index;

        // Reserve the slot before the native allocation
        self.pool_sets_count[pool_index] += 1;

        match self.device.allocate_descriptor_set(self.pools[pool_index], self.layout.handle()) {
            Ok(descriptor_set) => {
                self.set_pool_mapping.insert(descriptor_set, pool_index);
                Some(descriptor_set)
            }
            Err(err) => {
                log::error!("Failed to allocate descriptor set: {:?}", err);
                self.pool_sets_count[pool_index] -= 1;
                None
            }
        }
    }

    /// Returns `false` when the set was not allocated from this pool.
    pub fn free_descriptor_set(&mut self, descriptor_set: vk::DescriptorSet) -> Result<bool> {
        let Some(pool_index) = self.set_pool_mapping.get(&descriptor_set).copied() else {
            return Ok(false);
        };

        self.device.free_descriptor_set(self.pools[pool_index], descriptor_set)?;

        self.set_pool_mapping.remove(&descriptor_set);
        self.pool_sets_count[pool_index] -= 1;
        self.pool_index = self.pool_index.min(pool_index);

        Ok(true)
    }

    /// Rewinds every native pool without destroying it.
    pub fn reset(&mut self) -> Result<()> {
        for &pool in &self.pools {
            self.device.reset_descriptor_pool(pool)?;
        }

        self.pool_sets_count.fill(0);
        self.set_pool_mapping.clear();
        self.pool_index = 0;

        Ok(())
    }

    fn find_available_pool(&mut self, search_index: usize) -> Result<usize> {
        let mut pool_index = search_index;

        loop {
            if pool_index >= self.pools.len() {
                let pool = self.device
                    .create_descriptor_pool(&self.pool_sizes, self.pool_max_sets, self.pool_flags)
                    .map_err(|err| color_eyre::eyre::eyre!("{:?}", err))?;
                log::debug!(
                    "Created descriptor pool {} for layout of set {}",
                    self.pools.len(),
                    self.layout.set_index(),
                );
                self.pools.push(pool);
                self.pool_sets_count.push(0);
                return Ok(self.pools.len() - 1);
            }

            if self.pool_sets_count[pool_index] < self.pool_max_sets {
                return Ok(pool_index);
            }

            pool_index += 1;
        }
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        for pool in self.pools.drain(..) {
            self.device.destroy_descriptor_pool(pool);
        }
    }
}
