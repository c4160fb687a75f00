use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use ash::vk;
use color_eyre::eyre::{eyre, OptionExt};
use color_eyre::Result;
use crate::renderer::contexts::device_ctx::RenderDevice;
use crate::renderer::contexts::resource_ctx::descriptor_pool::DescriptorPool;
use crate::renderer::contexts::resource_ctx::descriptor_set_layout::DescriptorSetLayout;
use crate::renderer::contexts::resource_ctx::hashing;
use crate::renderer::resources::ResourceId;

/// binding index -> array element -> descriptor info
pub type BindingMap<T> = BTreeMap<u32, BTreeMap<u32, T>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferBinding {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub range: u64,
}

impl BufferBinding {
    pub fn new(buffer: vk::Buffer, offset: u64, range: u64) -> Self {
        Self {
            buffer,
            offset,
            range,
        }
    }

    pub fn to_vk(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset: self.offset,
            range: self.range,
        }
    }
}

impl From<vk::DescriptorBufferInfo> for BufferBinding {
    fn from(info: vk::DescriptorBufferInfo) -> Self {
        Self::new(info.buffer, info.offset, info.range)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageBinding {
    pub sampler: vk::Sampler,
    pub image_view: vk::ImageView,
    pub image_layout: vk::ImageLayout,
}

impl ImageBinding {
    pub fn new(sampler: vk::Sampler, image_view: vk::ImageView, image_layout: vk::ImageLayout) -> Self {
        Self {
            sampler,
            image_view,
            image_layout,
        }
    }

    pub fn to_vk(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.image_view,
            image_layout: self.image_layout,
        }
    }
}

impl From<vk::DescriptorImageInfo> for ImageBinding {
    fn from(info: vk::DescriptorImageInfo) -> Self {
        Self::new(info.sampler, info.image_view, info.image_layout)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorInfo {
    Buffer(BufferBinding),
    Image(ImageBinding),
}

/// One descriptor write, self-contained so it can be hashed and batched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorWrite {
    pub dst_set: vk::DescriptorSet,
    pub dst_binding: u32,
    pub dst_array_element: u32,
    pub descriptor_type: vk::DescriptorType,
    pub info: DescriptorInfo,
}

impl DescriptorWrite {
    pub fn content_hash(&self) -> u64 {
        hashing::hash_key(self)
    }
}

/// An allocated descriptor set and the binding contents it was written with.
/// Writes are diffed against what was last pushed to the device.
pub struct DescriptorSet {
    id: ResourceId,
    handle: vk::DescriptorSet,
    layout: Arc<DescriptorSetLayout>,
    // Keeps the native pool owning `handle` alive
    pool: Arc<Mutex<DescriptorPool>>,

    buffer_infos: BindingMap<BufferBinding>,
    image_infos: BindingMap<ImageBinding>,

    write_descriptor_sets: Vec<DescriptorWrite>,
    prepared: bool,
    // (binding, array element) -> hash of the write last applied
    updated_bindings: HashMap<(u32, u32), u64>,

    device: Arc<dyn RenderDevice>,
}

impl DescriptorSet {
    pub fn new(
        device: Arc<dyn RenderDevice>,
        layout: Arc<DescriptorSetLayout>,
        pool: Arc<Mutex<DescriptorPool>>,
        buffer_infos: BindingMap<BufferBinding>,
        image_infos: BindingMap<ImageBinding>,
    ) -> Result<Self> {
        if pool.lock().map_err(|e| eyre!(e.to_string()))?.layout().key() != layout.key() {
            return Err(eyre!("Descriptor pool was created for a different layout"));
        }

        let handle = pool
            .lock()
            .map_err(|e| eyre!(e.to_string()))?
            .allocate_descriptor_set()
            .ok_or_eyre("Failed to allocate descriptor set")?;

        let mut descriptor_set = Self {
            id: ResourceId::next(),
            handle,
            layout,
            pool,
            buffer_infos,
            image_infos,
            write_descriptor_sets: Vec::new(),
            prepared: false,
            updated_bindings: HashMap::new(),
            device,
        };
        descriptor_set.prepare();

        Ok(descriptor_set)
    }

    /// Builds one write per (binding, array element). Runs once per
    /// construction or reset.
    pub fn prepare(&mut self) {
        if self.prepared {
            log::warn!("Trying to prepare a descriptor set that has already been prepared, skipping.");
            return;
        }

        let limits = self.device.limits();

        for (&binding_index, elements) in &self.buffer_infos {
            let Some(binding) = self.layout.layout_binding(binding_index) else {
                log::error!("Shader layout set does not use buffer binding at #{}", binding_index);
                continue;
            };

            let range_limit = match binding.descriptor_type {
                vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC => {
                    Some(limits.max_uniform_buffer_range as u64)
                }
                vk::DescriptorType::STORAGE_BUFFER | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => {
                    Some(limits.max_storage_buffer_range as u64)
                }
                _ => None,
            };

            for (&array_element, buffer_binding) in elements {
                let mut buffer_binding = *buffer_binding;

                if let Some(range_limit) = range_limit {
                    if buffer_binding.range != vk::WHOLE_SIZE && buffer_binding.range > range_limit {
                        log::warn!(
                            "Set {} binding {} cannot be updated: buffer size {} exceeds the limit ({}). Clamping.",
                            self.layout.set_index(),
                            binding_index,
                            buffer_binding.range,
                            range_limit,
                        );
                        buffer_binding.range = range_limit;
                    }
                }

                self.write_descriptor_sets.push(DescriptorWrite {
                    dst_set: self.handle,
                    dst_binding: binding_index,
                    dst_array_element: array_element,
                    descriptor_type: binding.descriptor_type,
                    info: DescriptorInfo::Buffer(buffer_binding),
                });
            }
        }

        for (&binding_index, elements) in &self.image_infos {
            let Some(binding) = self.layout.layout_binding(binding_index) else {
                log::error!("Shader layout set does not use image binding at #{}", binding_index);
                continue;
            };

            for (&array_element, image_binding) in elements {
                self.write_descriptor_sets.push(DescriptorWrite {
                    dst_set: self.handle,
                    dst_binding: binding_index,
                    dst_array_element: array_element,
                    descriptor_type: binding.descriptor_type,
                    info: DescriptorInfo::Image(*image_binding),
                });
            }
        }

        self.prepared = true;
    }

    /// Pushes the prepared writes whose contents differ from what was last
    /// applied, in one batched call. An empty filter considers every binding.
    /// Returns the number of writes issued.
    pub fn update(&mut self, bindings_to_update: &[u32]) -> usize {
        let mut pending = Vec::new();
        let mut pending_hashes = Vec::new();

        for write in &self.write_descriptor_sets {
            if !bindings_to_update.is_empty() && !bindings_to_update.contains(&write.dst_binding) {
                continue;
            }

            let slot = (write.dst_binding, write.dst_array_element);
            let write_hash = write.content_hash();
            if self.updated_bindings.get(&slot) == Some(&write_hash) {
                continue;
            }

            pending.push(*write);
            pending_hashes.push((slot, write_hash));
        }

        if !pending.is_empty() {
            self.device.update_descriptor_sets(&pending);
        }
        self.updated_bindings.extend(pending_hashes);

        pending.len()
    }

    /// Pushes every prepared write without consulting the applied hashes.
    pub fn apply_writes(&self) {
        if !self.write_descriptor_sets.is_empty() {
            self.device.update_descriptor_sets(&self.write_descriptor_sets);
        }
    }

    pub fn reset(
        &mut self,
        new_buffer_infos: BindingMap<BufferBinding>,
        new_image_infos: BindingMap<ImageBinding>,
    ) {
        if !new_buffer_infos.is_empty() || !new_image_infos.is_empty() {
            self.buffer_infos = new_buffer_infos;
            self.image_infos = new_image_infos;
        } else {
            log::warn!("Calling reset on descriptor set with no new buffer infos and no new image infos.");
        }

        self.write_descriptor_sets.clear();
        self.updated_bindings.clear();
        self.prepared = false;

        self.prepare();
    }

    /// Rebinds every image binding that samples `old_views[i]` to
    /// `new_views[i]`. Returns the rewritten writes, already recorded as
    /// applied, for the caller to batch.
    pub fn replace_image_views(
        &mut self,
        old_views: &[vk::ImageView],
        new_views: &[vk::ImageView],
    ) -> Vec<DescriptorWrite> {
        let mut changed = Vec::new();

        for (&binding_index, elements) in self.image_infos.iter_mut() {
            for (&array_element, image_binding) in elements.iter_mut() {
                let Some(position) = old_views
                    .iter()
                    .position(|view| *view == image_binding.image_view)
                else {
                    continue;
                };
                let Some(&new_view) = new_views.get(position) else {
                    continue;
                };

                image_binding.image_view = new_view;
                changed.push((binding_index, array_element, *image_binding));
            }
        }

        let mut writes = Vec::with_capacity(changed.len());
        for (binding_index, array_element, image_binding) in changed {
            let write = self.write_descriptor_sets
                .iter_mut()
                .find(|write| {
                    write.dst_binding == binding_index
                        && write.dst_array_element == array_element
                        && matches!(write.info, DescriptorInfo::Image(_))
                });
            if let Some(write) = write {
                write.info = DescriptorInfo::Image(image_binding);
                self.updated_bindings
                    .insert((binding_index, array_element), write.content_hash());
                writes.push(*write);
            }
        }

        writes
    }

    /// Cache key of the current binding contents.
    pub fn structural_key(&self) -> u64 {
        hashing::descriptor_set_key(&self.layout, &self.buffer_infos, &self.image_infos)
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn handle(&self) -> vk::DescriptorSet {
        self.handle
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    pub fn pool(&self) -> &Arc<Mutex<DescriptorPool>> {
        &self.pool
    }

    pub fn buffer_infos(&self) -> &BindingMap<BufferBinding> {
        &self.buffer_infos
    }

    pub fn image_infos(&self) -> &BindingMap<ImageBinding> {
        &self.image_infos
    }

    pub fn write_descriptor_sets(&self) -> &[DescriptorWrite] {
        &self.write_descriptor_sets
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }
}
