use std::sync::Arc;
use ash::vk;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use crate::renderer::contexts::device_ctx::RenderDevice;
use crate::renderer::contexts::resource_ctx::descriptor_set::BufferBinding;

/// Offset alignment a block of the given usage must honour.
fn usage_alignment(limits: &vk::PhysicalDeviceLimits, usage: vk::BufferUsageFlags) -> u64 {
    let alignment = if usage == vk::BufferUsageFlags::UNIFORM_BUFFER {
        limits.min_uniform_buffer_offset_alignment
    } else if usage == vk::BufferUsageFlags::STORAGE_BUFFER {
        limits.min_storage_buffer_offset_alignment
    } else if usage == vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER {
        limits.min_texel_buffer_offset_alignment
    } else if usage.intersects(
        vk::BufferUsageFlags::INDEX_BUFFER
            | vk::BufferUsageFlags::VERTEX_BUFFER
            | vk::BufferUsageFlags::INDIRECT_BUFFER,
    ) {
        16
    } else {
        1
    };
    alignment.max(1)
}

fn align_up(offset: u64, alignment: u64) -> u64 {
    (offset + alignment - 1) & !(alignment - 1)
}

/// A sub-range of a block's buffer. Only valid until the owning frame is
/// reset.
#[derive(Clone)]
pub struct BufferAllocation {
    buffer: vk::Buffer,
    offset: u64,
    size: u64,
    device: Arc<dyn RenderDevice>,
}

impl BufferAllocation {
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Writes `data` at `offset` bytes into this allocation.
    pub fn update(&self, data: &[u8], offset: u64) -> Result<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= self.size);
        if end.is_none() {
            return Err(eyre!(
                "Writing {} bytes at offset {} overflows an allocation of {} bytes",
                data.len(),
                offset,
                self.size,
            ));
        }
        self.device.write_buffer(self.buffer, self.offset + offset, data)
    }

    pub fn update_value<T: bytemuck::Pod>(&self, value: &T, offset: u64) -> Result<()> {
        self.update(bytemuck::bytes_of(value), offset)
    }

    pub fn update_slice<T: bytemuck::Pod>(&self, values: &[T], offset: u64) -> Result<()> {
        self.update(bytemuck::cast_slice(values), offset)
    }

    pub fn to_binding(&self) -> BufferBinding {
        BufferBinding::new(self.buffer, self.offset, self.size)
    }
}

/// One host visible buffer handed out linearly.
pub struct BufferBlock {
    buffer: vk::Buffer,
    size: u64,
    alignment: u64,
    offset: u64,
    device: Arc<dyn RenderDevice>,
}

impl BufferBlock {
    pub fn new(device: Arc<dyn RenderDevice>, size: u64, usage: vk::BufferUsageFlags) -> Result<Self> {
        let buffer = device.create_buffer(size, usage)?;
        let alignment = usage_alignment(&device.limits(), usage);

        Ok(Self {
            buffer,
            size,
            alignment,
            offset: 0,
            device,
        })
    }

    pub fn can_allocate(&self, size: u64) -> bool {
        size > 0 && align_up(self.offset, self.alignment) + size <= self.size
    }

    pub fn allocate(&mut self, size: u64) -> Option<BufferAllocation> {
        if !self.can_allocate(size) {
            return None;
        }

        let offset = align_up(self.offset, self.alignment);
        self.offset = offset + size;

        Some(BufferAllocation {
            buffer: self.buffer,
            offset,
            size,
            device: self.device.clone(),
        })
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn used(&self) -> u64 {
        self.offset
    }

    pub fn reset(&mut self) {
        self.offset = 0;
    }
}

impl Drop for BufferBlock {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.buffer);
    }
}

/// Growable list of blocks for one buffer usage. Blocks are never freed,
/// only rewound on reset.
pub struct BufferPool {
    block_size: u64,
    usage: vk::BufferUsageFlags,
    blocks: Vec<BufferBlock>,
    device: Arc<dyn RenderDevice>,
}

impl BufferPool {
    pub fn new(device: Arc<dyn RenderDevice>, block_size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self {
            block_size,
            usage,
            blocks: Vec::new(),
            device,
        }
    }

    /// Index of the first block that fits `minimum_size`, creating one if
    /// none does. A `minimal` request only reuses blocks of exactly that
    /// size and creates them at that size.
    pub fn request_buffer_block(&mut self, minimum_size: u64, minimal: bool) -> Result<usize> {
        if minimum_size == 0 {
            return Err(eyre!("Cannot request a buffer block for zero bytes"));
        }

        let existing = self.blocks.iter().position(|block| {
            (!minimal || block.size() == minimum_size) && block.can_allocate(minimum_size)
        });
        if let Some(index) = existing {
            return Ok(index);
        }

        let size = if minimal {
            minimum_size
        } else {
            self.block_size.max(minimum_size)
        };
        log::debug!("Creating buffer block of {} bytes for usage {:?}", size, self.usage);

        self.blocks.push(BufferBlock::new(self.device.clone(), size, self.usage)?);
        Ok(self.blocks.len() - 1)
    }

    pub fn block(&self, index: usize) -> Option<&BufferBlock> {
        self.blocks.get(index)
    }

    pub fn block_mut(&mut self, index: usize) -> Option<&mut BufferBlock> {
        self.blocks.get_mut(index)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            block.reset();
        }
    }
}
