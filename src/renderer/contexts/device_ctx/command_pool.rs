use std::sync::Arc;
use ash::vk;
use color_eyre::Result;
use crate::renderer::contexts::device_ctx::RenderDevice;

/// How command buffers from a pool are recycled between frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CommandBufferResetMode {
    #[default]
    ResetPool,
    ResetIndividually,
    AlwaysAllocate,
}

/// One native command pool for a (queue family, thread) pair. Command buffers
/// are handed out in order and reused after a reset.
pub struct CommandPool {
    handle: vk::CommandPool,
    queue_family_index: u32,
    thread_index: usize,
    reset_mode: CommandBufferResetMode,

    primary_command_buffers: Vec<vk::CommandBuffer>,
    active_primary_command_buffer_count: usize,
    secondary_command_buffers: Vec<vk::CommandBuffer>,
    active_secondary_command_buffer_count: usize,

    device: Arc<dyn RenderDevice>,
}

impl CommandPool {
    pub fn new(
        device: Arc<dyn RenderDevice>,
        queue_family_index: u32,
        thread_index: usize,
        reset_mode: CommandBufferResetMode,
    ) -> Result<Self> {
        let flags = match reset_mode {
            CommandBufferResetMode::ResetIndividually | CommandBufferResetMode::AlwaysAllocate => {
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
            }
            CommandBufferResetMode::ResetPool => vk::CommandPoolCreateFlags::TRANSIENT,
        };
        let handle = device.create_command_pool(queue_family_index, flags)?;

        Ok(Self {
            handle,
            queue_family_index,
            thread_index,
            reset_mode,
            primary_command_buffers: Vec::new(),
            active_primary_command_buffer_count: 0,
            secondary_command_buffers: Vec::new(),
            active_secondary_command_buffer_count: 0,
            device,
        })
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.handle
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub fn thread_index(&self) -> usize {
        self.thread_index
    }

    pub fn reset_mode(&self) -> CommandBufferResetMode {
        self.reset_mode
    }

    pub fn request_command_buffer(&mut self, level: vk::CommandBufferLevel) -> Result<vk::CommandBuffer> {
        let (command_buffers, active_count) = if level == vk::CommandBufferLevel::PRIMARY {
            (&mut self.primary_command_buffers, &mut self.active_primary_command_buffer_count)
        } else {
            (&mut self.secondary_command_buffers, &mut self.active_secondary_command_buffer_count)
        };

        if let Some(&command_buffer) = command_buffers.get(*active_count) {
            *active_count += 1;
            return Ok(command_buffer);
        }

        let command_buffer = self.device.allocate_command_buffer(self.handle, level)?;
        command_buffers.push(command_buffer);
        *active_count += 1;

        Ok(command_buffer)
    }

    pub fn reset_pool(&mut self) -> Result<()> {
        match self.reset_mode {
            CommandBufferResetMode::ResetIndividually => {
                for &command_buffer in self.primary_command_buffers
                    .iter()
                    .chain(self.secondary_command_buffers.iter())
                {
                    self.device.reset_command_buffer(command_buffer)?;
                }
            }
            CommandBufferResetMode::ResetPool => {
                self.device.reset_command_pool(self.handle)?;
            }
            CommandBufferResetMode::AlwaysAllocate => {
                self.free_command_buffers();
            }
        }

        self.active_primary_command_buffer_count = 0;
        self.active_secondary_command_buffer_count = 0;

        Ok(())
    }

    fn free_command_buffers(&mut self) {
        if !self.primary_command_buffers.is_empty() {
            self.device.free_command_buffers(self.handle, &self.primary_command_buffers);
            self.primary_command_buffers.clear();
        }
        if !self.secondary_command_buffers.is_empty() {
            self.device.free_command_buffers(self.handle, &self.secondary_command_buffers);
            self.secondary_command_buffers.clear();
        }
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.free_command_buffers();
        self.device.destroy_command_pool(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::testing::MockDevice;

    #[test]
    fn command_buffers_are_reused_after_reset() {
        let device = MockDevice::new();
        let mut pool = CommandPool::new(device.clone(), 0, 0, CommandBufferResetMode::ResetPool).unwrap();

        let first = pool.request_command_buffer(vk::CommandBufferLevel::PRIMARY).unwrap();
        let second = pool.request_command_buffer(vk::CommandBufferLevel::PRIMARY).unwrap();
        let secondary = pool.request_command_buffer(vk::CommandBufferLevel::SECONDARY).unwrap();
        assert_ne!(first, second);
        assert_ne!(first, secondary);
        assert_eq!(device.command_buffers_allocated(), 3);

        pool.reset_pool().unwrap();
        assert_eq!(device.command_pool_resets(), 1);
        assert_eq!(pool.request_command_buffer(vk::CommandBufferLevel::PRIMARY).unwrap(), first);
        assert_eq!(device.command_buffers_allocated(), 3);
    }

    #[test]
    fn always_allocate_frees_on_reset() {
        let device = MockDevice::new();
        let mut pool = CommandPool::new(device.clone(), 0, 0, CommandBufferResetMode::AlwaysAllocate).unwrap();

        pool.request_command_buffer(vk::CommandBufferLevel::PRIMARY).unwrap();
        pool.reset_pool().unwrap();
        pool.request_command_buffer(vk::CommandBufferLevel::PRIMARY).unwrap();

        assert_eq!(device.command_buffers_allocated(), 2);
        assert_eq!(device.command_pool_resets(), 0);
    }
}
