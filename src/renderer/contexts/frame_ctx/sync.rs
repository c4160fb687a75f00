use std::sync::Arc;
use ash::vk;
use color_eyre::Result;
use crate::renderer::contexts::device_ctx::RenderDevice;

/// Fences handed out during a frame, recycled once the frame is reset.
pub struct FencePool {
    fences: Vec<vk::Fence>,
    active_fence_count: usize,
    device: Arc<dyn RenderDevice>,
}

impl FencePool {
    pub fn new(device: Arc<dyn RenderDevice>) -> Self {
        Self {
            fences: Vec::new(),
            active_fence_count: 0,
            device,
        }
    }

    pub fn request_fence(&mut self) -> Result<vk::Fence> {
        if let Some(&fence) = self.fences.get(self.active_fence_count) {
            self.active_fence_count += 1;
            return Ok(fence);
        }

        let fence = self.device.create_fence()?;
        self.fences.push(fence);
        self.active_fence_count += 1;

        Ok(fence)
    }

    /// Blocks until every fence requested since the last reset is signaled.
    pub fn wait(&self, timeout: u64) -> Result<()> {
        if self.active_fence_count == 0 {
            return Ok(());
        }
        self.device.wait_for_fences(&self.fences[..self.active_fence_count], timeout)
    }

    pub fn reset(&mut self) -> Result<()> {
        if self.active_fence_count == 0 {
            return Ok(());
        }
        self.device.reset_fences(&self.fences[..self.active_fence_count])?;
        self.active_fence_count = 0;
        Ok(())
    }

    pub fn active_fence_count(&self) -> usize {
        self.active_fence_count
    }
}

impl Drop for FencePool {
    fn drop(&mut self) {
        if let Err(err) = self.wait(u64::MAX) {
            log::error!("Failed to wait for frame fences: {}", err);
        }
        for fence in self.fences.drain(..) {
            self.device.destroy_fence(fence);
        }
    }
}

/// Semaphores handed out during a frame. Pooled semaphores are recycled on
/// reset. Owned ones belong to the caller until released back, and only
/// return to the pool at the next reset.
pub struct SemaphorePool {
    semaphores: Vec<vk::Semaphore>,
    released_semaphores: Vec<vk::Semaphore>,
    active_semaphore_count: usize,
    device: Arc<dyn RenderDevice>,
}

impl SemaphorePool {
    pub fn new(device: Arc<dyn RenderDevice>) -> Self {
        Self {
            semaphores: Vec::new(),
            released_semaphores: Vec::new(),
            active_semaphore_count: 0,
            device,
        }
    }

    pub fn request_semaphore(&mut self) -> Result<vk::Semaphore> {
        if let Some(&semaphore) = self.semaphores.get(self.active_semaphore_count) {
            self.active_semaphore_count += 1;
            return Ok(semaphore);
        }

        let semaphore = self.device.create_semaphore()?;
        self.semaphores.push(semaphore);
        self.active_semaphore_count += 1;

        Ok(semaphore)
    }

    /// A semaphore the pool stops tracking. Hand it back with
    /// [`Self::release_owned_semaphore`] or destroy it yourself.
    pub fn request_semaphore_with_ownership(&mut self) -> Result<vk::Semaphore> {
        if self.active_semaphore_count < self.semaphores.len() {
            if let Some(semaphore) = self.semaphores.pop() {
                return Ok(semaphore);
            }
        }

        self.device.create_semaphore()
    }

    pub fn release_owned_semaphore(&mut self, semaphore: vk::Semaphore) {
        self.released_semaphores.push(semaphore);
    }

    pub fn reset(&mut self) {
        self.active_semaphore_count = 0;
        self.semaphores.append(&mut self.released_semaphores);
    }

    pub fn active_semaphore_count(&self) -> usize {
        self.active_semaphore_count
    }

    pub fn semaphore_count(&self) -> usize {
        self.semaphores.len()
    }
}

impl Drop for SemaphorePool {
    fn drop(&mut self) {
        self.reset();
        for semaphore in self.semaphores.drain(..) {
            self.device.destroy_semaphore(semaphore);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::testing::MockDevice;

    #[test]
    fn fences_are_reused_after_reset() {
        let device = MockDevice::new();
        let mut pool = FencePool::new(device.clone());

        let first = pool.request_fence().unwrap();
        pool.request_fence().unwrap();
        pool.wait(u64::MAX).unwrap();
        pool.reset().unwrap();

        assert_eq!(pool.request_fence().unwrap(), first);
        assert_eq!(device.fences_created(), 2);
        assert_eq!(device.fence_waits(), 1);
        assert_eq!(device.fence_resets(), 1);
    }

    #[test]
    fn idle_fence_pool_skips_native_calls() {
        let device = MockDevice::new();
        let mut pool = FencePool::new(device.clone());

        pool.wait(0).unwrap();
        pool.reset().unwrap();
        assert_eq!(device.fence_waits(), 0);
        assert_eq!(device.fence_resets(), 0);
    }

    #[test]
    fn owned_semaphores_return_on_reset() {
        let device = MockDevice::new();
        let mut pool = SemaphorePool::new(device.clone());

        let pooled = pool.request_semaphore().unwrap();
        let owned = pool.request_semaphore_with_ownership().unwrap();
        assert_ne!(pooled, owned);
        assert_eq!(pool.semaphore_count(), 1);

        pool.release_owned_semaphore(owned);
        assert_eq!(pool.semaphore_count(), 1);

        pool.reset();
        assert_eq!(pool.semaphore_count(), 2);
        assert_eq!(pool.request_semaphore().unwrap(), pooled);
        assert_eq!(pool.request_semaphore().unwrap(), owned);
        assert_eq!(device.semaphores_created(), 2);
    }

    #[test]
    fn ownership_takes_an_idle_pooled_semaphore() {
        let device = MockDevice::new();
        let mut pool = SemaphorePool::new(device.clone());

        let first = pool.request_semaphore().unwrap();
        pool.reset();

        assert_eq!(pool.request_semaphore_with_ownership().unwrap(), first);
        assert_eq!(pool.semaphore_count(), 0);
        assert_eq!(device.semaphores_created(), 1);
    }
}
