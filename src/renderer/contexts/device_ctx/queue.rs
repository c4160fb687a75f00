use std::hash::{Hash, Hasher};
use ash::vk;

/// A device queue the frame's command pools are created for.
#[derive(Clone, Debug)]
pub struct Queue {
    family: QueueFamily,
    index: u32,
    handle: vk::Queue,
}

impl Queue {
    pub fn new(family: QueueFamily, index: u32, handle: vk::Queue) -> Self {
        Self {
            family,
            index,
            handle,
        }
    }

    pub fn family(&self) -> &QueueFamily {
        &self.family
    }

    pub fn family_index(&self) -> u32 {
        self.family.index
    }

    /// Index of this queue within its family.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn handle(&self) -> vk::Queue {
        self.handle
    }
}

#[derive(Clone, Debug)]
pub struct QueueFamily {
    pub index: u32,
    pub properties: vk::QueueFamilyProperties,
    supports_present: bool,
}

impl QueueFamily {
    pub fn new(
        index: u32,
        properties: vk::QueueFamilyProperties,
        supports_present: bool,
    ) -> Self {
        Self {
            index,
            properties,
            supports_present,
        }
    }

    pub fn supports_present(&self) -> bool {
        self.supports_present
    }

    pub fn supports_graphics(&self) -> bool {
        self.properties.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    }

    pub fn supports_compute(&self) -> bool {
        self.properties.queue_flags.contains(vk::QueueFlags::COMPUTE)
    }

    pub fn supports_transfer(&self) -> bool {
        self.properties.queue_flags.contains(vk::QueueFlags::TRANSFER)
    }
}

// Families are identified by index alone
impl PartialEq for QueueFamily {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for QueueFamily {}

impl Hash for QueueFamily {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}
