/// "Resources" refers to the immutable GPU objects handed out by the resource cache.
/// They are shared between rendering threads and destroyed when the last reference drops.

pub mod framebuffer;
pub mod pipeline;
pub mod render_pass;
pub mod shader;

use std::sync::atomic::{AtomicU64, Ordering};

static RESOURCE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Permanent identity of a cached object, independent of its address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    pub(crate) fn next() -> Self {
        Self(RESOURCE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}
