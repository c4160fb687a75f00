pub mod buffer_pool;
pub mod frame;
pub mod sync;

pub use frame::{FrameThreadResources, RenderFrame};
