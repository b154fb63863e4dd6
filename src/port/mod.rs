//! Local port allocation.

mod allocator;
mod probe;

pub use allocator::{PortAllocator, PortError, PortMetrics};
pub use probe::{OsProbe, PortHold, PortProbe};
