//! Memory-management engines: page descriptors, the SLAB allocator and the
//! buddy allocator's zones

pub mod page;
pub mod slab;
pub mod zone;

pub use page::{BuddyTest, CompoundStrategy, FlagLayout, MemoryModel, Page, PageModel, PageModelOptions, PageSummary};
pub use zone::{Zone, ZoneEnv, ZoneLayout, ZoneStats};
