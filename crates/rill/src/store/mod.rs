mod id;
mod memory;
mod traits;

pub use id::{ParseStreamIdError, StreamId};
pub use memory::MemoryStreamStore;
pub use traits::{Fields, GroupInfo, StreamStore};
