//! Storage backends for template and component sources.

mod fs;
mod memory;
mod object;

pub use fs::FsStorage;
pub use memory::MemoryStorage;
pub use object::HttpObjectStorage;
