pub mod file;
pub mod memory;

pub use file::FileGateway;
pub use memory::MemoryGateway;
