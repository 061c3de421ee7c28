pub mod channel;
pub mod lock;
pub mod memory;
pub mod sqlite;

pub use channel::Channel;
pub use memory::MemoryChannel;
pub use sqlite::SqliteChannel;
