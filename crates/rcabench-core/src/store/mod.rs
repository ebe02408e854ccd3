//! KV store: key formats, stream ids, and the in-memory engine.

pub mod keys;
pub mod memory;
pub mod stream_id;

pub use memory::InMemoryStore;
pub use stream_id::StreamId;
