//! Storage backends for the Coda core.
//!
//! Two small traits cover everything the core needs from a shared store:
//! [`StreamBackend`] (an append-only log with consumer groups) and
//! [`KvBackend`] (TTL keys plus a sliding-window counter). The in-process
//! [`MemoryBackend`] implements both with full consumer-group semantics and
//! is the default; [`RedisBackend`] maps the same operations onto a shared
//! Redis so multiple processes can cooperate.
//!
//! [`JsonlTable`] provides the append-only row tables used for alert
//! history, the subagent archive, and user preferences.

pub mod backend;
pub mod memory;
pub mod redis;
pub mod table;

pub use backend::{KvBackend, StreamBackend, StreamEntry, WindowSample};
pub use memory::MemoryBackend;
pub use redis::RedisBackend;
pub use table::JsonlTable;
