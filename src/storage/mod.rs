//! Local stores for rules, entities, matches and assessment runs.

mod encrypted;
mod memory;

pub use encrypted::SecureStore;
pub use memory::MemoryStore;
