//! Infrastructure adapters for trigger storage.

pub mod store;

pub use store::{InterceptingStore, RamTriggerStore};
