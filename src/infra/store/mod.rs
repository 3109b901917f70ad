//! Trigger store implementations.

pub mod intercept;
pub mod memory;

pub use intercept::{DelayInterceptor, InterceptingStore, StoreInterceptor, StoreOp};
pub use memory::RamTriggerStore;
