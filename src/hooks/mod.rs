//! Register-write hooks: who owns them and what they do when they fire.

pub mod dispatch;
pub mod registry;

pub use dispatch::{Dispatcher, StatusEvent, StatusPolicy};
pub use registry::HookRegistry;
