//! Enhancement requests: storage, lifecycle, retries and status streams.

pub mod handlers;
pub mod notifier;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod store;
