//! Lifecycle coordinator and HTTP surface for the cluster watchdog

pub mod coordinator;
pub mod handlers;
pub mod reporter;
pub mod server;

pub use coordinator::{Coordinator, LifecycleHost, ServiceIdentity};
pub use reporter::SelfReporter;
pub use server::Server;
