//! # karst-node-lib
//! Full node composition: the typed hook surface, the scheduled task
//! runner, node configuration, and the [`KarstNode`] wiring them to the
//! pipeline and synchronizer.

pub mod config;
pub mod hooks;
pub mod node;
pub mod scheduler;

pub use config::NodeConfig;
pub use hooks::ServerHooks;
pub use node::KarstNode;
pub use scheduler::{ScheduledTask, SchedulerHandle, TaskScheduler};
