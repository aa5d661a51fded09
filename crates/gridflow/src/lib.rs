#![deny(clippy::await_holding_refcell_ref)]

pub mod backend;
pub mod common;
pub mod config;
pub mod engine;
pub mod poller;
pub mod run;
pub mod task;
pub mod workflow;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::GridError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = hashbrown::HashMap<K, V>;
pub type Set<T> = hashbrown::HashSet<T>;

pub use common::WrappedRcRefCell;
pub use common::setup::setup_logging;
pub use engine::{Engine, EngineConfig};
pub use run::{Execution, JobInfo, ReturnCode, RunState, Signal};
pub use task::{Application, JobSpec, Task, TaskId};
