//! CLI commands

mod cache;
mod graph;
mod run;
mod state;

pub use cache::CacheCommand;
pub use graph::GraphCommand;
pub use run::{BuildFailure, RunCommand};
pub use state::StateCommand;
