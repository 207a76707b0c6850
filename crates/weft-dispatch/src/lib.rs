//! Execution routing for node activations.
//!
//! The [`ExecutionRouter`] picks a provider per activation; each provider
//! executor owns its own retry and fallback ladder and always answers with
//! an `ExecutionResult`.

pub mod cluster;
pub mod container;
pub mod remote;
pub mod router;
pub mod workspace;

pub use cluster::{ClusterJobExecutor, ClusterJobRuntime};
pub use container::{BollardRuntime, CliRuntime, ContainerExecutor};
pub use router::{ExecutionRouter, RoutedRequest};
pub use workspace::WorkspaceExecutor;
