//! Graph Scheduler for Weft.
//!
//! A run walks its graph from `start`: every activation is dispatched through
//! the [`weft_dispatch::ExecutionRouter`], its outgoing edges are resolved,
//! and tokens on solid edges are joined per target before the target
//! activates. Dotted edges only feed the latest known output of their source
//! into the target's input context.

pub mod dispatch;
pub mod joins;
pub mod routing;
pub mod scheduler;
pub mod topology;
pub mod worker;

pub use dispatch::{DispatchTable, EchoCompute};
pub use joins::JoinBuffer;
pub use scheduler::Scheduler;
pub use topology::Topology;
pub use worker::{ChannelQueue, RunJob, Worker};
