pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod marker;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, TransportError, WeftError};
pub use event::EventBus;
pub use graph::{CompiledGraph, CompiledNode, Edge, EdgeMode, Graph, Guardrails, Node, NodeKind, NodeSpec};
pub use types::*;
