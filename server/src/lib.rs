//! Communication layer for an out-of-process code analysis server.
//!
//! The server runs as a child process and speaks a line-delimited JSON
//! protocol over stdio. This crate launches and supervises that process,
//! multiplexes caller requests onto its single input pipe under a bounded,
//! priority-aware concurrency policy, and fans server events out to
//! subscribers.

pub mod error;
pub mod events;
pub mod launch_target;
pub mod sink;
pub mod types;
pub mod wire;

pub(crate) mod launcher;
pub(crate) mod lsp;
pub(crate) mod multiplexer;
pub(crate) mod prioritization;
pub(crate) mod process_tree;
pub(crate) mod queue;
pub(crate) mod stdio;
pub(crate) mod supervisor;

mod engine;

pub use engine::{Engine, EngineDeps, EngineFut, StartRequest, create_engine};
pub use error::{LaunchError, RequestError, StartError, StopError};
pub use events::{EventRegistry, Listener, Subscription};
pub use launch_target::{LaunchTarget, LaunchTargetKind, find_launch_targets};
pub use launcher::{HostInfo, HostResolver, HostResolvers, PathHostResolver, ResolveFut};
pub use lsp::LspEngine;
pub use process_tree::{ProcessTree, SystemProcessTree, TreeFut};
pub use sink::{EngineEvent, EventSink, TracingSink};
pub use stdio::StdioEngine;
pub use types::{EngineKind, HostKind, Platform, ServerOptions, ServerState};
