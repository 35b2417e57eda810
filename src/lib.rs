//! # flowgraph-rs: thread-parallel dataflow runtime
//!
//! A runtime executing a graph of user-provided *filters* connected by
//! typed *ports*. Each filter lives on exactly one worker thread; ports
//! on the same thread communicate synchronously, ports across threads
//! exchange samples through a flow-controlled connection. A per-thread
//! cooperative executor serializes delivery of cross-thread samples into
//! a fair, bounded-latency processing loop.
//!
//! ## Architecture
//!
//! - **Samples** — immutable, shared-ownership records of
//!   `(payload, datatype, timestamp µs)`.
//! - **Ports** — typed endpoints on filters; input ports own a bounded
//!   sliding-window queue with sample-count and time-window eviction.
//! - **Inter-thread connections** — flow-controlled edges applying
//!   back-pressure through a counting semaphore, with an optional
//!   dynamic-queue mode whose sender credit tracks the effective queue
//!   depth.
//! - **Executors** — per-thread cooperative dispatchers draining pending
//!   receives under fairness, back-pressure and reentrancy constraints.
//! - **Orchestration** — an [`ActiveGraph`] drives every filter through
//!   the lifecycle chain on its owning thread.
//!
//! ## Example
//!
//! ```ignore
//! let mut builder = GraphBuilder::new();
//! builder.add_filter("source", "producer", make_source)?;
//! builder.add_filter("sink", "consumer", make_sink)?;
//! builder.connect(("source", "out"), ("sink", "in"));
//!
//! let mut graph = builder.activate()?;
//! graph.init()?;
//! graph.open()?;
//! graph.start()?;
//! // ... samples flow ...
//! graph.shutdown()?;
//! ```

pub mod connection;
pub mod environment;
pub mod error;
pub mod executor;
pub mod filter;
pub mod graph;
pub mod plugin;
pub mod port;
pub mod properties;
pub mod sample;
pub mod services;

pub use connection::{FlowSemaphore, InterThreadConnection};
pub use environment::{FilterEnvironment, LifecycleOp, PortRef};
pub use error::{FlowgraphError, Result};
pub use executor::Executor;
pub use filter::{Filter, FilterId, FilterState};
pub use graph::{ActiveGraph, ConnectionMode, ConnectionOptions, GraphBuilder};
pub use plugin::{PluginDefinition, PluginRegistry, SharedFilterFactory};
pub use port::{InputPort, OutputPort, PortDirection};
pub use properties::{PropertyCollection, PropertyOptions, PropertyValue};
pub use sample::{Sample, TIMESTAMP_RES};
pub use services::{HostEventHook, LogLevel, LogSink, Profiling, Services};
