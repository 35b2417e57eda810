//! Graph orchestration: worker threads, wiring and the lifecycle driver.
//!
//! An [`ActiveGraph`] owns one worker thread per filter group and drives
//! every filter through the lifecycle chain
//!
//! ```text
//! Constructed → Initialized → Opened → Active → Opened → Initialized → Destructed
//!               (init)        (open)   (start)  (stop)   (close)       (deinit+destruct)
//! ```
//!
//! Each operation is broadcast to all workers and synchronized with a
//! barrier so every filter of a phase enters its transient state before
//! any callback of that phase runs. Edges are wired on the first start:
//! same-thread edges through the destination executor (or inline when
//! requested), cross-thread edges through a flow-controlled
//! inter-thread connection.

pub mod builder;
pub(crate) mod thread;

pub use builder::{ConnectionMode, ConnectionOptions, GraphBuilder};

use crate::connection::InterThreadConnection;
use crate::environment::{FilterEnvironment, LifecycleOp};
use crate::executor::Executor;
use crate::filter::{Filter, FilterState};
use crate::graph::builder::ConnectionDef;
use crate::graph::thread::ThreadEvent;
use crate::port::OutputPort;
use crate::properties::PropertyCollection;
use crate::services::Services;
use crate::{FlowgraphError, Result};
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;

pub(crate) struct ThreadHandle {
    pub name: String,
    pub tx: Sender<ThreadEvent>,
    pub executor: Arc<Executor>,
    pub handle: Option<JoinHandle<()>>,
}

/// A running filter graph. Created through [`GraphBuilder::activate`].
pub struct ActiveGraph {
    threads: Vec<ThreadHandle>,
    envs: HashMap<String, Arc<FilterEnvironment>>,
    filter_threads: HashMap<String, usize>,
    connections: Vec<ConnectionDef>,
    itcs: Vec<Arc<InterThreadConnection>>,
    connected: bool,
    state: FilterState,
    finished_rx: Receiver<String>,
    services: Arc<Services>,
}

impl ActiveGraph {
    pub(crate) fn new(
        threads: Vec<ThreadHandle>,
        envs: HashMap<String, Arc<FilterEnvironment>>,
        filter_threads: HashMap<String, usize>,
        connections: Vec<ConnectionDef>,
        finished_rx: Receiver<String>,
        services: Arc<Services>,
    ) -> Result<Self> {
        let mut graph = Self {
            threads,
            envs,
            filter_threads,
            connections,
            itcs: Vec::new(),
            connected: false,
            state: FilterState::Constructing,
            finished_rx,
            services,
        };
        graph.broadcast(LifecycleOp::Create, FilterState::Constructed)?;
        Ok(graph)
    }

    /// Current graph-level lifecycle state.
    pub fn state(&self) -> FilterState {
        self.state
    }

    /// Environment of a filter, by name.
    pub fn environment(&self, filter: &str) -> Option<&Arc<FilterEnvironment>> {
        self.envs.get(filter)
    }

    /// Property collection of a filter, by name.
    pub fn property_collection(&self, filter: &str) -> Option<Arc<PropertyCollection>> {
        self.envs
            .get(filter)
            .map(|env| env.property_collection().clone())
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Run a closure against a filter on its owning thread. The closure
    /// receives the filter instance (downcastable through `Any`) and its
    /// environment; it is how hosts and tests drive source filters.
    pub fn invoke<F>(&self, filter: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Filter, &Arc<FilterEnvironment>) + Send + 'static,
    {
        let env = self.envs.get(filter).ok_or_else(|| {
            FlowgraphError::InvalidArgument(format!("no filter named '{filter}'"))
        })?;
        let tidx = self.filter_threads[filter];
        self.threads[tidx]
            .tx
            .send(ThreadEvent::Invoke {
                filter: env.id(),
                f: Box::new(f),
            })
            .map_err(|_| FlowgraphError::Internal("worker thread is gone".into()))
    }

    // ── Lifecycle operations ──

    /// `Constructed → Initialized`.
    pub fn init(&mut self) -> Result<()> {
        self.checked_broadcast(LifecycleOp::Init)
    }

    /// `Initialized → Opened`.
    pub fn open(&mut self) -> Result<()> {
        self.checked_broadcast(LifecycleOp::Open)
    }

    /// `Opened → Active`. Wires the connections on first use and un-stops
    /// all inter-thread connections.
    pub fn start(&mut self) -> Result<()> {
        if self.state != FilterState::Opened {
            return Err(FlowgraphError::InvalidState {
                operation: "ActiveGraph::start",
                state: self.state,
            });
        }
        if !self.connected {
            self.setup_connections()?;
            self.connected = true;
        }
        for itc in &self.itcs {
            itc.set_stopped(false);
        }
        self.broadcast(LifecycleOp::Start, FilterState::Active)
    }

    /// `Active → Opened`. Stops all inter-thread connections — pending
    /// senders drain with drop warnings within the acquire timeout — then
    /// lets every executor finalize and clear.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != FilterState::Active {
            return Err(FlowgraphError::InvalidState {
                operation: "ActiveGraph::stop",
                state: self.state,
            });
        }
        for itc in &self.itcs {
            itc.set_stopped(true);
        }
        self.broadcast(LifecycleOp::Stop, FilterState::Opened)
    }

    /// `Opened → Initialized`.
    pub fn close(&mut self) -> Result<()> {
        self.checked_broadcast(LifecycleOp::Close)
    }

    /// `Initialized → Constructed`.
    pub fn deinit(&mut self) -> Result<()> {
        self.checked_broadcast(LifecycleOp::Deinit)
    }

    /// `Constructed → Destructed`; drops all filters and joins the worker
    /// threads.
    pub fn destruct(&mut self) -> Result<()> {
        if self.state != FilterState::Constructed {
            return Err(FlowgraphError::InvalidState {
                operation: "ActiveGraph::destruct",
                state: self.state,
            });
        }
        self.broadcast(LifecycleOp::Destruct, FilterState::Destructed)?;
        self.stop_threads();
        Ok(())
    }

    /// Walk the remaining lifecycle chain down to `Destructed`.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state == FilterState::Active {
            self.stop()?;
        }
        if self.state == FilterState::Opened {
            self.close()?;
        }
        if self.state == FilterState::Initialized {
            self.deinit()?;
        }
        if self.state == FilterState::Constructed {
            self.destruct()?;
        }
        if self.state != FilterState::Destructed {
            return Err(FlowgraphError::Internal(format!(
                "unexpected state {} after shutdown",
                self.state
            )));
        }
        Ok(())
    }

    fn checked_broadcast(&mut self, op: LifecycleOp) -> Result<()> {
        let (from, _, to) = op
            .transition()
            .ok_or_else(|| FlowgraphError::Internal(format!("{op} is not a broadcast op")))?;
        if self.state != from {
            return Err(FlowgraphError::InvalidState {
                operation: "ActiveGraph lifecycle operation",
                state: self.state,
            });
        }
        self.broadcast(op, to)
    }

    /// Send one operation to all workers and wait until every thread
    /// reports completion.
    fn broadcast(&mut self, op: LifecycleOp, to: FilterState) -> Result<()> {
        tracing::debug!("graph operation {op}, state {}", self.state);
        let barrier = Arc::new(Barrier::new(self.threads.len()));
        for thread in &self.threads {
            thread
                .tx
                .send(ThreadEvent::Operation {
                    op,
                    barrier: barrier.clone(),
                })
                .map_err(|_| {
                    FlowgraphError::Internal(format!("worker '{}' is gone", thread.name))
                })?;
        }
        for _ in 0..self.threads.len() {
            self.finished_rx
                .recv()
                .map_err(|_| FlowgraphError::Internal("worker threads are gone".into()))?;
        }
        self.state = to;
        tracing::debug!("graph operation {op} done, state {}", self.state);
        Ok(())
    }

    /// Wire all edges. Assumed fixed for the lifetime of the graph.
    fn setup_connections(&mut self) -> Result<()> {
        for conn in &self.connections {
            let from_env = &self.envs[&conn.from_filter];
            let to_env = &self.envs[&conn.to_filter];
            let output = from_env.output_port(&conn.from_port)?;
            let input = to_env.input_port(&conn.to_port)?;
            let from_thread = self.filter_threads[&conn.from_filter];
            let to_thread = self.filter_threads[&conn.to_filter];
            if from_thread == to_thread {
                match conn.options.mode {
                    ConnectionMode::Direct => {
                        OutputPort::setup_direct_connection(&output, &input);
                    }
                    ConnectionMode::Auto => OutputPort::setup_same_thread_connection(
                        &output,
                        &input,
                        &self.threads[to_thread].executor,
                    ),
                }
            } else {
                let itc = OutputPort::setup_inter_thread_connection(
                    &output,
                    &input,
                    &self.threads[to_thread].executor,
                    conn.options.width,
                    &self.services,
                );
                self.itcs.push(itc);
            }
        }
        Ok(())
    }

    fn stop_threads(&mut self) {
        for thread in &self.threads {
            let _ = thread.tx.send(ThreadEvent::Quit);
        }
        for thread in &mut self.threads {
            if let Some(handle) = thread.handle.take() {
                if handle.join().is_err() {
                    tracing::error!("worker '{}' panicked", thread.name);
                }
            }
        }
    }
}

impl Drop for ActiveGraph {
    fn drop(&mut self) {
        if self.state != FilterState::Destructed {
            if let Err(e) = self.shutdown() {
                tracing::warn!("graph shutdown in drop failed: {e}");
            }
            self.stop_threads();
        }
    }
}
