//! Builder for constructing and activating a filter graph.

use crate::environment::FilterEnvironment;
use crate::executor::Executor;
use crate::filter::{Filter, FilterFactory, FilterId};
use crate::graph::thread::{spawn_worker, ThreadEvent, WorkerConfig};
use crate::graph::{ActiveGraph, ThreadHandle};
use crate::plugin::PluginRegistry;
use crate::properties::PropertyCollection;
use crate::services::Services;
use crate::{FlowgraphError, Result};
use crossbeam_channel::unbounded;
use std::collections::HashMap;
use std::sync::Arc;

/// How a same-thread edge delivers its samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionMode {
    /// Same-thread edges are routed through the thread's executor so a
    /// sender that is mid-step cannot recurse unboundedly. Cross-thread
    /// edges always use an inter-thread connection.
    #[default]
    Auto,
    /// Same-thread edges call the receiver inline, before `transmit`
    /// returns.
    Direct,
}

/// Options of one edge.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Flow-control width of a cross-thread edge: `0` is unbounded and
    /// non-blocking, `>= 1` applies strict back-pressure.
    pub width: u32,
    pub mode: ConnectionMode,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            width: 1,
            mode: ConnectionMode::Auto,
        }
    }
}

pub(crate) struct ConnectionDef {
    pub from_filter: String,
    pub from_port: String,
    pub to_filter: String,
    pub to_port: String,
    pub options: ConnectionOptions,
}

struct FilterDef {
    name: String,
    thread: String,
    factory: FilterFactory,
    properties: Arc<PropertyCollection>,
}

/// Builder assembling filters, thread assignments and edges into an
/// [`ActiveGraph`].
#[derive(Default)]
pub struct GraphBuilder {
    services: Option<Arc<Services>>,
    filters: Vec<FilterDef>,
    connections: Vec<ConnectionDef>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject the service collection shared by all filters of the graph.
    pub fn with_services(mut self, services: Arc<Services>) -> Self {
        self.services = Some(services);
        self
    }

    /// Add a filter under a unique name, assigned to the worker thread of
    /// the given name. The factory runs on that thread during `create`.
    pub fn add_filter<F>(&mut self, name: &str, thread: &str, factory: F) -> Result<()>
    where
        F: Fn(&Arc<FilterEnvironment>) -> Result<Box<dyn Filter>> + Send + Sync + 'static,
    {
        if self.filters.iter().any(|f| f.name == name) {
            return Err(FlowgraphError::InvalidArgument(format!(
                "a filter named '{name}' already exists"
            )));
        }
        self.filters.push(FilterDef {
            name: name.to_string(),
            thread: thread.to_string(),
            factory: Box::new(factory),
            properties: PropertyCollection::new(name),
        });
        Ok(())
    }

    /// Add a filter instantiated by name through a plugin registry.
    pub fn add_registered_filter(
        &mut self,
        name: &str,
        thread: &str,
        registry: &Arc<PluginRegistry>,
        type_name: &str,
    ) -> Result<()> {
        let registry = registry.clone();
        let type_name = type_name.to_string();
        self.add_filter(name, thread, move |env| registry.create(&type_name, env))
    }

    /// Connect `(filter, port)` to `(filter, port)` with default options.
    pub fn connect(&mut self, from: (&str, &str), to: (&str, &str)) {
        self.connect_with(from, to, ConnectionOptions::default());
    }

    /// Connect `(filter, port)` to `(filter, port)`.
    pub fn connect_with(&mut self, from: (&str, &str), to: (&str, &str), options: ConnectionOptions) {
        self.connections.push(ConnectionDef {
            from_filter: from.0.to_string(),
            from_port: from.1.to_string(),
            to_filter: to.0.to_string(),
            to_port: to.1.to_string(),
            options,
        });
    }

    /// Spawn the worker threads and construct all filters. The returned
    /// graph is in `Constructed` state.
    pub fn activate(self) -> Result<ActiveGraph> {
        if self.filters.is_empty() {
            return Err(FlowgraphError::InvalidArgument(
                "cannot activate an empty graph".into(),
            ));
        }
        for conn in &self.connections {
            for endpoint in [&conn.from_filter, &conn.to_filter] {
                if !self.filters.iter().any(|f| f.name == *endpoint) {
                    return Err(FlowgraphError::InvalidArgument(format!(
                        "connection references unknown filter '{endpoint}'"
                    )));
                }
            }
        }

        let services = self.services.unwrap_or_else(|| Arc::new(Services::new()));

        // Thread list in order of first appearance.
        let mut thread_names: Vec<String> = Vec::new();
        for filter in &self.filters {
            if !thread_names.contains(&filter.thread) {
                thread_names.push(filter.thread.clone());
            }
        }
        let thread_index: HashMap<String, usize> = thread_names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();

        let (finished_tx, finished_rx) = unbounded();
        let mut channels = Vec::with_capacity(thread_names.len());
        let mut executors = Vec::with_capacity(thread_names.len());
        for _ in &thread_names {
            let (tx, rx) = unbounded::<ThreadEvent>();
            executors.push(Executor::new(tx.clone()));
            channels.push((tx, rx));
        }

        let mut envs: HashMap<String, Arc<FilterEnvironment>> = HashMap::new();
        let mut filter_threads: HashMap<String, usize> = HashMap::new();
        let mut per_thread: Vec<Vec<(Arc<FilterEnvironment>, FilterFactory)>> =
            (0..thread_names.len()).map(|_| Vec::new()).collect();
        for (i, filter) in self.filters.into_iter().enumerate() {
            let id = FilterId(i as u32);
            let tidx = thread_index[&filter.thread];
            let env = FilterEnvironment::new(
                id,
                filter.name.clone(),
                filter.thread.clone(),
                filter.properties.clone(),
                services.clone(),
            );
            filter.properties.attach(id, channels[tidx].0.clone());
            envs.insert(filter.name.clone(), env.clone());
            filter_threads.insert(filter.name, tidx);
            per_thread[tidx].push((env, filter.factory));
        }

        let mut threads = Vec::with_capacity(thread_names.len());
        for ((name, (tx, rx)), (executor, filters)) in thread_names
            .into_iter()
            .zip(channels)
            .zip(executors.into_iter().zip(per_thread))
        {
            let handle = spawn_worker(WorkerConfig {
                name: name.clone(),
                rx,
                executor: executor.clone(),
                filters,
                finished_tx: finished_tx.clone(),
                services: services.clone(),
            })
            .map_err(|e| {
                FlowgraphError::Internal(format!("failed to spawn worker '{name}': {e}"))
            })?;
            threads.push(ThreadHandle {
                name,
                tx,
                executor,
                handle: Some(handle),
            });
        }

        ActiveGraph::new(
            threads,
            envs,
            filter_threads,
            self.connections,
            finished_rx,
            services,
        )
    }
}
