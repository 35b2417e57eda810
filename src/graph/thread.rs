//! Worker threads of an active graph.
//!
//! Each graph thread runs a cooperative event loop over a crossbeam
//! channel: executor wake-ups, barrier-synchronized lifecycle
//! operations broadcast by the orchestrator, host-posted filter
//! invocations and property-change notifications. Filters assigned to
//! the same thread never run in parallel.

use crate::environment::{FilterEnvironment, LifecycleOp};
use crate::executor::Executor;
use crate::filter::{Filter, FilterFactory, FilterId};
use crate::services::{LogLevel, Services};
use crossbeam_channel::{Receiver, Sender};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;

/// Name of the designated main thread. Input ports of filters assigned
/// here perform the cooperative host-event yield.
pub(crate) const MAIN_THREAD: &str = "main";

/// Closure posted into a filter's thread via `ActiveGraph::invoke`.
pub(crate) type InvokeFn = Box<dyn FnOnce(&mut dyn Filter, &Arc<FilterEnvironment>) + Send>;

/// Events processed by a worker's event loop.
pub(crate) enum ThreadEvent {
    /// Executor wake-up: run one `multi_step`.
    Step,
    /// Barrier-synchronized lifecycle operation on all filters of this
    /// thread.
    Operation {
        op: LifecycleOp,
        barrier: Arc<Barrier>,
    },
    /// Host-posted closure running against one filter.
    Invoke { filter: FilterId, f: InvokeFn },
    /// A property of a filter changed.
    PropertyChanged { filter: FilterId, name: String },
    /// Leave the event loop.
    Quit,
}

pub(crate) struct WorkerConfig {
    pub name: String,
    pub rx: Receiver<ThreadEvent>,
    pub executor: Arc<Executor>,
    /// Environments and factories of the filters assigned to this thread.
    pub filters: Vec<(Arc<FilterEnvironment>, FilterFactory)>,
    /// Completion signal back to the orchestrator, one per operation.
    pub finished_tx: Sender<String>,
    pub services: Arc<Services>,
}

pub(crate) fn spawn_worker(config: WorkerConfig) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(config.name.clone())
        .spawn(move || run_worker(config))
}

fn run_worker(config: WorkerConfig) {
    let WorkerConfig {
        name,
        rx,
        executor,
        filters,
        finished_tx,
        services,
    } = config;

    executor.bind_thread();
    if name == MAIN_THREAD {
        services.register_main_thread();
    }
    for (env, _) in &filters {
        env.bind_thread();
    }
    tracing::debug!("worker '{name}' started with {} filters", filters.len());

    while let Ok(event) = rx.recv() {
        match event {
            ThreadEvent::Step => executor.multi_step(),
            ThreadEvent::Operation { op, barrier } => {
                perform_operation(op, &barrier, &executor, &filters);
                let _ = finished_tx.send(name.clone());
            }
            ThreadEvent::Invoke { filter, f } => invoke(&filters, filter, f),
            ThreadEvent::PropertyChanged { filter, name } => {
                property_changed(&filters, filter, &name, &services);
            }
            ThreadEvent::Quit => break,
        }
    }
    tracing::debug!("worker '{name}' exiting");
}

/// Perform one lifecycle operation on all filters of this thread,
/// synchronized with the other workers: every filter of the phase enters
/// its transient state before any callback of the phase runs.
fn perform_operation(
    op: LifecycleOp,
    barrier: &Barrier,
    executor: &Arc<Executor>,
    filters: &[(Arc<FilterEnvironment>, FilterFactory)],
) {
    barrier.wait();
    if op == LifecycleOp::Stop {
        // Drain pending deliveries while the filters are still active,
        // then synchronize so no thread stops filters another thread is
        // still delivering into.
        executor.finalize();
        barrier.wait();
    }
    if op.transition().is_some() {
        for (env, _) in filters {
            if let Err(e) = env.pre_state_transition(op) {
                tracing::error!("pre-state transition {op} failed for '{}': {e}", env.name());
            }
        }
        barrier.wait();
    }
    match op {
        LifecycleOp::Create => {
            for (env, factory) in filters {
                env.create(factory);
            }
        }
        LifecycleOp::Destruct => {
            for (env, _) in filters {
                env.destruct();
            }
        }
        LifecycleOp::Start => {
            executor.restart();
            for (env, _) in filters {
                env.perform(op);
            }
        }
        _ => {
            for (env, _) in filters {
                env.perform(op);
            }
        }
    }
    if op == LifecycleOp::Stop {
        executor.clear();
    }
    barrier.wait();
}

fn invoke(filters: &[(Arc<FilterEnvironment>, FilterFactory)], id: FilterId, f: InvokeFn) {
    let Some((env, _)) = filters.iter().find(|(env, _)| env.id() == id) else {
        tracing::error!("invoke for unknown filter {id:?}");
        return;
    };
    if env.with_filter_mut(|filter| f(filter, env)).is_none() {
        tracing::warn!("invoke on filter '{}' dropped", env.name());
    }
}

fn property_changed(
    filters: &[(Arc<FilterEnvironment>, FilterFactory)],
    id: FilterId,
    property: &str,
    services: &Arc<Services>,
) {
    let Some((env, _)) = filters.iter().find(|(env, _)| env.id() == id) else {
        return;
    };
    let result = env.with_filter_mut(|filter| filter.on_property_changed(property));
    if let Some(Err(e)) = result {
        services.log(
            LogLevel::Error,
            &format!(
                "error in on_property_changed('{property}') of filter '{}': {e}",
                env.name()
            ),
            file!(),
            line!(),
        );
    }
}
