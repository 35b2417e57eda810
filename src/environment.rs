//! Per-filter state holder and lifecycle state machine.
//!
//! A `FilterEnvironment` owns the filter instance and its ports, records
//! the filter's thread affinity and current lifecycle state, and performs
//! the state transitions driven by the orchestrator. Ownership is
//! strictly `environment owns filter owns ports`; ports hold a non-owning
//! handle back to the environment.

use crate::filter::{Filter, FilterFactory, FilterId, FilterState};
use crate::port::{InputPort, OutputPort, PortDirection};
use crate::properties::PropertyCollection;
use crate::services::{LogLevel, Services};
use crate::{FlowgraphError, Result};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::ThreadId;

/// Operations the orchestrator performs on every filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOp {
    Create,
    Init,
    Open,
    Start,
    Stop,
    Close,
    Deinit,
    Destruct,
}

impl LifecycleOp {
    /// `(from, transient, to)` states of this operation, or `None` for
    /// the construction and destruction phases which are handled
    /// specially.
    pub(crate) fn transition(self) -> Option<(FilterState, FilterState, FilterState)> {
        match self {
            LifecycleOp::Init => Some((
                FilterState::Constructed,
                FilterState::Initializing,
                FilterState::Initialized,
            )),
            LifecycleOp::Open => Some((
                FilterState::Initialized,
                FilterState::Opening,
                FilterState::Opened,
            )),
            LifecycleOp::Start => Some((
                FilterState::Opened,
                FilterState::Starting,
                FilterState::Active,
            )),
            LifecycleOp::Stop => Some((
                FilterState::Active,
                FilterState::Stopping,
                FilterState::Opened,
            )),
            LifecycleOp::Close => Some((
                FilterState::Opened,
                FilterState::Closing,
                FilterState::Initialized,
            )),
            LifecycleOp::Deinit => Some((
                FilterState::Initialized,
                FilterState::Deinitializing,
                FilterState::Constructed,
            )),
            LifecycleOp::Create | LifecycleOp::Destruct => None,
        }
    }
}

impl fmt::Display for LifecycleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleOp::Create => "create",
            LifecycleOp::Init => "init",
            LifecycleOp::Open => "open",
            LifecycleOp::Start => "start",
            LifecycleOp::Stop => "stop",
            LifecycleOp::Close => "close",
            LifecycleOp::Deinit => "deinit",
            LifecycleOp::Destruct => "destruct",
        };
        f.write_str(name)
    }
}

/// A registered port of either direction.
#[derive(Clone)]
pub enum PortRef {
    Input(Arc<InputPort>),
    Output(Arc<OutputPort>),
}

impl PortRef {
    pub fn name(&self) -> &str {
        match self {
            PortRef::Input(p) => p.name(),
            PortRef::Output(p) => p.name(),
        }
    }

    pub fn dynamic(&self) -> bool {
        match self {
            PortRef::Input(p) => p.dynamic(),
            PortRef::Output(p) => p.dynamic(),
        }
    }

    pub fn direction(&self) -> PortDirection {
        match self {
            PortRef::Input(_) => PortDirection::Input,
            PortRef::Output(_) => PortDirection::Output,
        }
    }
}

/// Per-filter state holder: lifecycle state, thread affinity, owned
/// ports, the filter instance itself and its property collection.
pub struct FilterEnvironment {
    id: FilterId,
    name: String,
    thread_name: String,
    thread: OnceLock<ThreadId>,
    state: Mutex<FilterState>,
    ports: Mutex<Vec<PortRef>>,
    dynamic_ports_supported: Mutex<Option<(bool, bool)>>,
    filter: Mutex<Option<Box<dyn Filter>>>,
    properties: Arc<PropertyCollection>,
    services: Arc<Services>,
}

impl FilterEnvironment {
    pub(crate) fn new(
        id: FilterId,
        name: impl Into<String>,
        thread_name: impl Into<String>,
        properties: Arc<PropertyCollection>,
        services: Arc<Services>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            thread_name: thread_name.into(),
            thread: OnceLock::new(),
            state: Mutex::new(FilterState::Constructing),
            ports: Mutex::new(Vec::new()),
            dynamic_ports_supported: Mutex::new(None),
            filter: Mutex::new(None),
            properties,
            services,
        })
    }

    pub fn id(&self) -> FilterId {
        self.id
    }

    /// Fully qualified filter name within the graph.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the worker thread this filter is assigned to.
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// The property collection associated with this filter.
    pub fn property_collection(&self) -> &Arc<PropertyCollection> {
        &self.properties
    }

    pub fn state(&self) -> FilterState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind this environment to the calling thread. Invoked once by the
    /// owning worker before the filter is constructed.
    pub(crate) fn bind_thread(&self) {
        let _ = self.thread.set(std::thread::current().id());
    }

    pub(crate) fn assert_my_thread(&self, context: &'static str) -> Result<()> {
        match self.thread.get() {
            Some(id) if *id == std::thread::current().id() => Ok(()),
            _ => Err(FlowgraphError::WrongThread { context }),
        }
    }

    // ── Dynamic-ports policy ──

    /// Declare whether this filter supports dynamic input/output ports.
    /// Set exactly once during construction; declaring a direction
    /// unsupported while a dynamic port of that direction exists is a
    /// construction-time failure.
    pub fn set_dynamic_ports_supported(&self, dyn_in: bool, dyn_out: bool) -> Result<()> {
        let state = self.state();
        if state != FilterState::Constructing {
            return Err(FlowgraphError::InvalidState {
                operation: "FilterEnvironment::set_dynamic_ports_supported",
                state,
            });
        }
        let mut supported = self
            .dynamic_ports_supported
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if supported.is_some() {
            return Err(FlowgraphError::InvalidState {
                operation: "FilterEnvironment::set_dynamic_ports_supported (already set)",
                state,
            });
        }
        let ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        for port in ports.iter().filter(|p| p.dynamic()) {
            let direction = port.direction();
            let ok = match direction {
                PortDirection::Input => dyn_in,
                PortDirection::Output => dyn_out,
            };
            if !ok {
                return Err(FlowgraphError::DynamicPortsUnsupported {
                    filter: self.name.clone(),
                    direction,
                });
            }
        }
        *supported = Some((dyn_in, dyn_out));
        Ok(())
    }

    pub fn dynamic_ports_supported(&self) -> (bool, bool) {
        self.dynamic_ports_supported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or((false, false))
    }

    // ── Port registration and lookup ──

    /// Register a static input port. Only possible during construction.
    pub fn add_static_input_port(
        self: &Arc<Self>,
        name: &str,
        max_samples: usize,
        max_seconds: f64,
    ) -> Result<Arc<InputPort>> {
        let port = InputPort::new(false, name, self, max_samples, max_seconds);
        self.register_port(PortRef::Input(port.clone()))?;
        Ok(port)
    }

    /// Register a dynamic input port; requires dynamic input support.
    pub fn add_dynamic_input_port(
        self: &Arc<Self>,
        name: &str,
        max_samples: usize,
        max_seconds: f64,
    ) -> Result<Arc<InputPort>> {
        let port = InputPort::new(true, name, self, max_samples, max_seconds);
        self.register_port(PortRef::Input(port.clone()))?;
        Ok(port)
    }

    /// Register a static output port. Only possible during construction.
    pub fn add_static_output_port(self: &Arc<Self>, name: &str) -> Result<Arc<OutputPort>> {
        let port = OutputPort::new(false, name, self);
        self.register_port(PortRef::Output(port.clone()))?;
        Ok(port)
    }

    /// Register a dynamic output port; requires dynamic output support.
    pub fn add_dynamic_output_port(self: &Arc<Self>, name: &str) -> Result<Arc<OutputPort>> {
        let port = OutputPort::new(true, name, self);
        self.register_port(PortRef::Output(port.clone()))?;
        Ok(port)
    }

    fn register_port(&self, port: PortRef) -> Result<()> {
        let state = self.state();
        if !matches!(state, FilterState::Constructing | FilterState::Constructed) {
            return Err(FlowgraphError::InvalidState {
                operation: "FilterEnvironment::add_port",
                state,
            });
        }
        if port.dynamic() {
            let (dyn_in, dyn_out) = self.dynamic_ports_supported();
            let direction = port.direction();
            let ok = match direction {
                PortDirection::Input => dyn_in,
                PortDirection::Output => dyn_out,
            };
            if !ok {
                return Err(FlowgraphError::DynamicPortsUnsupported {
                    filter: self.name.clone(),
                    direction,
                });
            }
        }
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        if ports
            .iter()
            .any(|p| p.direction() == port.direction() && p.name() == port.name())
        {
            return Err(FlowgraphError::InvalidArgument(format!(
                "filter '{}' already has a {:?} port named '{}'",
                self.name,
                port.direction(),
                port.name()
            )));
        }
        ports.push(port);
        Ok(())
    }

    /// Remove a static port registered during construction.
    pub fn remove_static_port(&self, name: &str, direction: PortDirection) -> Result<()> {
        let state = self.state();
        if !matches!(state, FilterState::Constructing | FilterState::Constructed) {
            return Err(FlowgraphError::InvalidState {
                operation: "FilterEnvironment::remove_static_port",
                state,
            });
        }
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = ports
            .iter()
            .position(|p| !p.dynamic() && p.direction() == direction && p.name() == name)
            .ok_or_else(|| {
                FlowgraphError::InvalidArgument(format!(
                    "filter '{}' has no static {direction:?} port named '{name}'",
                    self.name
                ))
            })?;
        ports.remove(idx);
        Ok(())
    }

    /// Look up an input port by name.
    pub fn input_port(&self, name: &str) -> Result<Arc<InputPort>> {
        let ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        ports
            .iter()
            .find_map(|p| match p {
                PortRef::Input(p) if p.name() == name => Some(p.clone()),
                _ => None,
            })
            .ok_or_else(|| {
                FlowgraphError::InvalidArgument(format!(
                    "filter '{}' has no input port named '{name}'",
                    self.name
                ))
            })
    }

    /// Look up an output port by name.
    pub fn output_port(&self, name: &str) -> Result<Arc<OutputPort>> {
        let ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        ports
            .iter()
            .find_map(|p| match p {
                PortRef::Output(p) if p.name() == name => Some(p.clone()),
                _ => None,
            })
            .ok_or_else(|| {
                FlowgraphError::InvalidArgument(format!(
                    "filter '{}' has no output port named '{name}'",
                    self.name
                ))
            })
    }

    fn input_ports_filtered(&self, dynamic: Option<bool>) -> Vec<Arc<InputPort>> {
        let ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        ports
            .iter()
            .filter_map(|p| match p {
                PortRef::Input(p) if dynamic.is_none() || dynamic == Some(p.dynamic()) => {
                    Some(p.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn output_ports_filtered(&self, dynamic: Option<bool>) -> Vec<Arc<OutputPort>> {
        let ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        ports
            .iter()
            .filter_map(|p| match p {
                PortRef::Output(p) if dynamic.is_none() || dynamic == Some(p.dynamic()) => {
                    Some(p.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub fn static_input_ports(&self) -> Vec<Arc<InputPort>> {
        self.input_ports_filtered(Some(false))
    }

    pub fn dynamic_input_ports(&self) -> Vec<Arc<InputPort>> {
        self.input_ports_filtered(Some(true))
    }

    pub fn all_input_ports(&self) -> Vec<Arc<InputPort>> {
        self.input_ports_filtered(None)
    }

    pub fn static_output_ports(&self) -> Vec<Arc<OutputPort>> {
        self.output_ports_filtered(Some(false))
    }

    pub fn dynamic_output_ports(&self) -> Vec<Arc<OutputPort>> {
        self.output_ports_filtered(Some(true))
    }

    pub fn all_output_ports(&self) -> Vec<Arc<OutputPort>> {
        self.output_ports_filtered(None)
    }

    // ── Filter instance ──

    pub(crate) fn install_filter(&self, filter: Box<dyn Filter>) {
        *self.filter.lock().unwrap_or_else(PoisonError::into_inner) = Some(filter);
    }

    /// Run a closure against the owned filter instance on the owning
    /// thread. Returns `None` when no filter is installed or its callback
    /// is already executing further up the stack.
    pub(crate) fn with_filter_mut<R>(&self, f: impl FnOnce(&mut dyn Filter) -> R) -> Option<R> {
        let mut guard = match self.filter.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.services.log(
                    LogLevel::Error,
                    &format!(
                        "filter '{}' is already executing; re-entrant access refused",
                        self.name
                    ),
                    file!(),
                    line!(),
                );
                return None;
            }
        };
        guard.as_mut().map(|filter| f(filter.as_mut()))
    }

    // ── Lifecycle state machine ──

    /// Construct the filter instance via its factory. The factory body is
    /// the `Constructing` phase; a failing factory is logged and leaves
    /// the environment without a filter, which then traverses the
    /// remaining lifecycle as a no-op.
    pub(crate) fn create(self: &Arc<Self>, factory: &FilterFactory) {
        debug_assert_eq!(self.state(), FilterState::Constructing);
        match factory(self) {
            Ok(filter) => self.install_filter(filter),
            Err(e) => self.services.log(
                LogLevel::Error,
                &format!("failed to construct filter '{}': {e}", self.name),
                file!(),
                line!(),
            ),
        }
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = FilterState::Constructed;
    }

    /// Move this filter into the transient state of `op` ahead of the
    /// barrier-synchronized execution, so all filters of a phase are in
    /// the adapted state before any callback of that phase runs.
    pub(crate) fn pre_state_transition(&self, op: LifecycleOp) -> Result<()> {
        let Some((from, transient, _)) = op.transition() else {
            return Ok(());
        };
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(FlowgraphError::InvalidState {
                operation: "FilterEnvironment::pre_state_transition",
                state: *state,
            });
        }
        *state = transient;
        Ok(())
    }

    /// Execute a lifecycle operation: enter the transient state, run the
    /// filter callback, and enter the resting state. A failing callback
    /// is caught, logged, and the state is forced onward — a misbehaving
    /// filter never blocks the whole graph.
    pub(crate) fn perform(&self, op: LifecycleOp) {
        let Some((from, transient, to)) = op.transition() else {
            return;
        };
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != from && *state != transient {
                self.services.log(
                    LogLevel::Error,
                    &format!(
                        "cannot perform {op} on filter '{}' in state {}",
                        self.name, *state
                    ),
                    file!(),
                    line!(),
                );
                return;
            }
            *state = transient;
        }
        let result = self
            .with_filter_mut(|filter| match op {
                LifecycleOp::Init => filter.on_init(),
                LifecycleOp::Open => filter.on_open(),
                LifecycleOp::Start => filter.on_start(),
                LifecycleOp::Stop => filter.on_stop(),
                LifecycleOp::Close => filter.on_close(),
                LifecycleOp::Deinit => filter.on_deinit(),
                LifecycleOp::Create | LifecycleOp::Destruct => Ok(()),
            })
            .unwrap_or(Ok(()));
        if let Err(e) = result {
            self.services.log(
                LogLevel::Error,
                &format!(
                    "error while executing {op} of filter '{}': {e}; forcing state {to}",
                    self.name
                ),
                file!(),
                line!(),
            );
        }
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }

    /// Tear the filter down. Walks any remaining lifecycle steps so a
    /// destruct from a higher resting state is safe, then drops the
    /// filter instance.
    pub(crate) fn destruct(&self) {
        if self.state() == FilterState::Active {
            self.perform(LifecycleOp::Stop);
        }
        if self.state() == FilterState::Opened {
            self.perform(LifecycleOp::Close);
        }
        if self.state() == FilterState::Initialized {
            self.perform(LifecycleOp::Deinit);
        }
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = FilterState::Destructing;
        *self.filter.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = FilterState::Destructed;
    }

    /// Deliver a data notification to the filter. Samples arriving while
    /// the filter is not active are discarded; failures inside the
    /// callback are caught and logged at Error so the graph keeps
    /// running.
    pub(crate) fn port_data_changed(&self, port: &Arc<InputPort>) {
        if let Err(e) = self.assert_my_thread("FilterEnvironment::port_data_changed") {
            self.services
                .log(LogLevel::Error, &e.to_string(), file!(), line!());
            return;
        }
        let state = self.state();
        if state != FilterState::Active {
            match state {
                FilterState::Opened | FilterState::Initialized => self.services.log(
                    LogLevel::Info,
                    &format!(
                        "data sample discarded; filter '{}' has been stopped already",
                        self.name
                    ),
                    file!(),
                    line!(),
                ),
                _ => self.services.log(
                    LogLevel::Error,
                    &format!(
                        "data sample arrived at filter '{}' in unexpected state {state}",
                        self.name
                    ),
                    file!(),
                    line!(),
                ),
            }
            return;
        }
        let result = self.with_filter_mut(|filter| filter.on_port_data_changed(port));
        if let Some(Err(e)) = result {
            let wrapped = FlowgraphError::FilterCallbackFailed {
                callback: "on_port_data_changed",
                message: e.to_string(),
            };
            self.services.log(
                LogLevel::Error,
                &format!("unhandled error in filter '{}': {wrapped}", self.name),
                file!(),
                line!(),
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: FilterState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}
