//! Filter trait and lifecycle states.
//!
//! A filter is a user-defined computation step living on exactly one
//! worker thread. The runtime drives it through the lifecycle chain and
//! delivers data arriving at its input ports via `on_port_data_changed`.
//! All callbacks are invoked on the filter's owning thread.

use crate::environment::FilterEnvironment;
use crate::port::InputPort;
use crate::Result;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Index of a filter within its graph.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FilterId(pub u32);

impl FilterId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FilterId({})", self.0)
    }
}

/// Position in the filter lifecycle chain.
///
/// Only forward transitions are permitted; every `*ing` state is strictly
/// traversed once before the matching resting state is entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    Constructing,
    Constructed,
    Initializing,
    Initialized,
    Opening,
    Opened,
    Starting,
    Active,
    Stopping,
    Closing,
    Deinitializing,
    Destructing,
    Destructed,
}

impl FilterState {
    /// Whether this is a transient (`*ing`) state.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FilterState::Constructing
                | FilterState::Initializing
                | FilterState::Opening
                | FilterState::Starting
                | FilterState::Stopping
                | FilterState::Closing
                | FilterState::Deinitializing
                | FilterState::Destructing
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FilterState::Constructing => "Constructing",
            FilterState::Constructed => "Constructed",
            FilterState::Initializing => "Initializing",
            FilterState::Initialized => "Initialized",
            FilterState::Opening => "Opening",
            FilterState::Opened => "Opened",
            FilterState::Starting => "Starting",
            FilterState::Active => "Active",
            FilterState::Stopping => "Stopping",
            FilterState::Closing => "Closing",
            FilterState::Deinitializing => "Deinitializing",
            FilterState::Destructing => "Destructing",
            FilterState::Destructed => "Destructed",
        }
    }
}

impl fmt::Display for FilterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-defined computation step with lifecycle callbacks.
///
/// A minimal filter registers its ports in the factory closure and
/// forwards data in `on_port_data_changed`:
///
/// ```ignore
/// struct Doubler {
///     input: Arc<InputPort>,
///     output: Arc<OutputPort>,
/// }
///
/// fn make_doubler(env: &Arc<FilterEnvironment>) -> Result<Box<dyn Filter>> {
///     env.set_dynamic_ports_supported(false, false)?;
///     Ok(Box::new(Doubler {
///         input: env.add_static_input_port("in", 1, 0.0)?,
///         output: env.add_static_output_port("out")?,
///     }))
/// }
///
/// impl Filter for Doubler {
///     fn on_port_data_changed(&mut self, port: &Arc<InputPort>) -> Result<()> {
///         let sample = port.get_data(Some(0), None)?;
///         self.output.transmit(&Sample::copy(&sample))
///     }
/// }
/// ```
///
/// All default implementations are no-ops. Callbacks must not spawn OS
/// threads that call back into the runtime. The `Any` supertrait allows
/// hosts to downcast filters driven by external stimuli (see
/// `ActiveGraph::invoke`).
#[allow(unused_variables)]
pub trait Filter: Send + Any {
    /// Initialization related to dynamic ports.
    fn on_init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Acquire heavyweight resources (files, devices, ...).
    fn on_open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Last setup step before the filter becomes active.
    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called exactly once for each data sample arriving at an input port.
    fn on_port_data_changed(&mut self, port: &Arc<InputPort>) -> Result<()> {
        Ok(())
    }

    /// Opposite of `on_start`.
    fn on_stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// Opposite of `on_open`.
    fn on_close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Opposite of `on_init`.
    fn on_deinit(&mut self) -> Result<()> {
        Ok(())
    }

    /// A property of the filter's property collection changed. Always
    /// delivered on the filter's owning thread.
    fn on_property_changed(&mut self, name: &str) -> Result<()> {
        Ok(())
    }
}

/// Factory creating a filter instance bound to an environment. The
/// factory body acts as the filter constructor: it declares dynamic-port
/// support and registers static ports. It is always invoked on the
/// filter's owning thread.
pub type FilterFactory =
    Box<dyn Fn(&Arc<FilterEnvironment>) -> Result<Box<dyn Filter>> + Send + Sync>;
