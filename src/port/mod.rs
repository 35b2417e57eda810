//! Typed ports attached to filters.
//!
//! A port is a named endpoint on a filter, either input or output, and
//! either static (registered during construction, alive for the filter's
//! lifetime) or dynamic (created and removed at runtime). A port's thread
//! affinity equals its filter's: all receive and transmit operations are
//! restricted to the owning thread.

mod input;
mod output;
mod queue;

pub use input::InputPort;
pub use output::OutputPort;

pub(crate) use queue::InputQueue;

use crate::environment::FilterEnvironment;
use crate::{FlowgraphError, Result};
use std::sync::{Arc, Weak};

/// Whether a port is an input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// State shared by input and output ports.
pub(crate) struct PortBase {
    name: String,
    dynamic: bool,
    env: Weak<FilterEnvironment>,
}

impl PortBase {
    pub(crate) fn new(dynamic: bool, name: impl Into<String>, env: Weak<FilterEnvironment>) -> Self {
        Self {
            name: name.into(),
            dynamic,
            env,
        }
    }

    #[inline]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn dynamic(&self) -> bool {
        self.dynamic
    }

    /// The owning filter environment. Ports hold a non-owning handle;
    /// the environment strictly outlives port use in a running graph.
    pub(crate) fn env(&self) -> Result<Arc<FilterEnvironment>> {
        self.env.upgrade().ok_or_else(|| {
            FlowgraphError::Internal(format!(
                "environment of port '{}' is no longer alive",
                self.name
            ))
        })
    }
}
