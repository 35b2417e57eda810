//! Error handling for the flowgraph runtime.
//!
//! Port-thread violations fail fast — they indicate programmer error.
//! Failures inside filter callbacks are caught by the runtime, logged and
//! swallowed so the graph keeps running.

use crate::filter::FilterState;
use crate::port::PortDirection;
use thiserror::Error;

/// Main error type for flowgraph operations.
#[derive(Error, Debug)]
pub enum FlowgraphError {
    /// An operation was invoked off its owning thread.
    #[error("{context} has been called from an unexpected thread")]
    WrongThread { context: &'static str },

    /// An argument combination is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A queue access lies outside the buffered window.
    #[error("{what} is out of range")]
    OutOfRange { what: &'static str },

    /// An operation is not allowed in the current lifecycle state.
    #[error("{operation} is not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: FilterState,
    },

    /// A dynamic port exists although the filter declared it unsupported.
    #[error("dynamic {direction:?} ports are not supported by filter '{filter}'")]
    DynamicPortsUnsupported {
        filter: String,
        direction: PortDirection,
    },

    /// A plugin could not be loaded.
    #[error("failed to load plugin: {0}")]
    PluginLoadError(String),

    /// No filter factory is registered under the requested name.
    #[error("no filter factory registered under '{0}'")]
    PluginSymbolMissing(String),

    /// A filter callback failed; wraps the underlying error.
    #[error("filter callback {callback} failed: {message}")]
    FilterCallbackFailed {
        callback: &'static str,
        message: String,
    },

    /// Errors raised by filter implementations.
    #[error("filter error: {0}")]
    Filter(String),

    /// A runtime invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for flowgraph operations.
pub type Result<T> = std::result::Result<T, FlowgraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FlowgraphError::WrongThread {
            context: "OutputPort::transmit",
        };
        assert_eq!(
            err.to_string(),
            "OutputPort::transmit has been called from an unexpected thread"
        );

        let err = FlowgraphError::InvalidState {
            operation: "OutputPort::transmit",
            state: FilterState::Opened,
        };
        assert!(err.to_string().contains("Opened"));
    }
}
