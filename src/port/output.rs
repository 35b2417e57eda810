//! Output ports: sample broadcast to subscribed edges.

use crate::connection::InterThreadConnection;
use crate::environment::FilterEnvironment;
use crate::executor::Executor;
use crate::filter::FilterState;
use crate::port::{InputPort, PortBase};
use crate::sample::Sample;
use crate::services::Services;
use crate::{FlowgraphError, Result};
use std::sync::{Arc, Mutex, PoisonError};

/// One subscriber bound to an output port at graph-wiring time.
#[derive(Clone)]
pub(crate) enum Subscription {
    /// Same-thread edge delivered inline, before `transmit` returns.
    Direct(Arc<InputPort>),
    /// Same-thread edge routed through the executor, so a sender that is
    /// mid-step cannot recurse unboundedly.
    SameThreadQueued {
        executor: Arc<Executor>,
        input: Arc<InputPort>,
    },
    /// Cross-thread edge with flow control.
    InterThread(Arc<InterThreadConnection>),
}

/// Typed output endpoint of a filter.
pub struct OutputPort {
    base: PortBase,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl OutputPort {
    pub(crate) fn new(
        dynamic: bool,
        name: impl Into<String>,
        env: &Arc<FilterEnvironment>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: PortBase::new(dynamic, name, Arc::downgrade(env)),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn dynamic(&self) -> bool {
        self.base.dynamic()
    }

    /// Broadcast a sample to every subscriber of this port, in wiring
    /// order. Must be invoked on the port's owning thread while the filter
    /// is `Active`.
    pub fn transmit(&self, sample: &Sample) -> Result<()> {
        let env = self.base.env()?;
        env.assert_my_thread("OutputPort::transmit")?;
        let state = env.state();
        if state != FilterState::Active {
            return Err(FlowgraphError::InvalidState {
                operation: "OutputPort::transmit",
                state,
            });
        }
        // Snapshot so subscriber callbacks may themselves transmit.
        let subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for subscription in &subscriptions {
            match subscription {
                Subscription::Direct(input) => input.receive_sync(sample),
                Subscription::SameThreadQueued { executor, input } => {
                    executor.register_pending_rcv_sync(input, sample);
                    // The self-block defers events destined to this filter
                    // until its current callback returns.
                    executor.step(Some(env.id()));
                }
                Subscription::InterThread(itc) => itc.receive_sample(sample),
            }
        }
        Ok(())
    }

    /// Return a copy of this port attached to a new environment.
    pub fn clone_for(&self, env: &Arc<FilterEnvironment>) -> Arc<OutputPort> {
        OutputPort::new(self.dynamic(), self.name(), env)
    }

    pub(crate) fn subscribe(&self, subscription: Subscription) {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscription);
    }

    // ── Graph-wiring helpers ──

    /// Wire a direct (intra-thread) edge. Both ports must live in the
    /// same thread.
    pub(crate) fn setup_direct_connection(output: &Arc<OutputPort>, input: &Arc<InputPort>) {
        tracing::info!(
            "setup direct connection between {} -> {}",
            output.name(),
            input.name()
        );
        output.subscribe(Subscription::Direct(input.clone()));
    }

    /// Wire a same-thread edge routed through the thread's executor.
    pub(crate) fn setup_same_thread_connection(
        output: &Arc<OutputPort>,
        input: &Arc<InputPort>,
        executor: &Arc<Executor>,
    ) {
        tracing::info!(
            "setup same-thread connection between {} -> {}",
            output.name(),
            input.name()
        );
        output.subscribe(Subscription::SameThreadQueued {
            executor: executor.clone(),
            input: input.clone(),
        });
    }

    /// Wire a cross-thread edge with the given flow-control width. The
    /// returned connection manages the edge and has to survive until the
    /// graph is torn down.
    pub(crate) fn setup_inter_thread_connection(
        output: &Arc<OutputPort>,
        input: &Arc<InputPort>,
        dest_executor: &Arc<Executor>,
        width: u32,
        services: &Arc<Services>,
    ) -> Arc<InterThreadConnection> {
        tracing::info!(
            "setup inter-thread connection between {} -> {} (width {})",
            output.name(),
            input.name(),
            width
        );
        let itc = InterThreadConnection::new(dest_executor.clone(), input.clone(), width, services);
        output.subscribe(Subscription::InterThread(itc.clone()));
        itc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterId;
    use crate::properties::PropertyCollection;
    use crate::services::Services;

    fn make_env(id: u32, name: &str) -> Arc<FilterEnvironment> {
        let env = FilterEnvironment::new(
            FilterId(id),
            name,
            "main",
            PropertyCollection::new(name),
            Arc::new(Services::new()),
        );
        env.bind_thread();
        env
    }

    #[test]
    fn test_clone_for_carries_descriptor_to_new_environment() {
        let env = make_env(0, "src");
        let port = env.add_static_output_port("out").unwrap();
        let peer = env.add_static_input_port("loop", 1, 0.0).unwrap();
        OutputPort::setup_direct_connection(&port, &peer);

        let other = make_env(1, "clone");
        let clone = port.clone_for(&other);
        assert_eq!(clone.name(), "out");
        assert!(!clone.dynamic());
        assert!(Arc::ptr_eq(&clone.base.env().unwrap(), &other));
        // Only the descriptor is cloned, not the wiring.
        assert!(clone
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty());
    }

    #[test]
    fn test_clone_preserves_dynamic_flag() {
        let env = make_env(0, "src");
        env.set_dynamic_ports_supported(false, true).unwrap();
        let port = env.add_dynamic_output_port("dout").unwrap();
        assert!(port.clone_for(&make_env(1, "clone")).dynamic());
    }
}
