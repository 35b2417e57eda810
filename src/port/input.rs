//! Input ports: queueing, synchronous and asynchronous reception.
//!
//! An input port owns a bounded [`InputQueue`] and exposes two receive
//! entry points used by the framework:
//!
//! - `receive_sync` — invoked inline by a same-thread output port or the
//!   executor; pushes into the queue and notifies the filter
//!   synchronously.
//! - `receive_async` — invoked by the executor when draining an
//!   inter-thread delivery; additionally manages the flow-control
//!   semaphore, either with a fixed credit of one (static queue) or with
//!   a per-semaphore credit that tracks the effective queue depth
//!   (dynamic queue), letting the producer overrun transient consumer
//!   slow-downs.
//!
//! On the process's designated main thread, `receive_async` cooperatively
//! yields to the host event loop once per delivery so a busy graph cannot
//! starve the UI; receives arriving during that yield are buffered in a
//! thread-local list and drained afterwards in FIFO order.

use crate::connection::FlowSemaphore;
use crate::environment::FilterEnvironment;
use crate::filter::FilterState;
use crate::port::{InputQueue, PortBase};
use crate::sample::Sample;
use crate::services::LogLevel;
use crate::Result;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

thread_local! {
    /// Set while the cooperative yield processes host events on this thread.
    static PROCESS_EVENTS_RUNNING: Cell<bool> = const { Cell::new(false) };
    /// Receives that arrived while the cooperative yield was running.
    static PENDING_RECEIVES: RefCell<PendingList> = const { RefCell::new(VecDeque::new()) };
}

type PendingList = VecDeque<(Arc<InputPort>, Sample, Option<Arc<FlowSemaphore>>)>;

/// Typed input endpoint of a filter, owning the sample queue.
pub struct InputPort {
    base: PortBase,
    queue: Mutex<InputQueue>,
    interthread_dynamic_queue: AtomicBool,
    /// Per-semaphore credit for the dynamic queue mode, keyed by the
    /// semaphore's address.
    semaphore_credit: Mutex<HashMap<usize, u32>>,
    /// Cached "{filter}/{port}" name for the profiling service.
    profile_name: OnceLock<String>,
}

impl InputPort {
    pub(crate) fn new(
        dynamic: bool,
        name: impl Into<String>,
        env: &Arc<FilterEnvironment>,
        max_samples: usize,
        max_seconds: f64,
    ) -> Arc<Self> {
        let (queue, forced) = InputQueue::new(max_samples, max_seconds);
        let port = Arc::new(Self {
            base: PortBase::new(dynamic, name, Arc::downgrade(env)),
            queue: Mutex::new(queue),
            interthread_dynamic_queue: AtomicBool::new(false),
            semaphore_credit: Mutex::new(HashMap::new()),
            profile_name: OnceLock::new(),
        });
        if forced {
            port.warn_forced_queue(env);
        }
        port
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn dynamic(&self) -> bool {
        self.base.dynamic()
    }

    /// Id of the owning filter, if the environment is still alive.
    pub(crate) fn owner_id(&self) -> Option<crate::filter::FilterId> {
        self.base.env().ok().map(|env| env.id())
    }

    /// Return a buffered sample. Must be called on the owning thread,
    /// typically from inside `on_port_data_changed`. Exactly one of the
    /// two delays must be given: `delay_samples` indexes from the newest
    /// sample, `delay_seconds` selects the newest sample at least that
    /// much older than the queue head.
    pub fn get_data(
        &self,
        delay_samples: Option<usize>,
        delay_seconds: Option<f64>,
    ) -> Result<Sample> {
        let env = self.base.env()?;
        env.assert_my_thread("InputPort::get_data")?;
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(delay_samples, delay_seconds)
    }

    /// Number of samples currently buffered.
    pub fn queue_len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Replace the queue bounds. `max_samples == 0` and
    /// `max_seconds <= 0.0` disable the respective bound; disabling both
    /// falls back to a one-sample queue with a warning.
    pub fn set_queue_size(&self, max_samples: usize, max_seconds: f64) {
        let forced = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_bounds(max_samples, max_seconds);
        if forced {
            if let Ok(env) = self.base.env() {
                self.warn_forced_queue(&env);
            }
        }
    }

    pub fn queue_size_samples(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .max_samples()
    }

    pub fn queue_size_seconds(&self) -> f64 {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .max_seconds()
    }

    /// Enable or disable dynamic queueing for inter-thread connections to
    /// this port. Only accepted while the filter is in `Constructing`,
    /// `Constructed`, `Initializing` or `Initialized`; later writes are
    /// refused and logged. Same-thread connections are unaffected.
    pub fn set_interthread_dynamic_queue(&self, enabled: bool) {
        if enabled == self.interthread_dynamic_queue.load(Ordering::Relaxed) {
            return;
        }
        let Ok(env) = self.base.env() else {
            return;
        };
        let state = env.state();
        match state {
            FilterState::Constructing
            | FilterState::Constructed
            | FilterState::Initializing
            | FilterState::Initialized => {
                self.interthread_dynamic_queue
                    .store(enabled, Ordering::Relaxed);
            }
            _ => env.services().log(
                LogLevel::Error,
                &format!(
                    "cannot change the interthread dynamic queue setting of port '{}' in state {}",
                    self.name(),
                    state
                ),
                file!(),
                line!(),
            ),
        }
    }

    pub fn interthread_dynamic_queue(&self) -> bool {
        self.interthread_dynamic_queue.load(Ordering::Relaxed)
    }

    /// Return a copy of this port attached to a new environment.
    pub fn clone_for(&self, env: &Arc<FilterEnvironment>) -> Arc<InputPort> {
        let (max_samples, max_seconds) = {
            let q = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            (q.max_samples(), q.max_seconds())
        };
        InputPort::new(self.dynamic(), self.name(), env, max_samples, max_seconds)
    }

    // ── Framework entry points ──

    /// Synchronous reception from a same-thread output port.
    pub(crate) fn receive_sync(self: &Arc<Self>, sample: &Sample) {
        let Ok(env) = self.base.env() else {
            tracing::error!("receive_sync on port '{}' without environment", self.name());
            return;
        };
        if let Err(e) = env.assert_my_thread("InputPort::receive_sync") {
            env.services()
                .log(LogLevel::Error, &e.to_string(), file!(), line!());
            return;
        }
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sample.clone());
        self.dispatch_data_changed(&env);
    }

    /// Asynchronous reception, invoked by the executor when draining an
    /// inter-thread delivery. `semaphore` is the flow-control semaphore of
    /// the originating connection (absent for unbounded connections);
    /// `is_pending` marks re-deliveries from the main-thread yield buffer.
    pub(crate) fn receive_async(
        self: &Arc<Self>,
        sample: &Sample,
        semaphore: Option<&Arc<FlowSemaphore>>,
        is_pending: bool,
    ) {
        let Ok(env) = self.base.env() else {
            tracing::error!("receive_async on port '{}' without environment", self.name());
            return;
        };
        if let Err(e) = env.assert_my_thread("InputPort::receive_async") {
            env.services()
                .log(LogLevel::Error, &e.to_string(), file!(), line!());
            return;
        }
        let services = env.services();
        if !is_pending && services.is_main_thread() {
            if PROCESS_EVENTS_RUNNING.get() {
                // A cooperative yield is running further down this stack;
                // buffer and let the yielding call deliver us afterwards.
                PENDING_RECEIVES.with_borrow_mut(|pending| {
                    pending.push_back((self.clone(), sample.clone(), semaphore.cloned()));
                });
                return;
            }
            PROCESS_EVENTS_RUNNING.set(true);
            services.process_host_events();
            PROCESS_EVENTS_RUNNING.set(false);
        }
        self.receive(&env, sample, semaphore);
        if !is_pending {
            loop {
                let next = PENDING_RECEIVES.with_borrow_mut(VecDeque::pop_front);
                match next {
                    Some((port, sample, sem)) => port.receive_async(&sample, sem.as_ref(), true),
                    None => break,
                }
            }
        }
    }

    fn receive(
        self: &Arc<Self>,
        env: &Arc<FilterEnvironment>,
        sample: &Sample,
        semaphore: Option<&Arc<FlowSemaphore>>,
    ) {
        let queue_len = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.push(sample.clone());
            queue.len()
        };
        match semaphore {
            // Unbounded connection: no tokens to return.
            None => {}
            Some(sem) if !self.interthread_dynamic_queue() => sem.release(1),
            Some(sem) => {
                let mut credits = self
                    .semaphore_credit
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let credit = credits.entry(Arc::as_ptr(sem) as usize).or_insert(1);
                let delta = *credit as i64 - queue_len as i64;
                if delta <= 0 {
                    // The queue has grown relative to the credit: open
                    // matching credit to the sender.
                    sem.release((1 - delta) as usize);
                    *credit += (-delta) as u32;
                } else {
                    // The queue shrank relative to the credit. The permit
                    // for this delivery is already held by the sender.
                    *credit -= 1;
                    for _ in 1..delta {
                        if sem.try_acquire() {
                            *credit -= 1;
                        } else {
                            break;
                        }
                    }
                }
                tracing::trace!(
                    port = self.name(),
                    delta,
                    credit = *credit,
                    "dynamic queue credit updated"
                );
            }
        }
        self.dispatch_data_changed(env);
    }

    /// Notify the owning filter, bracketed by the profiling service when
    /// one is installed.
    fn dispatch_data_changed(self: &Arc<Self>, env: &Arc<FilterEnvironment>) {
        match env.services().profiling() {
            Some(profiling) => {
                let name = self
                    .profile_name
                    .get_or_init(|| format!("{}/{}", env.name(), self.name()));
                profiling.before_port_data_changed(name);
                env.port_data_changed(self);
                profiling.after_port_data_changed(name);
            }
            None => env.port_data_changed(self),
        }
    }

    fn warn_forced_queue(&self, env: &Arc<FilterEnvironment>) {
        env.services().log(
            LogLevel::Warn,
            &format!(
                "infinite buffering used for port '{}'; using a one sample sized queue instead",
                self.name()
            ),
            file!(),
            line!(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterId;
    use crate::properties::PropertyCollection;
    use crate::services::{HostEventHook, Services};

    fn make_env(services: Arc<Services>) -> Arc<FilterEnvironment> {
        let env = FilterEnvironment::new(
            FilterId(0),
            "test",
            "main",
            PropertyCollection::new("test"),
            services,
        );
        env.bind_thread();
        env
    }

    fn make_clone_target() -> Arc<FilterEnvironment> {
        let env = FilterEnvironment::new(
            FilterId(1),
            "clone",
            "main",
            PropertyCollection::new("clone"),
            Arc::new(Services::new()),
        );
        env.bind_thread();
        env
    }

    fn sample(ts: i64) -> Sample {
        Sample::new(vec![0u8], "test", ts)
    }

    #[test]
    fn test_clone_for_carries_descriptor_to_new_environment() {
        let env = make_env(Arc::new(Services::new()));
        let port = env.add_static_input_port("in", 3, 0.5).unwrap();
        port.set_interthread_dynamic_queue(true);
        env.force_state(FilterState::Active);
        port.receive_sync(&sample(1));

        let other = make_clone_target();
        let clone = port.clone_for(&other);
        assert_eq!(clone.name(), "in");
        assert!(!clone.dynamic());
        assert_eq!(clone.queue_size_samples(), 3);
        assert_eq!(clone.queue_size_seconds(), 0.5);
        assert_eq!(clone.owner_id(), Some(FilterId(1)));
        // Only the descriptor is cloned: the queue starts empty and the
        // dynamic queue setting is back at its default.
        assert_eq!(clone.queue_len(), 0);
        assert!(!clone.interthread_dynamic_queue());
    }

    #[test]
    fn test_clone_preserves_dynamic_flag() {
        let env = make_env(Arc::new(Services::new()));
        env.set_dynamic_ports_supported(true, false).unwrap();
        let port = env.add_dynamic_input_port("din", 2, 0.0).unwrap();
        assert!(port.clone_for(&make_clone_target()).dynamic());
    }

    #[test]
    fn test_dynamic_queue_credit_tracks_queue_depth() {
        let env = make_env(Arc::new(Services::new()));
        let port = env.add_static_input_port("in", 4, 0.0).unwrap();
        port.set_interthread_dynamic_queue(true);
        env.force_state(FilterState::Active);
        let sem = Arc::new(FlowSemaphore::new(1));

        // The sender credit opens up to the queue depth as the queue
        // fills, then stays in lock-step with it.
        for (ts, expected_permits) in [(1, 1), (2, 2), (3, 3), (4, 4), (5, 4)] {
            assert!(sem.try_acquire(), "sender starved at ts {ts}");
            port.receive_async(&sample(ts), Some(&sem), false);
            assert_eq!(sem.available_permits(), expected_permits);
        }
        assert_eq!(port.queue_len(), 4);

        // Shrinking the queue pulls the credit back in.
        port.set_queue_size(2, 0.0);
        assert!(sem.try_acquire());
        port.receive_async(&sample(6), Some(&sem), false);
        assert_eq!(port.queue_len(), 2);
        assert_eq!(sem.available_permits(), 2);
    }

    #[test]
    fn test_static_queue_releases_one_permit_per_delivery() {
        let env = make_env(Arc::new(Services::new()));
        let port = env.add_static_input_port("in", 4, 0.0).unwrap();
        env.force_state(FilterState::Active);
        let sem = Arc::new(FlowSemaphore::new(1));

        for ts in 1..=5 {
            assert!(sem.try_acquire());
            port.receive_async(&sample(ts), Some(&sem), false);
            assert_eq!(sem.available_permits(), 1);
        }
    }

    #[test]
    fn test_dynamic_queue_setting_window() {
        let env = make_env(Arc::new(Services::new()));
        let port = env.add_static_input_port("in", 1, 0.0).unwrap();
        env.force_state(FilterState::Active);
        // Refused outside the configuration window.
        port.set_interthread_dynamic_queue(true);
        assert!(!port.interthread_dynamic_queue());

        env.force_state(FilterState::Initialized);
        port.set_interthread_dynamic_queue(true);
        assert!(port.interthread_dynamic_queue());
    }

    struct ReentrantHook {
        port: Mutex<Option<Arc<InputPort>>>,
        sem: Arc<FlowSemaphore>,
    }

    impl HostEventHook for ReentrantHook {
        fn process_events(&self) {
            // A receive arriving while the yield runs must be buffered,
            // not delivered inline.
            if let Some(port) = self
                .port
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                port.receive_async(&sample(99), Some(&self.sem), false);
                assert_eq!(port.queue_len(), 0);
            }
        }
    }

    #[test]
    fn test_main_thread_yield_buffers_reentrant_receives() {
        let services = Arc::new(Services::new());
        services.register_main_thread();
        let env = make_env(services.clone());
        let port = env.add_static_input_port("in", 4, 0.0).unwrap();
        env.force_state(FilterState::Active);
        let sem = Arc::new(FlowSemaphore::new(2));

        services.install_host_event_hook(Box::new(ReentrantHook {
            port: Mutex::new(Some(port.clone())),
            sem: sem.clone(),
        }));

        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        port.receive_async(&sample(1), Some(&sem), false);

        // Both the outer sample and the one buffered during the yield
        // arrived, in FIFO order.
        assert_eq!(port.queue_len(), 2);
        assert_eq!(port.get_data(Some(0), None).unwrap().timestamp(), 99);
        assert_eq!(port.get_data(Some(1), None).unwrap().timestamp(), 1);
        assert_eq!(sem.available_permits(), 2);
    }
}
