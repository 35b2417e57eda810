//! Per-thread cooperative dispatcher of pending receive events.
//!
//! Each worker thread owns one `Executor`, the sole consumer of that
//! thread's pending-receive queue. Cross-thread senders append events and
//! signal a wake-up; the worker's event loop answers the wake-up with
//! `multi_step`, which dispatches a bounded batch and re-arms itself when
//! work remains so other event-loop tasks are not starved.
//!
//! Fairness and reentrancy:
//! - events are dispatched in arrival order, skipping only events whose
//!   destination filter is currently executing a step on this thread
//!   (`blocked_filters`);
//! - a filter transmitting on a same-thread edge re-enters the executor
//!   via `register_pending_rcv_sync` + `step(from_filter)`; the
//!   self-block defers the sender's own inputs until its callback
//!   returns.

use crate::connection::FlowSemaphore;
use crate::filter::FilterId;
use crate::graph::thread::ThreadEvent;
use crate::port::InputPort;
use crate::sample::Sample;
use crossbeam_channel::Sender;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// Maximum number of events one `multi_step` dispatches before yielding
/// back to the event loop.
pub(crate) const MAX_EVENTS_PER_STEP: usize = 32;

/// Wall-clock budget of one `multi_step`.
pub(crate) const STEP_DEADLINE: Duration = Duration::from_millis(100);

/// Retry bound per destination input port during `finalize`, so draining
/// terminates even if a filter keeps re-emitting into another.
pub(crate) const MAX_LOOPS_FINALIZE: u32 = 5;

/// One pending delivery to an input port on this executor's thread.
enum ReceiveEvent {
    /// Registered by a same-thread sender.
    Sync { port: Arc<InputPort>, sample: Sample },
    /// Registered by an inter-thread connection; carries its flow-control
    /// semaphore unless the connection is unbounded.
    Async {
        port: Arc<InputPort>,
        sample: Sample,
        semaphore: Option<Arc<FlowSemaphore>>,
    },
}

impl ReceiveEvent {
    fn port(&self) -> &Arc<InputPort> {
        match self {
            ReceiveEvent::Sync { port, .. } | ReceiveEvent::Async { port, .. } => port,
        }
    }

    /// Destination filter, resolved through the port's environment.
    fn dest_filter(&self) -> Option<FilterId> {
        self.port().owner_id()
    }

    fn port_key(&self) -> usize {
        Arc::as_ptr(self.port()) as usize
    }
}

struct ExecutorState {
    pending: VecDeque<ReceiveEvent>,
    /// Filters currently executing a step on this thread.
    blocked_filters: HashSet<FilterId>,
    stopped: bool,
    /// Pending wake-ups; at most one `Step` event is in flight.
    notifies_in_queue: u32,
}

/// Per-thread cooperative dispatcher. See the module documentation.
pub struct Executor {
    state: Mutex<ExecutorState>,
    /// Wake-up channel into the owning worker's event loop.
    wakeup: Sender<ThreadEvent>,
    thread: OnceLock<ThreadId>,
}

impl Executor {
    pub(crate) fn new(wakeup: Sender<ThreadEvent>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ExecutorState {
                pending: VecDeque::new(),
                blocked_filters: HashSet::new(),
                stopped: false,
                notifies_in_queue: 0,
            }),
            wakeup,
            thread: OnceLock::new(),
        })
    }

    /// Bind this executor to the calling thread. Invoked once at worker
    /// startup.
    pub(crate) fn bind_thread(&self) {
        let _ = self.thread.set(std::thread::current().id());
    }

    fn on_my_thread(&self) -> bool {
        self.thread
            .get()
            .is_some_and(|id| *id == std::thread::current().id())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ExecutorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a pending receive originated from this thread.
    pub(crate) fn register_pending_rcv_sync(&self, port: &Arc<InputPort>, sample: &Sample) {
        debug_assert!(self.on_my_thread());
        {
            let mut state = self.lock();
            if state.stopped {
                return;
            }
            state.pending.push_back(ReceiveEvent::Sync {
                port: port.clone(),
                sample: sample.clone(),
            });
        }
        self.notify();
    }

    /// Register a pending receive originated from another thread through
    /// an inter-thread connection.
    pub(crate) fn register_pending_rcv_async(
        &self,
        port: &Arc<InputPort>,
        sample: &Sample,
        semaphore: Option<&Arc<FlowSemaphore>>,
    ) {
        {
            let mut state = self.lock();
            if state.stopped {
                return;
            }
            state.pending.push_back(ReceiveEvent::Async {
                port: port.clone(),
                sample: sample.clone(),
                semaphore: semaphore.cloned(),
            });
        }
        self.notify();
    }

    /// Signal a wake-up to the owning worker unless one is already in
    /// flight.
    pub(crate) fn notify(&self) {
        let mut state = self.lock();
        if state.stopped || state.notifies_in_queue > 0 {
            return;
        }
        state.notifies_in_queue = 1;
        if self.wakeup.send(ThreadEvent::Step).is_err() {
            // Worker already gone; nothing left to wake.
            state.notifies_in_queue = 0;
        }
    }

    /// Dispatch a bounded batch of pending events: up to
    /// [`MAX_EVENTS_PER_STEP`] invocations of [`Executor::step`] or until
    /// [`STEP_DEADLINE`] elapses. Re-arms itself when work remained.
    pub(crate) fn multi_step(&self) {
        {
            let mut state = self.lock();
            state.notifies_in_queue = state.notifies_in_queue.saturating_sub(1);
            if state.stopped {
                return;
            }
        }
        let deadline = Instant::now() + STEP_DEADLINE;
        let mut dispatched = false;
        for _ in 0..MAX_EVENTS_PER_STEP {
            dispatched = self.step(None);
            if !dispatched || Instant::now() >= deadline {
                break;
            }
        }
        if dispatched {
            // Budget or deadline exhausted while the queue may still hold
            // work: reschedule instead of starving other event-loop tasks.
            self.notify();
        }
    }

    /// Pop and dispatch the first pending event whose destination filter
    /// is not blocked. `from_filter` is blocked for the duration of the
    /// call, so re-entrant same-thread deliveries cannot recurse into the
    /// filter currently executing. Returns whether an event was
    /// dispatched.
    pub(crate) fn step(&self, from_filter: Option<FilterId>) -> bool {
        debug_assert!(self.on_my_thread());
        let event = {
            let mut state = self.lock();
            if state.stopped {
                return false;
            }
            if let Some(filter) = from_filter {
                state.blocked_filters.insert(filter);
            }
            let idx = state
                .pending
                .iter()
                .position(|ev| match ev.dest_filter() {
                    Some(dest) => !state.blocked_filters.contains(&dest),
                    None => true,
                });
            idx.and_then(|i| state.pending.remove(i))
        };
        let dispatched = match event {
            Some(event) => {
                self.dispatch(event);
                true
            }
            None => false,
        };
        if let Some(filter) = from_filter {
            self.lock().blocked_filters.remove(&filter);
        }
        dispatched
    }

    /// Drain remaining events before the thread winds down. Deliveries
    /// are bounded per destination input port by [`MAX_LOOPS_FINALIZE`].
    pub(crate) fn finalize(&self) {
        debug_assert!(self.on_my_thread());
        tracing::debug!("executor finalize");
        let mut num_called: HashMap<usize, u32> = HashMap::new();
        loop {
            let event = {
                let mut state = self.lock();
                if state.stopped {
                    return;
                }
                let idx = state.pending.iter().position(|ev| {
                    let dest_free = match ev.dest_filter() {
                        Some(dest) => !state.blocked_filters.contains(&dest),
                        None => true,
                    };
                    dest_free
                        && num_called.get(&ev.port_key()).copied().unwrap_or(0) < MAX_LOOPS_FINALIZE
                });
                match idx.and_then(|i| state.pending.remove(i)) {
                    Some(ev) => ev,
                    None => break,
                }
            };
            *num_called.entry(event.port_key()).or_insert(0) += 1;
            self.dispatch(event);
        }
    }

    /// Stop the executor: pending events are discarded and further
    /// register operations are no-ops.
    pub(crate) fn clear(&self) {
        let mut state = self.lock();
        state.stopped = true;
        state.pending.clear();
        state.blocked_filters.clear();
    }

    /// Re-arm a cleared executor for a subsequent start.
    pub(crate) fn restart(&self) {
        self.lock().stopped = false;
    }

    fn dispatch(&self, event: ReceiveEvent) {
        match event {
            ReceiveEvent::Sync { port, sample } => port.receive_sync(&sample),
            ReceiveEvent::Async {
                port,
                sample,
                semaphore,
            } => port.receive_async(&sample, semaphore.as_ref(), false),
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::FilterEnvironment;
    use crate::filter::{Filter, FilterState};
    use crate::properties::PropertyCollection;
    use crate::services::Services;
    use crate::Result;
    use crossbeam_channel::unbounded;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFilter {
        hits: Arc<AtomicUsize>,
    }

    impl Filter for CountingFilter {
        fn on_port_data_changed(&mut self, _port: &Arc<InputPort>) -> Result<()> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn active_env_with_port(
        id: u32,
        hits: &Arc<AtomicUsize>,
    ) -> (Arc<FilterEnvironment>, Arc<InputPort>) {
        let services = Arc::new(Services::new());
        let props = PropertyCollection::new("test");
        let env = FilterEnvironment::new(FilterId(id), format!("f{id}"), "main", props, services);
        env.bind_thread();
        let port = env.add_static_input_port("in", 4, 0.0).unwrap();
        let hits = hits.clone();
        env.install_filter(Box::new(CountingFilter { hits }));
        env.force_state(FilterState::Active);
        (env, port)
    }

    fn sample(ts: i64) -> Sample {
        Sample::new(vec![0u8], "test", ts)
    }

    #[test]
    fn test_multi_step_batches_and_rearms() {
        let (tx, rx) = unbounded();
        let executor = Executor::new(tx);
        executor.bind_thread();
        let hits = Arc::new(AtomicUsize::new(0));
        let (_env, port) = active_env_with_port(0, &hits);

        for ts in 0..200 {
            executor.register_pending_rcv_sync(&port, &sample(ts));
        }
        assert_eq!(executor.pending_len(), 200);
        // One wake-up in flight, no matter how many events were queued.
        assert_eq!(rx.try_iter().count(), 1);

        executor.multi_step();
        assert_eq!(hits.load(Ordering::SeqCst), MAX_EVENTS_PER_STEP);
        // multi_step re-armed itself for the remaining work.
        assert_eq!(rx.try_iter().count(), 1);

        while executor.pending_len() > 0 {
            executor.multi_step();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn test_step_skips_blocked_filter() {
        let (tx, _rx) = unbounded();
        let executor = Executor::new(tx);
        executor.bind_thread();
        let hits_a = Arc::new(AtomicUsize::new(0));
        let hits_b = Arc::new(AtomicUsize::new(0));
        let (env_a, port_a) = active_env_with_port(0, &hits_a);
        let (_env_b, port_b) = active_env_with_port(1, &hits_b);

        executor.register_pending_rcv_sync(&port_a, &sample(1));
        executor.register_pending_rcv_sync(&port_b, &sample(2));

        // With filter A blocked, the older event destined to A is skipped
        // and B's event is dispatched first.
        assert!(executor.step(Some(env_a.id())));
        assert_eq!(hits_a.load(Ordering::SeqCst), 0);
        assert_eq!(hits_b.load(Ordering::SeqCst), 1);

        // Unblocked again, A's event is delivered.
        assert!(executor.step(None));
        assert_eq!(hits_a.load(Ordering::SeqCst), 1);
        assert!(!executor.step(None));
    }

    #[test]
    fn test_register_after_clear_is_dropped() {
        let (tx, _rx) = unbounded();
        let executor = Executor::new(tx);
        executor.bind_thread();
        let hits = Arc::new(AtomicUsize::new(0));
        let (_env, port) = active_env_with_port(0, &hits);

        executor.register_pending_rcv_sync(&port, &sample(1));
        executor.clear();
        assert_eq!(executor.pending_len(), 0);

        executor.register_pending_rcv_sync(&port, &sample(2));
        assert_eq!(executor.pending_len(), 0);
        assert!(!executor.step(None));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_finalize_drains_pending() {
        let (tx, _rx) = unbounded();
        let executor = Executor::new(tx);
        executor.bind_thread();
        let hits = Arc::new(AtomicUsize::new(0));
        let (_env, port) = active_env_with_port(0, &hits);

        for ts in 0..3 {
            executor.register_pending_rcv_sync(&port, &sample(ts));
        }
        executor.finalize();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(executor.pending_len(), 0);
    }

    #[test]
    fn test_finalize_bounds_reemitting_port() {
        // A filter whose callback re-registers into its own port would
        // drain forever without the per-port bound.
        struct Reemitter {
            executor: Arc<Executor>,
            port: Arc<InputPort>,
            hits: Arc<AtomicUsize>,
        }

        impl Filter for Reemitter {
            fn on_port_data_changed(&mut self, _port: &Arc<InputPort>) -> Result<()> {
                self.hits.fetch_add(1, Ordering::SeqCst);
                self.executor
                    .register_pending_rcv_sync(&self.port, &sample(0));
                Ok(())
            }
        }

        let (tx, _rx) = unbounded();
        let executor = Executor::new(tx);
        executor.bind_thread();
        let services = Arc::new(Services::new());
        let props = PropertyCollection::new("test");
        let env = FilterEnvironment::new(FilterId(7), "reemitter", "main", props, services);
        env.bind_thread();
        let port = env.add_static_input_port("in", 1, 0.0).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        env.install_filter(Box::new(Reemitter {
            executor: executor.clone(),
            port: port.clone(),
            hits: hits.clone(),
        }));
        env.force_state(FilterState::Active);

        executor.register_pending_rcv_sync(&port, &sample(0));
        executor.finalize();
        assert_eq!(hits.load(Ordering::SeqCst), MAX_LOOPS_FINALIZE as usize);
    }
}
