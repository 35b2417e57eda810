//! Flow-controlled inter-thread connections.
//!
//! An [`InterThreadConnection`] is the edge between an output port on one
//! thread and an input port on another. It lives on the sender's thread
//! and applies back-pressure through a counting semaphore: a connection of
//! width `W >= 1` never has more than `W` samples in flight, a width of 0
//! is unbounded and non-blocking. Samples handed to a stopped connection
//! are dropped with a warning; a stopped connection may be restarted.

use crate::executor::Executor;
use crate::port::InputPort;
use crate::sample::Sample;
use crate::services::{LogLevel, Services};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// How long a sender waits for a permit before re-checking the stopped
/// flag.
pub(crate) const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);

/// Counting semaphore used for connection flow control.
///
/// Unlike a bounded channel, the permit count may grow past its initial
/// value — the dynamic queue mode releases extra credit to let the
/// producer overrun transient consumer slow-downs.
pub struct FlowSemaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl FlowSemaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Add `n` permits and wake blocked acquirers.
    pub fn release(&self, n: usize) {
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        *permits += n;
        if n == 1 {
            self.available.notify_one();
        } else {
            self.available.notify_all();
        }
    }

    /// Take one permit without blocking. Returns whether one was taken.
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        if *permits > 0 {
            *permits -= 1;
            true
        } else {
            false
        }
    }

    /// Take one permit, blocking up to `timeout`. Returns whether one was
    /// taken.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *permits > 0 {
                *permits -= 1;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _timeout_result) = self
                .available
                .wait_timeout(permits, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            permits = guard;
        }
    }

    /// Number of permits currently available.
    pub fn available_permits(&self) -> usize {
        *self.permits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Flow-controlled edge between an output port on one thread and an input
/// port on another.
pub struct InterThreadConnection {
    dest_executor: Arc<Executor>,
    dest_port: Arc<InputPort>,
    width: u32,
    semaphore: Option<Arc<FlowSemaphore>>,
    stopped: AtomicBool,
    services: Arc<Services>,
}

impl InterThreadConnection {
    /// Create a connection of the given width. `width == 0` means
    /// unbounded and non-blocking. Connections start in stopped mode; the
    /// orchestrator un-stops them when the graph starts.
    pub(crate) fn new(
        dest_executor: Arc<Executor>,
        dest_port: Arc<InputPort>,
        width: u32,
        services: &Arc<Services>,
    ) -> Arc<Self> {
        Arc::new(Self {
            dest_executor,
            dest_port,
            width,
            semaphore: (width > 0).then(|| Arc::new(FlowSemaphore::new(width as usize))),
            stopped: AtomicBool::new(true),
            services: services.clone(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    /// When stopped, pending and future samples are dropped with a
    /// warning and senders never block. Thread safe, callable from any
    /// thread.
    pub fn set_stopped(&self, stopped: bool) {
        self.stopped.store(stopped, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Receive a sample on the sender's thread and queue it to the
    /// destination thread's executor, applying back-pressure. Retries the
    /// permit acquisition until the connection is stopped.
    pub(crate) fn receive_sample(&self, sample: &Sample) {
        loop {
            if self.is_stopped() {
                self.services.log(
                    LogLevel::Warn,
                    &format!(
                        "inter-thread connection to port '{}' is stopped; data sample discarded",
                        self.dest_port.name()
                    ),
                    file!(),
                    line!(),
                );
                return;
            }
            match &self.semaphore {
                None => {
                    self.dest_executor
                        .register_pending_rcv_async(&self.dest_port, sample, None);
                    return;
                }
                Some(semaphore) => {
                    if semaphore.acquire_timeout(ACQUIRE_TIMEOUT) {
                        self.dest_executor.register_pending_rcv_async(
                            &self.dest_port,
                            sample,
                            Some(semaphore),
                        );
                        return;
                    }
                }
            }
        }
    }
}
