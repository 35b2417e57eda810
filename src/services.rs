//! Injected runtime collaborators: logging sink, profiling hook, host
//! event processing.
//!
//! There are no global service singletons; a [`Services`] instance is
//! created once at boot and handed to the graph builder.

use serde::{Deserialize, Serialize};
use std::sync::{OnceLock, PoisonError, RwLock};
use std::thread::ThreadId;

/// Log levels of the host-facing logging service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Internal = 5,
    Debug = 10,
    Info = 20,
    Warn = 30,
    Error = 40,
    Critical = 50,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Internal => "INTERNAL",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

/// Sink receiving runtime log records.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, msg: &str, file: &str, line: u32);
}

/// Optional profiling service bracketing each `on_port_data_changed`
/// invocation. `name` is `"{filter}/{port}"`, computed once per port.
pub trait Profiling: Send + Sync {
    fn before_port_data_changed(&self, name: &str);
    fn after_port_data_changed(&self, name: &str);
}

/// Host hook processing pending platform events once, used by the
/// main-thread cooperative yield. On non-GUI deployments no hook is
/// installed and the yield branch is a no-op.
pub trait HostEventHook: Send + Sync {
    fn process_events(&self);
}

/// Collection of injected collaborators, created once at boot.
#[derive(Default)]
pub struct Services {
    log_sink: RwLock<Option<Box<dyn LogSink>>>,
    profiling: RwLock<Option<std::sync::Arc<dyn Profiling>>>,
    host_events: RwLock<Option<Box<dyn HostEventHook>>>,
    main_thread: OnceLock<ThreadId>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install_log_sink(&self, sink: Box<dyn LogSink>) {
        *self
            .log_sink
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    pub fn install_profiling(&self, profiling: std::sync::Arc<dyn Profiling>) {
        *self
            .profiling
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(profiling);
    }

    pub fn install_host_event_hook(&self, hook: Box<dyn HostEventHook>) {
        *self
            .host_events
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub fn profiling(&self) -> Option<std::sync::Arc<dyn Profiling>> {
        self.profiling
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Emit a log record through the installed sink. Without a sink,
    /// records at `Info` and above go to standard error.
    pub fn log(&self, level: LogLevel, msg: &str, file: &str, line: u32) {
        let sink = self.log_sink.read().unwrap_or_else(PoisonError::into_inner);
        match sink.as_ref() {
            Some(sink) => sink.log(level, msg, file, line),
            None => {
                if level >= LogLevel::Info {
                    eprintln!("[{}] {}:{}: {}", level.as_str(), file, line, msg);
                }
            }
        }
    }

    /// Mark the calling thread as the designated main thread.
    pub(crate) fn register_main_thread(&self) {
        let _ = self.main_thread.set(std::thread::current().id());
    }

    pub(crate) fn is_main_thread(&self) -> bool {
        self.main_thread
            .get()
            .is_some_and(|id| *id == std::thread::current().id())
    }

    /// Run the host event hook once. Returns whether a hook was installed.
    pub(crate) fn process_host_events(&self) -> bool {
        let hook = self
            .host_events
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match hook.as_ref() {
            Some(hook) => {
                hook.process_events();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink(Arc<AtomicUsize>);

    impl LogSink for CountingSink {
        fn log(&self, _level: LogLevel, _msg: &str, _file: &str, _line: u32) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Internal < LogLevel::Debug);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Critical);
    }

    #[test]
    fn test_sink_receives_records() {
        let count = Arc::new(AtomicUsize::new(0));
        let services = Services::new();
        services.install_log_sink(Box::new(CountingSink(count.clone())));
        services.log(LogLevel::Internal, "low level", file!(), line!());
        services.log(LogLevel::Error, "boom", file!(), line!());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_main_thread_registration() {
        let services = Services::new();
        assert!(!services.is_main_thread());
        services.register_main_thread();
        assert!(services.is_main_thread());
        std::thread::scope(|s| {
            s.spawn(|| assert!(!services.is_main_thread()));
        });
    }
}
