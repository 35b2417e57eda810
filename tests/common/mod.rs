//! Shared test filters and helpers for the integration tests.

use crossbeam_channel::Sender;
use flowgraph_rs::{
    Filter, FilterEnvironment, FlowgraphError, InputPort, LogLevel, LogSink, OutputPort, Result,
    Sample,
};
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

pub fn init_tracing() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .init();
    });
}

/// Source filter with a single output port, driven from the outside via
/// `ActiveGraph::invoke`.
pub struct EmitSource {
    pub out: Arc<OutputPort>,
}

impl Filter for EmitSource {}

pub fn make_emit_source(env: &Arc<FilterEnvironment>) -> Result<Box<dyn Filter>> {
    env.set_dynamic_ports_supported(false, false)?;
    Ok(Box::new(EmitSource {
        out: env.add_static_output_port("out")?,
    }))
}

/// Queue an `invoke` that emits one sample per timestamp on the source's
/// output port.
pub fn emit(graph: &flowgraph_rs::ActiveGraph, filter: &str, timestamps: Vec<i64>) {
    graph
        .invoke(filter, move |f, _env| {
            let src = (f as &mut dyn Any)
                .downcast_mut::<EmitSource>()
                .expect("filter is not an EmitSource");
            for ts in timestamps {
                src.out
                    .transmit(&Sample::new(ts.to_le_bytes().to_vec(), "test/ts", ts))
                    .expect("transmit failed");
            }
        })
        .expect("invoke failed");
}

/// What a `Recorder` observed in one callback.
#[derive(Debug, Clone)]
pub struct Received {
    pub timestamp: i64,
    pub queue_len: usize,
}

/// Sink filter reporting each callback through a channel, optionally
/// sleeping per sample or failing on the n-th one.
pub struct Recorder {
    #[allow(dead_code)]
    input: Arc<InputPort>,
    tx: Sender<Received>,
    sleep: Duration,
    fail_on: Option<usize>,
    seen: usize,
}

impl Filter for Recorder {
    fn on_port_data_changed(&mut self, port: &Arc<InputPort>) -> Result<()> {
        self.seen += 1;
        let head = port.get_data(Some(0), None)?;
        let _ = self.tx.send(Received {
            timestamp: head.timestamp(),
            queue_len: port.queue_len(),
        });
        if self.fail_on == Some(self.seen) {
            return Err(FlowgraphError::Filter("intentional test failure".into()));
        }
        if !self.sleep.is_zero() {
            std::thread::sleep(self.sleep);
        }
        Ok(())
    }
}

/// Configuration of a [`Recorder`] factory.
pub struct RecorderSpec {
    pub tx: Sender<Received>,
    pub max_samples: usize,
    pub max_seconds: f64,
    pub sleep: Duration,
    pub fail_on: Option<usize>,
    pub dynamic_queue: bool,
}

impl RecorderSpec {
    pub fn new(tx: Sender<Received>) -> Self {
        Self {
            tx,
            max_samples: 1,
            max_seconds: 0.0,
            sleep: Duration::ZERO,
            fail_on: None,
            dynamic_queue: false,
        }
    }

    pub fn factory(
        self,
    ) -> impl Fn(&Arc<FilterEnvironment>) -> Result<Box<dyn Filter>> + Send + Sync + 'static {
        move |env| {
            env.set_dynamic_ports_supported(false, false)?;
            let input = env.add_static_input_port("in", self.max_samples, self.max_seconds)?;
            if self.dynamic_queue {
                input.set_interthread_dynamic_queue(true);
            }
            Ok(Box::new(Recorder {
                input,
                tx: self.tx.clone(),
                sleep: self.sleep,
                fail_on: self.fail_on,
                seen: 0,
            }))
        }
    }
}

/// Log sink counting records at Error and above.
pub struct ErrorCountingSink {
    pub errors: Arc<AtomicUsize>,
}

impl LogSink for ErrorCountingSink {
    fn log(&self, level: LogLevel, msg: &str, file: &str, line: u32) {
        if level >= LogLevel::Error {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        if level >= LogLevel::Warn {
            eprintln!("[{}] {}:{}: {}", level.as_str(), file, line, msg);
        }
    }
}
