//! Process-wide leveled logger built on the `log` facade.
//!
//! A single background thread drains a lock-free queue of formatted records
//! and hands them to a [`Sink`]. Error-level records and anything logged
//! while a panic is unwinding are flushed synchronously instead, so nothing
//! observed during a crash is lost in the queue.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

const ASYNC_FLUSH_QD_LINES_THRESHOLD: usize = 100_000;
const SYNC_FLUSH_QD_LINES_THRESHOLD: usize = 10 * ASYNC_FLUSH_QD_LINES_THRESHOLD;
const MIN_FLUSH_FREQUENCY: Duration = Duration::from_secs(10);

/// A single formatted line handed to a [`Sink`].
pub struct LogLine {
    pub level: Level,
    pub text: String,
}

/// Destination for formatted log lines. The default sink writes to stdout
/// (and mirrors `Error` lines to stderr); tests install a [`BufferSink`]
/// instead of touching the process-wide logger.
pub trait Sink: Send + Sync {
    fn write_line(&self, line: &LogLine);
    fn flush(&self) {}
}

pub struct StdioSink {
    mirror_errors_to_stderr: bool,
}

impl Sink for StdioSink {
    fn write_line(&self, line: &LogLine) {
        println!("{}", line.text);
        if self.mirror_errors_to_stderr && line.level == Level::Error {
            eprintln!("{}", line.text);
        }
    }
}

/// In-memory sink for tests. Never installed as the process logger.
#[derive(Default)]
pub struct BufferSink {
    lines: Mutex<Vec<String>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl Sink for BufferSink {
    fn write_line(&self, line: &LogLine) {
        self.lines.lock().unwrap().push(line.text.clone());
    }
}

struct ReactorLogger {
    queue: ArrayQueue<LogLine>,
    sink: Mutex<Box<dyn Sink>>,
    flush_each_line: AtomicBool,
    dropped: AtomicUsize,
}

impl ReactorLogger {
    fn new(sink: Box<dyn Sink>, flush_each_line: bool) -> Self {
        Self {
            queue: ArrayQueue::new(SYNC_FLUSH_QD_LINES_THRESHOLD),
            sink: Mutex::new(sink),
            flush_each_line: AtomicBool::new(flush_each_line),
            dropped: AtomicUsize::new(0),
        }
    }

    fn enqueue(&self, line: LogLine) {
        let level = line.level;
        if self.flush_each_line.load(Ordering::Relaxed)
            || level == Level::Error
            || self.queue.len() >= SYNC_FLUSH_QD_LINES_THRESHOLD
        {
            self.sink.lock().unwrap().write_line(&line);
            return;
        }
        if self.queue.push(line).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn drain_once(&self) {
        let sink = self.sink.lock().unwrap();
        while let Some(line) = self.queue.pop() {
            sink.write_line(&line);
        }
        sink.flush();
    }
}

impl Log for ReactorLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !log::logger().enabled(record.metadata()) {
            return;
        }
        let mut text = String::new();
        let _ = write!(
            text,
            "{:?} [{}] [{}:{}] {}",
            Instant::now(),
            record.level(),
            record.file().unwrap_or("?"),
            record.line().unwrap_or(0),
            record.args(),
        );
        self.enqueue(LogLine {
            level: record.level(),
            text,
        });
    }

    fn flush(&self) {
        self.drain_once();
    }
}

static LOGGER: OnceLock<ReactorLogger> = OnceLock::new();

fn logger() -> &'static ReactorLogger {
    LOGGER
        .get()
        .expect("reactor_logger::init was never called")
}

/// Installs the process-wide logger, spawns its background flush thread, and
/// installs a panic hook that flushes synchronously before unwinding.
///
/// Safe to call only once; subsequent calls return `Err` from
/// [`log::set_logger`].
pub fn init(max_level: LevelFilter, flush_each_line: bool) -> Result<(), SetLoggerError> {
    init_with_sink(Box::new(StdioSink {
        mirror_errors_to_stderr: true,
    }), max_level, flush_each_line)
}

pub fn init_with_sink(
    sink: Box<dyn Sink>,
    max_level: LevelFilter,
    flush_each_line: bool,
) -> Result<(), SetLoggerError> {
    let _ = LOGGER.set(ReactorLogger::new(sink, flush_each_line));
    log::set_logger(logger())?;
    log::set_max_level(max_level);

    std::thread::Builder::new()
        .name("reactor-logger".into())
        .spawn(|| loop {
            std::thread::sleep(MIN_FLUSH_FREQUENCY);
            logger().drain_once();
        })
        .expect("failed to spawn reactor-logger flush thread");

    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if let Some(l) = LOGGER.get() {
            l.drain_once();
        }
        prev_hook(info);
    }));

    Ok(())
}
