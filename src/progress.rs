//! Streaming progress accounting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use proxmox_human_byte::HumanByte;

/// Byte counters shared between the archive reader and the device writers.
#[derive(Default)]
pub struct Counters {
    read: AtomicU64,
    written: AtomicU64,
}

impl Counters {
    pub fn add_read(&self, bytes: u64) {
        self.read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_written(&self, bytes: u64) {
        self.written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

/// Snapshot handed to progress sinks and rendered into the default log line.
#[derive(Debug)]
pub struct ExtractProgress {
    pub elapsed: Duration,
    pub read_bytes: u64,
    pub written_bytes: u64,
    /// Archive length; the percentage is relative to this.
    pub total_bytes: u64,
    /// Read rate since the previous emission.
    pub rate: u64,
}

impl ExtractProgress {
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            1.0
        } else {
            self.read_bytes as f64 / self.total_bytes as f64
        }
    }
}

impl std::fmt::Display for ExtractProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.2}% ({} read, {} written, {}/s)",
            self.percentage() * 100.0,
            HumanByte::from(self.read_bytes),
            HumanByte::from(self.written_bytes),
            HumanByte::from(self.rate),
        )
    }
}

pub type ProgressSink = Box<dyn Fn(&ExtractProgress) + Send>;

/// Emits at most one progress line per wall-clock second.
///
/// Only the extractor thread polls this, so emission is single-writer and
/// lines never interleave. Workers merely bump the shared [`Counters`].
pub struct ProgressReporter {
    counters: Arc<Counters>,
    total: u64,
    start: Instant,
    last_emit: Instant,
    last_read: u64,
    sink: Option<ProgressSink>,
}

impl ProgressReporter {
    pub fn new(counters: Arc<Counters>, total: u64, sink: Option<ProgressSink>) -> Self {
        let now = Instant::now();
        Self {
            counters,
            total,
            start: now,
            last_emit: now,
            last_read: 0,
            sink,
        }
    }

    /// Emit a line when at least a second passed since the last one.
    pub fn tick(&mut self) {
        if self.last_emit.elapsed() < Duration::from_secs(1) {
            return;
        }
        self.emit();
    }

    /// Unconditional final line.
    pub fn finish(&mut self) {
        self.emit();
    }

    fn emit(&mut self) {
        let read = self.counters.read();
        let since_last = self.last_emit.elapsed().as_secs_f64();
        let rate = if since_last > 0.0 {
            (read.saturating_sub(self.last_read) as f64 / since_last) as u64
        } else {
            0
        };
        let progress = ExtractProgress {
            elapsed: self.start.elapsed(),
            read_bytes: read,
            written_bytes: self.counters.written(),
            total_bytes: self.total,
            rate,
        };
        self.last_emit = Instant::now();
        self.last_read = read;

        match &self.sink {
            Some(sink) => sink(&progress),
            None => log::info!("progress: {}", progress),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_percentage() {
        let progress = ExtractProgress {
            elapsed: Duration::from_secs(2),
            read_bytes: 512,
            written_bytes: 0,
            total_bytes: 2048,
            rate: 256,
        };
        assert!((progress.percentage() - 0.25).abs() < f64::EPSILON);

        let rendered = progress.to_string();
        assert!(rendered.starts_with("25.00%"), "got {:?}", rendered);
    }

    #[test]
    fn test_empty_archive_is_complete() {
        let progress = ExtractProgress {
            elapsed: Duration::ZERO,
            read_bytes: 0,
            written_bytes: 0,
            total_bytes: 0,
            rate: 0,
        };
        assert_eq!(progress.percentage(), 1.0);
    }

    #[test]
    fn test_sink_receives_final_line() {
        let (tx, rx) = std::sync::mpsc::channel();
        let counters = Arc::new(Counters::default());
        counters.add_read(100);

        let sink: ProgressSink = Box::new(move |progress| {
            tx.send(progress.read_bytes).unwrap();
        });
        let mut reporter = ProgressReporter::new(counters, 100, Some(sink));
        reporter.finish();

        assert_eq!(rx.try_recv().unwrap(), 100);
    }
}
