//! Opt-in span profiler with a wait/warmup/active schedule.
//!
//! Spans are only recorded during active steps. When an active window ends,
//! its spans are written as one Chrome trace-event JSON file (open with
//! `chrome://tracing` or Perfetto). [`Profiler::stop`] flushes a window that
//! was cut short.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use serde::Serialize;
use tracing::info;

/// What a recorded span measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Span {
    Iteration,
    Evaluate,
    DataWait,
    Forward,
    Backward,
    GradSync,
    Optimizer,
}

impl Span {
    pub fn as_str(&self) -> &'static str {
        match self {
            Span::Iteration => "iteration",
            Span::Evaluate => "evaluate",
            Span::DataWait => "data_wait",
            Span::Forward => "forward",
            Span::Backward => "backward",
            Span::GradSync => "grad_sync",
            Span::Optimizer => "optimizer",
        }
    }
}

/// Which steps are skipped, warmed up and recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileSchedule {
    pub wait: usize,
    pub warmup: usize,
    pub active: usize,
    /// Number of cycles; 0 repeats forever.
    pub repeat: usize,
}

impl Default for ProfileSchedule {
    fn default() -> Self {
        Self {
            wait: 1,
            warmup: 1,
            active: 3,
            repeat: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Wait,
    Warmup,
    Active,
    Done,
}

impl ProfileSchedule {
    fn cycle_len(&self) -> usize {
        self.wait + self.warmup + self.active
    }

    pub fn phase(&self, step: usize) -> Phase {
        let cycle = self.cycle_len();
        if cycle == 0 || (self.repeat > 0 && step >= cycle * self.repeat) {
            return Phase::Done;
        }
        let pos = step % cycle;
        if pos < self.wait {
            Phase::Wait
        } else if pos < self.wait + self.warmup {
            Phase::Warmup
        } else {
            Phase::Active
        }
    }

    /// True on the last active step of a cycle.
    fn ends_cycle(&self, step: usize) -> bool {
        self.phase(step) == Phase::Active && step % self.cycle_len() == self.cycle_len() - 1
    }
}

#[derive(Serialize)]
struct TraceEvent {
    name: &'static str,
    cat: &'static str,
    ph: &'static str,
    ts: f64,
    dur: f64,
    pid: usize,
    tid: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TraceFile<'a> {
    trace_events: &'a [TraceEvent],
    display_time_unit: &'static str,
}

pub struct Profiler {
    enabled: bool,
    schedule: ProfileSchedule,
    step: usize,
    cycle: usize,
    origin: Instant,
    rank: usize,
    dir: PathBuf,
    events: Vec<TraceEvent>,
    written: Vec<PathBuf>,
}

impl Profiler {
    /// A profiler that records nothing.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            schedule: ProfileSchedule::default(),
            step: 0,
            cycle: 0,
            origin: Instant::now(),
            rank: 0,
            dir: PathBuf::new(),
            events: Vec::new(),
            written: Vec::new(),
        }
    }

    pub fn new(dir: impl Into<PathBuf>, rank: usize, schedule: ProfileSchedule) -> Self {
        Self {
            enabled: true,
            schedule,
            rank,
            dir: dir.into(),
            ..Self::disabled()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_recording(&self) -> bool {
        self.enabled && self.schedule.phase(self.step) == Phase::Active
    }

    /// Record a span that started at `start` and ends now.
    pub fn record(&mut self, span: Span, start: Instant) {
        if !self.is_recording() {
            return;
        }
        let end = Instant::now();
        self.events.push(TraceEvent {
            name: span.as_str(),
            cat: "forge",
            ph: "X",
            ts: start.duration_since(self.origin).as_secs_f64() * 1e6,
            dur: end.duration_since(start).as_secs_f64() * 1e6,
            pid: self.rank,
            tid: 0,
        });
    }

    /// Advance the schedule by one iteration, writing a trace when an active
    /// window completes.
    pub fn step(&mut self) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.schedule.ends_cycle(self.step) {
            self.flush()?;
        }
        self.step += 1;
        Ok(())
    }

    /// Flush any partial window and disable further recording.
    pub fn stop(&mut self) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if !self.events.is_empty() {
            self.flush()?;
        }
        self.enabled = false;
        if !self.written.is_empty() {
            info!("profiling traces saved to {}", self.dir.display());
        }
        Ok(())
    }

    /// Trace files written so far.
    pub fn traces(&self) -> &[PathBuf] {
        &self.written
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating trace dir {}", self.dir.display()))?;
        let path = trace_path(&self.dir, self.rank, self.cycle);
        let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer(
            BufWriter::new(file),
            &TraceFile {
                trace_events: &self.events,
                display_time_unit: "ms",
            },
        )
        .with_context(|| format!("writing {}", path.display()))?;
        self.events.clear();
        self.written.push(path);
        self.cycle += 1;
        Ok(())
    }
}

fn trace_path(dir: &Path, rank: usize, cycle: usize) -> PathBuf {
    dir.join(format!("trace_rank{rank}_cycle{cycle}.json"))
}
