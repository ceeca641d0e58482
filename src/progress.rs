// ============================================
// RTA Builder - progress.rs
// ============================================
// Progress reporting for a build.
//
// Three pieces live here:
//   - ProgressTracker: turns "stage X is 40% done" into an overall 0-100
//   - Reporter: logs every message and forwards it to the caller's callback
//   - Line parsers: one per external tool, pulling a percentage out of the
//     tool's text output. Each tool's format is its own contract.
// ============================================

use tracing::{debug, error, info, warn};

use crate::pipeline::Stage;

/// A single progress update: overall percent plus a human message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub percent: u8,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(percent: u8, message: impl Into<String>) -> Self {
        Self {
            percent: percent.min(100),
            message: message.into(),
        }
    }
}

// ============================================
// OVERALL PROGRESS
// ============================================

/// Aggregates per-stage progress into one monotonic percentage.
///
/// overall = sum(weights of completed stages) + weight(current) * fraction,
/// clamped to 100. A strategy that falls back and starts over at 0% cannot
/// pull the overall number backwards.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    completed: Vec<Stage>,
    completed_weight: u32,
    current: Option<Stage>,
    last: u8,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, stage: Stage) {
        self.current = Some(stage);
    }

    /// Record the stage-local fraction (0.0..=1.0) of the stage in progress
    pub fn update(&mut self, fraction: f64) -> u8 {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        let in_progress = self
            .current
            .map(|stage| stage.weight() as f64 * fraction)
            .unwrap_or(0.0);
        let value = (self.completed_weight as f64 + in_progress).floor().min(100.0) as u8;
        self.last = self.last.max(value);
        self.last
    }

    /// Mark a stage done. Completing the same stage twice is a no-op.
    pub fn complete(&mut self, stage: Stage) -> u8 {
        if !self.completed.contains(&stage) {
            self.completed.push(stage);
            self.completed_weight = (self.completed_weight + stage.weight()).min(100);
        }
        if self.current == Some(stage) {
            self.current = None;
        }
        self.last = self.last.max(self.completed_weight as u8);
        self.last
    }

    /// Jump to 100 (used once the build is Done)
    pub fn finish(&mut self) -> u8 {
        self.completed_weight = 100;
        self.current = None;
        self.last = 100;
        self.last
    }

    pub fn overall(&self) -> u8 {
        self.last
    }

    pub fn current(&self) -> Option<Stage> {
        self.current
    }
}

// ============================================
// REPORTER
// ============================================

/// Routes messages to the log and to the caller's `on_event(message, percent)`
/// callback. The callback runs on the build worker, so it should return quickly.
pub struct Reporter<'a> {
    sink: Box<dyn FnMut(&str, Option<u8>) + 'a>,
    tracker: ProgressTracker,
}

impl<'a> Reporter<'a> {
    pub fn new(sink: impl FnMut(&str, Option<u8>) + 'a) -> Self {
        Self {
            sink: Box::new(sink),
            tracker: ProgressTracker::new(),
        }
    }

    /// A reporter that only logs
    pub fn silent() -> Reporter<'static> {
        Reporter::new(|_, _| {})
    }

    pub fn info(&mut self, message: &str) {
        info!("{}", message);
        (self.sink)(message, None);
    }

    /// Tool chatter: forwarded to the caller, logged at debug level
    pub fn detail(&mut self, message: &str) {
        debug!("{}", message);
        (self.sink)(message, None);
    }

    pub fn warn(&mut self, message: &str) {
        warn!("{}", message);
        (self.sink)(message, None);
    }

    pub fn error(&mut self, message: &str) {
        error!("{}", message);
        (self.sink)(message, None);
    }

    /// Report stage-local progress (0-100); the callback receives overall
    /// progress. Outside of any stage the local value is passed through.
    pub fn progress(&mut self, local_percent: u8, message: &str) {
        let local_percent = local_percent.min(100);
        let overall = match self.tracker.current() {
            Some(_) => self.tracker.update(local_percent as f64 / 100.0),
            None => local_percent,
        };
        info!(local = local_percent, overall, "{}", message);
        (self.sink)(message, Some(overall));
    }

    /// Forward a translated tool event as stage-local progress
    pub fn report(&mut self, event: &ProgressEvent) {
        self.progress(event.percent, &event.message);
    }

    pub fn begin_stage(&mut self, stage: Stage) {
        self.tracker.begin(stage);
        let overall = self.tracker.overall();
        let message = format!("{}...", stage.label());
        info!(overall, "{}", message);
        (self.sink)(&message, Some(overall));
    }

    pub fn complete_stage(&mut self, stage: Stage) {
        let overall = self.tracker.complete(stage);
        let message = format!("{} complete", stage.label());
        info!(overall, "{}", message);
        (self.sink)(&message, Some(overall));
    }

    pub fn finish(&mut self, message: &str) {
        let overall = self.tracker.finish();
        info!(overall, "{}", message);
        (self.sink)(message, Some(overall));
    }

    pub fn overall(&self) -> u8 {
        self.tracker.overall()
    }
}

// ============================================
// CADENCE
// ============================================

/// Decides when a bulk loop (file copy, archiving) should emit progress:
/// every `every` items, plus always on the last one.
#[derive(Debug, Clone, Copy)]
pub struct Cadence {
    every: u64,
    total: u64,
}

impl Cadence {
    pub fn new(every: u64, total: u64) -> Self {
        Self { every: every.max(1), total }
    }

    pub fn should_report(&self, done: u64) -> bool {
        done == self.total || done % self.every == 0
    }

    /// The loop ended before `total` (items were skipped), so the last
    /// regular report never fired
    pub fn is_short(&self, done: u64) -> bool {
        done < self.total
    }

    pub fn percent(&self, done: u64) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((done.min(self.total) * 100) / self.total) as u8
    }
}

// ============================================
// TOOL OUTPUT PARSERS
// ============================================

/// What one line of tool output means for progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Progress(ProgressEvent),
    Message(String),
    Blank,
}

/// Pull the integer in front of the first '%' ("  45% 12 - file" -> 45)
pub fn parse_percent_token(line: &str) -> Option<u8> {
    let (before, _) = line.split_once('%')?;
    let token = before.split_whitespace().last()?;
    let value: u32 = token.parse().ok()?;
    (value <= 100).then_some(value as u8)
}

fn parse_percent_line(line: &str, label: &str) -> LineEvent {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineEvent::Blank;
    }
    if trimmed.contains('%') {
        if let Some(percent) = parse_percent_token(trimmed) {
            return LineEvent::Progress(ProgressEvent::new(percent, format!("{}: {}%", label, percent)));
        }
    }
    LineEvent::Message(trimmed.to_string())
}

/// 7-Zip (`-bsp1`) output: any line with a percent token is progress
pub fn parse_archiver_line(line: &str) -> LineEvent {
    parse_percent_line(line, "Extraction progress")
}

/// oscdimg output: same shape as 7-Zip ("45% complete")
pub fn parse_masterer_line(line: &str) -> LineEvent {
    parse_percent_line(line, "ISO creation progress")
}

/// New-IsoFile output: only "NN% complete" lines count as progress, so that
/// file names containing '%' are not misread
pub fn parse_authoring_line(line: &str) -> LineEvent {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineEvent::Blank;
    }
    if trimmed.contains('%') && trimmed.to_lowercase().contains("complete") {
        if let Some(percent) = parse_percent_token(trimmed) {
            return LineEvent::Progress(ProgressEvent::new(percent, format!("ISO creation progress: {}%", percent)));
        }
    }
    LineEvent::Message(trimmed.to_string())
}
