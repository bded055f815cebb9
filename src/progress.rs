//! Progress reporting for long-running vault operations.
//!
//! Engine code reports through a [`ProgressTracker`], which clamps
//! percentages so they never regress, and fans out to whatever
//! [`ProgressSink`] the caller injected. The tokio broadcast sink is what
//! a UI subscribes to; dropped events on a lagging receiver are acceptable
//! because every event is self-contained.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Preparing,
    Validating,
    Checkpointing,
    ClosingStorage,
    CreatingRollback,
    ClearingData,
    Extracting,
    Streaming,
    ReopeningStorage,
    Verifying,
    RepairingReferences,
    InvalidatingSessions,
    Complete,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: ProgressPhase,
    pub percentage: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Sink that discards everything. For headless callers and tests.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&self, _event: ProgressEvent) {}
}

/// Fan-out sink backed by a tokio broadcast channel.
pub struct BroadcastSink {
    tx: broadcast::Sender<ProgressEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        BroadcastSink { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl ProgressSink for BroadcastSink {
    fn report(&self, event: ProgressEvent) {
        // Fire-and-forget: send only fails when no receiver is subscribed
        let _ = self.tx.send(event);
    }
}

/// Sink that records every event in memory, in order.
pub struct MemorySink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for MemorySink {
    fn report(&self, event: ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Monotonic progress reporter for one operation.
///
/// Each phase owns a disjoint percentage sub-range, but interleavings and
/// estimation drift must never show a number going backwards, so the last
/// reported percentage is a floor for the next one.
pub struct ProgressTracker {
    sink: Arc<dyn ProgressSink>,
    last: AtomicU8,
}

impl ProgressTracker {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        ProgressTracker {
            sink,
            last: AtomicU8::new(0),
        }
    }

    pub fn report(&self, phase: ProgressPhase, percentage: u8, message: impl Into<String>) {
        self.emit(phase, percentage, message.into(), None);
    }

    pub fn report_file(
        &self,
        phase: ProgressPhase,
        percentage: u8,
        message: impl Into<String>,
        current_file: impl Into<String>,
    ) {
        self.emit(phase, percentage, message.into(), Some(current_file.into()));
    }

    /// Terminal failure event. Keeps the last percentage so the bar freezes
    /// where the operation died instead of jumping.
    pub fn error(&self, message: impl Into<String>) {
        let pct = self.last.load(Ordering::SeqCst);
        self.sink.report(ProgressEvent {
            phase: ProgressPhase::Error,
            percentage: pct,
            message: message.into(),
            current_file: None,
        });
    }

    fn emit(&self, phase: ProgressPhase, percentage: u8, message: String, current_file: Option<String>) {
        let clamped = self.clamp(percentage.min(100));
        self.sink.report(ProgressEvent {
            phase,
            percentage: clamped,
            message,
            current_file,
        });
    }

    fn clamp(&self, pct: u8) -> u8 {
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let next = pct.max(current);
            match self
                .last
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Human-readable byte count for CLI output and log lines.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// A phase's slice of the progress bar.
///
/// `at` maps "completed of total" onto the slice with the `total + 1`
/// denominator, which leaves headroom for the finalization work that
/// follows the last item, and caps at `cap` rather than the slice end.
#[derive(Debug, Clone, Copy)]
pub struct ProgressSpan {
    pub phase: ProgressPhase,
    pub floor: u8,
    pub span: u8,
    pub cap: u8,
}

impl ProgressSpan {
    pub fn at(&self, completed: usize, total: usize) -> u8 {
        let scaled = (completed as u64 * self.span as u64) / (total as u64 + 1);
        let pct = self.floor as u64 + scaled;
        pct.min(self.cap as u64) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_never_regresses() {
        let sink = Arc::new(MemorySink::new());
        let tracker = ProgressTracker::new(sink.clone());

        tracker.report(ProgressPhase::Preparing, 10, "a");
        tracker.report(ProgressPhase::Validating, 5, "b");
        tracker.report(ProgressPhase::Checkpointing, 20, "c");

        let pcts: Vec<u8> = sink.events().iter().map(|e| e.percentage).collect();
        assert_eq!(pcts, vec![10, 10, 20]);
    }

    #[test]
    fn tracker_caps_at_hundred() {
        let sink = Arc::new(MemorySink::new());
        let tracker = ProgressTracker::new(sink.clone());

        tracker.report(ProgressPhase::Complete, 250, "done");
        assert_eq!(sink.events()[0].percentage, 100);
    }

    #[test]
    fn error_keeps_last_percentage() {
        let sink = Arc::new(MemorySink::new());
        let tracker = ProgressTracker::new(sink.clone());

        tracker.report(ProgressPhase::Extracting, 62, "working");
        tracker.error("boom");

        let events = sink.events();
        assert_eq!(events[1].phase, ProgressPhase::Error);
        assert_eq!(events[1].percentage, 62);
    }

    #[test]
    fn span_maps_completed_onto_slice() {
        let span = ProgressSpan {
            phase: ProgressPhase::Streaming,
            floor: 15,
            span: 80,
            cap: 95,
        };

        assert_eq!(span.at(0, 9), 15);
        assert_eq!(span.at(5, 9), 55);
        // total + 1 denominator keeps the last file short of the cap
        assert_eq!(span.at(9, 9), 87);
        // an overshoot cannot pass the cap
        assert_eq!(span.at(500, 9), 95);
    }

    #[test]
    fn span_handles_empty_input() {
        let span = ProgressSpan {
            phase: ProgressPhase::Extracting,
            floor: 40,
            span: 35,
            cap: 75,
        };
        assert_eq!(span.at(0, 0), 40);
    }

    #[tokio::test]
    async fn broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(16);
        let mut rx = sink.subscribe();

        sink.report(ProgressEvent {
            phase: ProgressPhase::Preparing,
            percentage: 1,
            message: "hello".into(),
            current_file: None,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.percentage, 1);
        assert_eq!(event.message, "hello");
    }

    #[test]
    fn formats_byte_counts() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn broadcast_sink_without_subscribers_is_silent() {
        let sink = BroadcastSink::new(16);
        sink.report(ProgressEvent {
            phase: ProgressPhase::Preparing,
            percentage: 1,
            message: "nobody listening".into(),
            current_file: None,
        });
    }
}
