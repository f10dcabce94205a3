use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Phase;

/// Telemetry events sent from pipeline workers for progress tracking
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// A phase dispatched its units
    PhaseStarted { phase: Phase, units: usize },
    /// A unit (source, job or output) started
    UnitStarted { phase: Phase, name: String },
    /// A unit finished, successfully or not
    UnitFinished {
        phase: Phase,
        name: String,
        ok: bool,
        duration_ms: u64,
    },
    /// Files moved by a unit (copied, downloaded or uploaded)
    FilesTransferred {
        phase: Phase,
        name: String,
        files: u64,
        bytes: u64,
    },
}

/// Cloneable sending side of the telemetry channel; a disabled sink drops events
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    tx: Option<mpsc::UnboundedSender<TelemetryEvent>>,
}

impl Telemetry {
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, event: TelemetryEvent) {
        if let Some(tx) = &self.tx {
            // The collector may already be gone during shutdown
            let _ = tx.send(event);
        }
    }
}

/// Statistics aggregated from telemetry events
#[derive(Debug, Default, Clone, Serialize)]
pub struct ProgressStats {
    pub units_started: usize,
    pub units_succeeded: usize,
    pub units_failed: usize,
    pub files_transferred: u64,
    pub bytes_transferred: u64,
    #[serde(skip)]
    pub unit_durations_ms: Vec<u64>,
}

impl ProgressStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a telemetry event
    pub fn update(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::PhaseStarted { .. } => {}
            TelemetryEvent::UnitStarted { .. } => {
                self.units_started += 1;
            }
            TelemetryEvent::UnitFinished {
                ok, duration_ms, ..
            } => {
                if *ok {
                    self.units_succeeded += 1;
                } else {
                    self.units_failed += 1;
                }
                self.unit_durations_ms.push(*duration_ms);
            }
            TelemetryEvent::FilesTransferred { files, bytes, .. } => {
                self.files_transferred += files;
                self.bytes_transferred += bytes;
            }
        }
    }

    /// Calculate percentile from unit durations
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.unit_durations_ms.is_empty() {
            return None;
        }

        let mut sorted = self.unit_durations_ms.clone();
        sorted.sort_unstable();

        let index = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        let index = index.saturating_sub(1).min(sorted.len() - 1);

        Some(sorted[index])
    }

    /// Get p50, p90, p99 percentiles
    pub fn get_percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        (
            self.percentile(50.0),
            self.percentile(90.0),
            self.percentile(99.0),
        )
    }
}

fn phase_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {prefix:>16}: [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

/// Consume telemetry events until every sender is dropped
///
/// With `show_progress`, one progress bar per phase is drawn as units finish.
/// The returned handle resolves to the aggregated statistics.
pub fn spawn_collector(
    mut rx: mpsc::UnboundedReceiver<TelemetryEvent>,
    show_progress: bool,
) -> JoinHandle<ProgressStats> {
    tokio::spawn(async move {
        let multi_progress = show_progress.then(MultiProgress::new);
        let mut current: Option<ProgressBar> = None;
        let mut stats = ProgressStats::new();

        while let Some(event) = rx.recv().await {
            stats.update(&event);

            let Some(multi_progress) = &multi_progress else {
                continue;
            };
            match &event {
                TelemetryEvent::PhaseStarted { phase, units } => {
                    if let Some(bar) = current.take() {
                        bar.finish();
                    }
                    let bar = multi_progress.add(ProgressBar::new(*units as u64));
                    bar.set_style(phase_style());
                    bar.set_prefix(phase.to_string());
                    current = Some(bar);
                }
                TelemetryEvent::UnitFinished { name, ok, .. } => {
                    if let Some(bar) = &current {
                        bar.inc(1);
                        let mark = if *ok { "ok" } else { "failed" };
                        bar.set_message(format!("{} {}", name, mark));
                    }
                }
                _ => {}
            }
        }

        if let Some(bar) = current {
            bar.finish();
        }

        stats
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(name: &str, ok: bool, duration_ms: u64) -> TelemetryEvent {
        TelemetryEvent::UnitFinished {
            phase: Phase::Gather,
            name: name.to_string(),
            ok,
            duration_ms,
        }
    }

    #[test]
    fn test_stats_update() {
        let mut stats = ProgressStats::new();
        stats.update(&TelemetryEvent::UnitStarted {
            phase: Phase::Gather,
            name: "a".to_string(),
        });
        stats.update(&finished("a", true, 10));
        stats.update(&finished("b", false, 30));
        stats.update(&TelemetryEvent::FilesTransferred {
            phase: Phase::Gather,
            name: "a".to_string(),
            files: 2,
            bytes: 128,
        });

        assert_eq!(stats.units_started, 1);
        assert_eq!(stats.units_succeeded, 1);
        assert_eq!(stats.units_failed, 1);
        assert_eq!(stats.files_transferred, 2);
        assert_eq!(stats.bytes_transferred, 128);
    }

    #[test]
    fn test_percentiles() {
        let mut stats = ProgressStats::new();
        assert_eq!(stats.get_percentiles(), (None, None, None));

        for ms in 1..=100 {
            stats.update(&finished("x", true, ms));
        }
        assert_eq!(stats.percentile(50.0), Some(50));
        assert_eq!(stats.percentile(90.0), Some(90));
        assert_eq!(stats.percentile(99.0), Some(99));
        assert_eq!(stats.percentile(0.0), Some(1));
    }

    #[tokio::test]
    async fn test_collector_finishes_when_senders_drop() {
        let (telemetry, rx) = Telemetry::channel();
        let handle = spawn_collector(rx, false);

        let clone = telemetry.clone();
        clone.emit(finished("a", true, 5));
        telemetry.emit(finished("b", true, 7));
        drop(clone);
        drop(telemetry);

        let stats = handle.await.unwrap();
        assert_eq!(stats.units_succeeded, 2);
    }

    #[test]
    fn test_disabled_sink_drops_events() {
        Telemetry::disabled().emit(finished("a", true, 1));
    }
}
