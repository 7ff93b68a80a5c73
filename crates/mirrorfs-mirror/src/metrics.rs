//! Engine counters and their Prometheus export

use crate::message::ForwardOutcome;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-engine request and forward counters
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub requests: AtomicU64,
    pub local_errors: AtomicU64,
    pub rejected: AtomicU64,
    pub forwards_ok: AtomicU64,
    pub forwards_failed: AtomicU64,
    pub forwards_diverged: AtomicU64,
    pub forwards_skipped: AtomicU64,
    pub forwards_recorded: AtomicU64,
    /// Resent forwards answered from the reply cache
    pub forwards_replayed: AtomicU64,
}

impl EngineMetrics {
    pub fn record_forward(&self, outcome: &ForwardOutcome) {
        let counter = match outcome {
            ForwardOutcome::NotRequired => return,
            ForwardOutcome::Acknowledged => &self.forwards_ok,
            ForwardOutcome::Diverged(_) => &self.forwards_diverged,
            ForwardOutcome::CommFailed => &self.forwards_failed,
            ForwardOutcome::Skipped => &self.forwards_skipped,
            ForwardOutcome::RecordedForResync => &self.forwards_recorded,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Append this engine's series to `output` in Prometheus text format.
    ///
    /// Callers write the `# HELP`/`# TYPE` preamble once via [`write_header`].
    pub fn write_prometheus(&self, output: &mut String, target_id: u16) {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        let _ = writeln!(
            output,
            "mirrorfs_engine_requests_total{{target_id=\"{target_id}\"}} {}",
            load(&self.requests)
        );
        let _ = writeln!(
            output,
            "mirrorfs_engine_local_errors_total{{target_id=\"{target_id}\"}} {}",
            load(&self.local_errors)
        );
        let _ = writeln!(
            output,
            "mirrorfs_engine_rejected_total{{target_id=\"{target_id}\"}} {}",
            load(&self.rejected)
        );
        let _ = writeln!(
            output,
            "mirrorfs_engine_replayed_forwards_total{{target_id=\"{target_id}\"}} {}",
            load(&self.forwards_replayed)
        );

        let forwards = [
            ("acknowledged", &self.forwards_ok),
            ("comm_failed", &self.forwards_failed),
            ("diverged", &self.forwards_diverged),
            ("skipped", &self.forwards_skipped),
            ("recorded_for_resync", &self.forwards_recorded),
        ];
        for (outcome, counter) in forwards {
            let _ = writeln!(
                output,
                "mirrorfs_engine_forwards_total{{target_id=\"{target_id}\",outcome=\"{outcome}\"}} {}",
                load(counter)
            );
        }
    }
}

/// `# HELP`/`# TYPE` lines for the series written by [`EngineMetrics::write_prometheus`]
pub fn write_header(output: &mut String) {
    let series = [
        ("mirrorfs_engine_requests_total", "Requests handled by the engine"),
        ("mirrorfs_engine_local_errors_total", "Requests that failed locally"),
        ("mirrorfs_engine_rejected_total", "Requests rejected by the role check"),
        (
            "mirrorfs_engine_replayed_forwards_total",
            "Resent forwards answered from the reply cache",
        ),
        ("mirrorfs_engine_forwards_total", "Forward decisions by outcome"),
    ];
    for (name, help) in series {
        let _ = writeln!(output, "# HELP {name} {help}");
        let _ = writeln!(output, "# TYPE {name} counter");
    }
}
