//! Run diagnostics: timing, counts, and other metrics for each stage.
//!
//! Every stage returns a [`StageDiagnostics`] alongside its output. The
//! stage runner collects them, together with cache and skip decisions,
//! into a [`RunDiagnostics`] whose [`report`](RunDiagnostics::report)
//! renders a human-readable table.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics for a single stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics (counts, sizes, etc.).
    pub metrics: StageMetrics,
}

/// Polygons discarded by the vectorizer, by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionCounts {
    /// Closing or repair left nothing.
    pub empty: usize,
    /// Still invalid after a zero-distance buffer repair.
    pub invalid: usize,
    /// Below the minimum area.
    pub too_small: usize,
    /// Above the maximum area.
    pub too_large: usize,
}

impl RejectionCounts {
    /// Sum of all reasons.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.empty + self.invalid + self.too_small + self.too_large
    }

    /// Add `other` into `self`.
    pub const fn absorb(&mut self, other: &Self) {
        self.empty += other.empty;
        self.invalid += other.invalid;
        self.too_small += other.too_small;
        self.too_large += other.too_large;
    }
}

/// Per-class tallies from the classifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCounts {
    /// Labelled terrace.
    pub terrace: usize,
    /// Labelled wall, including slivers and errors.
    pub wall: usize,
    /// Rejected by the sliver rule.
    pub sliver: usize,
    /// Empty or invalid geometry.
    pub error: usize,
}

/// Stage-specific metrics that vary by stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Slope computation.
    Slope {
        /// Blocks processed.
        blocks: usize,
        /// Blocks replaced by zeros after a shape mismatch.
        substituted_blocks: usize,
        /// Context margin in pixels.
        padding: u32,
        /// Largest slope written.
        max_slope: f64,
    },
    /// Break mask thresholding.
    Breaks {
        /// Slope threshold.
        threshold: f64,
        /// Blocks processed.
        blocks: usize,
        /// Pixels above the threshold.
        break_pixels: u64,
        /// Pixels examined.
        total_pixels: u64,
    },
    /// Tile vectorization in the worker pool.
    Vectorize {
        /// Batches submitted.
        batches: usize,
        /// Blocks processed.
        blocks: usize,
        /// Blocks skipped for having no break pixels.
        empty_blocks: usize,
        /// Blocks that failed.
        failed_blocks: usize,
        /// Polygons produced by tracing.
        traced: usize,
        /// Polygons surviving closing, repair and the area filter.
        kept: usize,
        /// Discarded polygons by reason.
        rejected: RejectionCounts,
    },
    /// Global union.
    Merge {
        /// Strategy that produced the result.
        strategy: String,
        /// Polygons in.
        input: usize,
        /// Disjoint polygons out.
        output: usize,
    },
    /// Simplify, filter, reproject, write.
    Export {
        /// Polygons in.
        input: usize,
        /// Features written.
        written: usize,
        /// Dropped below the minimum area after simplification.
        too_small: usize,
        /// Dropped above the maximum area after simplification.
        too_large: usize,
        /// Dropped because reprojection failed.
        failed: usize,
    },
    /// Classification and rewrite.
    Classify {
        /// Features classified.
        features: usize,
        /// Per-class tallies.
        counts: ClassCounts,
        /// Features with at least one valid elevation probe.
        probed: usize,
    },
}

/// What happened to one stage in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageOutcome {
    /// The stage ran.
    Ran(StageDiagnostics),
    /// A valid artifact from an earlier run was reused.
    Cached,
    /// The stage could not run.
    Skipped {
        /// Why.
        reason: String,
    },
}

/// One row of a [`RunDiagnostics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage name.
    pub name: String,
    /// Outcome.
    pub outcome: StageOutcome,
}

/// Diagnostics collected from a whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    /// Stages in execution order.
    pub stages: Vec<StageRecord>,
    /// Total wall-clock duration of the run (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
}

impl RunDiagnostics {
    /// Append a stage record.
    pub fn push(&mut self, name: impl Into<String>, outcome: StageOutcome) {
        self.stages.push(StageRecord {
            name: name.into(),
            outcome,
        });
    }

    /// Look up a stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageOutcome> {
        self.stages
            .iter()
            .find(|s| s.name == name)
            .map(|s| &s.outcome)
    }

    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Run Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<16} {:>12} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        for record in &self.stages {
            let name = &record.name;
            match &record.outcome {
                StageOutcome::Ran(diag) => {
                    let ms = duration_ms(diag.duration);
                    let pct = if total_ms > 0.0 {
                        ms / total_ms * 100.0
                    } else {
                        0.0
                    };
                    let details = format_metrics(&diag.metrics);
                    lines.push(format!("{name:<16} {ms:>10.3}ms {pct:>9.1}%  {details}"));
                }
                StageOutcome::Cached => {
                    lines.push(format!("{name:<16} {:>12} {:>10}  reused artifact", "cached", "-"));
                }
                StageOutcome::Skipped { reason } => {
                    lines.push(format!("{name:<16} {:>12} {:>10}  {reason}", "skipped", "-"));
                }
            }
        }

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Slope {
            blocks,
            substituted_blocks,
            padding,
            max_slope,
        } => format!(
            "{blocks} blocks (pad={padding}px, {substituted_blocks} zeroed) max={max_slope:.1}"
        ),
        StageMetrics::Breaks {
            threshold,
            break_pixels,
            total_pixels,
            ..
        } => {
            #[allow(clippy::cast_precision_loss)]
            let density = if *total_pixels > 0 {
                *break_pixels as f64 / *total_pixels as f64 * 100.0
            } else {
                0.0
            };
            format!("threshold={threshold:.1} breaks={break_pixels} ({density:.2}%)")
        }
        StageMetrics::Vectorize {
            batches,
            blocks,
            empty_blocks,
            failed_blocks,
            traced,
            kept,
            rejected,
        } => format!(
            "{blocks} blocks/{batches} batches ({empty_blocks} empty, {failed_blocks} failed) polys={traced}->{kept} rejected={}",
            rejected.total(),
        ),
        StageMetrics::Merge {
            strategy,
            input,
            output,
        } => format!("{strategy} {input}->{output} polys"),
        StageMetrics::Export {
            input,
            written,
            too_small,
            too_large,
            failed,
        } => format!(
            "{input}->{written} features (small={too_small} large={too_large} failed={failed})"
        ),
        StageMetrics::Classify {
            features,
            counts,
            probed,
        } => format!(
            "{features} features: terrace={} wall={} sliver={} error={} probed={probed}",
            counts.terrace, counts.wall, counts.sliver, counts.error,
        ),
    }
}
