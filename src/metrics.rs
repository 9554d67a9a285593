//! Accuracy and timing summaries for inference runs.

use std::fmt;
use std::time::Duration;

use crate::pipeline::Prediction;

/// Fraction of predictions equal to their label; 0 for an empty run.
///
/// Extra predictions or labels past the shorter list are ignored.
pub fn accuracy(predictions: &[usize], labels: &[u8]) -> f64 {
    let n = predictions.len().min(labels.len());
    if n == 0 {
        return 0.0;
    }
    let correct = predictions.iter().zip(labels).filter(|(p, l)| **p == **l as usize).count();
    correct as f64 / n as f64
}

/// Outcome of one encrypted batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchReport {
    pub images: usize,
    /// Predictions matching a label; `None` when no labels were available.
    pub correct: Option<usize>,
    pub bootstraps: usize,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn new(predictions: &[Prediction], labels: Option<&[u8]>, bootstraps: usize, elapsed: Duration) -> Self {
        let correct = labels.map(|labels| {
            predictions
                .iter()
                .zip(labels)
                .filter(|(p, l)| p.class == **l as usize)
                .count()
        });
        Self { images: predictions.len(), correct, bootstraps, elapsed }
    }

    pub fn per_image(&self) -> Duration {
        if self.images == 0 {
            return Duration::ZERO;
        }
        self.elapsed / self.images as u32
    }

    /// Sum of several reports. `correct` is kept only if every report has it.
    pub fn merge(reports: &[BatchReport]) -> BatchReport {
        reports.iter().fold(
            BatchReport { correct: Some(0), ..BatchReport::default() },
            |acc, r| BatchReport {
                images: acc.images + r.images,
                correct: acc.correct.zip(r.correct).map(|(a, b)| a + b),
                bootstraps: acc.bootstraps + r.bootstraps,
                elapsed: acc.elapsed + r.elapsed,
            },
        )
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} images", self.images)?;
        if let Some(correct) = self.correct {
            let pct = if self.images == 0 { 0.0 } else { 100.0 * correct as f64 / self.images as f64 };
            write!(f, ", {} correct ({:.1}%)", correct, pct)?;
        }
        write!(
            f,
            ", {} bootstraps, {:.2}s ({:.2}s/image)",
            self.bootstraps,
            self.elapsed.as_secs_f64(),
            self.per_image().as_secs_f64()
        )
    }
}
