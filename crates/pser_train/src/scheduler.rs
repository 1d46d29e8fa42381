//! Epoch-level learning-rate milestones and difficulty schedule.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};

/// Epochs after which the data sources are hardened.
pub const HARDEN_EPOCHS: [usize; 6] = [100, 140, 160, 220, 280, 340];

/// Step decay at fixed epochs.
///
/// At milestone `i` the rate is multiplied by `factors[i]` and the pointer
/// advances to the next milestone; it stays on the last one once reached,
/// so a repeated last milestone can never index out of range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneSchedule {
    milestones: Vec<usize>,
    factors: Vec<f64>,
    pointer: usize,
}

impl MilestoneSchedule {
    /// Create a schedule. `milestones` and `factors` must have equal length.
    pub fn new(milestones: Vec<usize>, factors: Vec<f64>) -> Result<Self> {
        if milestones.len() != factors.len() {
            return Err(TrainError::Other(format!(
                "{} lr milestones but {} factors",
                milestones.len(),
                factors.len()
            )));
        }
        Ok(Self {
            milestones,
            factors,
            pointer: 0,
        })
    }

    /// Index of the next milestone.
    pub fn pointer(&self) -> usize {
        self.pointer
    }

    /// Apply the schedule at the end of `epoch`.
    ///
    /// Returns the new rate when `epoch` is the current milestone.
    pub fn step(&mut self, epoch: usize, lr: f64) -> Option<f64> {
        let &milestone = self.milestones.get(self.pointer)?;
        if epoch != milestone {
            return None;
        }
        let new_lr = lr * self.factors[self.pointer];
        if self.pointer + 1 < self.milestones.len() {
            self.pointer += 1;
        }
        Some(new_lr)
    }

    /// Replay every milestone up to and including `epoch`, as when resuming.
    pub fn fast_forward(&mut self, epoch: usize, mut lr: f64) -> f64 {
        for e in 1..=epoch {
            if let Some(new_lr) = self.step(e, lr) {
                lr = new_lr;
            }
        }
        lr
    }
}

/// Whether the data sources are hardened after `epoch`.
pub fn is_harden_epoch(epoch: usize) -> bool {
    HARDEN_EPOCHS.contains(&epoch)
}
