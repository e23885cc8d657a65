//! Progress reporting for long-running steps.
//!
//! The tracker has its own lock, independent of the one serializing
//! install operations, so a caller polling progress is never stuck
//! behind an allocation or a chunk commit.

use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

/// Coarse state of the current step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressStatus {
    /// Nothing is running.
    #[default]
    NoOperation,
    /// A step is in progress.
    Working,
    /// The step finished.
    Complete,
}

/// A snapshot of install progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Progress {
    /// Human-readable step name, e.g. `create system`.
    pub step: String,
    /// Status of the step.
    pub status: ProgressStatus,
    /// Bytes handled so far.
    pub bytes_processed: u64,
    /// Bytes the step will handle in total.
    pub total_bytes: u64,
}

/// Shared, independently locked progress record.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    inner: Mutex<Progress>,
}

impl ProgressTracker {
    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Begin a new step.
    pub fn start(&self, step: &str, total_bytes: u64) {
        let mut p = self.lock();
        p.step = step.to_owned();
        p.status = ProgressStatus::Working;
        p.bytes_processed = 0;
        p.total_bytes = total_bytes;
    }

    /// Update the status of the current step.
    pub fn update(&self, status: ProgressStatus, bytes_processed: u64) {
        let mut p = self.lock();
        p.status = status;
        p.bytes_processed = if status == ProgressStatus::Complete {
            p.total_bytes
        } else {
            bytes_processed
        };
    }

    /// Return to the idle state.
    pub fn reset(&self) {
        self.update(ProgressStatus::NoOperation, 0);
    }

    /// Copy out the current state.
    pub fn snapshot(&self) -> Progress {
        self.lock().clone()
    }
}
