//! Worker and pool lifecycle status, shared between the controller and
//! worker tasks through small atomically read/written cells.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle state of one compute worker.
///
/// The numeric codes are part of the report contract and must stay stable.
/// A successful run moves forward through
/// `Unloaded → Loading → Preheating → Running → Exited`; any state may jump
/// to `Cleaning` and then to one of the terminal error states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum WorkerStatus {
    Unloaded = 0,
    Cleaning = 1,
    Loading = 2,
    Preheating = 3,
    Running = 4,
    /// On the pool-wide cell this doubles as the shutdown broadcast.
    Exited = 5,
    Error = 6,
    /// A value/parameter error (malformed labels, threshold, mapping).
    ErrorLabels = 7,
}

impl WorkerStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Unloaded),
            1 => Some(Self::Cleaning),
            2 => Some(Self::Loading),
            3 => Some(Self::Preheating),
            4 => Some(Self::Running),
            5 => Some(Self::Exited),
            6 => Some(Self::Error),
            7 => Some(Self::ErrorLabels),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Error | Self::ErrorLabels)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unloaded => "unloaded",
            Self::Cleaning => "cleaning",
            Self::Loading => "loading",
            Self::Preheating => "preheating",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Error => "error",
            Self::ErrorLabels => "error_labels",
        };
        f.write_str(name)
    }
}

/// A shared, atomically readable/writable status value.
///
/// One cell exists per worker plus one pool-wide cell per backend; cloning
/// shares the underlying atomic.
#[derive(Clone, Debug, Default)]
pub struct StatusCell {
    inner: Arc<AtomicU8>,
}

impl StatusCell {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AtomicU8::new(WorkerStatus::Unloaded.code())),
        }
    }

    pub fn load(&self) -> WorkerStatus {
        // The cell is only ever written with valid codes.
        WorkerStatus::from_code(self.inner.load(Ordering::SeqCst))
            .unwrap_or(WorkerStatus::Unloaded)
    }

    pub fn store(&self, status: WorkerStatus) {
        self.inner.store(status.code(), Ordering::SeqCst);
    }

    pub fn code(&self) -> u8 {
        self.inner.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in 0..=7u8 {
            let status = WorkerStatus::from_code(code).unwrap();
            assert_eq!(status.code(), code);
        }
        assert!(WorkerStatus::from_code(8).is_none());
    }

    #[test]
    fn cell_starts_unloaded_and_is_shared() {
        let cell = StatusCell::new();
        assert_eq!(cell.load(), WorkerStatus::Unloaded);

        let view = cell.clone();
        cell.store(WorkerStatus::Running);
        assert_eq!(view.load(), WorkerStatus::Running);
        assert_eq!(view.code(), 4);
    }

    #[test]
    fn terminal_states() {
        assert!(WorkerStatus::Exited.is_terminal());
        assert!(WorkerStatus::Error.is_terminal());
        assert!(WorkerStatus::ErrorLabels.is_terminal());
        assert!(!WorkerStatus::Running.is_terminal());
        assert!(!WorkerStatus::Cleaning.is_terminal());
    }
}
