// ⏱️ I/O budgets
// Every blocking read or store call runs under a caller-supplied timeout.

use crate::error::{PipelineError, Result};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

/// Run `f` on a helper thread and wait at most `budget` for its result.
///
/// On timeout the helper is detached; whatever it produces afterwards is dropped.
pub fn run_with_timeout<T, F>(operation: &str, budget: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel();

    thread::Builder::new()
        .name("etl-io".to_string())
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|e| PipelineError::Io {
            path: PathBuf::from(operation),
            source: e,
        })?;

    match rx.recv_timeout(budget) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(PipelineError::Timeout {
            operation: operation.to_string(),
            budget,
        }),
        Err(RecvTimeoutError::Disconnected) => Err(PipelineError::Io {
            path: PathBuf::from(operation),
            source: std::io::Error::new(std::io::ErrorKind::Other, "I/O worker panicked"),
        }),
    }
}

/// Absolute point in time after which an operation must give up.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Deadline {
            started: Instant::now(),
            budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn expired(&self) -> bool {
        self.started.elapsed() >= self.budget
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }
}
