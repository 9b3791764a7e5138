//! Progress monitors with cooperative cancellation.
//!
//! A [`Monitor`] tracks `work` done out of `total_work`. Forked children
//! cover a share of their parent's work: completing a child advances the
//! parent by that share. All monitors of a tree share one cancellation
//! state, so canceling any of them cancels the whole tree.
//!
//! # Example
//!
//! ```
//! use signalwire::monitor::Monitor;
//!
//! let root = Monitor::new();
//! root.begin(100.0);
//!
//! let child = root.fork(40.0);
//! child.begin(4.0);
//! child.worked(1.0);
//! assert_eq!(root.work(), 10.0);
//!
//! child.done();
//! assert_eq!(root.work(), 40.0);
//! ```

mod remote;
mod reporting;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SignalError};

pub(crate) use remote::RemoteProgress;
pub(crate) use reporting::ReportingTask;

/// Reason recorded by [`Monitor::cancel`].
pub const CANCELED_BY_USER: &str = "Canceled by user";

/// Hierarchical progress monitor. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Monitor {
    node: Arc<Node>,
}

struct Node {
    progress: Mutex<Progress>,
    parent: Option<(Monitor, f64)>,
    shared: Arc<Shared>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    total: f64,
    work: f64,
    begun: bool,
}

struct Shared {
    token: CancellationToken,
    reason: Mutex<Option<String>>,
    touched: Mutex<Instant>,
}

impl Monitor {
    /// Create a new root monitor.
    pub fn new() -> Self {
        Self {
            node: Arc::new(Node {
                progress: Mutex::new(Progress::default()),
                parent: None,
                shared: Arc::new(Shared {
                    token: CancellationToken::new(),
                    reason: Mutex::new(None),
                    touched: Mutex::new(Instant::now()),
                }),
            }),
        }
    }

    /// Start the task with `total` units of work. Resets prior progress.
    pub fn begin(&self, total: f64) {
        *lock(&self.node.progress) = Progress {
            total: total.max(0.0),
            work: 0.0,
            begun: true,
        };
        self.touch();
    }

    /// Record `amount` units of work. Work beyond the total is ignored.
    pub fn worked(&self, amount: f64) {
        if amount <= 0.0 || amount.is_nan() {
            return;
        }

        let ratio = {
            let mut progress = lock(&self.node.progress);
            if !progress.begun || progress.total <= 0.0 {
                return;
            }
            let applied = amount.min(progress.total - progress.work);
            if applied <= 0.0 {
                return;
            }
            progress.work += applied;
            applied / progress.total
        };

        self.touch();
        if let Some((parent, share)) = &self.node.parent {
            parent.worked(ratio * share);
        }
    }

    /// Fork a child monitor covering `work` units of this monitor.
    pub fn fork(&self, work: f64) -> Monitor {
        Self {
            node: Arc::new(Node {
                progress: Mutex::new(Progress::default()),
                parent: Some((self.clone(), work.max(0.0))),
                shared: self.node.shared.clone(),
            }),
        }
    }

    /// Complete the remaining work.
    pub fn done(&self) {
        let remaining = {
            let progress = lock(&self.node.progress);
            progress.begun.then(|| progress.total - progress.work)
        };

        match remaining {
            Some(remaining) => self.worked(remaining),
            None => {
                self.begin(1.0);
                self.worked(1.0);
            }
        }
    }

    /// Total units of work (0 until begun).
    pub fn total_work(&self) -> f64 {
        lock(&self.node.progress).total
    }

    /// Units of work done.
    pub fn work(&self) -> f64 {
        lock(&self.node.progress).work
    }

    /// Cancel the monitor tree.
    pub fn cancel(&self) {
        self.cancel_with(CANCELED_BY_USER);
    }

    /// Cancel the monitor tree with a reason. The first reason wins.
    pub fn cancel_with(&self, reason: impl Into<String>) {
        {
            let mut current = lock(&self.node.shared.reason);
            if current.is_none() {
                *current = Some(reason.into());
            }
        }
        self.node.shared.token.cancel();
    }

    /// Check if the monitor tree was canceled.
    pub fn is_canceled(&self) -> bool {
        self.node.shared.token.is_cancelled()
    }

    /// Return `Err(Canceled)` if the monitor tree was canceled.
    pub fn check_canceled(&self) -> Result<()> {
        if !self.is_canceled() {
            return Ok(());
        }
        let reason = lock(&self.node.shared.reason)
            .clone()
            .unwrap_or_else(|| CANCELED_BY_USER.to_string());
        Err(SignalError::Canceled(reason))
    }

    /// Wait until the monitor tree is canceled.
    pub async fn canceled(&self) {
        self.node.shared.token.cancelled().await;
    }

    /// Token canceled together with this monitor tree.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.node.shared.token.clone()
    }

    /// Mark the monitor tree as alive.
    pub fn touch(&self) {
        *lock(&self.node.shared.touched) = Instant::now();
    }

    /// Time since the monitor tree was last touched.
    pub fn untouched_for(&self) -> Duration {
        lock(&self.node.shared.touched).elapsed()
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let progress = *lock(&self.node.progress);
        f.debug_struct("Monitor")
            .field("total", &progress.total)
            .field("work", &progress.work)
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
