//! Mirror of the peer's progress on the requesting side.

use super::Monitor;

/// Applies cumulative progress reports from the peer to a local monitor.
///
/// Reports carry totals, not increments. Only the growth of the reported
/// ratio since the previous report is applied, so repeated or stale reports
/// never move the monitor backwards or count work twice.
pub(crate) struct RemoteProgress {
    monitor: Monitor,
    last_ratio: f64,
    begun: bool,
}

impl RemoteProgress {
    pub(crate) fn new(monitor: Monitor) -> Self {
        Self {
            monitor,
            last_ratio: 0.0,
            begun: false,
        }
    }

    /// Apply a `(total_work, work)` report from the peer.
    pub(crate) fn apply(&mut self, total_work: f64, work: f64) {
        if total_work <= 0.0 || !total_work.is_finite() || !work.is_finite() {
            return;
        }

        if !self.begun {
            self.monitor.begin(total_work);
            self.begun = true;
        }

        let ratio = (work / total_work).clamp(0.0, 1.0);
        let delta = ratio - self.last_ratio;
        if delta > 0.0 {
            self.monitor.worked(delta * self.monitor.total_work());
            self.last_ratio = ratio;
        }
        self.monitor.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_incremental_progress() {
        let fork = Monitor::new();
        let mut remote = RemoteProgress::new(fork.clone());

        remote.apply(100.0, 30.0);
        assert!(approx(fork.work(), 30.0));

        remote.apply(100.0, 55.0);
        assert!(approx(fork.work(), 55.0));
    }

    #[test]
    fn test_never_goes_backward() {
        let fork = Monitor::new();
        let mut remote = RemoteProgress::new(fork.clone());

        remote.apply(100.0, 60.0);
        remote.apply(100.0, 40.0);
        remote.apply(100.0, 60.0);
        assert!(approx(fork.work(), 60.0));

        remote.apply(100.0, 70.0);
        assert!(approx(fork.work(), 70.0));
    }

    #[test]
    fn test_feeds_parent_share() {
        let root = Monitor::new();
        root.begin(100.0);
        let mut remote = RemoteProgress::new(root.fork(50.0));

        remote.apply(100.0, 30.0);
        remote.apply(100.0, 55.0);
        assert!(approx(root.work(), 27.5));
    }

    #[test]
    fn test_invalid_reports_ignored() {
        let fork = Monitor::new();
        let mut remote = RemoteProgress::new(fork.clone());

        remote.apply(0.0, 10.0);
        remote.apply(f64::NAN, 1.0);
        assert_eq!(fork.work(), 0.0);
        assert_eq!(fork.total_work(), 0.0);
    }
}
