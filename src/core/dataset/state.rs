//! The two coalescing state machines the dataset manager debounces work
//! through: a per-dataset reload queue and a singleton recompile request.
//! Grounded on
//! `original_source/erddaputil/erddap/datasets.py::_queue_dataset_reload`
//! and `_queue_recompilation`.

use std::time::Instant;

/// A pending reload for one dataset. `flag` tracks the strongest reload
/// severity requested since the last flush; it only ever upgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReloadFlag {
    Soft = 0,
    Bad = 1,
    Hard = 2,
}

#[derive(Debug, Clone)]
pub struct DatasetReloadEntry {
    pub flag: ReloadFlag,
    pub first_queued_at: Instant,
    pub last_queued_at: Instant,
}

impl DatasetReloadEntry {
    pub fn new(flag: ReloadFlag, now: Instant) -> Self {
        Self {
            flag,
            first_queued_at: now,
            last_queued_at: now,
        }
    }

    /// Merges a new request into this entry: the flag can only increase in
    /// severity, and the sliding timestamp always advances to `now` so a
    /// dataset under continuous churn keeps getting pushed back within
    /// `max_delay`.
    pub fn merge(&mut self, flag: ReloadFlag, now: Instant) {
        if flag > self.flag {
            self.flag = flag;
        }
        self.last_queued_at = now;
    }

    /// True once the quiet period since the last enqueue (`max_delay`) has
    /// elapsed, or immediately if `max_delay` is zero. The other drain
    /// trigger — the queue holding more than `max_pending` entries — is a
    /// property of the whole queue, not a single entry, and is applied by
    /// the manager across all entries sorted by `enqueued_at`.
    pub fn is_due(&self, now: Instant, max_delay: std::time::Duration) -> bool {
        max_delay.is_zero() || now.duration_since(self.last_queued_at) >= max_delay
    }
}

/// The single outstanding recompilation request. `skip_errored` only ever
/// downgrades toward `false` (once any requester wants misconfigured
/// datasets included, that sticks); `reload_all` only ever upgrades toward
/// `true`.
#[derive(Debug, Clone)]
pub struct RecompileRequest {
    pub skip_errored: bool,
    pub reload_all: bool,
    pub first_queued_at: Instant,
    pub last_queued_at: Instant,
}

impl RecompileRequest {
    pub fn new(skip_errored: bool, reload_all: bool, now: Instant) -> Self {
        Self {
            skip_errored,
            reload_all,
            first_queued_at: now,
            last_queued_at: now,
        }
    }

    pub fn merge(&mut self, skip_errored: bool, reload_all: bool, now: Instant) {
        self.skip_errored = self.skip_errored && skip_errored;
        self.reload_all = self.reload_all || reload_all;
        self.last_queued_at = now;
    }

    pub fn is_due(&self, now: Instant, max_recompile_delay: std::time::Duration) -> bool {
        max_recompile_delay.is_zero() || now.duration_since(self.last_queued_at) >= max_recompile_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn reload_flag_merge_only_upgrades() {
        let now = Instant::now();
        let mut entry = DatasetReloadEntry::new(ReloadFlag::Soft, now);
        entry.merge(ReloadFlag::Bad, now);
        assert_eq!(entry.flag, ReloadFlag::Bad);
        entry.merge(ReloadFlag::Soft, now);
        assert_eq!(entry.flag, ReloadFlag::Bad, "flag must never downgrade");
        entry.merge(ReloadFlag::Hard, now);
        assert_eq!(entry.flag, ReloadFlag::Hard);
    }

    #[test]
    fn recompile_request_skip_errored_only_downgrades_to_false() {
        let now = Instant::now();
        let mut req = RecompileRequest::new(true, false, now);
        req.merge(true, false, now);
        assert!(req.skip_errored);
        req.merge(false, false, now);
        assert!(!req.skip_errored);
        req.merge(true, false, now);
        assert!(!req.skip_errored, "must never flip back to true once cleared");
    }

    #[test]
    fn recompile_request_reload_all_only_upgrades_to_true() {
        let now = Instant::now();
        let mut req = RecompileRequest::new(true, false, now);
        req.merge(true, true, now);
        assert!(req.reload_all);
        req.merge(true, false, now);
        assert!(req.reload_all, "must never flip back to false once set");
    }

    #[test]
    fn is_due_once_quiet_period_elapses() {
        let start = Instant::now();
        let entry = DatasetReloadEntry {
            flag: ReloadFlag::Soft,
            first_queued_at: start,
            last_queued_at: start,
        };
        assert!(!entry.is_due(start + Duration::from_millis(500), Duration::from_secs(2)));
        assert!(entry.is_due(start + Duration::from_secs(3), Duration::from_secs(2)));
    }

    #[test]
    fn zero_max_delay_drains_immediately() {
        let now = Instant::now();
        let entry = DatasetReloadEntry::new(ReloadFlag::Soft, now);
        assert!(entry.is_due(now, Duration::ZERO));
    }
}
