//! Lifecycle stage notifications for queue observers.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle stages an observer can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RunnerStage {
    /// The consumer is about to block in the I/O waiter.
    BeforeWaiting = 1 << 0,
    /// The consumer returned from the I/O waiter.
    AfterWaiting = 1 << 1,
    /// The VIP bucket went from empty to non-empty.
    VipExisted = 1 << 2,
    /// The VIP bucket was drained.
    VipNone = 1 << 3,
}

/// Set of [`RunnerStage`]s.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StageMask(u32);

impl StageMask {
    pub const EMPTY: StageMask = StageMask(0);
    pub const ALL: StageMask = StageMask(0b1111);

    pub fn contains(self, stage: RunnerStage) -> bool {
        self.0 & stage as u32 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl From<RunnerStage> for StageMask {
    fn from(stage: RunnerStage) -> Self {
        Self(stage as u32)
    }
}

impl BitOr for StageMask {
    type Output = StageMask;

    fn bitor(self, rhs: StageMask) -> StageMask {
        StageMask(self.0 | rhs.0)
    }
}

impl BitOr for RunnerStage {
    type Output = StageMask;

    fn bitor(self, rhs: RunnerStage) -> StageMask {
        StageMask::from(self) | StageMask::from(rhs)
    }
}

impl BitOr<RunnerStage> for StageMask {
    type Output = StageMask;

    fn bitor(self, rhs: RunnerStage) -> StageMask {
        self | StageMask::from(rhs)
    }
}

impl fmt::Debug for StageMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StageMask({:#06b})", self.0)
    }
}

/// Information passed to an observer callback.
#[derive(Debug, Clone, Copy)]
pub struct StageInfo {
    /// When the stage was reached.
    pub timestamp: Instant,
    /// Planned sleep for [`RunnerStage::BeforeWaiting`]; `None` means until notified.
    pub sleep_time: Option<Duration>,
}

impl StageInfo {
    pub(crate) fn now(sleep_time: Option<Duration>) -> Self {
        Self {
            timestamp: Instant::now(),
            sleep_time,
        }
    }
}

/// Observer callback. The returned status is only logged.
pub type StageCallback = Arc<dyn Fn(RunnerStage, &StageInfo) -> i32 + Send + Sync>;

/// A registered observer.
#[derive(Clone)]
pub(crate) struct StageObserver {
    pub stages: StageMask,
    pub callback: StageCallback,
}

impl StageObserver {
    /// Invoke the callback if it subscribed to `stage`.
    pub fn notify(&self, stage: RunnerStage, info: &StageInfo) {
        if !self.stages.contains(stage) {
            return;
        }
        let status = (self.callback)(stage, info);
        tracing::trace!(
            target: crate::logging::targets::QUEUE,
            ?stage,
            status,
            "observer notified"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_mask_composition() {
        let mask = RunnerStage::BeforeWaiting | RunnerStage::VipNone;
        assert!(mask.contains(RunnerStage::BeforeWaiting));
        assert!(mask.contains(RunnerStage::VipNone));
        assert!(!mask.contains(RunnerStage::AfterWaiting));
        assert_eq!(mask.bits(), 0b1001);
        assert!(StageMask::EMPTY.is_empty());
    }

    #[test]
    fn test_observer_filters_stages() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let observer = StageObserver {
            stages: RunnerStage::VipExisted.into(),
            callback: Arc::new(move |_: RunnerStage, _: &StageInfo| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                0
            }),
        };

        observer.notify(RunnerStage::BeforeWaiting, &StageInfo::now(None));
        observer.notify(RunnerStage::VipExisted, &StageInfo::now(None));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
