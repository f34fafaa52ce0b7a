use mintwatch_core_types::Mode;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Lock-free published mode. Consumers load this on their hot path; only the
/// backpressure controller stores.
#[derive(Debug)]
pub struct ModeCell {
    value: AtomicU8,
}

impl ModeCell {
    pub fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            value: AtomicU8::new(mode_to_u8(mode)),
        })
    }

    pub fn load(&self) -> Mode {
        u8_to_mode(self.value.load(Ordering::Relaxed))
    }

    fn store(&self, mode: Mode) {
        self.value.store(mode_to_u8(mode), Ordering::Relaxed);
    }
}

fn mode_to_u8(mode: Mode) -> u8 {
    match mode {
        Mode::Normal => 0,
        Mode::Degraded => 1,
        Mode::Critical => 2,
    }
}

fn u8_to_mode(value: u8) -> Mode {
    match value {
        0 => Mode::Normal,
        1 => Mode::Degraded,
        _ => Mode::Critical,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub lag_warn_s: f64,
    pub lag_crit_s: f64,
    pub buf_warn: usize,
    pub buf_crit: usize,
}

/// Mode controller fed by the 1 s sampler. Escalation applies immediately;
/// recovery steps down one level only after `recovery_samples` consecutive
/// samples agree, so a flapping signal cannot thrash the pipeline.
pub struct BackpressureController {
    mode: Arc<ModeCell>,
    thresholds: RwLock<Thresholds>,
    recovery_samples: u32,
    recovery_streak: AtomicU32,
    mode_changes: AtomicU64,
}

impl BackpressureController {
    pub fn new(thresholds: Thresholds, recovery_samples: u32) -> Self {
        Self {
            mode: ModeCell::new(Mode::Normal),
            thresholds: RwLock::new(thresholds),
            recovery_samples: recovery_samples.max(1),
            recovery_streak: AtomicU32::new(0),
            mode_changes: AtomicU64::new(0),
        }
    }

    pub fn mode_cell(&self) -> Arc<ModeCell> {
        Arc::clone(&self.mode)
    }

    pub fn mode(&self) -> Mode {
        self.mode.load()
    }

    pub fn mode_changes(&self) -> u64 {
        self.mode_changes.load(Ordering::Relaxed)
    }

    /// Thresholds are hot-reloadable via the `backpressure` config section.
    pub fn update_thresholds(&self, thresholds: Thresholds) {
        let mut guard = self
            .thresholds
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = thresholds;
    }

    pub fn observe(&self, lag_seconds: Option<f64>, buffer_len: usize) -> Mode {
        let target = self.target_mode(lag_seconds, buffer_len);
        let current = self.mode.load();

        let next = if target > current {
            self.recovery_streak.store(0, Ordering::Relaxed);
            target
        } else if target < current {
            let streak = self.recovery_streak.fetch_add(1, Ordering::Relaxed) + 1;
            if streak >= self.recovery_samples {
                self.recovery_streak.store(0, Ordering::Relaxed);
                step_down(current)
            } else {
                current
            }
        } else {
            self.recovery_streak.store(0, Ordering::Relaxed);
            current
        };

        if next != current {
            self.mode_changes.fetch_add(1, Ordering::Relaxed);
            warn!(
                from = current.as_str(),
                to = next.as_str(),
                lag_seconds = lag_seconds.unwrap_or(0.0),
                buffer_len,
                "backpressure mode changed"
            );
            self.mode.store(next);
        }
        next
    }

    fn target_mode(&self, lag_seconds: Option<f64>, buffer_len: usize) -> Mode {
        let thresholds = *self
            .thresholds
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let lag = lag_seconds.unwrap_or(0.0);
        if lag >= thresholds.lag_crit_s || buffer_len >= thresholds.buf_crit {
            Mode::Critical
        } else if lag >= thresholds.lag_warn_s || buffer_len >= thresholds.buf_warn {
            Mode::Degraded
        } else {
            Mode::Normal
        }
    }
}

fn step_down(mode: Mode) -> Mode {
    match mode {
        Mode::Critical => Mode::Degraded,
        Mode::Degraded | Mode::Normal => Mode::Normal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> BackpressureController {
        BackpressureController::new(
            Thresholds {
                lag_warn_s: 5.0,
                lag_crit_s: 30.0,
                buf_warn: 50_000,
                buf_crit: 80_000,
            },
            5,
        )
    }

    #[test]
    fn escalation_is_immediate() {
        let controller = controller();
        assert_eq!(controller.observe(Some(1.0), 100), Mode::Normal);
        assert_eq!(controller.observe(Some(6.0), 100), Mode::Degraded);
        assert_eq!(controller.observe(Some(31.0), 100), Mode::Critical);
    }

    #[test]
    fn buffer_thresholds_escalate_like_lag() {
        let controller = controller();
        assert_eq!(controller.observe(Some(0.0), 50_000), Mode::Degraded);
        assert_eq!(controller.observe(Some(0.0), 80_000), Mode::Critical);
    }

    #[test]
    fn recovery_requires_five_consecutive_clean_samples() {
        let controller = controller();
        controller.observe(Some(6.0), 100);
        assert_eq!(controller.mode(), Mode::Degraded);

        for _ in 0..4 {
            assert_eq!(controller.observe(Some(1.0), 100), Mode::Degraded);
        }
        assert_eq!(controller.observe(Some(1.0), 100), Mode::Normal);
    }

    #[test]
    fn a_dirty_sample_resets_the_recovery_streak() {
        let controller = controller();
        controller.observe(Some(6.0), 100);

        for _ in 0..3 {
            controller.observe(Some(1.0), 100);
        }
        controller.observe(Some(7.0), 100);
        for _ in 0..4 {
            assert_eq!(controller.observe(Some(1.0), 100), Mode::Degraded);
        }
        assert_eq!(controller.observe(Some(1.0), 100), Mode::Normal);
    }

    #[test]
    fn recovery_from_critical_steps_through_degraded() {
        let controller = controller();
        controller.observe(Some(40.0), 100);
        assert_eq!(controller.mode(), Mode::Critical);

        for _ in 0..5 {
            controller.observe(Some(1.0), 100);
        }
        assert_eq!(controller.mode(), Mode::Degraded);
        for _ in 0..5 {
            controller.observe(Some(1.0), 100);
        }
        assert_eq!(controller.mode(), Mode::Normal);
    }

    #[test]
    fn published_cell_tracks_controller_mode() {
        let controller = controller();
        let cell = controller.mode_cell();
        controller.observe(Some(35.0), 0);
        assert_eq!(cell.load(), Mode::Critical);
    }

    #[test]
    fn threshold_update_applies_to_next_sample() {
        let controller = controller();
        controller.update_thresholds(Thresholds {
            lag_warn_s: 1.0,
            lag_crit_s: 2.0,
            buf_warn: 10,
            buf_crit: 20,
        });
        assert_eq!(controller.observe(Some(1.5), 0), Mode::Degraded);
    }
}
