//! Opt-in timing instrumentation.
//!
//! A [`TimingGuard`] measures a scope and, when telemetry is switched on and the requested
//! level passes both the telemetry threshold and the logger filter, emits one record on the
//! `layerdrive::telemetry` target when it is dropped. With telemetry off the guard only holds
//! an `Instant`.

use std::{
    borrow::Cow,
    sync::atomic::{AtomicU8, Ordering},
    time::{Duration, Instant},
};

use log::{Level, LevelFilter, log, log_enabled};

/// Log target used for every telemetry record.
pub const TELEMETRY_TARGET: &str = "layerdrive::telemetry";

// 0 disables telemetry; otherwise the highest level (1 = error .. 5 = trace) that may be emitted.
static THRESHOLD: AtomicU8 = AtomicU8::new(0);

/// Scoped stopwatch that reports its elapsed time on drop.
#[derive(Debug)]
pub struct TimingGuard {
    label: Cow<'static, str>,
    level: Level,
    start: Instant,
    emit: bool,
}

impl TimingGuard {
    /// Whether dropping this guard will write a log record.
    pub fn is_active(&self) -> bool {
        self.emit
    }

    /// Time since the guard was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the guard and hand back the elapsed time. The record is still emitted when active.
    pub fn finish(self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        if self.emit {
            log!(
                target: TELEMETRY_TARGET,
                self.level,
                "{} took {:.2?}",
                self.label,
                self.start.elapsed()
            );
        }
    }
}

/// Start timing `label`; the record is emitted at `level` if telemetry allows it.
pub fn timing_guard(label: impl Into<Cow<'static, str>>, level: Level) -> TimingGuard {
    let emit = telemetry_allows(level) && log_enabled!(target: TELEMETRY_TARGET, level);
    TimingGuard {
        label: label.into(),
        level,
        start: Instant::now(),
        emit,
    }
}

/// Switch telemetry on or off and set its level ceiling.
pub fn configure(enabled: bool, level: LevelFilter) {
    let threshold = if enabled { level as usize as u8 } else { 0 };
    THRESHOLD.store(threshold, Ordering::Relaxed);
}

/// Whether telemetry is currently switched on.
pub fn telemetry_enabled() -> bool {
    THRESHOLD.load(Ordering::Relaxed) > 0
}

/// Current telemetry ceiling (`Off` while disabled).
pub fn telemetry_level() -> LevelFilter {
    match THRESHOLD.load(Ordering::Relaxed) {
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        5 => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}

/// Whether a telemetry record at `level` would pass the configured ceiling.
pub fn telemetry_allows(level: Level) -> bool {
    level <= telemetry_level()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Telemetry state is process global, so all assertions live in one test.
    #[test]
    fn threshold_follows_configuration() {
        configure(false, LevelFilter::Trace);
        assert!(!telemetry_enabled());
        assert!(!telemetry_allows(Level::Error));
        assert_eq!(telemetry_level(), LevelFilter::Off);

        configure(true, LevelFilter::Info);
        assert!(telemetry_enabled());
        assert!(telemetry_allows(Level::Warn));
        assert!(telemetry_allows(Level::Info));
        assert!(!telemetry_allows(Level::Debug));

        configure(true, LevelFilter::Off);
        assert!(!telemetry_enabled());

        configure(false, LevelFilter::Off);
        let guard = timing_guard("idle", Level::Info);
        assert!(!guard.is_active());
        assert!(guard.finish() >= Duration::ZERO);
    }
}
