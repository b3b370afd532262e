//! Available-RAM reading behind the writer's `low_memory_flush` option.
//!
//! The writer asks after every pushed page, so one sysinfo reading is reused
//! until it is `REFRESH_EVERY` old.

use parking_lot::Mutex;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use sysinfo::{System, SystemExt};

const REFRESH_EVERY: Duration = Duration::from_millis(500);

struct RamGauge {
    sys: System,
    read_at: Option<Instant>,
    fraction: f64,
}

impl RamGauge {
    fn fraction(&mut self, now: Instant) -> f64 {
        let stale = self.read_at.map_or(true, |t| now.duration_since(t) >= REFRESH_EVERY);
        if stale {
            self.sys.refresh_memory();
            let total = self.sys.total_memory();
            self.fraction = if total == 0 {
                1.0
            } else {
                (self.sys.available_memory() as f64 / total as f64).clamp(0.0, 1.0)
            };
            self.read_at = Some(now);
        }
        self.fraction
    }
}

static GAUGE: OnceLock<Mutex<RamGauge>> = OnceLock::new();

/// Share of system RAM still available, in `0.0..=1.0`.
pub fn available_memory_fraction() -> f64 {
    GAUGE
        .get_or_init(|| Mutex::new(RamGauge { sys: System::new(), read_at: None, fraction: 1.0 }))
        .lock()
        .fraction(Instant::now())
}

/// Whether the writer should flush before its byte budget is reached.
pub fn is_low_memory(threshold: f64) -> bool {
    available_memory_fraction() < threshold
}
