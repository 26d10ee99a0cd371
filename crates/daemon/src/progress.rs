//! Progress percentage derivation and throttling.

use crate::encode::ProgressReport;
use std::time::{Duration, Instant};

/// Highest percentage reported before the encoder confirms completion.
pub const MAX_IN_FLIGHT_PERCENT: u8 = 99;

/// Turns an encoder progress sample into a whole percentage.
///
/// In priority order:
/// 1. the encoder's own percentage, if it lies in (0, 100]
/// 2. `position / expected_secs`, when both are known
/// 3. zero
///
/// The result never exceeds [`MAX_IN_FLIGHT_PERCENT`]; 100 is reserved for
/// confirmed completion.
pub fn derive_percent(report: &ProgressReport, expected_secs: f64) -> u8 {
    let raw = match report.percent {
        Some(p) if p.is_finite() && p > 0.0 && p <= 100.0 => p.round(),
        _ => match report.position_secs {
            Some(pos) if pos.is_finite() && pos >= 0.0 && expected_secs > 0.0 => {
                (pos / expected_secs * 100.0).round()
            }
            _ => 0.0,
        },
    };
    raw.min(MAX_IN_FLIGHT_PERCENT as f64) as u8
}

/// Rate limiter for progress notifications.
///
/// The first sample always passes; later samples pass once `interval` has
/// elapsed since the last one that did.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    /// Returns true if a notification may be sent now, and records it.
    pub fn ready(&mut self) -> bool {
        self.ready_at(Instant::now())
    }

    fn ready_at(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}
