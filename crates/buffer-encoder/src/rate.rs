/// Picks which source frames reach the encoder when the target frame rate is
/// below the source frame rate.
///
/// The n-th forwarded frame is the source frame nearest to `n * keep_interval`.
/// Positions are computed from `n` directly rather than by summing the
/// interval, so a fractional ratio does not drift over long runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRateSelector {
    keep_interval: f64,
}

impl FrameRateSelector {
    pub fn new(source_rate: f32, target_rate: f32) -> Self {
        let keep_interval = if target_rate > 0.0 && source_rate > 0.0 {
            f64::from(source_rate) / f64::from(target_rate)
        } else {
            1.0
        };

        Self { keep_interval }
    }

    pub fn keep_interval(&self) -> f64 {
        self.keep_interval
    }

    pub fn forwards_all(&self) -> bool {
        self.keep_interval <= 1.0
    }

    /// Source ordinal of the `n`-th forwarded frame.
    pub fn forwarded_ordinal(&self, n: u64) -> u64 {
        if self.forwards_all() {
            return n;
        }
        (n as f64 * self.keep_interval).round() as u64
    }

    pub fn should_forward(&self, ordinal: u64) -> bool {
        if self.forwards_all() {
            return true;
        }

        let estimate = (ordinal as f64 / self.keep_interval).round() as u64;
        (estimate.saturating_sub(1)..=estimate + 1).any(|n| self.forwarded_ordinal(n) == ordinal)
    }
}
