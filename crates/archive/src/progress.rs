/// Turns noisy byte-count callbacks into a short, strictly increasing
/// stream of integer percentages.
///
/// Only multiples of `step` are emitted (plus `100`), `0` is never emitted,
/// and nothing is emitted after [`ProgressThrottle::seal`].
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    step: u8,
    last: u8,
    sealed: bool,
}

impl ProgressThrottle {
    pub fn new(step: u8) -> Self {
        Self {
            step: step.clamp(1, 100),
            last: 0,
            sealed: false,
        }
    }

    /// Feed a raw percentage; returns the value to publish, if any.
    pub fn observe(&mut self, percent: f64) -> Option<u8> {
        if self.sealed || !percent.is_finite() {
            return None;
        }
        let whole = percent.clamp(0.0, 100.0).floor() as u8;
        let bucket = if whole == 100 { 100 } else { whole - whole % self.step };
        if bucket == 0 || bucket <= self.last {
            return None;
        }
        self.last = bucket;
        Some(bucket)
    }

    /// Convenience for `processed / total` byte counts. An empty source is 100%.
    pub fn observe_bytes(&mut self, processed: u64, total: u64) -> Option<u8> {
        let percent = if total == 0 {
            100.0
        } else {
            (processed as f64 / total as f64) * 100.0
        };
        self.observe(percent)
    }

    /// Stop emitting; called once the terminal event for the job is out.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn last_emitted(&self) -> Option<u8> {
        (self.last > 0).then_some(self.last)
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(5)
    }
}
