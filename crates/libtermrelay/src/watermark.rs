use tracing::debug;

/// Reading stops once more than this many output messages are unacknowledged.
pub const READ_BLOCK_HIGH: usize = 10;
/// Reading resumes once fewer than this many are unacknowledged.
pub const READ_BLOCK_LOW: usize = 5;

/// Hysteresis over unacknowledged terminal output messages.
///
/// `on_sent` and `on_acked` return `Some(enabled)` only when the reading
/// state flips, so callers toggle the shell readers exactly on the edges.
#[derive(Debug)]
pub struct OutputWatermark {
    pending: usize,
    reading: bool,
    high: usize,
    low: usize,
}

impl OutputWatermark {
    pub fn new() -> Self {
        Self::with_marks(READ_BLOCK_HIGH, READ_BLOCK_LOW)
    }

    pub fn with_marks(high: usize, low: usize) -> Self {
        Self {
            pending: 0,
            reading: true,
            high,
            low,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn reading_enabled(&self) -> bool {
        self.reading
    }

    pub fn on_sent(&mut self) -> Option<bool> {
        self.pending += 1;
        self.resolve()
    }

    pub fn on_acked(&mut self) -> Option<bool> {
        if self.pending == 0 {
            debug!("output ack with nothing pending");
        }
        self.pending = self.pending.saturating_sub(1);
        self.resolve()
    }

    /// Forget outstanding messages, e.g. after the connection dropped.
    pub fn reset(&mut self) -> Option<bool> {
        self.pending = 0;
        self.resolve()
    }

    fn resolve(&mut self) -> Option<bool> {
        if self.reading && self.pending > self.high {
            self.reading = false;
            Some(false)
        } else if !self.reading && self.pending < self.low {
            self.reading = true;
            Some(true)
        } else {
            None
        }
    }
}

impl Default for OutputWatermark {
    fn default() -> Self {
        Self::new()
    }
}
