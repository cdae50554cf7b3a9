use tracing::error;

/// Monotonic `u32` id source. Ids start at 1; zero is never handed out.
#[derive(Debug)]
pub struct IdCounter {
    last: u32,
    kind: &'static str,
}

impl IdCounter {
    pub const fn new(kind: &'static str) -> Self {
        Self { last: 0, kind }
    }

    pub fn next(&mut self) -> u32 {
        if self.last == u32::MAX {
            error!(kind = self.kind, "id counter overflow, wrapping");
            self.last = 0;
        }
        self.last += 1;
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::IdCounter;

    #[test]
    fn ids_are_strictly_increasing() {
        let mut ids = IdCounter::new("terminal");
        let taken: Vec<u32> = (0..100).map(|_| ids.next()).collect();
        assert_eq!(taken[0], 1);
        assert!(taken.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn overflow_wraps_past_zero() {
        let mut ids = IdCounter {
            last: u32::MAX - 1,
            kind: "terminal",
        };
        assert_eq!(ids.next(), u32::MAX);
        assert_eq!(ids.next(), 1);
    }
}
