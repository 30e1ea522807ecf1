use core_types::Candle;

/// Forward-only lower bound (epoch milliseconds, inclusive) for the next page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    since_ms: i64,
}

impl Cursor {
    pub fn new(start_ms: i64) -> Self {
        Self { since_ms: start_ms }
    }

    pub fn since_ms(&self) -> i64 {
        self.since_ms
    }

    /// Moves the cursor one millisecond past the newest candle in `page` and returns the new
    /// value. Empty pages and pages that would move the cursor backwards leave it unchanged.
    pub fn advance(&mut self, page: &[Candle]) -> i64 {
        if let Some(newest) = page.iter().map(Candle::timestamp_ms).max() {
            let next = newest.saturating_add(1);
            if next > self.since_ms {
                self.since_ms = next;
            }
        }
        self.since_ms
    }

    /// A short page means the provider has nothing newer than the cursor yet.
    pub fn is_exhausted(page: &[Candle], requested: usize) -> bool {
        page.len() < requested
    }
}
