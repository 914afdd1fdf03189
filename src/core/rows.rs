//! # Row dispatcher
//!
//! Work is divided across threads by rows. Threads call [`RowDispatcher::next`]
//! to be handed the next unprocessed row.
//!
//! We do not simply split the image into one large span per thread: if one
//! thread runs more slowly than the rest (CPU contention with another
//! process, or some rows being more expensive than others), it would
//! bottleneck the whole stage while the other threads sit idle. Handing
//! out single rows keeps the pool busy until the work is actually gone.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Atomic row-index counter over `[0, rows)`.
///
/// `init`/`reset` are called on the primary thread while the others are
/// parked at the stage barrier; the barrier orders the reset against the
/// next stage's fetches.
#[derive(Debug, Default)]
pub struct RowDispatcher {
    rows: AtomicUsize,
    next: AtomicUsize,
}

impl RowDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&self, rows: usize) {
        self.rows.store(rows, Ordering::Relaxed);
        self.reset();
    }

    pub fn reset(&self) {
        self.next.store(0, Ordering::Relaxed);
    }

    /// Claim the next row, or `None` when the pass is exhausted.
    #[inline]
    pub fn next(&self) -> Option<usize> {
        let y = self.next.fetch_add(1, Ordering::Relaxed);
        if y < self.rows.load(Ordering::Relaxed) {
            Some(y)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn hands_out_each_row_exactly_once() {
        let d = Arc::new(RowDispatcher::new());
        d.init(1000);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let d = Arc::clone(&d);
            handles.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                while let Some(y) = d.next() {
                    got.push(y);
                }
                got
            }));
        }
        let mut all: Vec<usize> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        let expect: Vec<usize> = (0..1000).collect();
        assert_eq!(all, expect);
    }

    #[test]
    fn reset_restarts_the_pass() {
        let d = RowDispatcher::new();
        d.init(2);
        assert_eq!(d.next(), Some(0));
        assert_eq!(d.next(), Some(1));
        assert_eq!(d.next(), None);
        d.reset();
        assert_eq!(d.next(), Some(0));
    }

    #[test]
    fn zero_rows_is_immediately_exhausted() {
        let d = RowDispatcher::new();
        d.init(0);
        assert_eq!(d.next(), None);
    }
}
