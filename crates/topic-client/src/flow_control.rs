use crate::Error;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// Free-percentage level that triggers returning credit to the broker.
/// Returning at the natural ~20% point would cause request chatter under
/// trickle traffic; 35% leaves a dead-band of at least 15%.
const RELEASE_THRESHOLD_PERCENT: i64 = 35;

/// Byte-budget accounting of the read stream.
///
/// `rest_bytes` is the credit the broker may still spend unsolicited. It is
/// debited when a data frame arrives and re-credited only when accumulated
/// consumer releases cross the hysteresis threshold, at which point the
/// accumulated amount becomes the next `ReadRequest`.
pub(crate) struct FlowControl {
    buffer_bytes: i64,
    rest_bytes: AtomicI64,
    /// Bytes released by the consumer since the last emitted `ReadRequest`.
    pending_release: Mutex<i64>,
}

impl FlowControl {
    pub(crate) fn new(buffer_bytes: i64) -> Self {
        Self {
            buffer_bytes,
            rest_bytes: AtomicI64::new(0),
            pending_release: Mutex::new(0),
        }
    }

    /// Grants the whole window at stream start; returns the size of the
    /// initial `ReadRequest`, or `None` for a zero-sized window (in which
    /// case no `ReadRequest` is ever emitted).
    pub(crate) fn initial_grant(&self) -> Option<i64> {
        if self.buffer_bytes == 0 {
            return None;
        }
        self.rest_bytes.store(self.buffer_bytes, Ordering::SeqCst);
        Some(self.buffer_bytes)
    }

    /// Debits an arrived frame; returns the remaining credit, which may go
    /// non-positive when the broker overshoots the window.
    pub(crate) fn debit(&self, bytes: i64) -> i64 {
        self.rest_bytes.fetch_sub(bytes, Ordering::SeqCst) - bytes
    }

    pub(crate) fn rest_bytes(&self) -> i64 {
        self.rest_bytes.load(Ordering::SeqCst)
    }

    /// Lock-free check for the force-delivery condition: the window is fully
    /// spent and holding messages back could only deadlock the stream.
    pub(crate) fn exhausted(&self) -> bool {
        self.rest_bytes() <= 0
    }

    /// Percentage of the window that is free to be returned to the broker.
    pub(crate) fn free_space_percentage(&self) -> crate::Result<i64> {
        let pending = *self.pending_release.lock().unwrap();
        self.percentage_of_window(pending)
    }

    fn percentage_of_window(&self, pending: i64) -> crate::Result<i64> {
        if self.buffer_bytes == 0 {
            return Err(Error::CannotComputeFreeSpacePercentage);
        }
        let rest = self.rest_bytes();
        if rest > self.buffer_bytes {
            tracing::warn!(
                rest_bytes = rest,
                buffer_bytes = self.buffer_bytes,
                "rest credit exceeds the window, clamping free percentage"
            );
            return Ok(100);
        }
        Ok(pending * 100 / self.buffer_bytes)
    }

    /// Credits `bytes` released by the consumer. Returns `Some(total)` when
    /// the accumulated release crosses the threshold: the caller must emit
    /// `ReadRequest { bytes_size: total }`. The accumulator resets on
    /// emission, so every emission is a fresh rising edge.
    pub(crate) fn release(&self, bytes: i64) -> Option<i64> {
        if bytes <= 0 {
            return None;
        }
        let mut pending = self.pending_release.lock().unwrap();
        *pending += bytes;
        match self.percentage_of_window(*pending) {
            Ok(pct) if pct >= RELEASE_THRESHOLD_PERCENT => {
                let granted = std::mem::take(&mut *pending);
                self.rest_bytes.fetch_add(granted, Ordering::SeqCst);
                Some(granted)
            }
            Ok(_) | Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: i64 = 1_000_000;

    fn granted(flow: &FlowControl) -> i64 {
        flow.initial_grant().expect("non-zero window")
    }

    #[test]
    fn initial_grant_is_full_window() {
        let flow = FlowControl::new(WINDOW);
        assert_eq!(granted(&flow), WINDOW);
        assert_eq!(flow.rest_bytes(), WINDOW);
    }

    #[test]
    fn release_at_threshold_emits_accumulated_bytes() {
        let flow = FlowControl::new(WINDOW);
        granted(&flow);

        flow.debit(350_000);
        assert_eq!(flow.rest_bytes(), 650_000);
        assert_eq!(flow.release(350_000), Some(350_000));
        assert_eq!(flow.rest_bytes(), WINDOW);
    }

    #[test]
    fn release_below_threshold_accumulates() {
        let flow = FlowControl::new(WINDOW);
        granted(&flow);

        flow.debit(200_000);
        assert_eq!(flow.release(200_000), None);
        assert_eq!(flow.rest_bytes(), 800_000);
    }

    #[test]
    fn split_releases_cross_threshold_once() {
        let flow = FlowControl::new(WINDOW);
        granted(&flow);

        flow.debit(150_000);
        flow.debit(200_000);

        // 15% free: under the threshold, nothing emitted.
        assert_eq!(flow.release(150_000), None);
        // Another 20% reaches 35%: one request carrying the full accumulation.
        assert_eq!(flow.release(200_000), Some(350_000));
        assert_eq!(flow.rest_bytes(), WINDOW);
    }

    #[test]
    fn free_space_percentage_table() {
        struct Case {
            buffer: i64,
            pending: i64,
            expect: crate::Result<i64>,
        }
        let cases = [
            Case {
                buffer: 100,
                pending: 20,
                expect: Ok(20),
            },
            Case {
                buffer: 1234,
                pending: 0,
                expect: Ok(0),
            },
            Case {
                buffer: 100,
                pending: 100,
                expect: Ok(100),
            },
            Case {
                buffer: 0,
                pending: 0,
                expect: Err(Error::CannotComputeFreeSpacePercentage),
            },
        ];

        for case in cases {
            let flow = FlowControl::new(case.buffer);
            if case.buffer != 0 {
                granted(&flow);
                flow.debit(case.pending);
            }
            *flow.pending_release.lock().unwrap() = case.pending;
            match (flow.free_space_percentage(), case.expect) {
                (Ok(got), Ok(want)) => assert_eq!(got, want),
                (Err(Error::CannotComputeFreeSpacePercentage), Err(_)) => {}
                (got, want) => panic!("got {got:?}, want {want:?}"),
            }
        }
    }

    #[test]
    fn overshoot_clamps_to_hundred() {
        let flow = FlowControl::new(100);
        granted(&flow);
        // Force the impossible state directly.
        flow.rest_bytes.store(1_000, Ordering::SeqCst);
        assert_eq!(flow.free_space_percentage().unwrap(), 100);
    }

    #[test]
    fn zero_window_never_emits() {
        let flow = FlowControl::new(0);
        assert_eq!(flow.initial_grant(), None);
        flow.debit(10);
        assert_eq!(flow.release(10), None);
        assert!(matches!(
            flow.free_space_percentage(),
            Err(Error::CannotComputeFreeSpacePercentage)
        ));
        // A spent window always force-delivers.
        assert!(flow.exhausted());
    }
}
