// Monotonic accumulator for counter-type samples
//
// Raw sources such as interface byte counters go backwards when an
// interface is recreated or a 32-bit counter wraps. Exported counters must
// never regress, so collectors feed raw readings through this type instead
// of reporting them directly.

use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct State {
    last_raw: Option<f64>,
    total: f64,
}

/// Internally synchronized counter that only ever grows.
///
/// # Example
/// ```
/// use metrics_pusher::metrics::MonotonicCounter;
///
/// let counter = MonotonicCounter::new();
/// counter.observe(100.0);
/// counter.observe(150.0);
/// // source reset: the new reading counts from zero
/// assert_eq!(counter.observe(20.0), 170.0);
/// ```
#[derive(Debug, Default)]
pub struct MonotonicCounter {
    state: Mutex<State>,
}

impl MonotonicCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a cumulative raw reading and returns the accumulated total.
    ///
    /// The first reading is taken as-is. A reading lower than the previous
    /// one is treated as a source reset and added in full.
    pub fn observe(&self, raw: f64) -> f64 {
        if !raw.is_finite() || raw < 0.0 {
            return self.get();
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let delta = match state.last_raw {
            Some(last) if raw >= last => raw - last,
            _ => raw,
        };
        state.last_raw = Some(raw);
        state.total += delta;
        state.total
    }

    /// Adds a non-negative increment; negative or non-finite input is ignored.
    pub fn add(&self, delta: f64) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if delta.is_finite() && delta > 0.0 {
            state.total += delta;
        }
        state.total
    }

    pub fn get(&self) -> f64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total
    }
}
