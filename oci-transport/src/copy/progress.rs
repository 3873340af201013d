//! Rate-limited progress reporting. The copy pipeline can report after
//! every single chunk of every layer; emitting all of those to a caller's
//! callback would dominate the time spent actually copying, so this
//! throttles to at most one emission per interval per logical event
//! (plus always emitting the final "done" for each).

use std::time::{Duration, Instant};

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    LayerStarted { index: usize, total: usize },
    LayerBytes { index: usize, bytes_done: u64, bytes_total: i64 },
    LayerFinished { index: usize },
    ManifestPut,
}

pub struct NullProgressSink;
impl ProgressSink for NullProgressSink {
    fn on_progress(&self, _event: ProgressEvent) {}
}

/// Wraps a [`ProgressSink`] with a minimum interval between `LayerBytes`
/// emissions for the same layer index. Non-bytes events always pass
/// through immediately.
pub struct RateLimitedProgress<S: ProgressSink> {
    inner: S,
    interval: Duration,
    last_emit: std::sync::Mutex<std::collections::HashMap<usize, Instant>>,
}

impl<S: ProgressSink> RateLimitedProgress<S> {
    pub fn new(inner: S, interval: Duration) -> Self {
        RateLimitedProgress { inner, interval, last_emit: std::sync::Mutex::new(std::collections::HashMap::new()) }
    }

    pub fn report(&self, event: ProgressEvent) {
        if let ProgressEvent::LayerBytes { index, .. } = &event {
            let mut last = self.last_emit.lock().expect("progress rate-limit lock poisoned");
            let now = Instant::now();
            if let Some(prev) = last.get(index) {
                if now.duration_since(*prev) < self.interval {
                    return;
                }
            }
            last.insert(*index, now);
        }
        self.inner.on_progress(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink(Arc<AtomicUsize>);
    impl ProgressSink for CountingSink {
        fn on_progress(&self, _event: ProgressEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn bursts_of_byte_events_are_throttled() {
        let count = Arc::new(AtomicUsize::new(0));
        let limiter = RateLimitedProgress::new(CountingSink(count.clone()), Duration::from_secs(60));
        for i in 0..100 {
            limiter.report(ProgressEvent::LayerBytes { index: 0, bytes_done: i, bytes_total: 100 });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_layer_indices_are_tracked_independently() {
        let count = Arc::new(AtomicUsize::new(0));
        let limiter = RateLimitedProgress::new(CountingSink(count.clone()), Duration::from_secs(60));
        limiter.report(ProgressEvent::LayerBytes { index: 0, bytes_done: 1, bytes_total: 10 });
        limiter.report(ProgressEvent::LayerBytes { index: 1, bytes_done: 1, bytes_total: 10 });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn non_bytes_events_always_pass_through() {
        let count = Arc::new(AtomicUsize::new(0));
        let limiter = RateLimitedProgress::new(CountingSink(count.clone()), Duration::from_secs(60));
        limiter.report(ProgressEvent::LayerStarted { index: 0, total: 1 });
        limiter.report(ProgressEvent::LayerFinished { index: 0 });
        limiter.report(ProgressEvent::ManifestPut);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
