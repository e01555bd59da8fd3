use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

/// Sliding-window counter of nonces tried by the local sealing workers.
#[derive(Debug, Clone)]
pub struct HashrateMeter {
    window: Duration,
    samples: Arc<Mutex<VecDeque<(Instant, u64)>>>,
}

impl Default for HashrateMeter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl HashrateMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(128))),
        }
    }

    /// Record `count` hashes computed just now.
    pub fn mark(&self, count: u64) {
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.push_back((now, count));
        Self::prune(&mut samples, now, self.window);
    }

    /// Hashes per second over the window.
    pub fn rate(&self) -> f64 {
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        Self::prune(&mut samples, now, self.window);

        let total: u64 = samples.iter().map(|(_, count)| count).sum();
        total as f64 / self.window.as_secs_f64()
    }

    fn prune(samples: &mut VecDeque<(Instant, u64)>, now: Instant, window: Duration) {
        let Some(cutoff) = now.checked_sub(window) else {
            return;
        };
        while let Some((ts, _)) = samples.front() {
            if *ts < cutoff {
                samples.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_averages_over_window() {
        let meter = HashrateMeter::new(Duration::from_secs(10));
        assert_eq!(0.0, meter.rate());

        meter.mark(500);
        meter.mark(500);
        assert_eq!(100.0, meter.rate());
    }

    #[test]
    fn old_samples_fall_out() {
        let meter = HashrateMeter::new(Duration::from_millis(20));
        meter.mark(1_000);
        assert!(meter.rate() > 0.0);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(0.0, meter.rate());
    }

    #[test]
    fn clones_share_samples() {
        let meter = HashrateMeter::default();
        let worker = meter.clone();
        worker.mark(20);
        assert_eq!(2.0, meter.rate());
    }
}
