use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Per-loop counters. Mutated only from the owning loop's thread but read
/// with atomics so introspection from other threads never contends the
/// loop.
#[derive(Default)]
pub struct Profile {
    established_count: AtomicU64,
    active_count: AtomicU64,
    closed_count: AtomicU64,
    recv_bytes_total: AtomicU64,
    send_bytes_total: AtomicU64,
    recv_bytes_at_last_sample: AtomicU64,
    send_bytes_at_last_sample: AtomicU64,
    last_sample: std::sync::Mutex<Option<Instant>>,
}

#[derive(Debug, Clone, Copy)]
pub struct Bandwidth {
    pub recv_bytes_per_sec: f64,
    pub send_bytes_per_sec: f64,
}

impl Profile {
    pub fn on_channel_established(&self) {
        self.established_count.fetch_add(1, Ordering::Relaxed);
        self.active_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_channel_closed(&self) {
        self.closed_count.fetch_add(1, Ordering::Relaxed);
        self.active_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn on_bytes_recv(&self, n: u64) {
        self.recv_bytes_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn on_bytes_send(&self, n: u64) {
        self.send_bytes_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::Relaxed)
    }

    pub fn established_count(&self) -> u64 {
        self.established_count.load(Ordering::Relaxed)
    }

    pub fn closed_count(&self) -> u64 {
        self.closed_count.load(Ordering::Relaxed)
    }

    /// Bytes-since-last-sample divided by wall-clock seconds since last
    /// sample, floored at one second. The numerator is a byte-count delta,
    /// not a byte-count-minus-timestamp subtraction.
    pub fn sample_bandwidth(&self, now: Instant) -> Bandwidth {
        let mut last_sample = self.last_sample.lock().unwrap();
        let elapsed = last_sample
            .map(|t| now.saturating_duration_since(t).as_secs_f64())
            .unwrap_or(1.0)
            .max(1.0);
        *last_sample = Some(now);

        let recv_total = self.recv_bytes_total.load(Ordering::Relaxed);
        let send_total = self.send_bytes_total.load(Ordering::Relaxed);
        let recv_prev = self.recv_bytes_at_last_sample.swap(recv_total, Ordering::Relaxed);
        let send_prev = self.send_bytes_at_last_sample.swap(send_total, Ordering::Relaxed);

        Bandwidth {
            recv_bytes_per_sec: (recv_total.saturating_sub(recv_prev)) as f64 / elapsed,
            send_bytes_per_sec: (send_total.saturating_sub(send_prev)) as f64 / elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn bandwidth_uses_byte_delta_not_timestamp() {
        let profile = Profile::default();
        let t0 = Instant::now();
        profile.sample_bandwidth(t0);
        profile.on_bytes_send(2000);
        let bw = profile.sample_bandwidth(t0 + Duration::from_secs(2));
        assert_eq!(bw.send_bytes_per_sec, 1000.0);
    }

    #[test]
    fn established_count_never_subtracts_a_fudge_factor() {
        let profile = Profile::default();
        profile.on_channel_established();
        profile.on_channel_established();
        assert_eq!(profile.established_count(), 2);
    }
}
