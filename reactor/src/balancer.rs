use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::LoopBalanceOptions;
use crate::reactor_loop::LoopHandle;

struct Registered {
    handle: LoopHandle,
    options: LoopBalanceOptions,
}

/// Process-wide round-robin picker across loops that opted into inbound or
/// outbound balancing. There is exactly one balancer per process; loops
/// register with it at construction time if they want to participate.
#[derive(Default)]
pub struct Balancer {
    loops: Mutex<Vec<Registered>>,
    next_out: AtomicUsize,
    next_in: AtomicUsize,
}

impl Balancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: LoopHandle, options: LoopBalanceOptions) {
        self.loops.lock().unwrap().push(Registered { handle, options });
    }

    pub fn pick_out(&self, current: &LoopHandle) -> Option<LoopHandle> {
        self.pick(&self.next_out, LoopBalanceOptions::BALANCER_OUT, current)
    }

    pub fn pick_in(&self, current: &LoopHandle) -> Option<LoopHandle> {
        self.pick(&self.next_in, LoopBalanceOptions::BALANCER_IN, current)
    }

    fn pick(
        &self,
        counter: &AtomicUsize,
        required: LoopBalanceOptions,
        current: &LoopHandle,
    ) -> Option<LoopHandle> {
        let loops = self.loops.lock().unwrap();
        let eligible: Vec<&Registered> = loops
            .iter()
            .filter(|r| r.options.contains(required))
            .collect();
        if eligible.is_empty() {
            return None;
        }
        let idx = counter.fetch_add(1, Ordering::Relaxed) % eligible.len();
        let chosen = &eligible[idx];
        if chosen.handle.is_same(current) {
            return None;
        }
        Some(chosen.handle.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor_loop::LoopHandle;

    #[test]
    fn round_robins_across_registered_outbound_loops() {
        let balancer = Balancer::new();
        let a = LoopHandle::detached();
        let b = LoopHandle::detached();
        balancer.register(a.clone(), LoopBalanceOptions::BALANCER_OUT);
        balancer.register(b.clone(), LoopBalanceOptions::BALANCER_OUT);

        let other = LoopHandle::detached();
        let first = balancer.pick_out(&other).unwrap();
        let second = balancer.pick_out(&other).unwrap();
        assert!(!first.is_same(&second));
    }

    #[test]
    fn never_picks_the_caller_itself() {
        let balancer = Balancer::new();
        let a = LoopHandle::detached();
        balancer.register(a.clone(), LoopBalanceOptions::BALANCER_OUT);
        assert!(balancer.pick_out(&a).is_none());
    }
}
