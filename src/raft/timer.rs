use parking_lot::{Condvar, Mutex};
use rand::Rng as _;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// The election timer. Waits for a randomized timeout drawn uniformly from
/// [elect_timeout, 2 * elect_timeout), redrawn on every reset, and invokes
/// the expiry callback when it elapses undisturbed. Valid traffic from the
/// current leader and granted votes reset it; a leader lets it expire
/// harmlessly, since its expiry callback ignores leaders.
#[derive(Clone)]
pub struct Timer {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

struct TimerState {
    /// Bumped on every reset, so the timer thread can tell a reset wakeup
    /// from a timeout.
    epoch: u64,
    shutdown: bool,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TimerState { epoch: 0, shutdown: false }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Spawns the timer thread. expire is invoked on each undisturbed
    /// timeout, on the timer thread.
    pub fn start(
        &self,
        elect_timeout: Duration,
        expire: impl Fn() + Send + 'static,
    ) -> std::io::Result<JoinHandle<()>> {
        let shared = self.shared.clone();
        std::thread::Builder::new()
            .name("raft-timer".to_string())
            .spawn(move || Self::run(shared, elect_timeout, expire))
    }

    fn run(shared: Arc<Shared>, elect_timeout: Duration, expire: impl Fn()) {
        let millis = elect_timeout.as_millis() as u64;
        let mut rng = rand::thread_rng();
        loop {
            let timeout = Duration::from_millis(rng.gen_range(millis..2 * millis));
            let mut state = shared.state.lock();
            if state.shutdown {
                return;
            }
            let epoch = state.epoch;
            let timed_out = shared.cond.wait_for(&mut state, timeout).timed_out();
            if state.shutdown {
                return;
            }
            if !timed_out || state.epoch != epoch {
                continue;
            }
            drop(state);
            expire();
        }
    }

    /// Resets the timer, redrawing the randomized timeout.
    pub fn reset(&self) {
        let mut state = self.shared.state.lock();
        state.epoch += 1;
        self.shared.cond.notify_all();
    }

    /// Stops the timer thread.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        self.shared.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_after_timeout() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = Timer::new();
        let handle = {
            let fired = fired.clone();
            timer
                .start(Duration::from_millis(20), move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                })
                .expect("timer start failed")
        };
        std::thread::sleep(Duration::from_millis(200));
        assert!(fired.load(Ordering::SeqCst) >= 1);
        timer.shutdown();
        handle.join().expect("timer thread panicked");
    }

    #[test]
    fn reset_defers_expiry() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = Timer::new();
        let handle = {
            let fired = fired.clone();
            timer
                .start(Duration::from_millis(100), move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                })
                .expect("timer start failed")
        };
        // Reset well within every timeout draw; the timer must never fire.
        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(30));
            timer.reset();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.shutdown();
        handle.join().expect("timer thread panicked");
    }
}
