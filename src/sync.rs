//! Readiness signaling between the realtime threads and the application.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/**
    edge-triggered readiness event

    [Self::wait] blocks until the next [Self::signal] after the wait started, using a
    generation counter so a signal is never consumed twice and a wait never returns for a
    signal that happened before it began. Signaling is cheap enough for the job thread to do
    every cycle.
*/
#[derive(Default)]
pub struct Event {
    generation: Mutex<u64>,
    condition: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// wake every thread currently waiting
    pub fn signal(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.condition.notify_all();
    }

    /// block until the next signal
    pub fn wait(&self) {
        let mut generation = self.generation.lock();
        let start = *generation;
        while *generation == start {
            self.condition.wait(&mut generation);
        }
    }

    /// block until the next signal or the timeout, true if signaled
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        let start = *generation;
        while *generation == start {
            if self.condition.wait_until(&mut generation, deadline).timed_out() {
                return *generation != start;
            }
        }
        true
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, time::Duration};

    #[test]
    fn timeout_without_signal() {
        let event = Event::new();
        assert!(! event.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn wakes_on_signal() {
        let event = Arc::new(Event::new());
        let signaler = event.clone();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaler.signal();
        });
        assert!(event.wait_timeout(Duration::from_secs(2)));
        worker.join().unwrap();
    }

    #[test]
    fn signal_before_wait_is_not_consumed() {
        let event = Event::new();
        event.signal();
        assert!(! event.wait_timeout(Duration::from_millis(10)));
    }
}
