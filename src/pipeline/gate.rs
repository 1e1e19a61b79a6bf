//! Park/unpark hand-off for the hardware-side worker threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::thread::{self, Thread};

/// Suspends a dedicated worker thread until its pipeline lets it run.
///
/// The worker calls [`WorkerGate::attach`] once and then [`WorkerGate::wait`]
/// at the top of every iteration. Other tasks open or close the gate.
#[derive(Default)]
pub struct WorkerGate {
    open: AtomicBool,
    shutdown: AtomicBool,
    worker: OnceLock<Thread>,
}

impl WorkerGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the calling thread as the gated worker.
    pub fn attach(&self) {
        let _ = self.worker.set(thread::current());
    }

    pub fn resume(&self) {
        if !self.open.swap(true, Ordering::SeqCst) {
            log::debug!("worker resumed");
        }
        self.unpark();
    }

    pub fn suspend(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            log::debug!("worker suspended");
        }
    }

    /// Opens or closes the gate.
    pub fn set(&self, open: bool) {
        if open {
            self.resume();
        } else {
            self.suspend();
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Wakes the worker for good; [`WorkerGate::wait`] returns false from now on.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.unpark();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Parks until the gate is open. Returns false once shut down.
    pub fn wait(&self) -> bool {
        loop {
            if self.is_shutdown() {
                return false;
            }
            if self.is_open() {
                return true;
            }
            thread::park();
        }
    }

    fn unpark(&self) {
        if let Some(worker) = self.worker.get() {
            worker.unpark();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_worker_runs_only_while_open() {
        let gate = Arc::new(WorkerGate::new());
        let turns = Arc::new(AtomicUsize::new(0));

        let handle = {
            let gate = gate.clone();
            let turns = turns.clone();
            thread::spawn(move || {
                gate.attach();
                while gate.wait() {
                    turns.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert_eq!(turns.load(Ordering::SeqCst), 0);

        gate.resume();
        thread::sleep(Duration::from_millis(30));
        assert!(turns.load(Ordering::SeqCst) > 0);

        gate.suspend();
        thread::sleep(Duration::from_millis(10));
        let parked_at = turns.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(turns.load(Ordering::SeqCst), parked_at);

        gate.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_shutdown_wins_over_open() {
        let gate = WorkerGate::new();
        gate.resume();
        gate.shutdown();
        assert!(!gate.wait());
    }
}
