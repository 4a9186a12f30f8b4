//! Shutdown signal shared by background workers.
//!
//! Built on a crossbeam channel whose sender side is dropped on `signal()`:
//! every clone of the receiver wakes with `RecvError`, which `select!` arms
//! treat as "closed". Workers keep a `Closer` clone and select on
//! `has_been_signaled()` alongside their back-off timer.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};

#[derive(Clone)]
pub struct Closer {
    sender: Arc<Mutex<Option<Sender<()>>>>,
    receiver: Receiver<()>,
}

impl Closer {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            sender: Arc::new(Mutex::new(Some(tx))),
            receiver: rx,
        }
    }

    /// Signal shutdown. Idempotent; wakes every receiver clone.
    pub fn signal(&self) {
        self.sender.lock().unwrap().take();
    }

    /// Channel handle for use in `crossbeam_channel::select!`. Receiving an
    /// error on it means shutdown has been signaled.
    pub fn has_been_signaled(&self) -> &Receiver<()> {
        &self.receiver
    }

    /// Non-blocking check.
    pub fn is_signaled(&self) -> bool {
        self.sender.lock().unwrap().is_none()
    }
}

impl Default for Closer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_signal_wakes_receivers() {
        let closer = Closer::new();
        let clone = closer.clone();

        let handle = std::thread::spawn(move || {
            // Blocks until the sender is dropped by signal().
            let _ = clone.has_been_signaled().recv();
        });

        std::thread::sleep(Duration::from_millis(10));
        assert!(!closer.is_signaled());
        closer.signal();
        handle.join().unwrap();
        assert!(closer.is_signaled());
    }

    #[test]
    fn test_signal_is_idempotent() {
        let closer = Closer::new();
        closer.signal();
        closer.signal();
        assert!(closer.is_signaled());
    }
}
