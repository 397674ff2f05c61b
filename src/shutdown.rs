//! Cooperative cancellation shared by the server loop, pipes, and
//! connections.
//!
//! A [`Shutdown`] pairs an atomic flag (for loop guards) with a crossbeam
//! channel that is never sent on: dropping the sole sender disconnects every
//! cloned receiver, which wakes any `select!` blocked on it.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, Sender, bounded};

#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    trigger: Arc<Mutex<Option<Sender<Infallible>>>>,
    signal: Receiver<Infallible>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            trigger: Arc::new(Mutex::new(Some(tx))),
            signal: rx,
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        if let Ok(mut guard) = self.trigger.lock() {
            guard.take();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Channel view of the cancellation signal, for use in `select!` arms.
    ///
    /// The channel never yields a value; a `recv` completing (with a
    /// disconnect error) means cancellation fired.
    pub fn signal(&self) -> &Receiver<Infallible> {
        &self.signal
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
