//! Passthrough listener
//!
//! A listener-shaped object whose `accept` yields connections handed to it
//! programmatically. The dispatcher owns the real accept loop and submits
//! every connection it decides to terminate locally; the in-process HTTPS
//! server accepts from here exactly as it would from a TCP listener.
//! Submissions are delivered strictly in FIFO order.

use std::io;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// Receiving half: owned by the HTTPS server.
pub struct PassthroughListener<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

/// Submitting half: owned by the dispatcher. Cheap to clone.
pub struct PassthroughHandle<T> {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<T>>>>,
}

impl<T> Clone for PassthroughHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> PassthroughListener<T> {
    pub fn new() -> (PassthroughListener<T>, PassthroughHandle<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            PassthroughListener { rx },
            PassthroughHandle {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
        )
    }

    /// Wait for the next submitted connection. Fails once the listener has
    /// been closed and the queue is drained.
    pub async fn accept(&mut self) -> io::Result<T> {
        self.rx.recv().await.ok_or_else(closed_error)
    }
}

impl<T> PassthroughHandle<T> {
    /// Queue a connection for a pending or future `accept`. Never blocks.
    pub fn submit(&self, conn: T) -> io::Result<()> {
        let guard = self.tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx.send(conn).map_err(|_| closed_error()),
            None => Err(closed_error()),
        }
    }

    /// Close the listener: pending and future `accept` calls fail once the
    /// already-queued connections are drained.
    pub fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "passthrough listener closed")
}
