//! The asynchronous write queue: a bounded channel drained by a small pool
//! of worker threads that hand each dequeued atom to the store engine.
//!
//! Backpressure is the channel bound itself; an enqueue blocks while the
//! queue is full. Note that `flush_queue` waits for the queue to drain, not
//! for the workers to go idle: a writer may still be finishing the atom it
//! dequeued last. Callers requiring strict quiescence must follow up with
//! their own barrier.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::warn;

use crate::atom::AtomRef;
use crate::error::Result;

pub type StoreFn = Arc<dyn Fn(AtomRef) -> Result<()> + Send + Sync>;

pub struct WriteQueue {
    tx: Option<SyncSender<AtomRef>>,
    workers: Vec<JoinHandle<()>>,
    pending: Arc<(Mutex<usize>, Condvar)>,
}

impl WriteQueue {
    pub fn new(worker_count: usize, depth: usize, store: StoreFn) -> WriteQueue {
        let (tx, rx) = sync_channel::<AtomRef>(depth);
        let rx = Arc::new(Mutex::new(rx));
        let pending = Arc::new((Mutex::new(0usize), Condvar::new()));

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let rx = Arc::clone(&rx);
            let pending = Arc::clone(&pending);
            let store = Arc::clone(&store);
            workers.push(thread::spawn(move || {
                write_loop(&rx, &pending, &store);
            }));
        }

        WriteQueue {
            tx: Some(tx),
            workers,
            pending,
        }
    }

    /// Blocks while the queue is full.
    pub fn enqueue(&self, atom: AtomRef) {
        let Some(tx) = self.tx.as_ref() else {
            warn!("write queue is shut down; dropping atom");
            return;
        };

        let (lock, cvar) = &*self.pending;
        *lock.lock().unwrap() += 1;
        if tx.send(atom).is_err() {
            warn!("write queue workers are gone; dropping atom");
            *lock.lock().unwrap() -= 1;
            cvar.notify_all();
        }
    }

    /// Waits until every enqueued atom has been handed to a worker.
    pub fn flush_queue(&self) {
        let (lock, cvar) = &*self.pending;
        let mut queued = lock.lock().unwrap();
        while *queued > 0 {
            queued = cvar.wait(queued).unwrap();
        }
    }

    /// Closes the queue; workers drain the remaining items and exit.
    pub fn shutdown(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn write_loop(
    rx: &Mutex<Receiver<AtomRef>>,
    pending: &(Mutex<usize>, Condvar),
    store: &StoreFn,
) {
    loop {
        let message = {
            let rx = rx.lock().unwrap();
            rx.recv()
        };
        let atom = match message {
            Ok(atom) => atom,
            // Channel closed and drained.
            Err(_) => break,
        };

        {
            let (lock, cvar) = pending;
            *lock.lock().unwrap() -= 1;
            cvar.notify_all();
        }

        if let Err(e) = store(atom) {
            warn!(error = %e, "asynchronous store failed");
        }
    }
}
