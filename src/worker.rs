//! The client queue and fixed worker pool.
//!
//! `ClientQueue` is the shared FIFO of accepted sockets plus the
//! `workers_busy` counter the accept loop consults for backpressure: if
//! every worker is already serving a connection, a newly accepted socket
//! is dropped immediately rather than queued.

use std::collections::VecDeque;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::protocol;
use crate::registry::SegmentRegistry;

const WAIT_POLL: Duration = Duration::from_millis(250);

pub struct ClientQueue {
    queue: Mutex<VecDeque<TcpStream>>,
    clients_new: Condvar,
    busy: AtomicUsize,
    capacity: usize,
}

impl ClientQueue {
    pub fn new(capacity: usize) -> Self {
        ClientQueue {
            queue: Mutex::new(VecDeque::new()),
            clients_new: Condvar::new(),
            busy: AtomicUsize::new(0),
            capacity,
        }
    }

    /// True iff every worker is currently busy; the accept loop uses
    /// this to shed load by closing the socket instead of queueing it.
    pub fn is_saturated(&self) -> bool {
        self.busy.load(Ordering::SeqCst) >= self.capacity
    }

    pub fn enqueue(&self, stream: TcpStream) {
        self.queue.lock().unwrap().push_back(stream);
        self.clients_new.notify_one();
    }

    pub fn wake_all(&self) {
        self.clients_new.notify_all();
    }

    /// Block until a client is available or `running` goes false. On
    /// success, marks a worker busy; the caller must call `release`
    /// once done serving that connection.
    fn wait_for_client(&self, running: &AtomicBool) -> Option<TcpStream> {
        let mut guard = self.queue.lock().unwrap();
        loop {
            if let Some(stream) = guard.pop_front() {
                self.busy.fetch_add(1, Ordering::SeqCst);
                return Some(stream);
            }
            if !running.load(Ordering::SeqCst) {
                return None;
            }
            let (g, _timed_out) = self.clients_new.wait_timeout(guard, WAIT_POLL).unwrap();
            guard = g;
        }
    }

    fn release(&self) {
        self.busy.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct WorkerPool {
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `n` worker threads, each looping: wait for a queued
    /// client, serve it to completion, then go back to waiting. On
    /// shutdown (`running` cleared), a worker that wakes with an empty
    /// queue exits instead of waiting again.
    pub fn start(
        n: usize,
        clients: Arc<ClientQueue>,
        registry: Arc<SegmentRegistry>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let threads = (0..n)
            .map(|id| {
                let clients = clients.clone();
                let registry = registry.clone();
                let running = running.clone();
                thread::Builder::new()
                    .name(format!("bitdb-worker-{id}"))
                    .spawn(move || worker_loop(id, &clients, &registry, &running))
                    .expect("spawn worker thread")
            })
            .collect();
        WorkerPool { threads }
    }

    pub fn join(self) {
        for t in self.threads {
            if let Err(e) = t.join() {
                log::error!("worker thread panicked: {e:?}");
            }
        }
    }
}

fn worker_loop(id: usize, clients: &ClientQueue, registry: &Arc<SegmentRegistry>, running: &Arc<AtomicBool>) {
    log::debug!("worker {id} started");
    loop {
        let stream = match clients.wait_for_client(running) {
            Some(s) => s,
            None => break,
        };

        if let Err(e) = protocol::serve_client(stream, registry, running) {
            log::warn!("worker {id}: connection error: {e}");
        }
        clients.release();
    }
    log::debug!("worker {id} exiting");
}
