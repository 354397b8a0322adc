//! Packet dispatch across the worker pool.
//!
//! One producer per active session reads packets and hands them to the
//! dispatcher, which routes each packet to a worker by hashing its
//! [FlowKey]. All packets of one flow therefore serialize through one
//! worker, and each worker runs reassembly and connection building inline
//! over its own slice of the flow table. Worker inboxes are bounded; a full
//! inbox blocks the producer.
//!
//! A ticker thread fans a `Tick` to every worker once per timeout
//! resolution to drive idle-flush.

use crate::config::RuntimeConfig;
use crate::conntrack::conn_id::{ConnIdGen, SessionId};
use crate::conntrack::flow_key::FlowKey;
use crate::conntrack::pdu::L4Context;
use crate::conntrack::{ConnTracker, TrackerConfig};
use crate::memory::pktbuf::PktBuf;
use crate::record::{EventSink, FinalizeReason};
use crate::rules::PatternIndex;
use crate::services::ServiceRegistry;
use crate::storage::DocumentStore;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, tick, Receiver, Sender};

/// Context shared by every pipeline worker.
pub(crate) struct PipelineShared {
    pub(crate) storage: Arc<dyn DocumentStore>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) patterns: Arc<PatternIndex>,
    pub(crate) services: Arc<ServiceRegistry>,
    pub(crate) conn_ids: ConnIdGen,
}

/// Events delivered to a worker's inbox.
pub(crate) enum WorkerEvent {
    /// A parsed TCP packet for this worker's flow slice.
    Packet {
        buf: PktBuf,
        ctxt: L4Context,
        session: SessionId,
    },
    /// Periodic idle-flush check.
    Tick(Instant),
    /// Finalize every open flow, then acknowledge.
    Flush {
        reason: FinalizeReason,
        done: Sender<()>,
    },
    Shutdown,
}

/// Routes packets to workers and owns their threads.
pub(crate) struct PacketDispatcher {
    senders: Vec<Sender<WorkerEvent>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    ticker_stop: Arc<AtomicBool>,
}

impl PacketDispatcher {
    pub(crate) fn new(config: &RuntimeConfig, shared: Arc<PipelineShared>) -> Self {
        let nb_workers = config.pipeline.workers.max(1);
        let tracker_config = TrackerConfig::from(&config.conntrack);

        let mut senders = Vec::with_capacity(nb_workers);
        let mut handles = Vec::with_capacity(nb_workers);
        for worker_id in 0..nb_workers {
            let (tx, rx) = bounded(config.pipeline.channel_capacity);
            let tracker = ConnTracker::new(tracker_config.clone(), Arc::clone(&shared));
            let handle = std::thread::Builder::new()
                .name(format!("seine-worker-{}", worker_id))
                .spawn(move || worker_loop(rx, tracker))
                .expect("spawn worker thread");
            senders.push(tx);
            handles.push(handle);
        }

        let ticker_stop = Arc::new(AtomicBool::new(false));
        {
            let stop = Arc::clone(&ticker_stop);
            let senders = senders.clone();
            let period = Duration::from_millis(config.conntrack.timeout_resolution as u64);
            let ticker = tick(period);
            let handle = std::thread::Builder::new()
                .name("seine-ticker".to_string())
                .spawn(move || {
                    while let Ok(now) = ticker.recv() {
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        for tx in &senders {
                            // a missed tick is caught by the next one
                            let _ = tx.try_send(WorkerEvent::Tick(now));
                        }
                    }
                })
                .expect("spawn ticker thread");
            handles.push(handle);
        }

        log::info!("Started {} pipeline workers", nb_workers);
        PacketDispatcher {
            senders,
            handles: Mutex::new(handles),
            ticker_stop,
        }
    }

    /// Number of workers.
    pub(crate) fn nb_workers(&self) -> usize {
        self.senders.len()
    }

    /// Routes one packet to its flow's worker. Blocks when the worker's
    /// inbox is full (backpressure toward the packet source).
    pub(crate) fn dispatch(&self, buf: PktBuf, ctxt: L4Context, session: SessionId) {
        let key = FlowKey::new(ctxt.src, ctxt.dst);
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.senders.len() as u64) as usize;
        if self.senders[index]
            .send(WorkerEvent::Packet { buf, ctxt, session })
            .is_err()
        {
            log::error!("Worker {} inbox closed; dropping packet", index);
        }
    }

    /// Finalizes every open flow on every worker and waits until each
    /// worker has acknowledged. Packets dispatched before this call are
    /// processed first (inbox order).
    pub(crate) fn flush_all(&self, reason: FinalizeReason) {
        let (done_tx, done_rx) = bounded(self.senders.len());
        let mut expected = 0;
        for tx in &self.senders {
            if tx
                .send(WorkerEvent::Flush {
                    reason,
                    done: done_tx.clone(),
                })
                .is_ok()
            {
                expected += 1;
            }
        }
        drop(done_tx);
        for _ in 0..expected {
            if done_rx.recv().is_err() {
                break;
            }
        }
    }

    /// Stops the ticker and workers and joins their threads.
    pub(crate) fn shutdown(&self) {
        self.ticker_stop.store(true, Ordering::Relaxed);
        for tx in &self.senders {
            let _ = tx.send(WorkerEvent::Shutdown);
        }
        let mut handles = self.handles.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for PacketDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Receiver<WorkerEvent>, mut tracker: ConnTracker) {
    loop {
        match rx.recv() {
            Ok(WorkerEvent::Packet { buf, ctxt, session }) => {
                tracker.process(buf, ctxt, session);
            }
            Ok(WorkerEvent::Tick(now)) => tracker.check_inactive(now),
            Ok(WorkerEvent::Flush { reason, done }) => {
                tracker.drain(reason);
                let _ = done.send(());
            }
            Ok(WorkerEvent::Shutdown) | Err(_) => break,
        }
    }
    log::debug!("Worker exiting with {} open flows", tracker.size());
}
