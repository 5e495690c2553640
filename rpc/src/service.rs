//! Service dispatch: a bounded queue of inbound calls drained by worker
//! threads.

use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use tracing::debug;

use crate::call::InboundCall;
use crate::error::{Result, RpcError};

/// A request handler registered with a [`Messenger`](crate::Messenger).
///
/// `handle` runs on a service pool worker thread and may block; it never runs
/// on a reactor loop.
pub trait Service: Send + Sync + 'static {
    fn handle(&self, method: &str, payload: &[u8]) -> Result<Bytes>;
}

/// Replies with the request payload. Used by the demo binaries and tests.
pub struct EchoService;

impl Service for EchoService {
    fn handle(&self, _method: &str, payload: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(payload))
    }
}

/// Worker pool wrapping a [`Service`] behind a bounded inbound-call queue.
///
/// When the queue is full, new calls fail fast with "service queue is full"
/// instead of piling up. A pool may be built with zero workers, in which case
/// the queue fills and never drains.
#[derive(Clone)]
pub struct ServicePool {
    inner: Arc<ServicePoolInner>,
}

struct ServicePoolInner {
    queue_len: usize,
    state: Mutex<PoolState>,
    rx: Receiver<InboundCall>,
}

struct PoolState {
    tx: Option<Sender<InboundCall>>,
    workers: Vec<JoinHandle<()>>,
}

impl ServicePool {
    pub fn new(service: Arc<dyn Service>, queue_len: usize, num_threads: usize) -> ServicePool {
        let (tx, rx) = bounded(queue_len);
        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let rx: Receiver<InboundCall> = rx.clone();
            let service = service.clone();
            let handle = std::thread::Builder::new()
                .name(format!("svc-worker-{i}"))
                .spawn(move || {
                    while let Ok(call) = rx.recv() {
                        let result = service.handle(call.method(), call.payload());
                        call.respond(result);
                    }
                })
                .expect("failed to spawn service worker thread");
            workers.push(handle);
        }
        ServicePool {
            inner: Arc::new(ServicePoolInner {
                queue_len,
                state: Mutex::new(PoolState {
                    tx: Some(tx),
                    workers,
                }),
                rx,
            }),
        }
    }

    /// Queue a call for the workers. On failure the caller gets the status to
    /// turn into an error response.
    pub(crate) fn enqueue(&self, call: InboundCall) -> Result<()> {
        let tx = match self.inner.state.lock().tx.as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(RpcError::service_unavailable("service is shutting down")),
        };
        match tx.try_send(call) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RpcError::service_unavailable(format!(
                "service queue is full ({} entries)",
                self.inner.queue_len
            ))),
            Err(TrySendError::Disconnected(_)) => {
                Err(RpcError::service_unavailable("service is shutting down"))
            }
        }
    }

    /// Stop accepting calls, join the workers, and fail anything left in the
    /// queue. Idempotent.
    pub fn shutdown(&self) {
        let workers = {
            let mut state = self.inner.state.lock();
            if state.tx.take().is_none() {
                return;
            }
            std::mem::take(&mut state.workers)
        };
        debug!("service pool shutting down ({} workers)", workers.len());
        for handle in workers {
            let _ = handle.join();
        }
        // With zero workers (or workers that exited early) calls can still be
        // sitting in the queue; answer them so their connections don't hang.
        while let Ok(call) = self.inner.rx.try_recv() {
            call.respond(Err(RpcError::service_unavailable("service is shutting down")));
        }
    }
}
