use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::connection::handler::{ConnectionHandler, HandlerMessage};
use crate::handler::RequestHandler;
use crate::settings::ServerSettings;

/// State shared between the pool, the accept loop and the handler tasks.
/// Pool membership and the per-handler busy flags are guarded by one mutex.
pub(crate) struct PoolShared {
    pub(crate) settings: Arc<ServerSettings>,
    pub(crate) service: Arc<dyn RequestHandler>,
    pub(crate) tls: Option<TlsAcceptor>,
    workers: Mutex<Vec<Worker>>,
    next_id: AtomicU64,
}

struct Worker {
    id: u64,
    busy: bool,
    sender: mpsc::Sender<HandlerMessage>,
    join: JoinHandle<()>,
}

impl PoolShared {
    /// Find an idle handler and mark it busy, or grow the pool if it is
    /// still below `maxThreads`. `None` means saturation.
    pub(crate) fn acquire(self: &Arc<Self>) -> Option<mpsc::Sender<HandlerMessage>> {
        let mut workers = self.workers.lock();
        if let Some(worker) = workers.iter_mut().find(|worker| !worker.busy) {
            worker.busy = true;
            return Some(worker.sender.clone());
        }
        if workers.len() < self.settings.max_threads {
            let worker = spawn_worker(self);
            let sender = worker.sender.clone();
            workers.push(worker);
            return Some(sender);
        }
        None
    }

    /// Called by a handler when its connection ends.
    pub(crate) fn release(&self, id: u64) {
        let mut workers = self.workers.lock();
        if let Some(worker) = workers.iter_mut().find(|worker| worker.id == id) {
            worker.busy = false;
        }
    }
}

fn spawn_worker(shared: &Arc<PoolShared>) -> Worker {
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let (sender, receiver) = mpsc::channel(2);
    let join = tokio::spawn(ConnectionHandler::new(id, Arc::clone(shared), receiver).run());
    debug!(handler = id, "created connection handler");
    Worker { id, busy: true, sender, join }
}

/// Pool of reusable connection handlers with a periodic idle trimmer.
pub(crate) struct HandlerPool {
    shared: Arc<PoolShared>,
    trimmer: JoinHandle<()>,
}

impl HandlerPool {
    pub(crate) fn new(
        settings: Arc<ServerSettings>,
        service: Arc<dyn RequestHandler>,
        tls: Option<TlsAcceptor>,
    ) -> Self {
        let shared = Arc::new(PoolShared {
            settings,
            service,
            tls,
            workers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        });
        let trimmer = tokio::spawn(trim_loop(Arc::clone(&shared)));
        Self { shared, trimmer }
    }

    pub(crate) fn shared(&self) -> Arc<PoolShared> {
        Arc::clone(&self.shared)
    }

    /// Stop the trimmer, signal every handler to stop and wait for them.
    pub(crate) async fn shutdown(self) {
        self.trimmer.abort();
        let workers: Vec<Worker> = {
            let mut guard = self.shared.workers.lock();
            guard.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.sender.send(HandlerMessage::Shutdown).await;
            let _ = worker.join.await;
        }
    }

    #[cfg(test)]
    fn pool_size(&self) -> usize {
        self.shared.workers.lock().len()
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.shared.workers.lock().iter().filter(|worker| !worker.busy).count()
    }
}

/// Every `cleanupInterval`, destroy at most one idle handler while more
/// than `minThreads` of them are idle. Shrinking one at a time bounds the
/// churn when load drops off.
async fn trim_loop(shared: Arc<PoolShared>) {
    let interval = Duration::from_millis(shared.settings.cleanup_interval.max(1));
    loop {
        tokio::time::sleep(interval).await;
        let removed = {
            let mut workers = shared.workers.lock();
            let max_idle = shared.settings.min_threads;
            let mut idle = 0usize;
            let mut victim = None;
            for (index, worker) in workers.iter().enumerate() {
                if !worker.busy {
                    idle += 1;
                    if idle > max_idle {
                        victim = Some(index);
                        break;
                    }
                }
            }
            victim.map(|index| workers.remove(index))
        };
        if let Some(worker) = removed {
            if worker.sender.try_send(HandlerMessage::Shutdown).is_err() {
                warn!(handler = worker.id, "cannot signal idle handler to stop");
            }
            let _ = worker.join.await;
            debug!(handler = worker.id, "removed idle connection handler");
        }
    }
}
