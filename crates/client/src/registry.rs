//! Connection registry and its poll thread.
//!
//! The registry maps endpoint ids to connections and owns one background thread that
//! drives them all. The thread exists exactly while at least one endpoint is
//! registered: the first `open` spawns it, and the `close` that empties the map
//! cancels and joins it.
//!
//! Connections themselves live on the poll thread. `open` hands a new connection over
//! through a pending list; `close` cancels its token, wakes the thread and blocks until
//! the thread acknowledges that the socket is closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use futures_util::future::select_all;
use modlink_protocol::ArchipelagoCredentials;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::connection::{Connection, ReadOutcome};
use crate::dispatch::DispatchQueue;
use crate::endpoint::EndpointId;
use crate::error::RegistryError;
use crate::handle::{ConnectionHandle, ConnectionStatus};
use crate::protocol::{ArchipelagoProtocol, PubSubAuth, PubSubProtocol, SessionProtocol};
use crate::router::{EventSink, MessageRouter};
use crate::transport::{Connector, WsConnector};

const POLL_THREAD_NAME: &str = "modlink-poll";

struct Worker {
    thread: JoinHandle<()>,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<EndpointId, ConnectionHandle>,
    /// Opened but not yet picked up by the poll thread
    pending: Vec<Connection>,
    /// Closes waiting for the poll thread to shut their connection down
    closing: Vec<oneshot::Sender<()>>,
    worker: Option<Worker>,
}

#[derive(Default)]
struct Shared {
    inner: Mutex<Inner>,
    wake: Notify,
    cycles: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns every open connection and the thread that polls them.
///
/// Dropping the registry closes everything.
pub struct Registry {
    shared: Arc<Shared>,
    queue: DispatchQueue,
    router: MessageRouter,
    connector: Arc<dyn Connector>,
    config: Arc<SessionConfig>,
}

impl Registry {
    /// Registry opening real websockets with default settings.
    pub fn new(queue: DispatchQueue, router: MessageRouter) -> Self {
        Self::with_connector(queue, router, Arc::new(WsConnector), SessionConfig::default())
    }

    pub fn with_connector(
        queue: DispatchQueue,
        router: MessageRouter,
        connector: Arc<dyn Connector>,
        config: SessionConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            queue,
            router,
            connector,
            config: Arc::new(config),
        }
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register an endpoint and start connecting to it.
    ///
    /// Opening an id that is already registered returns the existing handle and
    /// ignores `protocol`.
    pub fn open(
        &self,
        id: impl Into<EndpointId>,
        protocol: impl SessionProtocol + 'static,
    ) -> Result<ConnectionHandle, RegistryError> {
        let id = id.into();
        let mut inner = self.shared.lock();
        if let Some(existing) = inner.entries.get(&id) {
            tracing::debug!(endpoint = %id, "Already open");
            return Ok(existing.clone());
        }

        let connection = Connection::new(
            id.clone(),
            Box::new(protocol),
            Arc::clone(&self.connector),
            Arc::clone(&self.config),
            EventSink::new(self.queue.clone(), self.router.clone()),
        );
        let handle = connection.handle();

        if inner.worker.is_none() {
            inner.worker = Some(self.spawn_worker()?);
        }
        inner.entries.insert(id.clone(), handle.clone());
        inner.pending.push(connection);
        drop(inner);

        tracing::info!(endpoint = %id, "Opened connection");
        self.shared.wake.notify_one();
        Ok(handle)
    }

    /// Open a Twitch PubSub topic. The topic template is the endpoint id.
    pub fn open_pubsub(
        &self,
        topic: &str,
        auth: PubSubAuth,
    ) -> Result<ConnectionHandle, RegistryError> {
        self.open(topic, PubSubProtocol::new(topic, auth))
    }

    /// Open an Archipelago slot, keyed by `archipelago:<name>@<server>`.
    pub fn open_archipelago(
        &self,
        credentials: ArchipelagoCredentials,
        game: &str,
    ) -> Result<ConnectionHandle, RegistryError> {
        let id = credentials.identity();
        self.open(id, ArchipelagoProtocol::new(credentials, game))
    }

    /// Close an endpoint. Unknown ids are ignored.
    ///
    /// Blocks until the poll thread has closed the socket. Closing the last endpoint also
    /// stops the poll thread and joins it.
    ///
    /// # Panics
    ///
    /// When the endpoint is live on the poll thread, this waits with
    /// [`oneshot::Receiver::blocking_recv`], which panics inside an async execution
    /// context. Async hosts call it through `tokio::task::block_in_place` or
    /// `spawn_blocking`.
    pub fn close(&self, id: &EndpointId) {
        let mut inner = self.shared.lock();
        let Some(handle) = inner.entries.remove(id) else {
            tracing::debug!(endpoint = %id, "Close of unknown endpoint ignored");
            return;
        };
        handle.close_token().cancel();

        // Never reached the poll thread; nothing to shut down but the status
        let before = inner.pending.len();
        inner.pending.retain(|connection| !connection.is_closed());
        let was_pending = inner.pending.len() != before;
        if was_pending {
            EventSink::new(self.queue.clone(), self.router.clone())
                .publish_status(id, ConnectionStatus::Closed);
        }

        let mut ack = None;
        let mut worker = None;
        if inner.entries.is_empty() {
            worker = inner.worker.take();
        } else if !was_pending && inner.worker.as_ref().is_some_and(|w| !w.is_current()) {
            let (tx, rx) = oneshot::channel();
            inner.closing.push(tx);
            ack = Some(rx);
        }
        if let Some(worker) = &worker {
            worker.shutdown.cancel();
        }
        drop(inner);

        self.shared.wake.notify_one();
        if let Some(ack) = ack {
            // Err means the thread exited, which closes every socket it held
            let _ = ack.blocking_recv();
        }
        if let Some(worker) = worker {
            join_worker(worker);
        }
        tracing::info!(endpoint = %id, "Closed connection");
    }

    /// Close every endpoint.
    pub fn close_all(&self) {
        for id in self.endpoints() {
            self.close(&id);
        }
    }

    /// Queue a raw frame for an endpoint. It is written once the session is connected.
    pub fn send_raw(&self, id: &EndpointId, frame: Value) -> Result<(), RegistryError> {
        let handle = self
            .handle(id)
            .ok_or_else(|| RegistryError::UnknownEndpoint(id.clone()))?;
        handle.send(frame)?;
        self.shared.wake.notify_one();
        Ok(())
    }

    pub fn handle(&self, id: &EndpointId) -> Option<ConnectionHandle> {
        self.shared.lock().entries.get(id).cloned()
    }

    pub fn is_open(&self, id: &EndpointId) -> bool {
        self.shared.lock().entries.contains_key(id)
    }

    pub fn endpoints(&self) -> Vec<EndpointId> {
        let mut ids: Vec<_> = self.shared.lock().entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a poll thread is currently attached.
    pub fn is_polling(&self) -> bool {
        self.shared.lock().worker.is_some()
    }

    /// Heartbeat: number of poll cycles run so far across every poll thread.
    pub fn poll_cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::SeqCst)
    }

    fn spawn_worker(&self) -> Result<Worker, RegistryError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let shared = Arc::clone(&self.shared);
        let config = Arc::clone(&self.config);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let thread = std::thread::Builder::new()
            .name(POLL_THREAD_NAME.to_string())
            .spawn(move || runtime.block_on(poll_loop(shared, config, token)))?;
        tracing::debug!("Spawned poll thread");
        Ok(Worker { thread, shutdown })
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.close_all();
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("endpoints", &self.endpoints())
            .field("polling", &self.is_polling())
            .finish()
    }
}

impl Worker {
    /// Whether the caller is running on this worker's thread.
    fn is_current(&self) -> bool {
        self.thread.thread().id() == std::thread::current().id()
    }
}

fn join_worker(worker: Worker) {
    if worker.is_current() {
        return;
    }
    if worker.thread.join().is_err() {
        tracing::error!("Poll thread panicked");
    }
}

/// Connections to shut down in one cycle, and the closes waiting on them.
struct Retired {
    connections: Vec<Connection>,
    acks: Vec<oneshot::Sender<()>>,
}

impl Retired {
    async fn shut_down(self) {
        for mut connection in self.connections {
            connection.shutdown().await;
        }
        for ack in self.acks {
            let _ = ack.send(());
        }
    }
}

/// Sync the thread-local connection list with the registry.
///
/// Returns the connections to shut down and whether the thread should exit.
fn take_work(
    shared: &Shared,
    connections: &mut Vec<Connection>,
    shutdown: &CancellationToken,
) -> (Retired, bool) {
    let mut inner = shared.lock();
    // Every close that cancelled a connection queued its ack under this same lock
    let acks = std::mem::take(&mut inner.closing);

    // A cancelled worker has been replaced; leave pending connections to its successor
    if shutdown.is_cancelled() {
        let connections = std::mem::take(connections);
        return (Retired { connections, acks }, true);
    }

    connections.append(&mut inner.pending);
    let (retired, live): (Vec<_>, Vec<_>) = std::mem::take(connections)
        .into_iter()
        .partition(Connection::is_closed);
    *connections = live;

    let mut retired = Retired {
        connections: retired,
        acks,
    };
    if inner.entries.is_empty() {
        // Emptied by a rejection on this thread: detach, nobody will join us
        inner.worker = None;
        retired.connections.append(connections);
        return (retired, true);
    }
    (retired, false)
}

/// Block until a socket is readable, the registry changes, shutdown, or `poll_wait`.
async fn wait_for_activity(
    connections: &mut [Connection],
    shared: &Shared,
    shutdown: &CancellationToken,
    config: &SessionConfig,
) {
    let readable: Vec<_> = connections
        .iter_mut()
        .filter(|connection| connection.has_socket() && !connection.is_closed())
        .map(|connection| Box::pin(connection.readable()))
        .collect();
    let any_readable = async move {
        if readable.is_empty() {
            std::future::pending::<()>().await;
        } else {
            select_all(readable).await;
        }
    };

    tokio::select! {
        _ = any_readable => {}
        _ = shared.wake.notified() => {}
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(config.poll_wait) => {}
    }
}

async fn poll_loop(shared: Arc<Shared>, config: Arc<SessionConfig>, shutdown: CancellationToken) {
    tracing::info!("Poll thread started");
    let mut connections: Vec<Connection> = Vec::new();

    loop {
        shared.cycles.fetch_add(1, Ordering::SeqCst);

        let (retired, exit) = take_work(&shared, &mut connections, &shutdown);
        retired.shut_down().await;
        if exit {
            break;
        }

        wait_for_activity(&mut connections, &shared, &shutdown, &config).await;
        if shutdown.is_cancelled() {
            continue;
        }

        let mut rejected = Vec::new();
        // A close during this cycle only cancels; the connection is shut down next cycle
        for (index, connection) in connections.iter_mut().enumerate() {
            if connection.is_closed() {
                continue;
            }
            for _ in 0..config.max_frames_per_cycle {
                match connection.receive_message().await {
                    ReadOutcome::Processed => {}
                    ReadOutcome::WouldBlock | ReadOutcome::Reconnected => break,
                    ReadOutcome::Rejected(_) => {
                        rejected.push(index);
                        break;
                    }
                }
            }
        }

        for index in rejected.into_iter().rev() {
            let connection = connections.swap_remove(index);
            let mut inner = shared.lock();
            let current = inner
                .entries
                .get(connection.id())
                .is_some_and(|handle| handle.same_connection(&connection.handle()));
            if current {
                inner.entries.remove(connection.id());
                tracing::info!(endpoint = %connection.id(), "Removed rejected connection");
            }
        }

        let now = Instant::now();
        for connection in connections.iter_mut().filter(|c| !c.is_closed()) {
            if connection.flush_outbound().await {
                connection.poll(now).await;
            }
        }
    }

    tracing::info!("Poll thread stopped");
}
