use std::{
    future::Future,
    net::SocketAddr,
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use socket2::SockRef;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};

use crate::{
    broadcast::Broadcaster,
    handler::ConnectionHandler,
    registry::{ClientRegistry, Connection, ConnectionId},
    store::ActiveMessageStore,
};

pub const DEFAULT_READ_BUFFER: NonZeroUsize = match NonZeroUsize::new(1024) {
    Some(size) => size,
    None => unreachable!(),
};

/// Tunables for a running relay.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Size of the per-connection read buffer.
    pub read_buffer: NonZeroUsize,
    /// Longest a single write to one client may take before it is dropped.
    pub write_timeout: Duration,
    /// How long shutdown waits for handlers to wind down.
    pub drain_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            read_buffer: DEFAULT_READ_BUFFER,
            write_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// State shared by the acceptor and every connection handler.
pub struct RelayState {
    pub registry: Arc<ClientRegistry>,
    pub store: Arc<ActiveMessageStore>,
    pub broadcaster: Broadcaster,
    pub settings: RelaySettings,
    pub shutdown: CancellationToken,
    next_id: AtomicU64,
}

impl RelayState {
    pub fn new(settings: RelaySettings) -> Arc<Self> {
        let registry = Arc::new(ClientRegistry::new());
        let store = Arc::new(ActiveMessageStore::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), Arc::clone(&store));
        Arc::new(Self {
            registry,
            store,
            broadcaster,
            settings,
            shutdown: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

pub struct Relay {
    listener: TcpListener,
    state: Arc<RelayState>,
    tasks: TaskTracker,
}

impl Relay {
    pub fn new(listener: TcpListener, settings: RelaySettings) -> Self {
        Self {
            listener,
            state: RelayState::new(settings),
            tasks: TaskTracker::new(),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    /// Accepts clients until `shutdown` resolves, then closes the listener,
    /// cancels every handler and waits for them up to the drain timeout.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            state,
            tasks,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                biased;
                _ = &mut shutdown => break,
                _ = state.shutdown.cancelled() => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &tasks);
                }
            }
        }

        drop(listener);
        let clients = state.registry.len().await;
        info!(clients, "relay shutting down");
        state.shutdown.cancel();
        tasks.close();

        if timeout(state.settings.drain_timeout, tasks.wait()).await.is_err() {
            warn!(
                remaining = tasks.len(),
                "handlers still running after drain timeout"
            );
        }

        info!("relay stopped");
        Ok(())
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<RelayState>,
    tasks: &TaskTracker,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, state, tasks),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<RelayState>,
    tasks: &TaskTracker,
) {
    configure_stream(&stream, peer);

    let id = state.next_id();
    info!(connection = id, %peer, "client connected");

    let (reader, writer) = stream.into_split();
    let connection = Connection::new(
        id,
        Some(peer),
        writer,
        state.settings.write_timeout,
        &state.shutdown,
    );
    let handler = ConnectionHandler::new(reader, connection, Arc::clone(state));

    tasks.spawn(async move {
        if let Err(err) = handler.run().await {
            warn!(connection = id, %peer, error = ?err, "client connection closed with error");
        }
    });
}

/// Turns on `TCP_NODELAY`, and `SO_KEEPALIVE` so a peer that vanished without
/// a FIN is noticed even while it sits idle.
fn configure_stream(stream: &TcpStream, peer: SocketAddr) {
    if let Err(err) = stream.set_nodelay(true) {
        warn!(%peer, error = ?err, "failed to set TCP_NODELAY");
    }
    if let Err(err) = SockRef::from(stream).set_keepalive(true) {
        warn!(%peer, error = ?err, "failed to set SO_KEEPALIVE");
    }
}

/// Installs SIGINT/SIGTERM handlers and returns a future that resolves on
/// the first of them.
///
/// Handlers are installed before this returns, so a signal that arrives
/// between the call and the first poll is not lost.
#[cfg(unix)]
pub fn shutdown_signal() -> impl Future<Output = ()> + Send + 'static {
    use tokio::signal::unix::{SignalKind, signal};

    let interrupt = signal(SignalKind::interrupt());
    let terminate = signal(SignalKind::terminate());

    async move {
        match (interrupt, terminate) {
            (Ok(mut interrupt), Ok(mut terminate)) => select! {
                _ = interrupt.recv() => info!("received SIGINT"),
                _ = terminate.recv() => info!("received SIGTERM"),
            },
            (Err(err), _) | (_, Err(err)) => {
                warn!(error = ?err, "failed to install signal handlers");
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
pub fn shutdown_signal() -> impl Future<Output = ()> + Send + 'static {
    async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received ctrl-c"),
            Err(err) => {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        }
    }
}
