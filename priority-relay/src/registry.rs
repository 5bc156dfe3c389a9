use std::{
    collections::BTreeMap,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

pub type ConnectionId = u64;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of one client connection, shared between its handler and the
/// registry.
///
/// Cloning is cheap. The connection is closed at most once no matter how many
/// clones call [`Connection::close`].
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    writer: Mutex<BoxedWriter>,
    write_timeout: Duration,
    shut: AtomicBool,
    cancel: CancellationToken,
}

impl Connection {
    /// Wraps a writer. `parent` is the server-wide shutdown token; cancelling
    /// it stops this connection's handler too.
    pub fn new<W>(
        id: ConnectionId,
        peer: Option<SocketAddr>,
        writer: W,
        write_timeout: Duration,
        parent: &CancellationToken,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                peer,
                writer: Mutex::new(Box::new(writer)),
                write_timeout,
                shut: AtomicBool::new(false),
                cancel: parent.child_token(),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// Writes and flushes `payload`, giving up after the write timeout.
    pub async fn send(&self, payload: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            ));
        }

        let mut writer = self.inner.writer.lock().await;
        let write = async {
            writer.write_all(payload).await?;
            writer.flush().await
        };
        timeout(self.inner.write_timeout, write)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?
    }

    /// Shuts the write half down and wakes the handler. Later calls are no-ops.
    pub async fn close(&self) {
        if self.inner.shut.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();

        let mut writer = self.inner.writer.lock().await;
        let _ = timeout(self.inner.write_timeout, writer.shutdown()).await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shut.load(Ordering::Acquire)
    }

    /// Resolves once the connection is closed or the server shuts down.
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }
}

#[derive(Clone)]
pub struct ClientEntry {
    pub name: String,
    pub connection: Connection,
}

/// Who is connected right now, keyed by connection id.
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<BTreeMap<ConnectionId, ClientEntry>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name` to `connection`, replacing any previous binding for the
    /// same id.
    pub async fn register(&self, connection: Connection, name: String) {
        let mut clients = self.clients.lock().await;
        clients.insert(connection.id(), ClientEntry { name, connection });
    }

    /// Removes the entry for `id`. Only the caller that gets `Some` back may
    /// close the connection.
    pub async fn unregister(&self, id: ConnectionId) -> Option<ClientEntry> {
        self.clients.lock().await.remove(&id)
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.clients.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }

    /// Visits every registered client while holding the registry lock.
    ///
    /// `f` must not block; do network I/O on the result of [`Self::entries`]
    /// instead.
    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&ClientEntry),
    {
        let clients = self.clients.lock().await;
        for entry in clients.values() {
            f(entry);
        }
    }

    /// Snapshot of the current entries, safe to iterate while clients come
    /// and go.
    pub async fn entries(&self) -> Vec<ClientEntry> {
        let mut entries = Vec::new();
        self.for_each(|entry| entries.push(entry.clone())).await;
        entries
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.for_each(|entry| names.push(entry.name.clone())).await;
        names
    }
}
