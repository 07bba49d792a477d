use super::{
    connection::{Connection, ConnectionId, TerminateHook, TransactionHandler},
    endpoint::Endpoint,
    worker::{StopSignal, Worker, WorkerState},
};
use crate::{config::TransportConfig, lock, types::NodeId, Error, Result};
use futures::future;
use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
};
use tokio::net::{lookup_host, TcpListener, TcpSocket};
use tracing::{debug, error, info, warn};

const BACKLOG: u32 = 1024;

struct ServerInner {
    endpoint: Endpoint,
    local_addr: SocketAddr,
    local_node: NodeId,
    handler: Arc<dyn TransactionHandler>,
    config: TransportConfig,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    acceptor: Worker,
    shut_down: AtomicBool,
}

/// Accepts connections on one endpoint and owns every connection it accepted.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Binds `uri` with address reuse and starts accepting. Port 0 picks an
    /// ephemeral port, see [`Server::local_addr`].
    pub async fn bind(
        uri: &str,
        local_node: NodeId,
        handler: Arc<dyn TransactionHandler>,
        config: TransportConfig,
    ) -> Result<Self> {
        let endpoint = Endpoint::parse(uri)?;
        let listener = listen(&endpoint).await?;
        let local_addr = listener.local_addr()?;

        let inner = Arc::new(ServerInner {
            acceptor: Worker::new(format!("acceptor {local_addr}")),
            endpoint,
            local_addr,
            local_node,
            handler,
            config,
            connections: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        });
        let server = Arc::downgrade(&inner);
        inner
            .acceptor
            .start(move |stop| accept_loop(server, listener, stop));

        info!(%local_addr, node = local_node, "listening");
        Ok(Self { inner })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn acceptor_state(&self) -> WorkerState {
        self.inner.acceptor.state()
    }

    /// A snapshot of the live connections.
    pub fn connections(&self) -> Vec<Connection> {
        lock(&self.inner.connections).values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.inner.connections).len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Closes every live connection, then stops accepting. Idempotent.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(local_addr = %inner.local_addr, "shutting down server");
        inner.acceptor.stop();

        let connections: Vec<_> = lock(&inner.connections).drain().map(|(_, c)| c).collect();
        future::join_all(connections.iter().map(|connection| connection.close())).await;

        if !inner.acceptor.join(inner.config.shutdown_timeout).await {
            error!(local_addr = %inner.local_addr, "cannot shut down acceptor");
        }
        debug!(local_addr = %inner.local_addr, "server has been shut down");
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Server")
            .field("endpoint", &self.inner.endpoint)
            .field("local_addr", &self.inner.local_addr)
            .field("connections", &self.connection_count())
            .field("acceptor", &self.inner.acceptor)
            .finish()
    }
}

async fn listen(endpoint: &Endpoint) -> Result<TcpListener> {
    let addr = lookup_host((endpoint.host(), endpoint.port()))
        .await?
        .next()
        .ok_or_else(|| Error::InvalidUri(format!("{endpoint}: host does not resolve")))?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(BACKLOG)?)
}

async fn accept_loop(server: Weak<ServerInner>, listener: TcpListener, mut stop: StopSignal) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop.stopped() => break,
            accepted = listener.accept() => accepted,
        };
        let Some(inner) = server.upgrade() else {
            break;
        };
        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(local_addr = %inner.local_addr, "accept failed: {e}");
                continue;
            }
        };

        let remove: TerminateHook = {
            let server = server.clone();
            Box::new(move |id| {
                if let Some(inner) = server.upgrade() {
                    lock(&inner.connections).remove(&id);
                }
            })
        };
        let connection = match Connection::start(
            stream,
            inner.local_node,
            inner.handler.clone(),
            inner.config,
            Some(remove),
        ) {
            Ok(connection) => connection,
            Err(e) => {
                warn!(%peer_addr, "cannot set up accepted connection: {e}");
                continue;
            }
        };
        debug!(%peer_addr, connection = connection.id(), "accepted connection");

        lock(&inner.connections).insert(connection.id(), connection.clone());
        // It may have died, or the server may have shut down, before the insert.
        if connection.is_closed() || inner.shut_down.load(Ordering::Acquire) {
            lock(&inner.connections).remove(&connection.id());
            connection.close().await;
        }
    }
    debug!("accept loop stopped");
}
