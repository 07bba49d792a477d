//! The per-process context: node id, configuration, local binders and the
//! routes to other nodes.

use crate::{
    binder::{query_local_interface, Binder, Interface, Stub},
    config::RuntimeConfig,
    dispatcher::DispatchError,
    lock,
    net::{
        client::Client,
        connection::{Connection, ConnectionContext, TransactionHandler},
        server::Server,
        Transaction,
    },
    proxy::SmartProxy,
    types::{BinderId, BinderRef, NodeId},
    Error, Promise, Result,
};
use futures::future;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};
use tracing::{debug, info, warn};

struct RuntimeInner {
    config: RuntimeConfig,
    binders: Mutex<HashMap<BinderId, Arc<dyn Binder>>>,
    next_binder_id: AtomicU64,
    routes: Mutex<HashMap<NodeId, Connection>>,
    clients: Mutex<Vec<Client>>,
    servers: Mutex<Vec<Server>>,
    shut_down: AtomicBool,
}

/// Handle to the runtime. Clones share the same state.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                config,
                binders: Mutex::new(HashMap::new()),
                next_binder_id: AtomicU64::new(1),
                routes: Mutex::new(HashMap::new()),
                clients: Mutex::new(Vec::new()),
                servers: Mutex::new(Vec::new()),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Creates a runtime and serves on the configured `listen` endpoint, if any.
    pub async fn start(config: RuntimeConfig) -> Result<Self> {
        let runtime = Self::new(config)?;
        if let Some(uri) = runtime.inner.config.listen.clone() {
            runtime.listen(&uri).await?;
        }
        Ok(runtime)
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.config.node_id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Servers this runtime is listening on.
    pub fn servers(&self) -> Vec<Server> {
        lock(&self.inner.servers).clone()
    }

    /// Registers a raw binder under a fresh id.
    pub fn attach(&self, binder: Arc<dyn Binder>) -> BinderRef {
        let id = self.inner.next_binder_id.fetch_add(1, Ordering::Relaxed);
        let reference = BinderRef::new(self.node_id(), id);
        debug!(binder = %reference, descriptor = binder.descriptor(), "attached binder");
        lock(&self.inner.binders).insert(id, binder);
        reference
    }

    /// Registers `implementation` behind a [`Stub`] of interface `I`.
    pub fn publish<I: Interface + ?Sized>(&self, implementation: Arc<I>) -> BinderRef {
        self.attach(Arc::new(Stub::new(implementation)))
    }

    /// Unregisters a local binder; later calls to it fail with
    /// [`DispatchError::NoSuchBinder`].
    pub fn detach(&self, reference: BinderRef) -> bool {
        if reference.node() != self.node_id() {
            return false;
        }
        let removed = lock(&self.inner.binders).remove(&reference.id()).is_some();
        if removed {
            debug!(binder = %reference, "detached binder");
        }
        removed
    }

    pub fn binder(&self, reference: BinderRef) -> Option<Arc<dyn Binder>> {
        if reference.node() != self.node_id() {
            return None;
        }
        lock(&self.inner.binders).get(&reference.id()).cloned()
    }

    /// True if `reference` names a binder currently attached to this runtime.
    pub fn is_local(&self, reference: BinderRef) -> bool {
        reference.node() == self.node_id()
            && lock(&self.inner.binders).contains_key(&reference.id())
    }

    pub fn query_local_interface<I: Interface + ?Sized>(
        &self,
        reference: BinderRef,
    ) -> Option<Arc<I>> {
        let binder = self.binder(reference)?;
        query_local_interface(binder.as_ref())
    }

    pub fn proxy<I: Interface + ?Sized>(&self, reference: BinderRef) -> SmartProxy<I> {
        SmartProxy::new(self.clone(), reference)
    }

    /// Serves on `uri`. Connections accepted there become routes to their
    /// nodes once the peer's handshake arrives.
    pub async fn listen(&self, uri: &str) -> Result<Server> {
        self.ensure_running()?;
        let config = self.inner.config.transport();
        let server = Server::bind(uri, self.node_id(), self.handler(), config).await?;
        lock(&self.inner.servers).push(server.clone());
        if self.is_shut_down() {
            server.shutdown().await;
            return Err(Error::closed());
        }
        Ok(server)
    }

    /// Dials `uri` and waits for the peer's handshake, so the route to the
    /// peer's node exists when this returns.
    pub async fn connect(&self, uri: &str) -> Result<Client> {
        self.ensure_running()?;
        let config = self.inner.config.transport();
        let client = Client::connect(uri, self.node_id(), self.handler(), config).await?;
        let node = match client
            .connection()
            .handshake()
            .wait_timeout(config.connect_timeout)
            .await
        {
            Ok(node) => node,
            Err(e) => {
                warn!(endpoint = %client.endpoint(), "no handshake from peer: {e}");
                client.close().await;
                return Err(e);
            }
        };

        {
            let mut clients = lock(&self.inner.clients);
            clients.retain(|client| !client.is_closed());
            clients.push(client.clone());
        }
        if self.is_shut_down() {
            client.close().await;
            return Err(Error::closed());
        }
        info!(node = self.node_id(), peer_node = node, endpoint = %client.endpoint(), "connected to node");
        Ok(client)
    }

    /// Dials the endpoint configured for `node`.
    pub async fn connect_node(&self, node: NodeId) -> Result<Client> {
        let uri = self
            .inner
            .config
            .node_uri(node)
            .ok_or_else(|| Error::Config(format!("no endpoint configured for node {node}")))?
            .to_owned();
        let client = self.connect(&uri).await?;
        match client.context().peer_node() {
            Some(peer) if peer == node => Ok(client),
            peer => {
                client.close().await;
                Err(Error::Protocol(format!(
                    "{uri} answered as node {peer:?}, expected node {node}"
                )))
            }
        }
    }

    /// The live connection calls to `node` travel on.
    pub fn route(&self, node: NodeId) -> Option<Connection> {
        lock(&self.inner.routes)
            .get(&node)
            .filter(|connection| !connection.is_closed())
            .cloned()
    }

    /// Sends `transaction` to `node`. Transactions for this node are
    /// dispatched directly without touching a socket.
    pub fn transact(&self, node: NodeId, transaction: Transaction) -> Promise<Vec<u8>> {
        if node == self.node_id() {
            let result = self.dispatch(&transaction);
            if transaction.is_oneway() {
                if let Err(e) = result {
                    warn!(binder = transaction.target(), code = transaction.code(), "oneway transaction failed: {e}");
                }
                return Promise::fulfilled(Vec::new());
            }
            return Promise::from_result(result.map_err(Error::from));
        }
        match self.route(node) {
            Some(connection) => connection.transact(transaction),
            None => Promise::rejected(Error::Transport(format!("no route to node {node}"))),
        }
    }

    /// Shuts down every server, client and route and drops all binders.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(node = self.node_id(), "shutting down runtime");

        let servers: Vec<_> = lock(&inner.servers).drain(..).collect();
        future::join_all(servers.iter().map(|server| server.shutdown())).await;

        let clients: Vec<_> = lock(&inner.clients).drain(..).collect();
        future::join_all(clients.iter().map(|client| client.close())).await;

        let routes: Vec<_> = lock(&inner.routes).drain().map(|(_, c)| c).collect();
        future::join_all(routes.iter().map(|connection| connection.close())).await;

        lock(&inner.binders).clear();
        debug!(node = self.node_id(), "runtime has been shut down");
    }

    fn dispatch(&self, transaction: &Transaction) -> Result<Vec<u8>, DispatchError> {
        self.inner.dispatch(transaction)
    }

    fn handler(&self) -> Arc<dyn TransactionHandler> {
        Arc::new(RuntimeHandler {
            runtime: Arc::downgrade(&self.inner),
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::closed());
        }
        Ok(())
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut routes: Vec<_> = lock(&self.inner.routes).keys().copied().collect();
        routes.sort_unstable();
        f.debug_struct("Runtime")
            .field("node_id", &self.node_id())
            .field("binders", &lock(&self.inner.binders).len())
            .field("routes", &routes)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl RuntimeInner {
    fn dispatch(&self, transaction: &Transaction) -> Result<Vec<u8>, DispatchError> {
        let binder = lock(&self.binders).get(&transaction.target()).cloned();
        match binder {
            Some(binder) => binder.on_transact(transaction),
            None => Err(DispatchError::NoSuchBinder(transaction.target())),
        }
    }
}

/// Routes inbound transactions of every connection to the runtime's binders.
struct RuntimeHandler {
    runtime: Weak<RuntimeInner>,
}

impl TransactionHandler for RuntimeHandler {
    fn on_transact(
        &self,
        _context: &ConnectionContext,
        transaction: &Transaction,
    ) -> Result<Vec<u8>, DispatchError> {
        match self.runtime.upgrade() {
            Some(runtime) => runtime.dispatch(transaction),
            None => Err(DispatchError::NoSuchBinder(transaction.target())),
        }
    }

    fn on_hello(&self, context: &ConnectionContext) {
        let (Some(runtime), Some(peer), Some(connection)) = (
            self.runtime.upgrade(),
            context.peer_node(),
            context.connection(),
        ) else {
            return;
        };
        if peer == runtime.config.node_id {
            warn!(connection = context.id(), node = peer, "peer claims this node's id");
            return;
        }
        let mut routes = lock(&runtime.routes);
        match routes.get(&peer) {
            Some(existing) if !existing.is_closed() && existing.id() != connection.id() => {
                debug!(
                    connection = context.id(),
                    route = existing.id(),
                    peer_node = peer,
                    "keeping existing route"
                );
            }
            _ => {
                debug!(connection = context.id(), peer_node = peer, "route registered");
                routes.insert(peer, connection);
            }
        }
    }

    fn on_close(&self, context: &ConnectionContext) {
        let (Some(runtime), Some(peer)) = (self.runtime.upgrade(), context.peer_node()) else {
            return;
        };
        let mut routes = lock(&runtime.routes);
        if routes.get(&peer).is_some_and(|route| route.id() == context.id()) {
            routes.remove(&peer);
            debug!(connection = context.id(), peer_node = peer, "route removed");
        }
    }
}
