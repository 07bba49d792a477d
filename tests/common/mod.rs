#![allow(dead_code)]

use binder_rpc::{
    Binder, ConnectionContext, DispatchError, NodeId, Runtime, RuntimeConfig, Server, Transaction,
    TransactionHandler, TransportConfig,
};
use std::{any::Any, sync::Arc, thread, time::Duration};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

pub const ECHO_ARG1: u32 = 1;
pub const ECHO_PAYLOAD: u32 = 2;
/// Sleeps `arg1` milliseconds on the read task, then echoes the payload.
pub const SLOW_ECHO: u32 = 3;
/// Oneway; forwards the payload to the recorder.
pub const RECORD: u32 = 4;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn transport() -> TransportConfig {
    TransportConfig {
        shutdown_timeout: SHUTDOWN_TIMEOUT,
        connect_timeout: Duration::from_secs(2),
        ..TransportConfig::default()
    }
}

pub fn config(node: NodeId) -> RuntimeConfig {
    RuntimeConfig::new(node)
        .with_shutdown_timeout(SHUTDOWN_TIMEOUT)
        .with_connect_timeout(Duration::from_secs(2))
}

/// Node 1 serving on an ephemeral port and node 2 connected to it.
pub async fn node_pair() -> (Runtime, Runtime) {
    init_logging();
    let server = Runtime::new(config(1)).unwrap();
    let listening = server.listen("tcp://127.0.0.1:0").await.unwrap();
    let uri = format!("tcp://{}", listening.local_addr());

    let client = Runtime::new(config(2).with_node(1, uri)).unwrap();
    client.connect_node(1).await.unwrap();
    (server, client)
}

pub fn uri_of(server: &Server) -> String {
    format!("tcp://{}", server.local_addr())
}

/// Polls `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// A raw binder exercising every part of a transaction.
pub struct EchoBinder {
    recorder: mpsc::UnboundedSender<Vec<u8>>,
}

impl EchoBinder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (recorder, records) = mpsc::unbounded_channel();
        (Self { recorder }, records)
    }
}

impl Binder for EchoBinder {
    fn descriptor(&self) -> &str {
        "tests.Echo"
    }

    fn on_transact(&self, transaction: &Transaction) -> Result<Vec<u8>, DispatchError> {
        match transaction.code() {
            ECHO_ARG1 => Ok(transaction.arg1().to_le_bytes().to_vec()),
            ECHO_PAYLOAD => Ok(transaction.payload().to_vec()),
            SLOW_ECHO => {
                thread::sleep(Duration::from_millis(transaction.arg1() as u64));
                Ok(transaction.payload().to_vec())
            }
            RECORD => {
                let _ = self.recorder.send(transaction.payload().to_vec());
                Ok(Vec::new())
            }
            code => Err(DispatchError::NoSuchMethod {
                descriptor: self.descriptor().to_owned(),
                code,
            }),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Hands every inbound transaction to one binder, whatever its target.
pub struct SingleBinder(pub Arc<dyn Binder>);

impl TransactionHandler for SingleBinder {
    fn on_transact(
        &self,
        _context: &ConnectionContext,
        transaction: &Transaction,
    ) -> Result<Vec<u8>, DispatchError> {
        self.0.on_transact(transaction)
    }
}

/// Rejects everything; for the side of a connection that only calls.
pub struct NoBinders;

impl TransactionHandler for NoBinders {
    fn on_transact(
        &self,
        _context: &ConnectionContext,
        transaction: &Transaction,
    ) -> Result<Vec<u8>, DispatchError> {
        Err(DispatchError::NoSuchBinder(transaction.target()))
    }
}

/// A server on an ephemeral port answering with an [`EchoBinder`].
pub async fn echo_server(node: NodeId) -> (Server, mpsc::UnboundedReceiver<Vec<u8>>) {
    init_logging();
    let (echo, records) = EchoBinder::new();
    let server = Server::bind(
        "tcp://127.0.0.1:0",
        node,
        Arc::new(SingleBinder(Arc::new(echo))),
        transport(),
    )
    .await
    .unwrap();
    (server, records)
}
