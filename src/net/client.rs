use super::{
    connection::{Connection, ConnectionContext, TransactionHandler},
    endpoint::Endpoint,
    Transaction,
};
use crate::{config::TransportConfig, types::NodeId, Error, Promise, Result};
use std::sync::Arc;
use tokio::{net::TcpStream, time::timeout};
use tracing::{error, info};

/// A dialed connection to one remote node.
#[derive(Clone, Debug)]
pub struct Client {
    endpoint: Endpoint,
    connection: Connection,
}

impl Client {
    /// Dials `uri`, which must be `tcp://host:port`. The dial is bounded by
    /// the connect timeout and never retried; on failure nothing is left
    /// running.
    pub async fn connect(
        uri: &str,
        local_node: NodeId,
        handler: Arc<dyn TransactionHandler>,
        config: TransportConfig,
    ) -> Result<Self> {
        let endpoint = Endpoint::parse(uri)?;
        let dial = TcpStream::connect((endpoint.host(), endpoint.port()));
        let stream = match timeout(config.connect_timeout, dial).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!(%endpoint, "cannot connect: {e}");
                return Err(e.into());
            }
            Err(_) => {
                error!(%endpoint, timeout = ?config.connect_timeout, "connect timed out");
                return Err(Error::Timeout(config.connect_timeout));
            }
        };

        let connection = Connection::start(stream, local_node, handler, config, None)?;
        info!(%endpoint, connection = connection.id(), node = local_node, "connected");
        Ok(Self {
            endpoint,
            connection,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn context(&self) -> &ConnectionContext {
        self.connection.context()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    pub fn transact(&self, transaction: Transaction) -> Promise<Vec<u8>> {
        self.connection.transact(transaction)
    }

    pub async fn close(&self) {
        self.connection.close().await
    }
}
