//! Two nodes in one process: node 1 publishes an echo service, node 2 calls
//! it over TCP and through a callback.
//!
//! Run with `RUST_LOG=debug` to see the transport at work.

use binder_rpc::{
    interface, services::CallbackResult, services::RemoteCallback, services::RemoteCallbackProxy,
    BinderRef, Method, RemoteError, Runtime, RuntimeConfig,
};
use std::{error::Error, sync::Arc};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

trait Echo: Send + Sync {
    fn echo(&self, message: String) -> Result<String, RemoteError>;
    fn echo_later(&self, message: String, callback: BinderRef) -> Result<(), RemoteError>;
}

const ECHO: Method<dyn Echo, String, String> = Method::new(1, "echo", |e, message| e.echo(message));
const ECHO_LATER: Method<dyn Echo, (String, BinderRef), ()> =
    Method::new(2, "echo_later", |e, (message, callback)| e.echo_later(message, callback));

interface!(dyn Echo, "demo.Echo", [ECHO, ECHO_LATER]);

struct EchoService {
    runtime: Runtime,
}

impl Echo for EchoService {
    fn echo(&self, message: String) -> Result<String, RemoteError> {
        info!(node = self.runtime.node_id(), %message, "echo");
        Ok(message)
    }

    fn echo_later(&self, message: String, callback: BinderRef) -> Result<(), RemoteError> {
        let binder = self.runtime.publish::<dyn Echo>(Arc::new(EchoService {
            runtime: self.runtime.clone(),
        }));
        info!(%message, %callback, "answering through callback");
        RemoteCallbackProxy::new(&self.runtime, callback).on_result(CallbackResult {
            success: !message.is_empty(),
            binder: Some(binder),
        });
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let node1 = Runtime::new(RuntimeConfig::new(1))?;
    let server = node1.listen("tcp://127.0.0.1:0").await?;
    let echo = node1.publish::<dyn Echo>(Arc::new(EchoService {
        runtime: node1.clone(),
    }));

    let node2 = Runtime::new(
        RuntimeConfig::new(2).with_node(1, format!("tcp://{}", server.local_addr())),
    )?;
    node2.connect_node(1).await?;

    let proxy = node2.proxy::<dyn Echo>(echo);
    let reply = proxy.call(&ECHO, "hello over tcp".to_owned()).await?;
    info!(%reply, local = proxy.is_local(), "node 2 got a reply");

    let (results_tx, mut results) = mpsc::unbounded_channel();
    let callback = node2.publish::<dyn RemoteCallback>(Arc::new(move |result: CallbackResult| {
        let _ = results_tx.send(result);
    }));
    proxy.call(&ECHO_LATER, ("call me back".to_owned(), callback)).await?;
    if let Some(result) = results.recv().await {
        info!(success = result.success, binder = ?result.binder, "node 2 was called back");
        if let Some(binder) = result.binder {
            let reply = node2.proxy::<dyn Echo>(binder).call(&ECHO, "again".to_owned()).await?;
            info!(%reply, "second echo binder answered");
        }
    }

    let local = node1.proxy::<dyn Echo>(echo);
    let reply = local.call(&ECHO, "no socket involved".to_owned()).await?;
    info!(%reply, local = local.is_local(), "node 1 called itself");

    node2.shutdown().await;
    node1.shutdown().await;
    Ok(())
}
