//! Transparent RPC between binder objects, in process or across TCP.
//!
//! A [`Runtime`] owns the local binders of one node and its connections to
//! other nodes. Interfaces are plain traits described by [`Method`] tables
//! (see [`interface!`]); a [`SmartProxy`] calls them directly when the binder
//! is local and marshals the call over the node's [`Connection`] otherwise.
//! Every call yields a [`Promise`].

#[macro_use]
mod macros;

pub mod binder;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod net;
pub mod promise;
pub mod proxy;
pub mod runtime;
pub mod services;
pub mod types;

pub use binder::{Binder, Interface, Stub};
pub use config::{RuntimeConfig, TransportConfig};
pub use dispatcher::{DispatchError, DynamicMethod, Method, MethodTable, OnewayMethod};
pub use error::{Error, RemoteError, Result};
pub use net::{
    client::Client,
    connection::{Connection, ConnectionContext, ConnectionId, TransactionHandler},
    endpoint::Endpoint,
    server::Server,
    worker::WorkerState,
    Transaction,
};
pub use promise::Promise;
pub use proxy::{Proxy, SmartProxy};
pub use runtime::Runtime;
pub use types::{BinderId, BinderRef, CallKind, NodeId, FLAG_ONEWAY};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
