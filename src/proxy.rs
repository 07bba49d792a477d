//! Client side of an interface.
//!
//! A [`Proxy`] always marshals: it encodes the arguments, sends a transaction
//! to the node owning the binder and decodes the reply. A [`SmartProxy`]
//! additionally keeps the implementation when the binder lives in this
//! runtime and calls it directly while it stays attached. Both paths produce
//! the same values and the same error kinds.

use crate::{
    binder::Interface,
    dispatcher::{Method, OnewayMethod},
    net::{decode_payload, encode_payload, Transaction},
    runtime::Runtime,
    types::BinderRef,
    Error, Promise,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    sync::Arc,
};
use tracing::warn;

pub struct Proxy<I: ?Sized> {
    runtime: Runtime,
    reference: BinderRef,
    interface: PhantomData<fn(&I)>,
}

impl<I: Interface + ?Sized> Proxy<I> {
    pub fn new(runtime: Runtime, reference: BinderRef) -> Self {
        Self {
            runtime,
            reference,
            interface: PhantomData,
        }
    }

    pub fn reference(&self) -> BinderRef {
        self.reference
    }

    pub fn descriptor(&self) -> &'static str {
        I::DESCRIPTOR
    }

    /// Calls a two-way method. A failure raised by the implementation comes
    /// back as [`Error::Remote`] with its kind intact.
    pub fn call<A, R>(&self, method: &Method<I, A, R>, args: A) -> Promise<R>
    where
        A: Serialize,
        R: DeserializeOwned + Clone + Send + 'static,
    {
        let name = method.name();
        let transaction = match self.transaction(method.code(), name, &args) {
            Ok(transaction) => transaction,
            Err(e) => return Promise::rejected(e),
        };
        let reply = self.runtime.transact(self.reference.node(), transaction);
        let result = reply.then(move |reply| {
            decode_payload(&reply?)
                .map_err(|e| Error::Protocol(format!("decoding result of {name}: {e}")))
        });
        // Cancelling the typed promise releases the pending transaction too.
        result.on_complete(move |outcome| {
            if matches!(outcome, Err(Error::Cancelled)) {
                reply.cancel();
            }
        });
        result
    }

    /// Sends a oneway method. Resolves once the request has been handed off;
    /// the callee's outcome is never reported.
    pub fn send<A: Serialize>(&self, method: &OnewayMethod<I, A>, args: A) -> Promise<()> {
        let transaction = match self.transaction(method.code(), method.name(), &args) {
            Ok(transaction) => transaction.oneway(),
            Err(e) => return Promise::rejected(e),
        };
        self.runtime
            .transact(self.reference.node(), transaction)
            .then(|written| written.map(drop))
    }

    fn transaction<A: Serialize>(&self, code: u32, name: &str, args: &A) -> Result<Transaction, Error> {
        let payload = encode_payload(args)
            .map_err(|e| Error::Protocol(format!("encoding arguments of {name}: {e}")))?;
        Ok(Transaction::new(self.reference.id(), code).with_payload(payload))
    }
}

impl<I: ?Sized> Clone for Proxy<I> {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            reference: self.reference,
            interface: PhantomData,
        }
    }
}

impl<I: ?Sized> PartialEq for Proxy<I> {
    fn eq(&self, other: &Self) -> bool {
        self.reference == other.reference
    }
}

impl<I: ?Sized> Eq for Proxy<I> {}

impl<I: ?Sized> Hash for Proxy<I> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.reference.hash(state)
    }
}

impl<I: ?Sized> fmt::Debug for Proxy<I> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Proxy({})", self.reference)
    }
}

/// Picks the direct or the marshalled path on every call.
pub struct SmartProxy<I: ?Sized> {
    local: Option<Arc<I>>,
    proxy: Proxy<I>,
}

impl<I: Interface + ?Sized> SmartProxy<I> {
    pub fn new(runtime: Runtime, reference: BinderRef) -> Self {
        Self {
            local: runtime.query_local_interface::<I>(reference),
            proxy: Proxy::new(runtime, reference),
        }
    }

    pub fn reference(&self) -> BinderRef {
        self.proxy.reference
    }

    pub fn proxy(&self) -> &Proxy<I> {
        &self.proxy
    }

    pub fn is_local(&self) -> bool {
        self.local().is_some()
    }

    pub fn call<A, R>(&self, method: &Method<I, A, R>, args: A) -> Promise<R>
    where
        A: Serialize,
        R: DeserializeOwned + Clone + Send + 'static,
    {
        match self.local() {
            Some(local) => Promise::from_result(method.invoke(local, args).map_err(Error::Remote)),
            None => self.proxy.call(method, args),
        }
    }

    pub fn send<A: Serialize>(&self, method: &OnewayMethod<I, A>, args: A) -> Promise<()> {
        let Some(local) = self.local() else {
            return self.proxy.send(method, args);
        };
        if let Err(e) = method.invoke(local, args) {
            warn!(binder = %self.reference(), method = method.name(), "oneway call failed: {e}");
        }
        Promise::fulfilled(())
    }

    fn local(&self) -> Option<&I> {
        let local = self.local.as_deref()?;
        self.proxy
            .runtime
            .is_local(self.proxy.reference)
            .then_some(local)
    }
}

impl<I: ?Sized> Clone for SmartProxy<I> {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            proxy: self.proxy.clone(),
        }
    }
}

impl<I: ?Sized> PartialEq for SmartProxy<I> {
    fn eq(&self, other: &Self) -> bool {
        self.proxy == other.proxy
    }
}

impl<I: ?Sized> Eq for SmartProxy<I> {}

impl<I: ?Sized> Hash for SmartProxy<I> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.proxy.hash(state)
    }
}

impl<I: ?Sized> fmt::Debug for SmartProxy<I> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SmartProxy")
            .field("reference", &self.proxy.reference)
            .field("local", &self.local.is_some())
            .finish()
    }
}
