//! Local binder objects.
//!
//! A [`Binder`] is anything the runtime can dispatch a [`Transaction`] to.
//! Most binders are a [`Stub`]: an implementation of some interface `I`
//! together with that interface's [`MethodTable`].

use crate::{
    dispatcher::{DispatchError, MethodTable},
    net::Transaction,
};
use std::{any::Any, fmt, sync::Arc};

pub trait Binder: Send + Sync + 'static {
    /// Names the interface, e.g. `binder_rpc.ServiceManager`.
    fn descriptor(&self) -> &str;

    /// Runs one transaction addressed to this binder. Called on the read
    /// task of the connection it arrived on, or on the caller's thread for
    /// local transactions.
    fn on_transact(&self, transaction: &Transaction) -> Result<Vec<u8>, DispatchError>;

    fn as_any(&self) -> &dyn Any;
}

/// An interface that can be published and called remotely, usually a
/// `dyn Trait`. Implemented with [`interface!`](crate::interface).
pub trait Interface: Send + Sync + 'static {
    const DESCRIPTOR: &'static str;

    fn methods() -> MethodTable<Self>;
}

/// Server side of an interface: decodes transactions and calls into the
/// implementation.
pub struct Stub<I: ?Sized> {
    implementation: Arc<I>,
    methods: MethodTable<I>,
}

impl<I: Interface + ?Sized> Stub<I> {
    pub fn new(implementation: Arc<I>) -> Self {
        Self {
            implementation,
            methods: I::methods(),
        }
    }

    pub fn implementation(&self) -> &Arc<I> {
        &self.implementation
    }

    pub fn methods(&self) -> &MethodTable<I> {
        &self.methods
    }
}

impl<I: Interface + ?Sized> Binder for Stub<I> {
    fn descriptor(&self) -> &str {
        I::DESCRIPTOR
    }

    fn on_transact(&self, transaction: &Transaction) -> Result<Vec<u8>, DispatchError> {
        self.methods.call(
            I::DESCRIPTOR,
            &self.implementation,
            transaction.code(),
            transaction.payload(),
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<I: ?Sized> fmt::Debug for Stub<I> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Stub").field("methods", &self.methods).finish()
    }
}

/// The implementation behind `binder`, if it is a [`Stub`] of `I`.
pub fn query_local_interface<I: Interface + ?Sized>(binder: &dyn Binder) -> Option<Arc<I>> {
    binder
        .as_any()
        .downcast_ref::<Stub<I>>()
        .map(|stub| stub.implementation.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dispatcher::Method,
        net::{decode_payload, encode_payload},
        RemoteError,
    };

    trait Counter: Send + Sync {
        fn add(&self, by: i64) -> Result<i64, RemoteError>;
    }

    struct Fixed(i64);

    impl Counter for Fixed {
        fn add(&self, by: i64) -> Result<i64, RemoteError> {
            Ok(self.0 + by)
        }
    }

    const ADD: Method<dyn Counter, i64, i64> = Method::new(1, "add", |c, by| c.add(by));

    interface!(dyn Counter, "tests.Counter", [ADD]);

    trait Other: Send + Sync {}
    interface!(dyn Other, "tests.Other", []);

    #[test]
    fn stub_dispatches_by_code() {
        let stub = Stub::<dyn Counter>::new(Arc::new(Fixed(40)));
        assert_eq!(stub.descriptor(), "tests.Counter");

        let transaction = Transaction::new(1, ADD.code()).with_payload(encode_payload(&2i64).unwrap());
        let reply = stub.on_transact(&transaction).unwrap();
        assert_eq!(decode_payload::<i64>(&reply).unwrap(), 42);

        assert_eq!(
            stub.on_transact(&Transaction::new(1, 7)),
            Err(DispatchError::NoSuchMethod {
                descriptor: "tests.Counter".into(),
                code: 7
            })
        );
    }

    #[test]
    fn queries_implementation_by_interface() {
        let stub: Arc<dyn Binder> = Arc::new(Stub::<dyn Counter>::new(Arc::new(Fixed(1))));
        let counter = query_local_interface::<dyn Counter>(stub.as_ref()).unwrap();
        assert_eq!(counter.add(1).unwrap(), 2);
        assert!(query_local_interface::<dyn Other>(stub.as_ref()).is_none());
    }
}
