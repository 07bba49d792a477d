//! The service registry boundary.
//!
//! These interfaces only fix the method codes and argument types. What starting,
//! stopping or binding a service means is up to the [`ServiceManager`]
//! implementation; the runtime routes the calls like any other.

use crate::{
    dispatcher::{Method, OnewayMethod},
    promise::Promise,
    proxy::SmartProxy,
    runtime::Runtime,
    types::BinderRef,
    RemoteError,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Identifies a component by package and class name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentName {
    pub package: String,
    pub class: String,
}

impl ComponentName {
    pub fn new(package: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            class: class.into(),
        }
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.package, self.class)
    }
}

/// Describes the service a request is about.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub component: Option<ComponentName>,
    pub action: Option<String>,
    pub extras: BTreeMap<String, String>,
}

impl ServiceDescriptor {
    pub fn for_component(component: ComponentName) -> Self {
        Self {
            component: Some(component),
            ..Self::default()
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }
}

pub trait ServiceManager: Send + Sync {
    fn start_service(&self, service: ServiceDescriptor) -> Result<ComponentName, RemoteError>;

    fn stop_service(&self, service: ServiceDescriptor) -> Result<bool, RemoteError>;

    /// Binds `service`; the outcome is reported later through `callback`, a
    /// [`RemoteCallback`] binder owned by the caller.
    fn bind_service(
        &self,
        service: ServiceDescriptor,
        callback: BinderRef,
        flags: i32,
    ) -> Result<bool, RemoteError>;

    fn unbind_service(&self, callback: BinderRef) -> Result<(), RemoteError>;
}

pub const START_SERVICE: Method<dyn ServiceManager, ServiceDescriptor, ComponentName> =
    Method::new(1, "start_service", |m, service| m.start_service(service));
pub const STOP_SERVICE: Method<dyn ServiceManager, ServiceDescriptor, bool> =
    Method::new(2, "stop_service", |m, service| m.stop_service(service));
pub const BIND_SERVICE: Method<dyn ServiceManager, (ServiceDescriptor, BinderRef, i32), bool> =
    Method::new(3, "bind_service", |m, (service, callback, flags)| {
        m.bind_service(service, callback, flags)
    });
pub const UNBIND_SERVICE: OnewayMethod<dyn ServiceManager, BinderRef> =
    OnewayMethod::new(4, "unbind_service", |m, callback| m.unbind_service(callback));

interface!(
    dyn ServiceManager,
    "binder_rpc.ServiceManager",
    [START_SERVICE, STOP_SERVICE, BIND_SERVICE, UNBIND_SERVICE]
);

/// Typed calls on a [`ServiceManager`], wherever it lives.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceManagerProxy {
    inner: SmartProxy<dyn ServiceManager>,
}

impl ServiceManagerProxy {
    pub fn new(runtime: &Runtime, reference: BinderRef) -> Self {
        Self {
            inner: runtime.proxy(reference),
        }
    }

    pub fn reference(&self) -> BinderRef {
        self.inner.reference()
    }

    pub fn start_service(&self, service: ServiceDescriptor) -> Promise<ComponentName> {
        self.inner.call(&START_SERVICE, service)
    }

    pub fn stop_service(&self, service: ServiceDescriptor) -> Promise<bool> {
        self.inner.call(&STOP_SERVICE, service)
    }

    pub fn bind_service(
        &self,
        service: ServiceDescriptor,
        callback: BinderRef,
        flags: i32,
    ) -> Promise<bool> {
        self.inner.call(&BIND_SERVICE, (service, callback, flags))
    }

    pub fn unbind_service(&self, callback: BinderRef) -> Promise<()> {
        self.inner.send(&UNBIND_SERVICE, callback)
    }
}

/// What a [`RemoteCallback`] is told about a bind request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CallbackResult {
    pub success: bool,
    /// The bound service's binder on success.
    pub binder: Option<BinderRef>,
}

/// Receives the result of an asynchronous request.
pub trait RemoteCallback: Send + Sync {
    fn on_result(&self, result: CallbackResult) -> Result<(), RemoteError>;
}

impl<F> RemoteCallback for F
where
    F: Fn(CallbackResult) + Send + Sync,
{
    fn on_result(&self, result: CallbackResult) -> Result<(), RemoteError> {
        self(result);
        Ok(())
    }
}

pub const ON_RESULT: OnewayMethod<dyn RemoteCallback, CallbackResult> =
    OnewayMethod::new(1, "on_result", |c, result| c.on_result(result));

interface!(dyn RemoteCallback, "binder_rpc.RemoteCallback", [ON_RESULT]);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemoteCallbackProxy {
    inner: SmartProxy<dyn RemoteCallback>,
}

impl RemoteCallbackProxy {
    pub fn new(runtime: &Runtime, reference: BinderRef) -> Self {
        Self {
            inner: runtime.proxy(reference),
        }
    }

    pub fn reference(&self) -> BinderRef {
        self.inner.reference()
    }

    pub fn on_result(&self, result: CallbackResult) -> Promise<()> {
        self.inner.send(&ON_RESULT, result)
    }
}
