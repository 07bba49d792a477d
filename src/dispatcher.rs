use crate::{
    net::{decode_payload, encode_payload},
    types::CallKind,
    RemoteError,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, sync::Arc};
use thiserror::Error;
use tracing::warn;

/// A two-way method of interface `I`, taking `A` and answering `R`.
///
/// The same descriptor drives both directions: a [`Stub`](crate::Stub)
/// decodes `A`, calls `invoke` and encodes `R`; a [`Proxy`](crate::Proxy)
/// encodes `A`, transacts with `code` and decodes `R`.
pub struct Method<I: ?Sized, A, R> {
    code: u32,
    name: &'static str,
    invoke: fn(&I, A) -> Result<R, RemoteError>,
}

impl<I: ?Sized, A, R> Method<I, A, R> {
    pub const fn new(
        code: u32,
        name: &'static str,
        invoke: fn(&I, A) -> Result<R, RemoteError>,
    ) -> Self {
        Self { code, name, invoke }
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn invoke(&self, target: &I, args: A) -> Result<R, RemoteError> {
        (self.invoke)(target, args)
    }
}

impl<I: ?Sized, A, R> Clone for Method<I, A, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<I: ?Sized, A, R> Copy for Method<I, A, R> {}

/// A fire-and-forget method of interface `I`. Failures on the callee side are
/// logged there and never reach the caller.
pub struct OnewayMethod<I: ?Sized, A> {
    code: u32,
    name: &'static str,
    invoke: fn(&I, A) -> Result<(), RemoteError>,
}

impl<I: ?Sized, A> OnewayMethod<I, A> {
    pub const fn new(
        code: u32,
        name: &'static str,
        invoke: fn(&I, A) -> Result<(), RemoteError>,
    ) -> Self {
        Self { code, name, invoke }
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn invoke(&self, target: &I, args: A) -> Result<(), RemoteError> {
        (self.invoke)(target, args)
    }
}

impl<I: ?Sized, A> Clone for OnewayMethod<I, A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<I: ?Sized, A> Copy for OnewayMethod<I, A> {}

/// A type-erased method, the unit a [`MethodTable`] dispatches to.
pub trait DynamicMethod<I: ?Sized>: Send + Sync {
    fn code(&self) -> u32;
    fn name(&self) -> &'static str;
    fn kind(&self) -> CallKind;
    fn call(&self, target: &I, payload: &[u8]) -> Result<Vec<u8>, DispatchError>;
}

impl<I, A, R> DynamicMethod<I> for Method<I, A, R>
where
    I: ?Sized,
    A: DeserializeOwned,
    R: Serialize,
{
    fn code(&self) -> u32 {
        self.code
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> CallKind {
        CallKind::TwoWay
    }

    fn call(&self, target: &I, payload: &[u8]) -> Result<Vec<u8>, DispatchError> {
        let args = decode_payload(payload).map_err(|e| DispatchError::Decode {
            method: self.name.to_owned(),
            message: e.to_string(),
        })?;
        let retval = self.invoke(target, args).map_err(DispatchError::Remote)?;
        encode_payload(&retval).map_err(|e| DispatchError::Encode {
            method: self.name.to_owned(),
            message: e.to_string(),
        })
    }
}

impl<I, A> DynamicMethod<I> for OnewayMethod<I, A>
where
    I: ?Sized,
    A: DeserializeOwned,
{
    fn code(&self) -> u32 {
        self.code
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> CallKind {
        CallKind::Oneway
    }

    fn call(&self, target: &I, payload: &[u8]) -> Result<Vec<u8>, DispatchError> {
        let args = decode_payload(payload).map_err(|e| DispatchError::Decode {
            method: self.name.to_owned(),
            message: e.to_string(),
        })?;
        self.invoke(target, args).map_err(DispatchError::Remote)?;
        Ok(Vec::new())
    }
}

/// Maps method codes of interface `I` to their [`DynamicMethod`].
pub struct MethodTable<I: ?Sized> {
    methods: BTreeMap<u32, Arc<dyn DynamicMethod<I>>>,
}

impl<I: ?Sized> Default for MethodTable<I> {
    fn default() -> Self {
        Self {
            methods: BTreeMap::new(),
        }
    }
}

impl<I: ?Sized> MethodTable<I> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<M>(&mut self, method: M) -> &mut Self
    where
        M: DynamicMethod<I> + 'static,
    {
        let code = method.code();
        let added = method.name();
        if let Some(previous) = self.methods.insert(code, Arc::new(method)) {
            warn!(code, added, replaced = previous.name(), "method code registered twice");
        }
        self
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub(crate) fn call(
        &self,
        descriptor: &str,
        target: &I,
        code: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>, DispatchError> {
        self.methods
            .get(&code)
            .ok_or_else(|| DispatchError::NoSuchMethod {
                descriptor: descriptor.to_owned(),
                code,
            })?
            .call(target, payload)
    }

    pub fn methods(&self) -> Vec<MethodInfo> {
        self.methods
            .values()
            .map(|method| MethodInfo {
                code: method.code(),
                name: method.name().to_owned(),
                kind: method.kind(),
            })
            .collect()
    }
}

impl<I: ?Sized> fmt::Debug for MethodTable<I> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.methods()).finish()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub code: u32,
    pub name: String,
    pub kind: CallKind,
}

/// Why a peer could not run a call. Travels back inside the reply frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("no binder with id {0}")]
    NoSuchBinder(u64),

    #[error("{descriptor} has no method with code {code}")]
    NoSuchMethod { descriptor: String, code: u32 },

    #[error("decoding arguments of {method}: {message}")]
    Decode { method: String, message: String },

    #[error("encoding result of {method}: {message}")]
    Encode { method: String, message: String },

    #[error("{0}")]
    Remote(RemoteError),
}
