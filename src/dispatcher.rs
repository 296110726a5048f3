use crate::{
    server::Context,
    types::{Arguments, Args, Encode, Signature, Type, TypeMismatch, Typed, Value},
    RpcFunction,
};
use serde::{Deserialize, Serialize};
use std::{
    any::Any,
    collections::BTreeMap,
    marker::PhantomData,
    panic::{self, AssertUnwindSafe},
};
use thiserror::Error;
use tracing::{debug, warn};

/// Maps [`RpcFunction`] names to a type-erased, schema-checked callable.
///
/// Functions can be registered with [`add`](Self::add) or
/// [`add_fn`](Self::add_fn). Registering under an existing name replaces the
/// previous function. Functions are called via [`call`](Self::call), which
/// never panics and never lets a handler failure escape as anything other
/// than a [`DispatchError`].
#[derive(Default)]
pub(crate) struct Dispatcher {
    rpc_functions: BTreeMap<String, Box<dyn DynamicRpcFunction + Send>>,
}

impl Dispatcher {
    pub(crate) fn add<RFn>(&mut self, rpc_function: RFn)
    where
        RFn: RpcFunction + Send + 'static,
    {
        let signature = rpc_function.signature();
        let rfws = TypedRpcFunction {
            rpc_function,
            signature,
        };
        let name = rfws.name().to_owned();

        let declared = rfws.signature.params.len();
        let expected = RFn::Domain::types().len();
        if declared != expected {
            warn!(
                function = %name,
                declared, expected, "signature arity does not match handler; every call will fail"
            );
        }

        if self.rpc_functions.insert(name.clone(), Box::new(rfws)).is_some() {
            debug!(function = %name, "replaced registered function");
        }
    }

    pub(crate) fn add_fn<F, D, R>(&mut self, name: &str, params: &[&str], f: F)
    where
        F: Fn(&mut Context<'_>, D) -> Result<R, HandlerError> + Send + 'static,
        D: Arguments + 'static,
        R: Encode + Typed + 'static,
    {
        self.add(FnFunction {
            name: name.to_owned(),
            signature: Signature::infer::<D, R>(params),
            f,
            _types: PhantomData,
        });
    }

    pub(crate) fn call(&self, name: &str, args: &Args, cx: &mut Context<'_>) -> CallResult {
        Ok(self
            .rpc_functions
            .get(name)
            .ok_or_else(|| DispatchError::UnknownFunction(name.to_owned()))?
            .call(args, cx)?)
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.rpc_functions.contains_key(name)
    }

    pub(crate) fn rpc_functions(&self) -> Vec<RpcFunctionInfo> {
        self.rpc_functions
            .iter()
            .map(|(name, rfn)| RpcFunctionInfo {
                name: name.clone(),
                signature: rfn.signature().clone(),
            })
            .collect()
    }
}

pub(crate) type CallResult = Result<Value, DispatchError>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RpcFunctionInfo {
    pub name: String,
    pub signature: Signature,
}

struct TypedRpcFunction<RFn>
where
    RFn: RpcFunction,
{
    rpc_function: RFn,
    signature: Signature,
}

impl<RFn> TypedRpcFunction<RFn>
where
    RFn: RpcFunction,
{
    fn call(&self, args: &Args, cx: &mut Context<'_>) -> Result<Value, CallError> {
        let Signature { params, range } = &self.signature;
        let decoded_args = RFn::Domain::bind(params, args)?;

        let retval = panic::catch_unwind(AssertUnwindSafe(|| {
            self.rpc_function.call(cx, decoded_args)
        }))
        .map_err(|payload| CallError::Handler(panic_message(payload)))?
        .map_err(|err| CallError::Handler(err.to_string()))?;

        let encoded_retval = RFn::Range::encode(retval);
        if !encoded_retval.conforms(*range) {
            return Err(CallError::Range {
                value: encoded_retval,
                expected: *range,
            });
        }
        Ok(encoded_retval)
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_owned()
    }
}

/// A type-erased version of the main trait, RpcFunction
trait DynamicRpcFunction {
    fn name(&self) -> &str;
    fn signature(&self) -> &Signature;
    fn call(&self, args: &Args, cx: &mut Context<'_>) -> Result<Value, CallError>;
}

impl<RFn> DynamicRpcFunction for TypedRpcFunction<RFn>
where
    RFn: RpcFunction,
{
    fn name(&self) -> &str {
        self.rpc_function.name()
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn call(&self, args: &Args, cx: &mut Context<'_>) -> Result<Value, CallError> {
        self.call(args, cx)
    }
}

/// Adapts a closure taking a parameter tuple into an [`RpcFunction`].
struct FnFunction<F, D, R> {
    name: String,
    signature: Signature,
    f: F,
    _types: PhantomData<fn(D) -> R>,
}

impl<F, D, R> RpcFunction for FnFunction<F, D, R>
where
    F: Fn(&mut Context<'_>, D) -> Result<R, HandlerError>,
    D: Arguments,
    R: Encode + Typed,
{
    type Domain = D;
    type Range = R;

    fn name(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> Signature {
        self.signature.clone()
    }

    fn call(&self, cx: &mut Context<'_>, args: D) -> Result<R, HandlerError> {
        (self.f)(cx, args)
    }
}

/// Failure reported by a handler itself.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_owned())
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("malformed arguments: {0}")]
    MalformedArguments(String),

    #[error(transparent)]
    Call(#[from] CallError),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("missing argument: {0}")]
    MissingArgument(String),

    #[error("type conversion error for {param}: {mismatch}")]
    Conversion { param: String, mismatch: TypeMismatch },

    #[error("signature declares {declared} parameters but the handler takes {expected}")]
    Arity { declared: usize, expected: usize },

    #[error("handler execution error: {0}")]
    Handler(String),

    #[error("(BUG in RPC function) result {value:?} is not a {expected}")]
    Range { value: Value, expected: Type },
}

impl DispatchError {
    /// Stable identifier of the failure, carried in error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::UnknownFunction(_) => "unknown_function",
            DispatchError::MalformedArguments(_) => "malformed_arguments",
            DispatchError::Call(CallError::MissingArgument(_)) => "missing_argument",
            DispatchError::Call(CallError::Conversion { .. }) => "type_conversion",
            DispatchError::Call(CallError::Arity { .. }) => "signature_mismatch",
            DispatchError::Call(CallError::Handler(_)) => "handler_error",
            DispatchError::Call(CallError::Range { .. }) => "result_type",
        }
    }
}
