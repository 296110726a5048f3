use crate::dispatcher::CallError;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, error::Error, fmt};

/// Argument map as received from the wire: parameter name to value.
pub type Args = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Type {
    Nil,
    Bool,
    Int,
    Float,
    String,
    /// Accepts any value without conversion. JSON-quoted strings are still
    /// unquoted, as for `String`.
    Any,
}

impl Type {
    fn name(&self) -> &'static str {
        use Type::*;
        match self {
            Nil => "Nil",
            Bool => "Bool",
            Int => "Int",
            Float => "Float",
            String => "String",
            Any => "Any",
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Value {
    /// Parses the textual form produced by [`Value`]'s `Display` (or by any
    /// JSON scalar) back into the most specific value. Text that is not a
    /// JSON scalar stays a string.
    pub fn from_text(text: &str) -> Value {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(serde_json::Value::Null) => Value::Nil,
            Ok(serde_json::Value::Bool(b)) => Value::Bool(b),
            Ok(serde_json::Value::Number(n)) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Ok(serde_json::Value::String(s)) => Value::String(s),
            _ => Value::String(text.to_owned()),
        }
    }

    pub fn rpc_type(&self) -> Type {
        match self {
            Value::Nil => Type::Nil,
            Value::Bool(_) => Type::Bool,
            Value::Int(_) => Type::Int,
            Value::Float(_) => Type::Float,
            Value::String(_) => Type::String,
        }
    }

    /// Converts this value to `typ`, accepting the textual wire forms of
    /// every scalar.
    pub fn coerce(self, typ: Type) -> Result<Value, TypeMismatch> {
        if typ == Type::Any || self.rpc_type() == typ {
            return Ok(self);
        }

        let converted = match (&self, typ) {
            (Value::String(s), Type::Nil) if s.is_empty() || s.trim() == "null" => Some(Value::Nil),
            (Value::String(s), Type::Bool) => parse_bool(s.trim()).map(Value::Bool),
            (Value::String(s), Type::Int) => s.trim().parse().ok().map(Value::Int),
            (Value::String(s), Type::Float) => s.trim().parse().ok().map(Value::Float),
            (Value::Int(n), Type::Float) => Some(Value::Float(*n as f64)),
            (Value::Float(x), Type::Int)
                if x.fract() == 0.0 && *x >= i64::MIN as f64 && *x < i64::MAX as f64 =>
            {
                Some(Value::Int(*x as i64))
            }
            (Value::Nil, Type::String) => Some(Value::String(String::new())),
            (Value::Bool(_) | Value::Int(_) | Value::Float(_), Type::String) => {
                Some(Value::String(self.to_string()))
            }
            _ => None,
        };

        converted.ok_or_else(|| TypeMismatch::new(self, typ))
    }

    /// Builds an argument map, e.g. for [`CallbackRouter::trigger`].
    ///
    /// [`CallbackRouter::trigger`]: crate::CallbackRouter::trigger
    pub fn args<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Args
    where
        K: Into<String>,
        V: Into<Value>,
    {
        pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect()
    }

    /// True if the value is already of type `typ`.
    pub fn conforms(&self, typ: Type) -> bool {
        typ == Type::Any || self.rpc_type() == typ
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    if s.eq_ignore_ascii_case("true") {
        Some(true)
    } else if s.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Strings arriving as JSON literals (`"\"hi\""`) are unquoted.
fn unquote(s: String) -> String {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        if let Ok(inner) = serde_json::from_str::<String>(&s) {
            return inner;
        }
    }
    s
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Nil => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n.into())
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

pub trait Typed {
    fn rpc_type() -> Type;
}

pub trait Encode {
    fn encode(val: Self) -> Value;
}

pub trait Decode: Sized {
    /// Checks `val` against the declared type `typ`, then extracts `Self`.
    fn decode(typ: Type, val: Value) -> Result<Self, TypeMismatch>;
}

macro_rules! impl_encode_decode {
    ($rust_type:ty, $rpc_type:expr, $encode_name:pat => $encode_expr:expr, $from_rpc:pat => $decoded:expr) => {
        impl Typed for $rust_type {
            fn rpc_type() -> Type {
                $rpc_type
            }
        }

        impl Encode for $rust_type {
            fn encode($encode_name: $rust_type) -> Value {
                $encode_expr
            }
        }

        impl Decode for $rust_type {
            fn decode(typ: Type, val: Value) -> Result<Self, TypeMismatch> {
                match val.coerce(typ)?.coerce($rpc_type)? {
                    $from_rpc => Ok($decoded),
                    val => Err(TypeMismatch::new(val, $rpc_type)),
                }
            }
        }
    };
}

impl_encode_decode!((), Type::Nil, () => Value::Nil, Value::Nil => ());
impl_encode_decode!(bool, Type::Bool, b => Value::Bool(b), Value::Bool(b) => b);
impl_encode_decode!(i64, Type::Int, n => Value::Int(n), Value::Int(n) => n);
impl_encode_decode!(f64, Type::Float, x => Value::Float(x), Value::Float(x) => x);
impl_encode_decode!(String, Type::String, s => Value::String(s), Value::String(s) => unquote(s));

impl Typed for i32 {
    fn rpc_type() -> Type {
        Type::Int
    }
}

impl Encode for i32 {
    fn encode(n: i32) -> Value {
        Value::Int(n.into())
    }
}

impl Decode for i32 {
    fn decode(typ: Type, val: Value) -> Result<Self, TypeMismatch> {
        let wide = i64::decode(typ, val)?;
        i32::try_from(wide).map_err(|_| TypeMismatch::new(Value::Int(wide), Type::Int))
    }
}

impl Typed for Value {
    fn rpc_type() -> Type {
        Type::Any
    }
}

impl Encode for Value {
    fn encode(val: Value) -> Value {
        val
    }
}

impl Decode for Value {
    fn decode(typ: Type, val: Value) -> Result<Self, TypeMismatch> {
        match val.coerce(typ)? {
            Value::String(s) => Ok(Value::String(unquote(s))),
            other => Ok(other),
        }
    }
}

/// One declared parameter of a registered function.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Registration-time schema: ordered parameters and the result type.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Signature {
    pub params: Vec<Param>,
    pub range: Type,
}

impl Signature {
    pub fn new<'a>(params: impl IntoIterator<Item = (&'a str, Type)>, range: Type) -> Self {
        Self {
            params: params
                .into_iter()
                .map(|(name, ty)| Param::new(name, ty))
                .collect(),
            range,
        }
    }

    /// Builds a signature from parameter names, taking each parameter's type
    /// from the matching position of `Domain`.
    ///
    /// Extra names are kept with type [`Type::Any`]; missing names make every
    /// call fail with an arity error, which is logged at registration.
    pub fn infer<Domain, Range>(names: &[&str]) -> Self
    where
        Domain: Arguments,
        Range: Typed,
    {
        let types = Domain::types();
        let params = names
            .iter()
            .enumerate()
            .map(|(i, name)| Param::new(*name, types.get(i).copied().unwrap_or(Type::Any)))
            .collect();
        Self {
            params,
            range: Range::rpc_type(),
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", param.name, param.ty)?;
        }
        write!(f, ") -> {}", self.range)
    }
}

/// A tuple of parameters bound by name from an [`Args`] map.
pub trait Arguments: Sized {
    fn types() -> Vec<Type>;
    fn bind(params: &[Param], args: &Args) -> Result<Self, CallError>;
}

fn bind_one<T: Decode>(param: &Param, args: &Args) -> Result<T, CallError> {
    let value = args
        .get(&param.name)
        .cloned()
        .ok_or_else(|| CallError::MissingArgument(param.name.clone()))?;
    T::decode(param.ty, value).map_err(|mismatch| CallError::Conversion {
        param: param.name.clone(),
        mismatch,
    })
}

impl Arguments for () {
    fn types() -> Vec<Type> {
        Vec::new()
    }

    fn bind(_params: &[Param], _args: &Args) -> Result<Self, CallError> {
        Ok(())
    }
}

macro_rules! impl_arguments {
    ($($t:ident $idx:tt),+) => {
        impl<$($t: Decode + Typed),+> Arguments for ($($t,)+) {
            fn types() -> Vec<Type> {
                vec![$($t::rpc_type()),+]
            }

            fn bind(params: &[Param], args: &Args) -> Result<Self, CallError> {
                let arity = [$($idx),+].len();
                if params.len() != arity {
                    return Err(CallError::Arity {
                        declared: params.len(),
                        expected: arity,
                    });
                }
                Ok(($(bind_one::<$t>(&params[$idx], args)?,)+))
            }
        }
    };
}

impl_arguments!(A 0);
impl_arguments!(A 0, B 1);
impl_arguments!(A 0, B 1, C 2);
impl_arguments!(A 0, B 1, C 2, D 3);
impl_arguments!(A 0, B 1, C 2, D 3, E 4);
impl_arguments!(A 0, B 1, C 2, D 3, E 4, F 5);

#[derive(Debug, Clone, PartialEq)]
pub struct TypeMismatch {
    value: Value,
    expected_type: Type,
}

impl TypeMismatch {
    fn new(value: Value, expected_type: Type) -> Self {
        Self {
            value,
            expected_type,
        }
    }

    pub fn expected_type(&self) -> Type {
        self.expected_type
    }
}

impl fmt::Display for TypeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} is not convertible to {}", self.value, self.expected_type)
    }
}

impl Error for TypeMismatch {}
