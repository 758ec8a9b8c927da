//! # Argument Values
//!
//! The dynamically typed value carried by every call, response and callback.
//!
//! ## Invariants
//! - **No Coercion**: Typed accessors check the tag and fail with `TypeError`;
//!   a number is never read as a string or vice versa.
//! - **Functions Are Handles**: A `Function` is either a local closure or a
//!   reference to a callback owned by the remote side of a connection. Both
//!   are invoked the same way.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::Failure;

/// The tag of a `Value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Null,
    Bool,
    Number,
    String,
    List,
    Map,
    Function,
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Kind::Null => "null",
            Kind::Bool => "bool",
            Kind::Number => "number",
            Kind::String => "string",
            Kind::List => "list",
            Kind::Map => "map",
            Kind::Function => "function",
        };
        f.write_str(name)
    }
}

/// A value was extracted as the wrong type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeError {
    pub expected: Kind,
    pub actual: Kind,
}

impl std::fmt::Display for TypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected {}, found {}", self.expected, self.actual)
    }
}

impl std::error::Error for TypeError {}

/// Something that can be invoked with a `Value`.
///
/// Local closures and remote callback references both implement this; the
/// connection layer supplies the remote implementation.
#[async_trait::async_trait]
pub trait Callable: Send + Sync + 'static {
    /// Invokes the function. The return value of a callback is never routed
    /// anywhere; only delivery failures are reported.
    async fn call(&self, args: Value) -> Result<(), Failure>;

    /// The remote callback id, if this callable lives on the other side of a connection.
    fn remote_id(&self) -> Option<u64> {
        None
    }
}

struct LocalFn<F>(F);

#[async_trait::async_trait]
impl<F, Fut> Callable for LocalFn<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn call(&self, args: Value) -> Result<(), Failure> {
        (self.0)(args).await;
        Ok(())
    }
}

/// A function value that can cross a connection as a callback reference.
#[derive(Clone)]
pub struct Function {
    inner: Arc<dyn Callable>,
}

impl Function {
    /// Wraps a local async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self { inner: Arc::new(LocalFn(f)) }
    }

    pub fn from_callable(callable: impl Callable) -> Self {
        Self { inner: Arc::new(callable) }
    }

    /// Invokes the function with the given arguments.
    pub async fn call(&self, args: impl Into<Value>) -> Result<(), Failure> {
        self.inner.call(args.into()).await
    }

    pub fn remote_id(&self) -> Option<u64> {
        self.inner.remote_id()
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Shared by all clones of this function and unique among live functions.
    pub fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.remote_id() {
            Some(id) => write!(f, "Function(remote #{})", id),
            None => write!(f, "Function(local)"),
        }
    }
}

/// A dynamically typed argument or result.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Function(Function),
}

static NULL: Value = Value::Null;

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Null => Kind::Null,
            Value::Bool(_) => Kind::Bool,
            Value::Number(_) => Kind::Number,
            Value::String(_) => Kind::String,
            Value::List(_) => Kind::List,
            Value::Map(_) => Kind::Map,
            Value::Function(_) => Kind::Function,
        }
    }

    fn mismatch(&self, expected: Kind) -> TypeError {
        TypeError { expected, actual: self.kind() }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Result<bool, TypeError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(other.mismatch(Kind::Bool)),
        }
    }

    pub fn as_f64(&self) -> Result<f64, TypeError> {
        match self {
            Value::Number(n) => Ok(*n),
            other => Err(other.mismatch(Kind::Number)),
        }
    }

    pub fn as_str(&self) -> Result<&str, TypeError> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(other.mismatch(Kind::String)),
        }
    }

    pub fn as_list(&self) -> Result<&[Value], TypeError> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(other.mismatch(Kind::List)),
        }
    }

    pub fn as_map(&self) -> Result<&BTreeMap<String, Value>, TypeError> {
        match self {
            Value::Map(entries) => Ok(entries),
            other => Err(other.mismatch(Kind::Map)),
        }
    }

    /// Extracts a function. For a value received over a connection this is an
    /// invokable reference to the sender's callback.
    pub fn as_function(&self) -> Result<&Function, TypeError> {
        match self {
            Value::Function(f) => Ok(f),
            other => Err(other.mismatch(Kind::Function)),
        }
    }

    /// Indexes into a list. A missing element reads as `Null`, so the
    /// following typed accessor reports the absence.
    pub fn at(&self, index: usize) -> Result<&Value, TypeError> {
        Ok(self.as_list()?.get(index).unwrap_or(&NULL))
    }

    /// Looks up a map entry. A missing key reads as `Null`.
    pub fn get(&self, key: &str) -> Result<&Value, TypeError> {
        Ok(self.as_map()?.get(key).unwrap_or(&NULL))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

// ============================================================================
//  CONVERSIONS INTO VALUE
// ============================================================================

impl From<()> for Value {
    fn from(_: ()) -> Self { Value::Null }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self { Value::Bool(v) }
}

macro_rules! number_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self { Value::Number(v as f64) }
            }
        )*
    };
}

number_from!(f64, f32, i8, i16, i32, i64, u8, u16, u32, u64, usize);

impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::String(v.to_string()) }
}

impl From<String> for Value {
    fn from(v: String) -> Self { Value::String(v) }
}

impl From<Function> for Value {
    fn from(v: Function) -> Self { Value::Function(v) }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self { Value::Map(v) }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self { Value::List(v.into_iter().map(Into::into).collect()) }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Value {
    fn from(v: [T; N]) -> Self { Value::List(v.into_iter().map(Into::into).collect()) }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self { v.map_or(Value::Null, Into::into) }
}

impl FromIterator<Value> for Value {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Value::List(iter.into_iter().collect())
    }
}

// ============================================================================
//  TYPED EXTRACTION
// ============================================================================

impl TryFrom<Value> for bool {
    type Error = TypeError;
    fn try_from(v: Value) -> Result<Self, TypeError> { v.as_bool() }
}

impl TryFrom<Value> for f64 {
    type Error = TypeError;
    fn try_from(v: Value) -> Result<Self, TypeError> { v.as_f64() }
}

impl TryFrom<Value> for String {
    type Error = TypeError;
    fn try_from(v: Value) -> Result<Self, TypeError> {
        match v {
            Value::String(s) => Ok(s),
            other => Err(other.mismatch(Kind::String)),
        }
    }
}

impl TryFrom<Value> for Vec<Value> {
    type Error = TypeError;
    fn try_from(v: Value) -> Result<Self, TypeError> {
        match v {
            Value::List(items) => Ok(items),
            other => Err(other.mismatch(Kind::List)),
        }
    }
}

impl TryFrom<Value> for BTreeMap<String, Value> {
    type Error = TypeError;
    fn try_from(v: Value) -> Result<Self, TypeError> {
        match v {
            Value::Map(entries) => Ok(entries),
            other => Err(other.mismatch(Kind::Map)),
        }
    }
}

impl TryFrom<Value> for Function {
    type Error = TypeError;
    fn try_from(v: Value) -> Result<Self, TypeError> {
        match v {
            Value::Function(f) => Ok(f),
            other => Err(other.mismatch(Kind::Function)),
        }
    }
}
