use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use futures::stream::LocalBoxStream;
use indexmap::IndexMap;
use smallvec::SmallVec;

use tokio::sync::oneshot;

use crate::error::{PoisonError, RenderError, RenderErrorKind};
use crate::runtime::call::MacroValue;

/// Insertion-ordered mapping; dict literals and namespaces keep source order.
pub type ValueMap = IndexMap<String, Value>;

/// Call arguments after marshaling: positionals in order plus keyword args.
#[derive(Default)]
pub struct Args {
    pub positional: SmallVec<[Value; 4]>,
    pub kwargs: ValueMap,
}

impl Args {
    #[must_use]
    pub fn positional(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            positional: values.into_iter().collect(),
            kwargs: ValueMap::new(),
        }
    }

    /// Positional argument or `Undefined` when absent.
    #[must_use]
    pub fn get(&self, index: usize) -> Value {
        self.positional.get(index).cloned().unwrap_or(Value::Undefined)
    }

    #[must_use]
    pub fn kwarg(&self, name: &str) -> Option<Value> {
        self.kwargs.get(name).cloned()
    }
}

/// What a user callable hands back: a ready value or work to await.
pub enum FuncReturn {
    Value(Result<Value, RenderError>),
    Future(LocalBoxFuture<'static, Result<Value, RenderError>>),
}

enum FuncImpl {
    Plain(Box<dyn Fn(Args) -> FuncReturn>),
    /// Method template living on a map value; binds to its owner at lookup.
    Method(Rc<dyn Fn(Value, Args) -> FuncReturn>),
    Bound {
        owner: Box<Value>,
        method: Rc<dyn Fn(Value, Args) -> FuncReturn>,
    },
}

struct FuncInner {
    name: Rc<str>,
    imp: FuncImpl,
}

/// An opaque callable: filter, global, extension or bound method.
#[derive(Clone)]
pub struct Func(Rc<FuncInner>);

impl Func {
    pub fn from_sync<F>(name: impl Into<Rc<str>>, f: F) -> Self
    where
        F: Fn(Args) -> Result<Value, RenderError> + 'static,
    {
        Self(Rc::new(FuncInner {
            name: name.into(),
            imp: FuncImpl::Plain(Box::new(move |args| FuncReturn::Value(f(args)))),
        }))
    }

    pub fn from_async<F>(name: impl Into<Rc<str>>, f: F) -> Self
    where
        F: Fn(Args) -> LocalBoxFuture<'static, Result<Value, RenderError>> + 'static,
    {
        Self(Rc::new(FuncInner {
            name: name.into(),
            imp: FuncImpl::Plain(Box::new(move |args| FuncReturn::Future(f(args)))),
        }))
    }

    /// A method value; `member_lookup` binds it to the map that owns it so
    /// the implementation sees its receiver.
    pub fn method<F>(name: impl Into<Rc<str>>, f: F) -> Self
    where
        F: Fn(Value, Args) -> FuncReturn + 'static,
    {
        Self(Rc::new(FuncInner {
            name: name.into(),
            imp: FuncImpl::Method(Rc::new(f)),
        }))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    #[must_use]
    pub(crate) fn bind(&self, owner: Value) -> Self {
        match &self.0.imp {
            FuncImpl::Method(method) => Self(Rc::new(FuncInner {
                name: Rc::clone(&self.0.name),
                imp: FuncImpl::Bound {
                    owner: Box::new(owner),
                    method: Rc::clone(method),
                },
            })),
            _ => self.clone(),
        }
    }

    pub fn invoke(&self, args: Args) -> FuncReturn {
        match &self.0.imp {
            FuncImpl::Plain(f) => f(args),
            FuncImpl::Method(method) => method(Value::Undefined, args),
            FuncImpl::Bound { owner, method } => method((**owner).clone(), args),
        }
    }

    fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Func").field(&self.0.name).finish()
    }
}

/// How an element of an async iterator failed.
#[derive(Debug, Clone)]
pub enum IterError {
    /// The element itself was an error; iteration continues.
    Soft(RenderError),
    /// The iterator failed; iteration stops.
    Hard(RenderError),
}

pub type IterResult = Result<Value, IterError>;

/// A consume-once async sequence of values.
#[derive(Clone)]
pub struct ValueStream(Rc<RefCell<Option<LocalBoxStream<'static, IterResult>>>>);

impl ValueStream {
    #[must_use]
    pub fn new(stream: LocalBoxStream<'static, IterResult>) -> Self {
        Self(Rc::new(RefCell::new(Some(stream))))
    }

    #[must_use]
    pub fn from_values(values: Vec<Value>) -> Self {
        Self::new(Box::pin(futures::stream::iter(values.into_iter().map(Ok))))
    }

    /// Takes the underlying stream; `None` if it was already consumed.
    pub(crate) fn take(&self) -> Option<LocalBoxStream<'static, IterResult>> {
        self.0.borrow_mut().take()
    }
}

impl fmt::Debug for ValueStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ValueStream").field(&"<stream>").finish()
    }
}

enum LazyState {
    /// Producer not yet polled; runs on first access.
    Thunk(LocalBoxFuture<'static, Result<Value, PoisonError>>),
    /// Someone is driving the producer; others wait.
    Running,
    Ready(Result<Value, PoisonError>),
}

/// A dict-entry resolver: the producer runs only when the entry is actually
/// accessed, and the result memoizes so every access observes one value.
///
/// Unaccessed entries never run, so a failing producer in an untouched key
/// does not poison the object.
#[derive(Clone)]
pub struct Lazy {
    state: Rc<RefCell<LazyState>>,
    waiters: Rc<RefCell<Vec<oneshot::Sender<()>>>>,
}

impl Lazy {
    pub(crate) fn new(thunk: LocalBoxFuture<'static, Result<Value, PoisonError>>) -> Self {
        Self {
            state: Rc::new(RefCell::new(LazyState::Thunk(thunk))),
            waiters: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Run the producer if no one has, or wait for whoever is running it.
    pub(crate) async fn force(&self) -> Result<Value, PoisonError> {
        loop {
            let taken = {
                let mut state = self.state.borrow_mut();
                match &*state {
                    LazyState::Ready(result) => return result.clone(),
                    LazyState::Running => None,
                    LazyState::Thunk(_) => {
                        match std::mem::replace(&mut *state, LazyState::Running) {
                            LazyState::Thunk(fut) => Some(fut),
                            // Checked under the same borrow.
                            LazyState::Running | LazyState::Ready(_) => None,
                        }
                    }
                }
            };

            match taken {
                Some(fut) => {
                    let result = fut.await;
                    *self.state.borrow_mut() = LazyState::Ready(result.clone());
                    for tx in self.waiters.borrow_mut().drain(..) {
                        let _ = tx.send(());
                    }
                    return result;
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    self.waiters.borrow_mut().push(tx);
                    if matches!(&*self.state.borrow(), LazyState::Ready(_)) {
                        continue;
                    }
                    let _ = rx.await;
                }
            }
        }
    }

    fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }
}

impl fmt::Debug for Lazy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.borrow() {
            LazyState::Thunk(_) => "thunk",
            LazyState::Running => "running",
            LazyState::Ready(_) => "ready",
        };
        f.debug_tuple("Lazy").field(&state).finish()
    }
}

/// The runtime value a template expression evaluates to.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Undefined,
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    /// Already-escaped string; autoescape is a no-op on it.
    Safe(Rc<str>),
    Array(Rc<Vec<Value>>),
    Map(Rc<ValueMap>),
    /// Dict-entry resolver; forced when the entry is accessed.
    Lazy(Lazy),
    Func(Func),
    Macro(Rc<MacroValue>),
    Stream(ValueStream),
}

impl Value {
    #[must_use]
    pub fn safe(s: impl Into<Rc<str>>) -> Self {
        Self::Safe(s.into())
    }

    #[must_use]
    pub fn array(values: impl IntoIterator<Item = Self>) -> Self {
        Self::Array(Rc::new(values.into_iter().collect()))
    }

    #[must_use]
    pub fn map(entries: impl IntoIterator<Item = (String, Self)>) -> Self {
        Self::Map(Rc::new(entries.into_iter().collect()))
    }

    #[must_use]
    pub const fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    #[must_use]
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    #[must_use]
    pub fn is_true(&self) -> bool {
        match self {
            Self::Undefined | Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) | Self::Safe(s) => !s.is_empty(),
            Self::Array(a) => !a.is_empty(),
            Self::Map(m) => !m.is_empty(),
            Self::Lazy(_) | Self::Func(_) | Self::Macro(_) | Self::Stream(_) => true,
        }
    }

    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::None => "none",
            Self::Bool(_) => "boolean",
            Self::Int(_) | Self::Float(_) => "number",
            Self::Str(_) | Self::Safe(_) => "string",
            Self::Array(_) => "array",
            Self::Map(_) => "object",
            Self::Lazy(_) => "pending value",
            Self::Func(_) => "function",
            Self::Macro(_) => "macro",
            Self::Stream(_) => "stream",
        }
    }

    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Bool(b) => Some(f64::from(u8::from(*b))),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::Safe(s) => Some(s),
            _ => None,
        }
    }

    /// Length for strings, arrays and maps.
    #[must_use]
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Str(s) | Self::Safe(s) => Some(s.chars().count()),
            Self::Array(a) => Some(a.len()),
            Self::Map(m) => Some(m.len()),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> Option<bool> {
        self.len().map(|n| n == 0)
    }

    /// Loose ordering used by `<`/`>` and `sort`.
    #[must_use]
    pub fn try_cmp(&self, other: &Self) -> Option<Ordering> {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return a.partial_cmp(&b);
        }
        match (self.as_str(), other.as_str()) {
            (Some(a), Some(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Rendered form: `undefined`/`none` vanish, containers print as JSON.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Undefined | Self::None => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Str(s) | Self::Safe(s) => s.to_string(),
            Self::Array(_) | Self::Map(_) => self
                .to_json()
                .map(|v| v.to_string())
                .unwrap_or_default(),
            Self::Lazy(_) => "<pending>".to_string(),
            Self::Func(f) => format!("<function {}>", f.name()),
            Self::Macro(m) => format!("<macro {}>", m.name()),
            Self::Stream(_) => "<stream>".to_string(),
        }
    }

    /// Convert from a JSON value; object key order is preserved.
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::None,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n.as_i64().map_or_else(
                || Self::Float(n.as_f64().unwrap_or(f64::NAN)),
                Self::Int,
            ),
            serde_json::Value::String(s) => Self::Str(s.into()),
            serde_json::Value::Array(items) => {
                Self::Array(Rc::new(items.into_iter().map(Self::from_json).collect()))
            }
            serde_json::Value::Object(entries) => Self::Map(Rc::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            )),
        }
    }

    /// Serialize any serde value into a runtime `Value`.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn from_serde<T: serde::Serialize>(value: &T) -> Result<Self, RenderError> {
        serde_json::to_value(value)
            .map(Self::from_json)
            .map_err(|e| {
                RenderError::with_cause(
                    RenderErrorKind::Runtime,
                    "value serialization failed",
                    e.into(),
                )
            })
    }

    /// Deserialize a runtime `Value` into a serde value.
    ///
    /// # Errors
    /// Returns an error if the value has no data form or deserialization
    /// fails.
    pub fn to_serde<T: serde::de::DeserializeOwned>(&self) -> Result<T, RenderError> {
        serde_json::from_value(self.to_json()?).map_err(|e| {
            RenderError::with_cause(
                RenderErrorKind::Runtime,
                "value deserialization failed",
                e.into(),
            )
        })
    }

    /// Convert into a JSON value.
    ///
    /// # Errors
    /// Returns an error for callables and streams, which have no data form.
    pub fn to_json(&self) -> Result<serde_json::Value, RenderError> {
        Ok(match self {
            Self::Undefined | Self::None => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::Str(s) | Self::Safe(s) => serde_json::Value::String(s.to_string()),
            Self::Array(items) => serde_json::Value::Array(
                items.iter().map(Self::to_json).collect::<Result<_, _>>()?,
            ),
            Self::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_json()?)))
                    .collect::<Result<_, RenderError>>()?,
            ),
            Self::Lazy(_) | Self::Func(_) | Self::Macro(_) | Self::Stream(_) => {
                return Err(RenderError::new(
                    RenderErrorKind::Runtime,
                    format!("{} is not serializable", self.type_name()),
                ));
            }
        })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            if !matches!(self, Self::Bool(_)) || !matches!(other, Self::Bool(_)) {
                return a == b;
            }
        }
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Str(a) | Self::Safe(a), Self::Str(b) | Self::Safe(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Lazy(a), Self::Lazy(b)) => a.ptr_eq(b),
            (Self::Func(a), Self::Func(b)) => a.ptr_eq(b),
            (Self::Macro(a), Self::Macro(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v.into())
    }
}

impl From<Func> for Value {
    fn from(v: Func) -> Self {
        Self::Func(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::from_json(v)
    }
}

#[cfg(test)]
mod tests {
    use super::{Func, Value};

    #[test]
    fn truthiness_follows_emptiness() {
        assert!(!Value::Undefined.is_true());
        assert!(!Value::from("").is_true());
        assert!(Value::from("x").is_true());
        assert!(!Value::array([]).is_true());
        assert!(Value::array([Value::from(1)]).is_true());
        assert!(!Value::Float(0.0).is_true());
    }

    #[test]
    fn loose_numeric_equality() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_ne!(Value::Int(1), Value::from("1"));
        assert_eq!(Value::from("a"), Value::safe("a"));
    }

    #[test]
    fn json_roundtrip_preserves_object_order() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"z":1,"a":[true,null],"m":{"k":"v"}}"#).expect("parse");
        let value = Value::from_json(json.clone());
        assert_eq!(value.to_json().expect("to json"), json);
        if let Value::Map(m) = &value {
            let keys: Vec<_> = m.keys().cloned().collect();
            assert_eq!(keys, ["z", "a", "m"]);
        } else {
            panic!("expected map");
        }
    }

    #[test]
    fn bound_method_sees_owner() {
        let method = Func::method("self_len", |owner, _args| {
            super::FuncReturn::Value(Ok(Value::from(owner.len().unwrap_or(0))))
        });
        let owner = Value::map([("m".to_string(), Value::Func(method.clone()))]);
        let bound = method.bind(owner);
        match bound.invoke(super::Args::default()) {
            super::FuncReturn::Value(Ok(Value::Int(n))) => assert_eq!(n, 1),
            _ => panic!("expected sync value"),
        }
    }

    #[test]
    fn render_hides_missing_values() {
        assert_eq!(Value::Undefined.render(), "");
        assert_eq!(Value::None.render(), "");
        assert_eq!(Value::Int(42).render(), "42");
    }

    #[test]
    fn serde_roundtrip() {
        let input = ("hello".to_string(), 42_i64);
        let value = Value::from_serde(&input).expect("from serde");
        let output: (String, i64) = value.to_serde().expect("to serde");
        assert_eq!(output, input);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn lazy_runs_its_producer_once_and_memoizes() {
        use std::cell::Cell;
        use std::rc::Rc;

        let runs = Rc::new(Cell::new(0));
        let counter = Rc::clone(&runs);
        let lazy = super::Lazy::new(Box::pin(async move {
            counter.set(counter.get() + 1);
            Ok(Value::from(7))
        }));
        assert_eq!(runs.get(), 0, "producer must not run before access");
        assert_eq!(lazy.force().await.expect("value"), Value::from(7));
        assert_eq!(lazy.force().await.expect("value"), Value::from(7));
        assert_eq!(runs.get(), 1);
    }
}
