//! Method tables: how the dispatcher finds and calls handlers.

use std::collections::HashMap;
use std::rc::Rc;

use crate::channel::ChannelId;
use crate::error::HandlerError;

/// Per-call information passed to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallContext {
    /// Channel the message arrived on.
    pub channel: ChannelId,
}

/// Lookup and invocation of RPC methods.
///
/// The broker only ever calls this from the host thread, so
/// implementations are free to hold non-`Send` host state.
pub trait MethodTable {
    /// Host-side value type handlers take and return.
    type Value;
    /// Resolved handler, produced by `lookup` and consumed by `invoke`.
    type Handler;

    fn lookup(&self, method: &str) -> Option<Self::Handler>;

    fn invoke(
        &mut self,
        handler: Self::Handler,
        ctx: &CallContext,
        args: Vec<Self::Value>,
    ) -> Result<Self::Value, HandlerError>;

    /// Names advertised in the API info.
    fn method_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Shared handler closure used by [`FnTable`].
pub type HandlerFn<V> = Rc<dyn Fn(&CallContext, Vec<V>) -> Result<V, HandlerError>>;

/// Closure-backed method table.
///
/// Handlers that need mutable host state capture it behind `Rc<RefCell<_>>`.
///
/// ```ignore
/// let table = FnTable::new()
///     .with("echo", |_ctx, args| Ok(args.into_iter().next().unwrap_or(Value::Nil)));
/// ```
pub struct FnTable<V> {
    methods: HashMap<String, HandlerFn<V>>,
}

impl<V> Default for FnTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> FnTable<V> {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&CallContext, Vec<V>) -> Result<V, HandlerError> + 'static,
    {
        self.insert(name, handler);
        self
    }

    /// Register `handler` under `name`, replacing any previous one.
    pub fn insert<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&CallContext, Vec<V>) -> Result<V, HandlerError> + 'static,
    {
        self.methods.insert(name.into(), Rc::new(handler));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl<V> MethodTable for FnTable<V> {
    type Value = V;
    type Handler = HandlerFn<V>;

    fn lookup(&self, method: &str) -> Option<Self::Handler> {
        self.methods.get(method).cloned()
    }

    fn invoke(
        &mut self,
        handler: Self::Handler,
        ctx: &CallContext,
        args: Vec<V>,
    ) -> Result<V, HandlerError> {
        handler(ctx, args)
    }

    fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}
