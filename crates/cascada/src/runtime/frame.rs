//! Lexical scopes and write gates.
//!
//! A frame is one node of a parent-linked scope chain. Variable bindings are
//! either plain values or *gates*: every announced write installs a fresh
//! gate over the previous binding, so each reader captures exactly the
//! binding that is lexically visible at its async-block entry and suspends
//! only while that binding's writes are outstanding.
//!
//! Gates nest: a compound statement announces one gate for its whole
//! subtree, and the writes inside announce sub-gates linked to it, so
//! draining propagates outward and a reader past the construct wakes only
//! when every inner write has happened or been cancelled.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use tokio::sync::oneshot;

use crate::error::PoisonError;
use crate::value::Value;

use super::EvalResult;

/// A variable binding as seen from one point in the scope chain.
#[derive(Clone)]
pub(crate) enum Binding {
    Ready(Value),
    Failed(PoisonError),
    Gate(Rc<WriteGate>),
}

impl Binding {
    pub fn undefined() -> Self {
        Self::Ready(Value::Undefined)
    }

    pub fn from_result(result: EvalResult) -> Self {
        match result {
            Ok(v) => Self::Ready(v),
            Err(p) => Self::Failed(p),
        }
    }
}

/// One announcement of pending writes to a name (or sequence-lock path).
pub(crate) struct WriteGate {
    pending: Cell<usize>,
    /// Result of a direct write through this gate.
    result: RefCell<Option<EvalResult>>,
    /// Binding that was visible before this announcement.
    prev: Binding,
    /// Enclosing construct's gate for the same name; draining propagates up.
    outer: Option<Rc<WriteGate>>,
    /// Lexically last sub-gate announced under this one.
    latest_inner: RefCell<Option<Rc<WriteGate>>>,
    /// Chain tail for sequence-lock turn taking.
    tail: RefCell<Binding>,
    waiters: RefCell<Vec<oneshot::Sender<()>>>,
}

impl WriteGate {
    pub fn announce(count: usize, prev: Binding, outer: Option<&Rc<Self>>) -> Rc<Self> {
        let gate = Rc::new(Self {
            pending: Cell::new(count),
            result: RefCell::new(None),
            prev: prev.clone(),
            outer: outer.map(Rc::clone),
            latest_inner: RefCell::new(None),
            tail: RefCell::new(prev),
            waiters: RefCell::new(Vec::new()),
        });
        if let Some(outer) = outer {
            *outer.latest_inner.borrow_mut() = Some(Rc::clone(&gate));
        }
        gate
    }

    pub fn pending(&self) -> usize {
        self.pending.get()
    }

    pub fn prev(&self) -> Binding {
        self.prev.clone()
    }

    /// Current lock-chain tail. Sequence locks serialize the ops announced
    /// under one aggregate by chaining each on the previous tail.
    pub fn tail(&self) -> Binding {
        self.tail.borrow().clone()
    }

    pub fn set_tail(&self, next: Binding) {
        *self.tail.borrow_mut() = next;
    }

    /// Record `inner` as the lexically latest sub-gate without linking its
    /// drain accounting; used where an enclosing construct drains its own
    /// gate explicitly (loop aggregates).
    pub fn link_inner(&self, inner: &Rc<Self>) {
        *self.latest_inner.borrow_mut() = Some(Rc::clone(inner));
    }

    /// A write happened through this gate.
    pub fn fulfill(&self, result: EvalResult) {
        *self.result.borrow_mut() = Some(result);
        self.release(1);
    }

    /// Writes that will not happen are cancelled; waiters fall through to
    /// the previous binding.
    pub fn skip(&self, count: usize) {
        self.release(count);
    }

    /// Drain whatever is still pending with a poison so no waiter hangs.
    pub fn poison_remaining(&self, poison: &PoisonError) {
        let left = self.pending.get();
        if left == 0 {
            return;
        }
        if self.result.borrow().is_none() {
            *self.result.borrow_mut() = Some(Err(poison.clone()));
        }
        self.release(left);
    }

    fn release(&self, count: usize) {
        // Saturating: a lazy dict entry forced after its statement already
        // drained the gate releases late, which must stay a no-op.
        let after = self.pending.get().saturating_sub(count);
        self.pending.set(after);
        if after == 0 {
            for tx in self.waiters.borrow_mut().drain(..) {
                let _ = tx.send(());
            }
        }
        if let Some(outer) = &self.outer {
            outer.release(count);
        }
    }

    pub async fn wait_drained(&self) {
        // Single-threaded: nothing can release between the check and the
        // registration.
        while self.pending.get() > 0 {
            let (tx, rx) = oneshot::channel();
            self.waiters.borrow_mut().push(tx);
            let _ = rx.await;
        }
    }

    /// Binding this gate resolves to once drained.
    fn resolution(&self) -> Binding {
        debug_assert_eq!(self.pending.get(), 0, "resolution of an undrained gate");
        if let Some(result) = self.result.borrow().clone() {
            return Binding::from_result(result);
        }
        if let Some(inner) = self.latest_inner.borrow().clone() {
            return Binding::Gate(inner);
        }
        self.prev.clone()
    }
}

/// Await a binding: ready values return immediately, gates suspend until
/// their writes drain, then follow the chain to the value that was actually
/// written (or the previous one if every write was cancelled).
pub(crate) async fn resolve_binding(binding: Binding) -> EvalResult {
    let mut binding = binding;
    loop {
        match binding {
            Binding::Ready(v) => return Ok(v),
            Binding::Failed(p) => return Err(p),
            Binding::Gate(gate) => {
                gate.wait_drained().await;
                binding = gate.resolution();
            }
        }
    }
}

pub(crate) struct Frame {
    parent: Option<Rc<Frame>>,
    vars: RefCell<HashMap<Rc<str>, Binding>>,
    declared: RefCell<HashSet<Rc<str>>>,
    top_level: bool,
    sequential_loop_body: Cell<bool>,
}

impl Frame {
    pub fn root() -> Rc<Self> {
        Rc::new(Self {
            parent: None,
            vars: RefCell::new(HashMap::new()),
            declared: RefCell::new(HashSet::new()),
            top_level: true,
            sequential_loop_body: Cell::new(false),
        })
    }

    /// New lexical scope (loop body, macro body, capture body). Sequential
    /// loop bodies pass the flag down so nested constructs keep chaining.
    pub fn push(self: &Rc<Self>) -> Rc<Self> {
        Rc::new(Self {
            parent: Some(Rc::clone(self)),
            vars: RefCell::new(HashMap::new()),
            declared: RefCell::new(HashSet::new()),
            top_level: false,
            sequential_loop_body: Cell::new(self.sequential_loop_body.get()),
        })
    }

    /// Unscoped async-block frame seeded with the bindings its statement
    /// reads and writes, so the block keeps a stable view while siblings
    /// keep announcing. Names the block itself declares must not be seeded.
    pub fn push_async_block(
        self: &Rc<Self>,
        snapshot: impl IntoIterator<Item = (Rc<str>, Binding)>,
    ) -> Rc<Self> {
        let child = self.push();
        child.vars.borrow_mut().extend(snapshot);
        child
    }

    pub fn set_sequential_loop_body(&self, value: bool) {
        self.sequential_loop_body.set(value);
    }

    pub fn is_sequential_loop_body(&self) -> bool {
        self.sequential_loop_body.get()
    }

    /// The top-level frame of this chain; lock entries live there so chains
    /// span sibling blocks.
    pub fn root_frame(self: &Rc<Self>) -> Rc<Self> {
        let mut cur = Rc::clone(self);
        while !cur.top_level {
            let Some(parent) = cur.parent.clone() else {
                break;
            };
            cur = parent;
        }
        cur
    }

    /// Closest binding for `name`, walking parents.
    pub fn lookup_binding(&self, name: &str) -> Option<Binding> {
        let mut frame = self;
        loop {
            if let Some(binding) = frame.vars.borrow().get(name) {
                return Some(binding.clone());
            }
            match &frame.parent {
                Some(parent) => frame = parent,
                None => return None,
            }
        }
    }

    pub fn is_declared_here(&self, name: &str) -> bool {
        self.declared.borrow().contains(name)
    }

    pub fn is_declared(&self, name: &str) -> bool {
        let mut frame = self;
        loop {
            if frame.declared.borrow().contains(name) {
                return true;
            }
            match &frame.parent {
                Some(parent) => frame = parent,
                None => return false,
            }
        }
    }

    /// Declare `name` in this scope; no-op when already declared here.
    pub fn declare(&self, name: &Rc<str>) {
        if self.declared.borrow_mut().insert(Rc::clone(name)) {
            self.vars
                .borrow_mut()
                .entry(Rc::clone(name))
                .or_insert_with(Binding::undefined);
        }
    }

    /// Declare and bind immediately (loop variables, macro parameters).
    pub fn declare_value(&self, name: impl Into<Rc<str>>, value: Value) {
        let name = name.into();
        self.declared.borrow_mut().insert(Rc::clone(&name));
        self.vars.borrow_mut().insert(name, Binding::Ready(value));
    }

    pub fn bind(&self, name: impl Into<Rc<str>>, binding: Binding) {
        self.vars.borrow_mut().insert(name.into(), binding);
    }

    /// Replace the binding in the nearest frame that has one; falls back to
    /// this frame. Announcements use this so a construct's internal write
    /// chain stays inside its own async-block frame.
    pub fn install(self: &Rc<Self>, name: &Rc<str>, binding: Binding) {
        let mut frame = Rc::clone(self);
        loop {
            if frame.vars.borrow().contains_key(name.as_ref()) {
                frame.vars.borrow_mut().insert(Rc::clone(name), binding);
                return;
            }
            let Some(parent) = frame.parent.clone() else {
                break;
            };
            frame = parent;
        }
        self.vars.borrow_mut().insert(Rc::clone(name), binding);
    }
}
