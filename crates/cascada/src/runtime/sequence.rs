//! Announcement targets and sequence-lock chains.
//!
//! At every statement entry the enclosing block announces the statement's
//! pending writes and sequence ops as gates. `Targets` carries those gates
//! into the statement's subtree so inner writes drain the right aggregates
//! and sequenced ops take their turns in lexical order.
//!
//! Lock entries live under their `!root!seg` key in the root frame, with a
//! `!key~` mirror updated on every release so the most recent value stays
//! observable.

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::PoisonError;

use super::frame::{resolve_binding, Binding, Frame, WriteGate};
use super::EvalResult;

/// Clonable so lazy dict-entry resolvers can keep their statement's gates
/// reachable past the statement's own lifetime.
#[derive(Default, Clone)]
pub(crate) struct Targets {
    writes: HashMap<Rc<str>, Rc<WriteGate>>,
    locks: HashMap<Rc<str>, Rc<WriteGate>>,
}

impl Targets {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn write_gate(&self, name: &str) -> Option<&Rc<WriteGate>> {
        self.writes.get(name)
    }

    pub fn lock_aggregate(&self, key: &str) -> Option<&Rc<WriteGate>> {
        self.locks.get(key)
    }

    /// Entry protocol for one child statement: declare what it declares,
    /// install one gate per written name over the current binding, and chain
    /// one lock aggregate per sequenced path. Runs synchronously, so entries
    /// across siblings happen in lexical order.
    pub fn announce_child(
        parent: &Self,
        frame: &Rc<Frame>,
        declares: &[Rc<str>],
        writes: &[(Rc<str>, usize)],
        locks: &[(Rc<str>, usize)],
    ) -> Self {
        let mut child = Self::empty();

        for name in declares {
            frame.declare(name);
        }

        for (name, count) in writes {
            if *count == 0 {
                continue;
            }
            let prev = frame
                .lookup_binding(name)
                .unwrap_or_else(Binding::undefined);
            let gate = WriteGate::announce(*count, prev, parent.writes.get(name.as_ref()));
            frame.install(name, Binding::Gate(Rc::clone(&gate)));
            child.writes.insert(Rc::clone(name), gate);
        }

        for (key, count) in locks {
            if *count == 0 {
                continue;
            }
            let gate = if let Some(outer) = parent.locks.get(key.as_ref()) {
                let gate = WriteGate::announce(*count, outer.tail(), Some(outer));
                outer.set_tail(Binding::Gate(Rc::clone(&gate)));
                gate
            } else {
                // Lock chains span sibling blocks, so the entry lives at the
                // root frame.
                let root = frame.root_frame();
                let prev = root.lookup_binding(key).unwrap_or_else(Binding::undefined);
                let gate = WriteGate::announce(*count, prev, None);
                root.install(key, Binding::Gate(Rc::clone(&gate)));
                gate
            };
            child.locks.insert(Rc::clone(key), gate);
        }

        child
    }

    /// Per-iteration targets for a loop body: lock aggregates chain on the
    /// loop-level aggregate's tail so ops serialize across iterations, while
    /// drain accounting stays with the loop (which releases its gates once,
    /// after the last iteration).
    pub fn loop_iteration(loop_targets: &Self, locks: &[(Rc<str>, usize)]) -> Self {
        let mut iteration = Self::empty();
        for (key, count) in locks {
            if *count == 0 {
                continue;
            }
            if let Some(loop_gate) = loop_targets.locks.get(key.as_ref()) {
                let gate = WriteGate::announce(*count, loop_gate.tail(), None);
                loop_gate.set_tail(Binding::Gate(Rc::clone(&gate)));
                loop_gate.link_inner(&gate);
                iteration.locks.insert(Rc::clone(key), gate);
            }
        }
        iteration
    }

    /// Cancel the writes and sequence ops of a branch that was not taken, so
    /// no waiter starves. Waiters fall through to the previous binding.
    pub fn skip_branch(&self, writes: &[(Rc<str>, usize)], locks: &[(Rc<str>, usize)]) {
        for (name, count) in writes {
            if let Some(gate) = self.writes.get(name.as_ref()) {
                gate.skip(*count);
            }
        }
        for (key, count) in locks {
            if let Some(gate) = self.locks.get(key.as_ref()) {
                gate.skip(*count);
            }
        }
    }

    /// Drain every gate this statement announced with a poison so failures
    /// never leave a reader hanging.
    pub fn poison_all(&self, poison: &PoisonError) {
        for gate in self.writes.values() {
            gate.poison_remaining(poison);
        }
        for gate in self.locks.values() {
            gate.poison_remaining(poison);
        }
    }

    /// Release any remaining announced counts as skips. Used after a
    /// statement completes normally for announcements that code paths
    /// (short circuits) never reached.
    pub fn skip_remaining(&self) {
        for gate in self.writes.values() {
            let left = gate.pending();
            if left > 0 {
                gate.skip(left);
            }
        }
        for gate in self.locks.values() {
            let left = gate.pending();
            if left > 0 {
                gate.skip(left);
            }
        }
    }
}

/// One sequenced operation's position in its path chain: acquired
/// synchronously at async-block entry, awaited before the op runs, released
/// with the op's result.
pub(crate) struct LockTurn {
    key: Rc<str>,
    prev: Binding,
    leaf: Rc<WriteGate>,
    root: Rc<Frame>,
}

impl LockTurn {
    /// Chain a new op on the aggregate's tail. Must run in the synchronous
    /// prefix of the op's evaluation so turns follow lexical order.
    pub fn acquire(targets: &Targets, frame: &Rc<Frame>, key: &Rc<str>) -> Option<Self> {
        let aggregate = targets.locks.get(key.as_ref())?;
        let prev = aggregate.tail();
        let leaf = WriteGate::announce(1, prev.clone(), Some(aggregate));
        aggregate.set_tail(Binding::Gate(Rc::clone(&leaf)));
        Some(Self {
            key: Rc::clone(key),
            prev,
            leaf,
            root: frame.root_frame(),
        })
    }

    /// Wait for the previous op on the path. A poisoned predecessor
    /// surfaces here so this op can decline to run.
    pub async fn wait_turn(&self) -> EvalResult {
        resolve_binding(self.prev.clone()).await
    }

    /// Release the chain with this op's result and update the read mirror.
    pub fn release(self, result: EvalResult) {
        let mirror: Rc<str> = format!("{}~", self.key).into();
        self.root.bind(mirror, Binding::from_result(result.clone()));
        self.leaf.fulfill(result);
    }
}

#[cfg(test)]
mod tests {
    use super::Targets;
    use crate::runtime::frame::{resolve_binding, Binding, Frame};
    use crate::value::Value;
    use std::rc::Rc;

    fn name(s: &str) -> Rc<str> {
        Rc::from(s)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn announced_write_is_visible_to_later_siblings() {
        let frame = Frame::root();
        let parent = Targets::empty();
        let targets = Targets::announce_child(
            &parent,
            &frame,
            &[name("x")],
            &[(name("x"), 1)],
            &[],
        );

        // A later sibling snapshots the gate and waits for the write.
        let binding = frame.lookup_binding("x").expect("binding");
        let reader = resolve_binding(binding);
        targets
            .write_gate("x")
            .expect("gate")
            .fulfill(Ok(Value::from(5)));
        assert_eq!(reader.await.expect("value"), Value::from(5));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn skipped_branch_releases_waiters() {
        let frame = Frame::root();
        let parent = Targets::empty();
        let writes = [(name("x"), 2)];
        let targets = Targets::announce_child(&parent, &frame, &[name("x")], &writes, &[]);

        let binding = frame.lookup_binding("x").expect("binding");
        let reader = resolve_binding(binding);
        targets.write_gate("x").expect("gate").fulfill(Ok(Value::from(1)));
        targets.skip_branch(&[(name("x"), 1)], &[]);
        assert_eq!(reader.await.expect("value"), Value::from(1));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn lock_turns_run_in_announcement_order() {
        let frame = Frame::root();
        let parent = Targets::empty();
        let key = name("!state");
        let locks = [(Rc::clone(&key), 2)];
        let targets = Targets::announce_child(&parent, &frame, &[], &[], &locks);

        let first = super::LockTurn::acquire(&targets, &frame, &key).expect("turn");
        let second = super::LockTurn::acquire(&targets, &frame, &key).expect("turn");

        let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let o1 = std::rc::Rc::clone(&order);
        let o2 = std::rc::Rc::clone(&order);

        // Drive the second op first; it must still wait for the first.
        futures::join!(
            async move {
                second.wait_turn().await.expect("turn");
                o2.borrow_mut().push(2);
                second.release(Ok(Value::from(2)));
            },
            async move {
                tokio::task::yield_now().await;
                first.wait_turn().await.expect("turn");
                o1.borrow_mut().push(1);
                first.release(Ok(Value::from(1)));
            }
        );
        assert_eq!(*order.borrow(), vec![1, 2]);

        // The aggregate resolved and the mirror carries the last release.
        let binding = frame.lookup_binding("!state").expect("binding");
        assert_eq!(resolve_binding(binding).await.expect("value"), Value::from(2));
        assert!(matches!(
            frame.lookup_binding("!state~"),
            Some(Binding::Ready(v)) if v == Value::from(2)
        ));
    }
}
