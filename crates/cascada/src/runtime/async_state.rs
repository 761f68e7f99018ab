//! Per-render accounting of live async blocks.
//!
//! States form a tree via parent links; entering a block creates a child and
//! bumps every ancestor, leaving releases the same chain, so the root's
//! count reaches zero exactly when the whole render has quiesced.

use std::cell::Cell;
use std::rc::Rc;

use tokio::sync::watch;

pub(crate) struct AsyncState {
    parent: Option<Rc<AsyncState>>,
    active: Cell<usize>,
    changed: watch::Sender<usize>,
    entered: Cell<usize>,
    left: Cell<usize>,
}

impl AsyncState {
    pub fn new_root() -> Rc<Self> {
        let (changed, _) = watch::channel(0);
        Rc::new(Self {
            parent: None,
            active: Cell::new(0),
            changed,
            entered: Cell::new(0),
            left: Cell::new(0),
        })
    }

    pub fn enter_async_block(self: &Rc<Self>) -> AsyncBlockGuard {
        let (changed, _) = watch::channel(1);
        let child = Rc::new(Self {
            parent: Some(Rc::clone(self)),
            active: Cell::new(1),
            changed,
            entered: Cell::new(1),
            left: Cell::new(0),
        });
        let mut cur = Some(Rc::clone(self));
        while let Some(state) = cur {
            state.entered.set(state.entered.get() + 1);
            state.bump(1);
            cur = state.parent.clone();
        }
        AsyncBlockGuard { state: child }
    }

    fn leave_async_block(self: &Rc<Self>) {
        let mut cur = Some(Rc::clone(self));
        while let Some(state) = cur {
            state.left.set(state.left.get() + 1);
            state.drop_one();
            cur = state.parent.clone();
        }
    }

    fn bump(&self, n: usize) {
        self.active.set(self.active.get() + n);
        let _ = self.changed.send_replace(self.active.get());
    }

    fn drop_one(&self) {
        let active = self.active.get();
        debug_assert!(active > 0, "leave without a matching enter");
        self.active.set(active.saturating_sub(1));
        let _ = self.changed.send_replace(self.active.get());
    }

    pub fn active_closures(&self) -> usize {
        self.active.get()
    }

    /// Resolves when the number of live blocks under this state drops to
    /// `count`.
    pub async fn wait_all_closures(&self, count: usize) {
        if self.active.get() == count {
            return;
        }
        let mut rx = self.changed.subscribe();
        // The sender lives on `self`, so the channel cannot close early.
        let _ = rx.wait_for(|v| *v == count).await;
    }

    #[cfg(test)]
    pub fn totals(&self) -> (usize, usize) {
        (self.entered.get(), self.left.get())
    }
}

/// Balances `enter_async_block` on every path, including poisons.
pub(crate) struct AsyncBlockGuard {
    state: Rc<AsyncState>,
}

impl AsyncBlockGuard {
    pub fn state(&self) -> &Rc<AsyncState> {
        &self.state
    }
}

impl Drop for AsyncBlockGuard {
    fn drop(&mut self) {
        self.state.leave_async_block();
    }
}

#[cfg(test)]
mod tests {
    use super::AsyncState;

    #[tokio::test(flavor = "current_thread")]
    async fn nested_blocks_propagate_to_the_root() {
        let root = AsyncState::new_root();
        let outer = root.enter_async_block();
        let inner = outer.state().enter_async_block();
        assert_eq!(root.active_closures(), 2);
        drop(inner);
        assert_eq!(root.active_closures(), 1);
        drop(outer);
        assert_eq!(root.active_closures(), 0);
        root.wait_all_closures(0).await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn wait_resolves_on_release() {
        let root = AsyncState::new_root();
        let guard = root.enter_async_block();
        let waiter = {
            let root = std::rc::Rc::clone(&root);
            async move { root.wait_all_closures(0).await }
        };
        let ((), ()) = futures::join!(waiter, async move {
            tokio::task::yield_now().await;
            drop(guard);
        });
        let (entered, left) = root.totals();
        assert_eq!(entered, left);
    }
}
