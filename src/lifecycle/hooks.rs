use std::sync::{Mutex, PoisonError};

/// Why a close hook is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// The resource closed.
    Closed,
    /// The observer let go of the resource while it was still open.
    Detached,
}

type Hook = Box<dyn FnOnce(CloseCause) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Teardown callbacks for a single resource.
///
/// [`CloseHooks::fire`] runs every registered hook exactly once, most recently registered first.
/// Hooks registered after firing run straight away. A hook can be run early with
/// [`CloseHooks::run`] or dropped with [`CloseHooks::cancel`]; either way it never runs again.
#[derive(Default)]
pub struct CloseHooks {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    hooks: Vec<(HookId, Hook)>,
    next_id: u64,
    fired: bool,
}

impl CloseHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hook: impl FnOnce(CloseCause) + Send + 'static) -> HookId {
        let mut state = self.lock();
        let id = HookId(state.next_id);
        state.next_id += 1;
        if state.fired {
            drop(state);
            hook(CloseCause::Closed);
        } else {
            state.hooks.push((id, Box::new(hook)));
        }
        id
    }

    /// Run a single hook ahead of time with [`CloseCause::Detached`].
    ///
    /// Returns `false` if the hook already ran or was cancelled.
    pub fn run(&self, id: HookId) -> bool {
        match self.take(id) {
            Some(hook) => {
                hook(CloseCause::Detached);
                true
            }
            None => false,
        }
    }

    /// Forget a hook without running it.
    pub fn cancel(&self, id: HookId) -> bool {
        self.take(id).is_some()
    }

    /// Run all pending hooks in reverse registration order.
    ///
    /// Only the first call does anything. Returns the number of hooks that ran.
    pub fn fire(&self) -> usize {
        let hooks = {
            let mut state = self.lock();
            if state.fired {
                return 0;
            }
            state.fired = true;
            std::mem::take(&mut state.hooks)
        };
        let count = hooks.len();
        for (_, hook) in hooks.into_iter().rev() {
            hook(CloseCause::Closed);
        }
        count
    }

    pub fn has_fired(&self) -> bool {
        self.lock().fired
    }

    pub fn pending(&self) -> usize {
        self.lock().hooks.len()
    }

    fn take(&self, id: HookId) -> Option<Hook> {
        let mut state = self.lock();
        let position = state.hooks.iter().position(|(hook_id, _)| *hook_id == id)?;
        Some(state.hooks.remove(position).1)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CloseHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("CloseHooks")
            .field("pending", &state.hooks.len())
            .field("fired", &state.fired)
            .finish()
    }
}
