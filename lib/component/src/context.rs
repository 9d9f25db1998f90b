//! The ambient context handed to host handlers.
//!
//! Every registered host function receives a [`HostContext`] naming the
//! live instance the call originated from, giving access to that
//! instance's resource store, and carrying the cancellation flag the
//! handler must honour. When the owning instance cannot be recovered
//! the handler still runs, with a detached context that cannot reach
//! guest state.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::errors::Error;
use crate::resources::ResourceStore;
use crate::values::InterfaceValue;

/// The signature of a registered host function.
pub type HostHandler = Arc<
    dyn Fn(HostContext<'_>, &[InterfaceValue]) -> Result<Vec<InterfaceValue>, Error>
        + Send
        + Sync,
>;

/// A shared cancellation flag.
///
/// Cloning shares the flag. There are no implicit timers: whoever wants
/// a timeout raises the flag themselves.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates an unraised token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether the flag has been raised.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The per-call context passed to host handlers.
pub struct HostContext<'a> {
    instance_id: Option<u64>,
    resources: Option<&'a Mutex<ResourceStore>>,
    cancel: Option<&'a CancelToken>,
}

impl<'a> HostContext<'a> {
    pub(crate) fn new(
        instance_id: u64,
        resources: &'a Mutex<ResourceStore>,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            instance_id: Some(instance_id),
            resources: Some(resources),
            cancel: Some(cancel),
        }
    }

    /// A context with no owning instance. Handlers invoked through such
    /// a context cannot reach instance state.
    pub(crate) fn detached() -> Self {
        Self {
            instance_id: None,
            resources: None,
            cancel: None,
        }
    }

    /// The id of the owning instance, when it could be recovered.
    pub fn instance_id(&self) -> Option<u64> {
        self.instance_id
    }

    /// The owning instance's resource store.
    pub fn resources(&self) -> Option<MutexGuard<'a, ResourceStore>> {
        self.resources.map(|m| match m.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        })
    }

    /// Whether the caller asked for cancellation. Long-running handlers
    /// must poll this and bail out early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_some_and(CancelToken::is_cancelled)
    }
}

thread_local! {
    static CURRENT_INSTANCE: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Runs `f` with the ambient current-instance cell set to `id`.
///
/// This is the fallback owner-recovery path: host functions reached
/// through engine plumbing that lost the per-instance environment can
/// still find the instance that is currently executing on this thread.
pub(crate) fn with_current_instance<R>(id: u64, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<u64>);
    impl Drop for Restore {
        fn drop(&mut self) {
            CURRENT_INSTANCE.with(|c| c.set(self.0));
        }
    }
    let _restore = Restore(CURRENT_INSTANCE.with(|c| c.replace(Some(id))));
    f()
}

/// The instance currently executing on this thread, if any.
pub(crate) fn current_instance() -> Option<u64> {
    CURRENT_INSTANCE.with(Cell::get)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn ambient_cell_nests_and_restores() {
        assert_eq!(current_instance(), None);
        let inner = with_current_instance(1, || {
            with_current_instance(2, current_instance)
        });
        assert_eq!(inner, Some(2));
        assert_eq!(current_instance(), None);
    }

    #[test]
    fn detached_context_has_no_state() {
        let cx = HostContext::detached();
        assert_eq!(cx.instance_id(), None);
        assert!(cx.resources().is_none());
        assert!(!cx.is_cancelled());
    }
}
