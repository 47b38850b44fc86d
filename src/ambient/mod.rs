// ============================================================================
// Ambient Scope Registry
// ============================================================================
//
// Makes the current scope discoverable by any code on the same logical
// flow without passing it through call signatures. Two pieces:
//
// - A flow-local key holding the current `ScopeId`. Inside `flow(...)` this
//   is a tokio task-local, which survives suspension and cross-worker
//   resumption and is NOT inherited by `tokio::spawn` — exactly the
//   propagation boundary we want. Outside any flow a thread-local cell is
//   the fallback for purely synchronous callers; it cannot follow an async
//   flow across workers, so async callers must enter `flow`.
//
// - A process-wide tracking table from `ScopeId` to a weak scope reference,
//   so the key stays lightweight and an abandoned scope can still be
//   reclaimed instead of leaking forever.
//
// ============================================================================

use crate::core::ScopeId;
use crate::scope::ScopeCore;
use lazy_static::lazy_static;
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::warn;

tokio::task_local! {
    static AMBIENT_SCOPE: RefCell<Option<ScopeId>>;
}

thread_local! {
    static FALLBACK_SCOPE: RefCell<Option<ScopeId>> = const { RefCell::new(None) };
}

lazy_static! {
    static ref TRACKED_SCOPES: RwLock<HashMap<ScopeId, Weak<ScopeCore>>> =
        RwLock::new(HashMap::new());
}

/// Run `fut` inside a fresh logical flow.
///
/// Scopes created inside the future stay ambient across every `.await`,
/// including when the task resumes on a different worker thread. Tasks
/// spawned from inside do not inherit the flow; each spawned branch must
/// call `flow` itself (after suppressing the ambient scope at the fan-out
/// point).
///
/// # Examples
///
/// ```ignore
/// dbscope::flow(async {
///     let mut scope = factory.create(JoinPolicy::JoinExisting)?;
///     // ... resolve handles, do work ...
///     scope.complete()?;
///     Ok(())
/// }).await
/// ```
pub async fn flow<F: Future>(fut: F) -> F::Output {
    AMBIENT_SCOPE.scope(RefCell::new(None), fut).await
}

fn read_key() -> Option<ScopeId> {
    AMBIENT_SCOPE
        .try_with(|cell| *cell.borrow())
        .unwrap_or_else(|_| FALLBACK_SCOPE.with(|cell| *cell.borrow()))
}

fn write_key(value: Option<ScopeId>) {
    if AMBIENT_SCOPE
        .try_with(|cell| *cell.borrow_mut() = value)
        .is_err()
    {
        FALLBACK_SCOPE.with(|cell| *cell.borrow_mut() = value);
    }
}

/// Install `core` as the ambient scope of the current flow. Idempotent.
pub(crate) fn set_ambient(core: &Arc<ScopeCore>) {
    TRACKED_SCOPES
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(core.id, Arc::downgrade(core));
    write_key(Some(core.id));
}

/// Resolve the ambient scope of the current flow, if any.
///
/// A key whose tracked scope has already been dropped means some caller
/// abandoned a scope without disposing it. That is a programming error in
/// the caller, but by the time it is observable here the offending flow is
/// long gone, so it is logged rather than surfaced.
pub(crate) fn get_ambient() -> Option<Arc<ScopeCore>> {
    let id = read_key()?;
    let tracked = TRACKED_SCOPES
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&id)
        .cloned();
    match tracked.as_ref().and_then(Weak::upgrade) {
        Some(core) => Some(core),
        None => {
            warn!(
                scope = %id,
                "ambient scope was dropped without disposal; treating the flow as scopeless"
            );
            TRACKED_SCOPES
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            None
        }
    }
}

/// The ambient scope ID of the current flow, without resolving the scope.
pub(crate) fn ambient_id() -> Option<ScopeId> {
    read_key()
}

/// Clear the flow-local key only; the tracking entry stays so the scope can
/// be re-installed later. Used by the suppression guard.
pub(crate) fn hide_ambient() {
    write_key(None);
}

/// Clear the flow-local key and drop the tracking entry. Used on disposal.
pub(crate) fn remove_ambient(id: ScopeId) {
    if read_key() == Some(id) {
        write_key(None);
    }
    TRACKED_SCOPES
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
}

/// Scoped suppression of the ambient scope.
///
/// Captures whatever is ambient (possibly nothing) and hides it until
/// released, so independently spawned work cannot observe it. This is the
/// only sanctioned way to start parallel work from inside a scope: without
/// it, every spawned branch would share one mutable session handle.
///
/// Dropping the guard releases it; `release` is idempotent. The guard must
/// be released on the same flow that acquired it.
pub struct SuppressionGuard {
    captured: Option<Arc<ScopeCore>>,
    released: bool,
}

impl SuppressionGuard {
    pub(crate) fn acquire() -> Self {
        let captured = get_ambient();
        hide_ambient();
        Self {
            captured,
            released: false,
        }
    }

    /// Re-install the captured scope as ambient. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(core) = self.captured.take() {
            set_ambient(&core);
        }
    }
}

impl Drop for SuppressionGuard {
    fn drop(&mut self) {
        self.release();
    }
}
