// ============================================================================
// Unit-of-Work Scope
// ============================================================================
//
// The user-facing unit of work. At construction it either joins the ambient
// scope (sharing its handle collection, never committing on its own) or
// becomes an owning scope with a fresh collection. Exactly one commit runs
// per owning collection, triggered by its owner's completion, no matter how
// many nested scopes completed along the way.
//
// State transitions: Active(nested|owning) -> Completed -> Disposed.
//
// ============================================================================

pub mod factory;
pub mod locator;

use crate::ambient;
use crate::collection::HandleCollection;
use crate::core::{IsolationLevel, JoinPolicy, Result, ScopeError, ScopeId};
use crate::handle::{contention_error, HandleFactory, SessionHandle, TypedHandle};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Shared interior of a scope. The registry tracks these weakly; nested
/// scopes hold a strong reference to their parent's core.
pub(crate) struct ScopeCore {
    pub(crate) id: ScopeId,
    pub(crate) nested: bool,
    pub(crate) read_only: bool,
    pub(crate) completed: AtomicBool,
    pub(crate) disposed: AtomicBool,
    pub(crate) parent: Option<Arc<ScopeCore>>,
    pub(crate) handles: Arc<HandleCollection>,
}

impl ScopeCore {
    #[cfg(test)]
    pub(crate) fn detached_for_tests(read_only: bool) -> Arc<Self> {
        Arc::new(Self {
            id: ScopeId::new(),
            nested: false,
            read_only,
            completed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            parent: None,
            handles: Arc::new(HandleCollection::new(read_only, None, None)),
        })
    }
}

/// A unit-of-work boundary coordinating one or more session handles.
///
/// Create through [`DbScopeFactory`](crate::DbScopeFactory). Read-write
/// scopes must call [`complete`](DbScope::complete) to commit; going out of
/// scope without completing rolls back. Read-only scopes auto-commit on
/// disposal, so completion-by-omission is the expected shape for queries.
pub struct DbScope {
    core: Arc<ScopeCore>,
}

impl DbScope {
    pub(crate) fn new(
        policy: JoinPolicy,
        read_only: bool,
        isolation: Option<IsolationLevel>,
        factory: Option<Arc<dyn HandleFactory>>,
    ) -> Result<Self> {
        if isolation.is_some() && policy == JoinPolicy::JoinExisting {
            return Err(ScopeError::configuration(
                "an explicit isolation level cannot be combined with JoinExisting: \
                 a joined scope cannot open its own transaction",
            ));
        }

        let ambient = ambient::get_ambient();
        let (nested, handles) = match (policy, &ambient) {
            (JoinPolicy::JoinExisting, Some(parent)) => {
                if parent.read_only && !read_only {
                    return Err(ScopeError::usage(
                        "cannot open a read-write scope within a read-only scope",
                    ));
                }
                (true, Arc::clone(&parent.handles))
            }
            _ => (
                false,
                Arc::new(HandleCollection::new(read_only, isolation, factory)),
            ),
        };

        let core = Arc::new(ScopeCore {
            id: ScopeId::new(),
            nested,
            read_only,
            completed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            parent: ambient,
            handles,
        });
        ambient::set_ambient(&core);
        Ok(Self { core })
    }

    pub fn id(&self) -> ScopeId {
        self.core.id
    }

    /// True when this scope joined an outer one and shares its handles.
    pub fn is_nested(&self) -> bool {
        self.core.nested
    }

    pub fn is_read_only(&self) -> bool {
        self.core.read_only
    }

    pub fn is_completed(&self) -> bool {
        self.core.completed.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.core.disposed.load(Ordering::SeqCst)
    }

    /// Resolve the cached session handle for `T`, creating it on first use.
    pub fn handle<T: SessionHandle + Default>(&self) -> Result<TypedHandle<T>> {
        self.ensure_not_disposed()?;
        self.core.handles.get::<T>()
    }

    /// Like [`handle`](DbScope::handle) for types the injected factory
    /// constructs.
    pub fn injected_handle<T: SessionHandle>(&self) -> Result<TypedHandle<T>> {
        self.ensure_not_disposed()?;
        self.core.handles.get_injected::<T>()
    }

    /// Mark the unit of work as successful.
    ///
    /// Owning scopes commit their handle collection and return the number
    /// of rows saved; nested scopes defer to the outermost owner and return
    /// zero.
    ///
    /// # Errors
    /// `Usage` when called twice or after disposal; `Persistence` when the
    /// underlying commit failed. A failed commit still ends the unit of
    /// work: leftover transactions are rolled back on the spot and disposal
    /// only releases the handles.
    pub fn complete(&mut self) -> Result<u64> {
        self.ensure_not_disposed()?;
        if self.is_completed() {
            return Err(ScopeError::usage("scope has already been completed"));
        }
        let saved = if self.core.nested {
            0
        } else {
            self.core.handles.commit()?
        };
        self.core.completed.store(true, Ordering::SeqCst);
        Ok(saved)
    }

    /// Async variant of [`complete`](DbScope::complete). The cancellation
    /// token reaches each handle's async save; rollback and disposal paths
    /// ignore it by design.
    pub async fn complete_async(&mut self, cancel: CancellationToken) -> Result<u64> {
        self.ensure_not_disposed()?;
        if self.is_completed() {
            return Err(ScopeError::usage("scope has already been completed"));
        }
        let saved = if self.core.nested {
            0
        } else {
            self.core.handles.commit_async(cancel).await?
        };
        self.core.completed.store(true, Ordering::SeqCst);
        Ok(saved)
    }

    /// Reconcile entities this scope modified into the enclosing scope's
    /// cached copies.
    ///
    /// For every handle type cached in both this scope and its parent, each
    /// entity tracked by the current handle is re-read into the parent's
    /// handle — but only where the parent's copy is unmodified; locally
    /// edited copies are never clobbered. No-op for nested scopes (they
    /// share state with the parent already) and for scopes without a
    /// parent.
    pub fn refresh_in_parent(&self, entities: &[&(dyn Any + Send + Sync)]) -> Result<()> {
        self.ensure_not_disposed()?;
        if self.core.nested {
            return Ok(());
        }
        let Some(parent) = &self.core.parent else {
            return Ok(());
        };

        for type_id in self.core.handles.cached_types() {
            let Some(parent_entry) = parent.handles.entry(type_id) else {
                continue;
            };
            let keys = self.tracked_keys(type_id, entities)?;
            let mut parent_handle = parent_entry.try_lock().map_err(|_| contention_error())?;
            for key in keys {
                parent_handle.reload_if_unmodified(&key)?;
            }
        }
        Ok(())
    }

    /// Async variant of [`refresh_in_parent`](DbScope::refresh_in_parent).
    pub async fn refresh_in_parent_async(
        &self,
        entities: &[&(dyn Any + Send + Sync)],
    ) -> Result<()> {
        self.ensure_not_disposed()?;
        if self.core.nested {
            return Ok(());
        }
        let Some(parent) = &self.core.parent else {
            return Ok(());
        };

        for type_id in self.core.handles.cached_types() {
            let Some(parent_entry) = parent.handles.entry(type_id) else {
                continue;
            };
            let keys = self.tracked_keys(type_id, entities)?;
            let mut parent_handle = parent_entry.try_lock().map_err(|_| contention_error())?;
            for key in keys {
                parent_handle.reload_if_unmodified_async(&key).await?;
            }
        }
        Ok(())
    }

    fn tracked_keys(
        &self,
        type_id: std::any::TypeId,
        entities: &[&(dyn Any + Send + Sync)],
    ) -> Result<Vec<crate::core::EntityKey>> {
        let Some(current_entry) = self.core.handles.entry(type_id) else {
            return Ok(Vec::new());
        };
        let current = current_entry.try_lock().map_err(|_| contention_error())?;
        Ok(entities
            .iter()
            .filter_map(|entity| current.entity_key(*entity))
            .collect())
    }

    /// Dispose the scope explicitly. Dropping it has the same effect.
    ///
    /// Owning scopes that never completed roll back (read-write) or commit
    /// (read-only) implicitly, then dispose their handle collection; all
    /// errors on this path are logged, never raised. Disposing scopes out
    /// of construction order is a fatal programming error and panics.
    pub fn dispose(self) {
        // Drop runs dispose_inner; the explicit method only exists to make
        // the disposal point visible at the call site.
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(ScopeError::usage("scope has been disposed"));
        }
        Ok(())
    }

    fn dispose_inner(&mut self) {
        if self.core.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if !self.core.nested {
            // A failed `complete` already ran the collection to completion;
            // only a scope that was never completed at all gets the
            // implicit treatment here.
            if !self.core.completed.swap(true, Ordering::SeqCst)
                && !self.core.handles.is_completed()
            {
                // Implicit completion: queries commit, abandoned writes
                // roll back to signal the failed unit of work.
                let outcome = if self.core.read_only {
                    self.core.handles.commit().map(|_| ())
                } else {
                    self.core.handles.rollback()
                };
                if let Err(e) = outcome {
                    warn!(scope = %self.core.id, error = %e,
                        "implicit completion during scope disposal failed");
                }
            }
            self.core.handles.dispose();
        }

        let current = ambient::ambient_id();
        if current != Some(self.core.id) {
            if std::thread::panicking() {
                error!(scope = %self.core.id, ambient = ?current,
                    "scope disposed out of construction order during unwind");
                return;
            }
            panic!(
                "scopes must be disposed in the reverse order of their creation \
                 (ambient is {:?}, disposing {})",
                current, self.core.id
            );
        }

        ambient::remove_ambient(self.core.id);

        if let Some(parent) = &self.core.parent {
            if parent.disposed.load(Ordering::SeqCst) {
                // The parent's flow already finished: this scope leaked
                // into concurrently started work without suppression.
                error!(scope = %self.core.id, parent = %parent.id,
                    "parent scope was disposed before its child; the ambient scope \
                     leaked into a parallel flow without suppression");
            } else {
                ambient::set_ambient(parent);
            }
        }
    }
}

impl Drop for DbScope {
    fn drop(&mut self) {
        self.dispose_inner();
    }
}

impl std::fmt::Debug for DbScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbScope")
            .field("id", &self.core.id)
            .field("nested", &self.core.nested)
            .field("read_only", &self.core.read_only)
            .field("completed", &self.is_completed())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
