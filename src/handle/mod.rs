// ============================================================================
// Session Handle Capabilities
// ============================================================================
//
// The persistence engine behind each handle is an external collaborator.
// This module defines the capability set the scope machinery needs from it:
// begin an explicit transaction, save pending changes (sync or async with
// cancellation), disable change tracking for read-only use, reload cached
// entities, and dispose.
//
// Handles are cached per concrete type inside a `HandleCollection`, so the
// traits must be dyn-compatible and downcastable.
//
// ============================================================================

use crate::core::{EntityKey, IsolationLevel, Result, ScopeError};
use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// An open session against a backing persistence engine.
///
/// One instance per concrete type lives in each owning scope's collection.
/// Implementations are driven from a single logical flow at a time; the
/// collection enforces that with uncontended locking.
#[async_trait]
pub trait SessionHandle: Send + 'static {
    /// Open an explicit transaction on this session.
    fn begin_transaction(
        &mut self,
        level: IsolationLevel,
    ) -> anyhow::Result<Box<dyn TransactionHandle>>;

    /// Flush pending changes to the backing store. Returns the number of
    /// rows written.
    fn save(&mut self) -> anyhow::Result<u64>;

    /// Async variant of [`save`](SessionHandle::save). Implementations must
    /// honor the cancellation token.
    async fn save_async(&mut self, cancel: CancellationToken) -> anyhow::Result<u64>;

    /// Stop tracking changes on this session. Called once, right after
    /// creation, when the owning scope is read-only.
    fn disable_change_tracking(&mut self);

    /// Identity of a domain object as tracked by this session, or `None`
    /// when the session does not track it.
    fn entity_key(&self, _entity: &(dyn Any + Send + Sync)) -> Option<EntityKey> {
        None
    }

    /// Reload the cached copy behind `key` from the backing store, but only
    /// if this session holds it unmodified. Locally modified copies stay
    /// untouched.
    fn reload_if_unmodified(&mut self, _key: &EntityKey) -> anyhow::Result<()> {
        Ok(())
    }

    /// Async variant of [`reload_if_unmodified`](SessionHandle::reload_if_unmodified).
    async fn reload_if_unmodified_async(&mut self, key: &EntityKey) -> anyhow::Result<()> {
        self.reload_if_unmodified(key)
    }

    /// Release the session. Called exactly once, when the owning collection
    /// is disposed.
    fn dispose(&mut self) -> anyhow::Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// An explicitly started transaction on one session handle.
pub trait TransactionHandle: Send {
    fn commit(&mut self) -> anyhow::Result<()>;

    fn rollback(&mut self) -> anyhow::Result<()>;

    fn dispose(&mut self) -> anyhow::Result<()>;
}

/// Injected constructor for session types without a usable `Default`.
///
/// The collection asks the factory first and falls back to default
/// construction; returning `None` means "not my type".
pub trait HandleFactory: Send + Sync {
    fn create(&self, type_id: TypeId) -> Option<Box<dyn SessionHandle>>;
}

/// Shared storage slot for one cached session handle.
///
/// A tokio mutex so async saves can hold the guard across `.await`; all
/// lock attempts are `try_lock` because contention can only mean two
/// logical flows are sharing one scope.
pub(crate) type HandleEntry = Arc<Mutex<Box<dyn SessionHandle>>>;

/// Typed view over a cached session handle.
///
/// Cheap to clone; all instances resolved for the same type within one
/// scope chain point at the same underlying session.
pub struct TypedHandle<T> {
    entry: HandleEntry,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for TypedHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedHandle")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> Clone for TypedHandle<T> {
    fn clone(&self) -> Self {
        Self {
            entry: Arc::clone(&self.entry),
            _marker: PhantomData,
        }
    }
}

pub(crate) fn contention_error() -> ScopeError {
    ScopeError::usage(
        "session handle is locked by another caller; a scope must not be shared \
         across concurrent flows (suppress the ambient scope before fanning out)",
    )
}

impl<T: SessionHandle> TypedHandle<T> {
    pub(crate) fn new(entry: HandleEntry) -> Self {
        Self {
            entry,
            _marker: PhantomData,
        }
    }

    /// Run `f` with exclusive access to the typed session.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut guard = self.entry.try_lock().map_err(|_| contention_error())?;
        let handle = guard
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| ScopeError::usage("cached session has a different concrete type"))?;
        Ok(f(handle))
    }

    /// Async variant of [`with`](TypedHandle::with); the session stays
    /// exclusively borrowed for the duration of the returned future.
    pub async fn with_async<R>(
        &self,
        f: impl for<'a> FnOnce(&'a mut T) -> Pin<Box<dyn Future<Output = R> + Send + 'a>>,
    ) -> Result<R> {
        let mut guard = self.entry.try_lock().map_err(|_| contention_error())?;
        let handle = guard
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| ScopeError::usage("cached session has a different concrete type"))?;
        Ok(f(handle).await)
    }
}
