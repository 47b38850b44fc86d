// ============================================================================
// Handle Collection
// ============================================================================
//
// Per-scope cache and lifecycle aggregator for session handles. One handle
// per concrete type, created on first request, disposed with the collection.
// Commit and rollback fold over every cached handle, always letting each
// one finish; only the last failure is surfaced, earlier ones are logged.
// Multi-handle commit is therefore explicitly not atomic.
//
// ============================================================================

use crate::core::{IsolationLevel, Result, ScopeError};
use crate::handle::{
    contention_error, HandleEntry, HandleFactory, SessionHandle, TransactionHandle, TypedHandle,
};
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub struct HandleCollection {
    read_only: bool,
    isolation: Option<IsolationLevel>,
    completed: AtomicBool,
    disposed: AtomicBool,
    factory: Option<Arc<dyn HandleFactory>>,
    handles: StdMutex<HashMap<TypeId, HandleEntry>>,
    transactions: StdMutex<HashMap<TypeId, Box<dyn TransactionHandle>>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HandleCollection {
    pub(crate) fn new(
        read_only: bool,
        isolation: Option<IsolationLevel>,
        factory: Option<Arc<dyn HandleFactory>>,
    ) -> Self {
        Self {
            read_only,
            isolation,
            completed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            factory,
            handles: StdMutex::new(HashMap::new()),
            transactions: StdMutex::new(HashMap::new()),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Number of handles created so far.
    pub fn handle_count(&self) -> usize {
        lock(&self.handles).len()
    }

    /// Resolve the cached handle for `T`, creating it on first request.
    ///
    /// The injected factory is consulted first; default construction is the
    /// fallback. Freshly created handles get change tracking disabled when
    /// the collection is read-only, and an explicit transaction when an
    /// isolation level was configured.
    pub fn get<T: SessionHandle + Default>(&self) -> Result<TypedHandle<T>> {
        self.get_or_create::<T>(Some(&|| Box::new(T::default())))
    }

    /// Like [`get`](HandleCollection::get) for handle types without a
    /// `Default`; the injected factory must produce the instance.
    pub fn get_injected<T: SessionHandle>(&self) -> Result<TypedHandle<T>> {
        self.get_or_create::<T>(None)
    }

    fn get_or_create<T: SessionHandle>(
        &self,
        fallback: Option<&dyn Fn() -> Box<dyn SessionHandle>>,
    ) -> Result<TypedHandle<T>> {
        if self.is_disposed() {
            return Err(ScopeError::usage(
                "cannot resolve a handle: collection has been disposed",
            ));
        }

        let type_id = TypeId::of::<T>();
        let mut handles = lock(&self.handles);
        if let Some(entry) = handles.get(&type_id) {
            return Ok(TypedHandle::new(entry.clone()));
        }

        let mut handle = match self.factory.as_ref().and_then(|f| f.create(type_id)) {
            Some(instance) => instance,
            None => match fallback {
                Some(make) => make(),
                None => {
                    return Err(ScopeError::usage(format!(
                        "no handle factory produced an instance of {}",
                        type_name::<T>()
                    )));
                }
            },
        };
        if !handle.as_any().is::<T>() {
            return Err(ScopeError::usage(format!(
                "handle factory returned the wrong type for {}",
                type_name::<T>()
            )));
        }

        if self.read_only {
            handle.disable_change_tracking();
        }
        if let Some(level) = self.isolation {
            let tx = handle.begin_transaction(level)?;
            lock(&self.transactions).insert(type_id, tx);
        }

        let entry: HandleEntry = Arc::new(Mutex::new(handle));
        handles.insert(type_id, entry.clone());
        Ok(TypedHandle::new(entry))
    }

    pub(crate) fn cached_types(&self) -> Vec<TypeId> {
        lock(&self.handles).keys().copied().collect()
    }

    pub(crate) fn entry(&self, type_id: TypeId) -> Option<HandleEntry> {
        lock(&self.handles).get(&type_id).cloned()
    }

    /// Save every cached handle and commit its explicit transaction.
    ///
    /// Best-effort: every handle gets a chance to finish; only the last
    /// error is returned. Returns the summed save count on full success.
    ///
    /// # Errors
    /// `Usage` if the collection already completed or was disposed;
    /// `Persistence` carrying the last failure otherwise.
    pub fn commit(&self) -> Result<u64> {
        self.ensure_active("commit")?;
        let result = self.commit_all();
        self.completed.store(true, Ordering::SeqCst);
        result
    }

    /// Async variant of [`commit`](HandleCollection::commit); the
    /// cancellation token is passed through to each handle's async save.
    pub async fn commit_async(&self, cancel: CancellationToken) -> Result<u64> {
        self.ensure_active("commit")?;
        let result = self.commit_all_async(cancel).await;
        self.completed.store(true, Ordering::SeqCst);
        result
    }

    /// Roll back and dispose every explicit transaction. Unsaved changes on
    /// the handles themselves need no action; they die with the handles.
    pub fn rollback(&self) -> Result<()> {
        self.ensure_active("rollback")?;
        let result = self.rollback_all();
        self.completed.store(true, Ordering::SeqCst);
        result
    }

    /// Release every cached handle. Idempotent. If the collection never
    /// completed, an implicit commit (read-only) or rollback (read-write)
    /// runs first; all errors on this path are logged and swallowed so
    /// disposal can never mask an unwinding failure.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if !self.completed.swap(true, Ordering::SeqCst) {
            let outcome = if self.read_only {
                self.commit_all().map(|_| ())
            } else {
                self.rollback_all()
            };
            if let Err(e) = outcome {
                warn!(error = %e, "implicit completion during dispose failed");
            }
        }

        let entries: Vec<HandleEntry> = lock(&self.handles).drain().map(|(_, e)| e).collect();
        for entry in entries {
            match entry.try_lock() {
                Ok(mut guard) => {
                    if let Err(e) = guard.dispose() {
                        warn!(error = %e, "session handle dispose failed");
                    }
                }
                Err(_) => {
                    warn!("session handle still locked during dispose; leaking it");
                }
            }
        }
    }

    fn ensure_active(&self, op: &str) -> Result<()> {
        if self.is_disposed() {
            return Err(ScopeError::usage(format!(
                "cannot {op}: handle collection has been disposed"
            )));
        }
        if self.is_completed() {
            return Err(ScopeError::usage(format!(
                "cannot {op}: handle collection already completed"
            )));
        }
        Ok(())
    }

    fn snapshot_entries(&self) -> Vec<(TypeId, HandleEntry)> {
        lock(&self.handles)
            .iter()
            .map(|(ty, entry)| (*ty, entry.clone()))
            .collect()
    }

    fn commit_all(&self) -> Result<u64> {
        let mut last_error = None;
        let mut saved = 0u64;
        for (type_id, entry) in self.snapshot_entries() {
            match self.commit_one(type_id, &entry) {
                Ok(n) => saved += n,
                Err(e) => {
                    warn!(error = %e, "session commit failed; continuing with remaining handles");
                    last_error = Some(e);
                }
            }
        }
        self.abort_leftover_transactions();
        match last_error {
            Some(e) => Err(e),
            None => Ok(saved),
        }
    }

    fn commit_one(&self, type_id: TypeId, entry: &HandleEntry) -> Result<u64> {
        let mut guard = entry.try_lock().map_err(|_| contention_error())?;
        let mut saved = 0;
        if !self.read_only {
            saved = guard.save()?;
        }
        if let Some(mut tx) = lock(&self.transactions).remove(&type_id) {
            match tx.commit() {
                Ok(()) => tx.dispose()?,
                Err(e) => {
                    if let Err(d) = tx.dispose() {
                        warn!(error = %d, "transaction dispose failed after a failed commit");
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(saved)
    }

    async fn commit_all_async(&self, cancel: CancellationToken) -> Result<u64> {
        let mut last_error = None;
        let mut saved = 0u64;
        for (type_id, entry) in self.snapshot_entries() {
            match self.commit_one_async(type_id, &entry, cancel.clone()).await {
                Ok(n) => saved += n,
                Err(e) => {
                    warn!(error = %e, "session commit failed; continuing with remaining handles");
                    last_error = Some(e);
                }
            }
        }
        self.abort_leftover_transactions();
        match last_error {
            Some(e) => Err(e),
            None => Ok(saved),
        }
    }

    async fn commit_one_async(
        &self,
        type_id: TypeId,
        entry: &HandleEntry,
        cancel: CancellationToken,
    ) -> Result<u64> {
        let mut guard = entry.try_lock().map_err(|_| contention_error())?;
        let mut saved = 0;
        if !self.read_only {
            saved = guard.save_async(cancel).await?;
        }
        if let Some(mut tx) = lock(&self.transactions).remove(&type_id) {
            match tx.commit() {
                Ok(()) => tx.dispose()?,
                Err(e) => {
                    if let Err(d) = tx.dispose() {
                        warn!(error = %d, "transaction dispose failed after a failed commit");
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(saved)
    }

    fn rollback_all(&self) -> Result<()> {
        let mut last_error = None;
        let txs: Vec<(TypeId, Box<dyn TransactionHandle>)> =
            lock(&self.transactions).drain().collect();
        for (_type_id, mut tx) in txs {
            if let Err(e) = tx.rollback() {
                warn!(error = %e, "transaction rollback failed; continuing with remaining handles");
                last_error = Some(ScopeError::Persistence(e));
            }
            // The engine must see the transaction closed even after a
            // failed rollback.
            if let Err(e) = tx.dispose() {
                warn!(error = %e, "transaction dispose failed");
                last_error = Some(ScopeError::Persistence(e));
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // A handle whose save failed never reaches its transaction commit. The
    // backing engine still has that transaction open, so the leftovers get
    // a best-effort rollback and dispose before the fold returns.
    fn abort_leftover_transactions(&self) {
        let txs: Vec<Box<dyn TransactionHandle>> = lock(&self.transactions)
            .drain()
            .map(|(_, tx)| tx)
            .collect();
        for mut tx in txs {
            if let Err(e) = tx.rollback() {
                warn!(error = %e, "rollback of an uncommitted transaction failed");
            }
            if let Err(e) = tx.dispose() {
                warn!(error = %e, "dispose of an uncommitted transaction failed");
            }
        }
    }
}

impl std::fmt::Debug for HandleCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleCollection")
            .field("read_only", &self.read_only)
            .field("isolation", &self.isolation)
            .field("completed", &self.is_completed())
            .field("disposed", &self.is_disposed())
            .field("handles", &self.handle_count())
            .finish()
    }
}
