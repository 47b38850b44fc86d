// Shared test collaborators: an in-memory store standing in for the
// persistence engine, plus session/transaction fakes that record what the
// scope machinery does to them.

#![allow(dead_code)]

use dbscope::prelude::*;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Route the crate's warn/error logs through the test harness, so the
/// swallowed-and-logged paths (implicit completion, leftover transaction
/// aborts) show up in failing test output.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_test_writer()
            .try_init();
    });
}

/// Backing store shared by every session a test creates.
#[derive(Clone, Default)]
pub struct MemoryStore {
    rows: Arc<Mutex<HashMap<String, String>>>,
    events: Arc<Mutex<Vec<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, id: &str, value: &str) {
        self.rows.lock().unwrap().insert(id.into(), value.into());
    }

    pub fn get(&self, id: &str) -> Option<String> {
        self.rows.lock().unwrap().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rows.lock().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count_events(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    fn put(&self, id: &str, value: &str) {
        self.rows.lock().unwrap().insert(id.into(), value.into());
    }

    fn log(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

/// Domain object used by the refresh tests.
pub struct TestUser {
    pub id: String,
    pub name: String,
}

impl TestUser {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

struct CachedRow {
    value: String,
    modified: bool,
}

/// Session fake bound to a [`MemoryStore`]. Writes are buffered until
/// `save`; reads populate a per-session cache with modification tracking,
/// which is what the cross-scope refresh operation works against.
pub struct RecordSession {
    pub instance: u64,
    pub tracking_disabled: bool,
    pub fail_next_save: bool,
    store: MemoryStore,
    pending: Vec<(String, String)>,
    cache: HashMap<String, CachedRow>,
}

impl Default for RecordSession {
    fn default() -> Self {
        Self::new(MemoryStore::default())
    }
}

impl RecordSession {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::SeqCst),
            tracking_disabled: false,
            fail_next_save: false,
            store,
            pending: Vec::new(),
            cache: HashMap::new(),
        }
    }

    /// Read a row from the store into the session cache.
    pub fn load(&mut self, id: &str) -> Option<String> {
        let value = self.store.get(id)?;
        self.cache.insert(
            id.into(),
            CachedRow {
                value: value.clone(),
                modified: false,
            },
        );
        Some(value)
    }

    /// Queue a brand-new row for the next save.
    pub fn add(&mut self, id: &str, value: &str) {
        self.pending.push((id.into(), value.into()));
    }

    /// Edit the cached copy and queue the change for the next save.
    pub fn update(&mut self, id: &str, value: &str) {
        if let Some(row) = self.cache.get_mut(id) {
            row.value = value.into();
            row.modified = true;
        }
        self.pending.push((id.into(), value.into()));
    }

    pub fn cached_value(&self, id: &str) -> Option<String> {
        self.cache.get(id).map(|row| row.value.clone())
    }

    pub fn is_cached_modified(&self, id: &str) -> bool {
        self.cache.get(id).map(|row| row.modified).unwrap_or(false)
    }
}

pub struct RecordTransaction {
    store: MemoryStore,
}

impl TransactionHandle for RecordTransaction {
    fn commit(&mut self) -> anyhow::Result<()> {
        self.store.log("tx_commit".into());
        Ok(())
    }

    fn rollback(&mut self) -> anyhow::Result<()> {
        self.store.log("tx_rollback".into());
        Ok(())
    }

    fn dispose(&mut self) -> anyhow::Result<()> {
        self.store.log("tx_dispose".into());
        Ok(())
    }
}

#[async_trait]
impl SessionHandle for RecordSession {
    fn begin_transaction(
        &mut self,
        level: IsolationLevel,
    ) -> anyhow::Result<Box<dyn TransactionHandle>> {
        self.store.log(format!("tx_begin:{level}"));
        Ok(Box::new(RecordTransaction {
            store: self.store.clone(),
        }))
    }

    fn save(&mut self) -> anyhow::Result<u64> {
        if self.fail_next_save {
            self.fail_next_save = false;
            anyhow::bail!("simulated save failure");
        }
        let mut saved = 0u64;
        for (id, value) in self.pending.drain(..) {
            self.store.put(&id, &value);
            if let Some(row) = self.cache.get_mut(&id) {
                row.value = value;
                row.modified = false;
            }
            saved += 1;
        }
        self.store.log(format!("save:{}", self.instance));
        Ok(saved)
    }

    async fn save_async(&mut self, cancel: CancellationToken) -> anyhow::Result<u64> {
        if cancel.is_cancelled() {
            anyhow::bail!("save cancelled");
        }
        tokio::task::yield_now().await;
        self.save()
    }

    fn disable_change_tracking(&mut self) {
        self.tracking_disabled = true;
    }

    fn entity_key(&self, entity: &(dyn Any + Send + Sync)) -> Option<EntityKey> {
        let user = entity.downcast_ref::<TestUser>()?;
        self.cache
            .contains_key(&user.id)
            .then(|| EntityKey::new(user.id.clone()))
    }

    fn reload_if_unmodified(&mut self, key: &EntityKey) -> anyhow::Result<()> {
        if let Some(row) = self.cache.get_mut(key.as_str()) {
            if !row.modified {
                if let Some(value) = self.store.get(key.as_str()) {
                    row.value = value;
                }
            }
        }
        Ok(())
    }

    fn dispose(&mut self) -> anyhow::Result<()> {
        self.pending.clear();
        self.store.log(format!("dispose:{}", self.instance));
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Second, default-constructible handle type, so tests can observe
/// aggregation across several handle types in one scope.
#[derive(Default)]
pub struct AuditSession {
    pub entries: Vec<String>,
    pub saved: u64,
    pub fail_next_save: bool,
}

impl AuditSession {
    pub fn record(&mut self, entry: &str) {
        self.entries.push(entry.into());
    }
}

#[async_trait]
impl SessionHandle for AuditSession {
    fn begin_transaction(
        &mut self,
        _level: IsolationLevel,
    ) -> anyhow::Result<Box<dyn TransactionHandle>> {
        anyhow::bail!("audit sessions do not support explicit transactions")
    }

    fn save(&mut self) -> anyhow::Result<u64> {
        if self.fail_next_save {
            self.fail_next_save = false;
            anyhow::bail!("simulated audit failure");
        }
        let saved = self.entries.len() as u64;
        self.saved += saved;
        self.entries.clear();
        Ok(saved)
    }

    async fn save_async(&mut self, cancel: CancellationToken) -> anyhow::Result<u64> {
        if cancel.is_cancelled() {
            anyhow::bail!("save cancelled");
        }
        self.save()
    }

    fn disable_change_tracking(&mut self) {}

    fn dispose(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct StoreSessionFactory {
    store: MemoryStore,
}

impl HandleFactory for StoreSessionFactory {
    fn create(&self, type_id: TypeId) -> Option<Box<dyn SessionHandle>> {
        (type_id == TypeId::of::<RecordSession>()).then(|| {
            let boxed: Box<dyn SessionHandle> = Box::new(RecordSession::new(self.store.clone()));
            boxed
        })
    }
}

/// Scope factory wired to `store` for `RecordSession` construction.
pub fn scope_factory(store: &MemoryStore) -> DbScopeFactory {
    init_tracing();
    DbScopeFactory::with_handle_factory(Arc::new(StoreSessionFactory {
        store: store.clone(),
    }))
}
