use std::sync::atomic::{AtomicU64, Ordering};

/// Global scope ID counter
static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a scope.
///
/// The registry propagates this lightweight token instead of the scope
/// object itself, so the scope never has to travel through the flow-local
/// storage mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub u64);

impl ScopeId {
    /// Generate a new unique scope ID
    pub fn new() -> Self {
        ScopeId(NEXT_SCOPE_ID.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ScopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scope_{}", self.0)
    }
}

/// Isolation level for an explicitly started transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

/// How a new scope relates to an already-ambient one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPolicy {
    /// Join the ambient scope if one exists, otherwise create a new one.
    /// A joined (nested) scope shares the outer scope's handles and never
    /// commits on its own.
    JoinExisting,

    /// Always create a new scope with its own handle collection, even if
    /// an ambient scope exists. The new scope commits independently.
    ForceNew,
}

/// Opaque identity of a tracked domain object, as understood by the session
/// handle that tracks it. Used by the cross-scope refresh operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey(pub String);

impl EntityKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_id_generation() {
        let id1 = ScopeId::new();
        let id2 = ScopeId::new();
        assert!(id2.as_u64() > id1.as_u64());
    }

    #[test]
    fn test_scope_id_display() {
        let id = ScopeId(42);
        assert_eq!(id.to_string(), "scope_42");
    }

    #[test]
    fn test_entity_key() {
        let key = EntityKey::new("user:1");
        assert_eq!(key.as_str(), "user:1");
        assert_eq!(key, EntityKey::new("user:1"));
    }
}
