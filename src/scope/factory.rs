use crate::ambient::SuppressionGuard;
use crate::core::{IsolationLevel, JoinPolicy, Result};
use crate::handle::HandleFactory;
use crate::scope::DbScope;
use std::sync::Arc;

/// Entry point for creating scopes.
///
/// Holds the optional injected handle factory; cheap to clone and share.
///
/// # Examples
///
/// ```ignore
/// let factory = DbScopeFactory::new();
/// let mut scope = factory.create(JoinPolicy::JoinExisting)?;
/// let users = scope.handle::<UserSession>()?;
/// users.with(|s| s.add(user))?;
/// scope.complete()?;
/// ```
#[derive(Clone, Default)]
pub struct DbScopeFactory {
    handle_factory: Option<Arc<dyn HandleFactory>>,
}

impl DbScopeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory whose scopes construct session handles through `factory`
    /// before falling back to default construction.
    pub fn with_handle_factory(factory: Arc<dyn HandleFactory>) -> Self {
        Self {
            handle_factory: Some(factory),
        }
    }

    /// Create a read-write scope.
    pub fn create(&self, policy: JoinPolicy) -> Result<DbScope> {
        DbScope::new(policy, false, None, self.handle_factory.clone())
    }

    /// Create a read-only scope. Read-only scopes auto-commit on disposal;
    /// no completion call is expected.
    pub fn create_read_only(&self, policy: JoinPolicy) -> Result<DbScope> {
        DbScope::new(policy, true, None, self.handle_factory.clone())
    }

    /// Create a read-write scope that opens an explicit transaction at
    /// `level` on every handle it creates. Implies force-new: demanding a
    /// specific new transaction while joining an existing scope would be
    /// contradictory.
    pub fn create_with_transaction(&self, level: IsolationLevel) -> Result<DbScope> {
        DbScope::new(
            JoinPolicy::ForceNew,
            false,
            Some(level),
            self.handle_factory.clone(),
        )
    }

    /// Read-only variant of
    /// [`create_with_transaction`](DbScopeFactory::create_with_transaction).
    pub fn create_read_only_with_transaction(&self, level: IsolationLevel) -> Result<DbScope> {
        DbScope::new(
            JoinPolicy::ForceNew,
            true,
            Some(level),
            self.handle_factory.clone(),
        )
    }

    /// Hide the ambient scope until the returned guard is released. Must be
    /// called before spawning parallel work from inside a scope, so the
    /// branches cannot share this flow's session handles.
    pub fn suppress_ambient(&self) -> SuppressionGuard {
        SuppressionGuard::acquire()
    }
}

impl std::fmt::Debug for DbScopeFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbScopeFactory")
            .field("handle_factory", &self.handle_factory.is_some())
            .finish()
    }
}
