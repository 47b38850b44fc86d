//! Convenience re-exports for application code.

pub use crate::ambient::{flow, SuppressionGuard};
pub use crate::core::{EntityKey, IsolationLevel, JoinPolicy, Result, ScopeError, ScopeId};
pub use crate::handle::{HandleFactory, SessionHandle, TransactionHandle, TypedHandle};
pub use crate::scope::factory::DbScopeFactory;
pub use crate::scope::locator::AmbientHandleLocator;
pub use crate::scope::DbScope;

pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
