// ============================================================================
// dbscope Library
// ============================================================================
//
// Ambient unit-of-work scopes: a scope opened anywhere on a logical async
// flow is discoverable by all code on that flow, lazily creates one session
// handle per handle type, and aggregates commit/rollback/dispose across all
// of them. Inner scopes join the outer one, so only the outermost owner
// decides the fate of the unit of work.
//
// Multi-handle commit is best-effort, not atomic: every handle gets a
// chance to finish, and only the last failure is surfaced.
//
// ============================================================================
//
// Typical shape:
//
// ```ignore
// dbscope::flow(async {
//     let factory = DbScopeFactory::new();
//     let mut scope = factory.create(JoinPolicy::JoinExisting)?;
//
//     let users = scope.handle::<UserSession>()?;
//     users.with(|s| s.add(new_user))?;
//
//     scope.complete()?; // owning scope commits; nested scopes defer
//     Ok::<_, ScopeError>(())
// }).await
// ```
//
// Before spawning parallel branches from inside a scope, suppress it:
//
// ```ignore
// let guard = factory.suppress_ambient();
// for chunk in chunks {
//     tokio::spawn(dbscope::flow(async move { /* own scope per branch */ }));
// }
// drop(guard);
// ```

pub mod ambient;
pub mod collection;
pub mod core;
pub mod handle;
pub mod prelude;
pub mod scope;

// Re-export main types for convenience
pub use crate::core::{EntityKey, IsolationLevel, JoinPolicy, Result, ScopeError, ScopeId};
pub use ambient::{flow, SuppressionGuard};
pub use collection::HandleCollection;
pub use handle::{HandleFactory, SessionHandle, TransactionHandle, TypedHandle};
pub use scope::factory::DbScopeFactory;
pub use scope::locator::AmbientHandleLocator;
pub use scope::DbScope;
