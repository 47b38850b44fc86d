pub mod error;
pub mod types;

pub use error::{Result, ScopeError};
pub use types::{EntityKey, IsolationLevel, JoinPolicy, ScopeId};
