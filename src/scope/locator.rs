use crate::ambient;
use crate::core::{Result, ScopeError};
use crate::handle::{SessionHandle, TypedHandle};

/// Resolves session handles through the ambient scope.
///
/// Repository code that should not know about scope management depends on
/// this instead of a concrete scope: whoever opened the ambient scope
/// controls the unit of work; the locator only reads it.
#[derive(Clone, Copy, Debug, Default)]
pub struct AmbientHandleLocator;

impl AmbientHandleLocator {
    pub fn new() -> Self {
        Self
    }

    /// Resolve the ambient scope's handle for `T`.
    ///
    /// # Errors
    /// `Usage` when no ambient scope exists on the current flow.
    pub fn handle<T: SessionHandle + Default>(&self) -> Result<TypedHandle<T>> {
        match ambient::get_ambient() {
            Some(scope) => scope.handles.get::<T>(),
            None => Err(no_ambient()),
        }
    }

    /// Like [`handle`](AmbientHandleLocator::handle) for types the injected
    /// factory constructs.
    pub fn injected_handle<T: SessionHandle>(&self) -> Result<TypedHandle<T>> {
        match ambient::get_ambient() {
            Some(scope) => scope.handles.get_injected::<T>(),
            None => Err(no_ambient()),
        }
    }
}

fn no_ambient() -> ScopeError {
    ScopeError::usage(
        "no ambient scope on this flow; open a DbScope before resolving handles \
         (a suppressed or foreign flow sees no scope by design)",
    )
}
