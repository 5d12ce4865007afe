//! Errors
use std::fmt;

/// A boxed, thread-safe error as carried on a dispatch-time failure.
///
/// Handler, tick and task failures never unwind the dispatcher; they are
/// captured here and re-surfaced as an [`crate::events::ErrorEvent`].
pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced directly to the caller of the registration API.
///
/// These never become events: they are programming errors, not runtime
/// failures of user handlers.
#[derive(Debug)]
pub enum ManagerError {
    /// The given component id is not (or no longer) part of the tree.
    UnknownComponent(crate::component::ComponentId),

    /// Attempted to remove a handler that isn't registered.
    UnknownHandler(crate::handler::HandlerId),

    /// Attempted to remove a tick that isn't registered.
    UnknownTick(crate::component::TickId),

    /// Attempted to unregister the root component.
    CannotUnregisterRoot,
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnknownComponent(id) => write!(f, "component {id:?} is not registered"),
            Self::UnknownHandler(id) => write!(f, "handler {id:?} is not registered"),
            Self::UnknownTick(id) => write!(f, "tick {id:?} is not registered"),
            Self::CannotUnregisterRoot => write!(f, "the root component cannot be unregistered"),
        }
    }
}

impl std::error::Error for ManagerError {}
