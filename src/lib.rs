#![doc = include_str!("../README.md")]
#![deny(missing_docs)]

// --- Global Imports
pub(crate) use std::any::Any;
pub(crate) use std::collections::{HashMap, VecDeque};
pub(crate) use std::fmt;
pub(crate) use std::sync::Arc;
pub(crate) use log::{debug, error, info, trace, warn};
pub(crate) use downcast_rs::Downcast;

// --- Public Prelude
/// API Prelude
pub mod prelude {
    pub use crate::component::{Component, ComponentBuilder, ComponentId, Manager, ManagerConfig, ManagerHandle};
    pub use crate::define_event;
    pub use crate::error::{DynError, ManagerError};
    pub use crate::event::{Channel, Event, FireOptions};
    pub use crate::events;
    pub use crate::handler::{HandlerClosure, HandlerId, HandlerMeta, HandlerOutcome, HandlerResult};
    pub use crate::task::{Step, StepYield};
    pub use crate::value::ValueHandle;
}

// --- Re-exports of used libraries.
pub use downcast_rs;
pub use log;
pub use signal_hook;

// --- Modules
pub mod component;
pub mod error;
pub mod event;
pub mod events;
pub mod handler;
pub mod manager;
pub mod task;
pub mod value;

// --- Internal Prelude
pub(crate) use component::*;
pub(crate) use error::*;
pub(crate) use event::*;
pub(crate) use handler::*;
pub(crate) use task::*;
pub(crate) use value::*;
