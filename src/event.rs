//! Events
use crate::*;

/// Something that can be fired into the bus.
///
/// Names are used for handler resolution and for synthesising the
/// `<Name>Done`/`<Name>Success`/`<Name>Failure` lifecycle events, so
/// `event_name` must be stable for a given type. The [`define_event!`]
/// macro derives it from the type's identifier; the synthetic lifecycle
/// events in [`crate::events`] implement it by hand, since their name
/// varies per origin event.
pub trait Event: Downcast + fmt::Debug + Send {
    /// The name this event is dispatched and cached under.
    fn event_name(&self) -> &str;

    /// Should this event be excluded from the debug-log trace?
    fn is_silent(&self) -> bool {
        false
    }

    /// The event's own channel tuple, if it carries one.
    ///
    /// Consulted by [`Manager::fire`](crate::component::Manager::fire) as the
    /// second preference in the channel-resolution order, after an explicit
    /// fire-time argument and before the firing component's own channel.
    fn channels(&self) -> Option<Vec<Channel>> {
        None
    }
}

use downcast_rs::impl_downcast;
impl_downcast!(Event);

/// Declares a plain event type and its [`Event`] impl in one go.
///
/// ```
/// sparkbus::define_event! {
///     #[derive(Debug)]
///     pub struct Ping;
/// }
/// ```
///
/// expands to:
///
/// ```
/// #[derive(Debug)]
/// pub struct Ping;
/// impl sparkbus::Event for Ping {
///     fn event_name(&self) -> &str { "Ping" }
/// }
/// ```
#[macro_export]
macro_rules! define_event {
    ($(#[$meta:meta])* $vis:vis struct $name:ident $($body:tt)*) => {
        $(#[$meta])*
        $vis struct $name $($body)*

        impl $crate::Event for $name {
            fn event_name(&self) -> &str {
                stringify!($name)
            }
        }
    };
}

/// A channel routes an event to a subset of handlers.
///
/// `Any` ("*") matches every handler. `Named` is a plain string tag, the
/// common case. `Target` addresses a single component's own handlers
/// directly, bypassing the normal channel-match rule entirely — this is how
/// a component can receive events it would otherwise filter out.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// Matches any handler ("*").
    Any,
    /// A named channel tag.
    Named(Arc<str>),
    /// Targets one component's own handlers directly.
    Target(ComponentId),
}

impl Channel {
    /// Shorthand for a named channel.
    pub fn named(name: impl Into<Arc<str>>) -> Self {
        Channel::Named(name.into())
    }

    /// Returns true if this is the wildcard channel.
    pub fn is_any(&self) -> bool {
        matches!(self, Channel::Any)
    }
}

impl From<&str> for Channel {
    fn from(s: &str) -> Self {
        if s == "*" {
            Channel::Any
        } else {
            Channel::Named(Arc::from(s))
        }
    }
}

impl From<ComponentId> for Channel {
    fn from(id: ComponentId) -> Self {
        Channel::Target(id)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Channel::Any => write!(f, "*"),
            Channel::Named(name) => write!(f, "{name}"),
            Channel::Target(id) => write!(f, "#{id:?}"),
        }
    }
}

/// Opt-in lifecycle flags supplied at fire-time.
///
/// Events here are plain user types, not required to carry framework
/// bookkeeping fields, so these flags travel alongside the event as
/// explicit fire-time options instead of mutable fields on the event
/// itself. See `DESIGN.md` for the rationale.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FireOptions {
    /// Fire `<Name>Success` when every handler completes without error.
    pub success: bool,
    /// Fire `<Name>Failure` when a handler raises.
    pub failure: bool,
    /// Fire `<Name>Done` once every handler (incl. suspended tasks) completes.
    pub alert_done: bool,
}

impl FireOptions {
    /// All lifecycle alerts enabled.
    pub fn all() -> Self {
        Self {
            success: true,
            failure: true,
            alert_done: true,
        }
    }
}

/// An event, its resolved channels, fire-time options, and the placeholder
/// [`ValueHandle`](crate::value::ValueHandle) returned to the caller — the
/// unit the root's queue actually holds.
pub struct QueuedEvent {
    /// The event payload.
    pub event: Box<dyn Event>,
    /// The resolved channel tuple this event dispatches on.
    pub channels: Vec<Channel>,
    /// Opt-in lifecycle flags supplied at fire time.
    pub opts: FireOptions,
    /// The placeholder handed back to the caller of `fire`.
    pub value: crate::value::ValueHandle,
}

#[cfg(test)]
mod tests {
    use super::*;

    define_event! {
        #[derive(Debug)]
        pub struct Ping;
    }

    #[test]
    fn event_name_is_derived() {
        let e = Ping;
        assert_eq!(Event::event_name(&e), "Ping");
    }

    #[test]
    fn channel_from_str_recognises_wildcard() {
        assert_eq!(Channel::from("*"), Channel::Any);
        assert_eq!(Channel::from("x"), Channel::named("x"));
    }
}
