//! Synthesized lifecycle events emitted by the core dispatcher.
//!
//! `Started`/`Stopped`/`Signal`/`ErrorEvent` have a fixed name known at
//! compile time. `Done`/`Success`/`Failure` are *synthesized per origin
//! event* — their name varies (`<Name>Done`, `<Name>Success`,
//! `<Name>Failure`) so, unlike [`define_event!`](crate::define_event), they
//! carry their name as a field and implement [`Event`] by hand.
use crate::*;

/// Fired once [`Manager::run`](crate::component::Manager::run) (or the
/// thread spawned by [`Manager::start`](crate::component::Manager::start))
/// enters its loop.
#[derive(Debug)]
pub struct Started;
impl Event for Started {
    fn event_name(&self) -> &str {
        "Started"
    }
}

/// Fired during [`Manager::stop`](crate::component::Manager::stop), before
/// it drains the queue over three ticks.
#[derive(Debug)]
pub struct Stopped;
impl Event for Stopped {
    fn event_name(&self) -> &str {
        "Stopped"
    }
}

/// Fired when the process receives a captured `SIGINT`/`SIGTERM`, just
/// before `stop()` is called on its behalf.
#[derive(Debug)]
pub struct Signal {
    /// The raw signal number, as delivered by `signal_hook`.
    pub signum: i32,
}
impl Event for Signal {
    fn event_name(&self) -> &str {
        "Signal"
    }
}

/// Fired on any trapped handler, tick, or task failure.
///
/// The originating error is captured as a formatted message plus its
/// `source()` chain rather than the original `Box<dyn Error>` itself: a
/// second synthesized event can't practically take ownership of a
/// non-`Clone` trait object that a caller's closure may still reference.
/// See `DESIGN.md`.
#[derive(Debug)]
pub struct ErrorEvent {
    /// `Display`-formatted message of the error that was trapped.
    pub message: String,
    /// The error's `source()` chain, one entry per link, message-only.
    pub chain: Vec<String>,
    /// The handler that raised, if this error originated from a handler
    /// (as opposed to a tick or a task).
    pub handler: Option<HandlerId>,
}
impl ErrorEvent {
    pub(crate) fn new(message: String, chain: Vec<String>, handler: Option<HandlerId>) -> Self {
        Self { message, chain, handler }
    }
}
impl Event for ErrorEvent {
    fn event_name(&self) -> &str {
        "Error"
    }

    fn is_silent(&self) -> bool {
        true
    }
}

/// `<Name>Done(event, value)`: fired once an event's value is final (every
/// handler and task that contributed to it has completed), iff the event
/// opted into `alert_done`.
#[derive(Debug)]
pub struct Done {
    name: Arc<str>,
    /// The final value of the event this `Done` reports on.
    pub value: ValueHandle,
}
impl Done {
    pub(crate) fn create(origin_name: &str, value: ValueHandle) -> Self {
        Self {
            name: Arc::from(format!("{origin_name}Done")),
            value,
        }
    }
}
impl Event for Done {
    fn event_name(&self) -> &str {
        &self.name
    }

    fn is_silent(&self) -> bool {
        true
    }
}

/// `<Name>Success(event, value)`: fired alongside `Done` when the event
/// completed with no trapped error and opted into `success`.
#[derive(Debug)]
pub struct Success {
    name: Arc<str>,
    /// The final value of the event this `Success` reports on.
    pub value: ValueHandle,
}
impl Success {
    pub(crate) fn create(origin_name: &str, value: ValueHandle) -> Self {
        Self {
            name: Arc::from(format!("{origin_name}Success")),
            value,
        }
    }
}
impl Event for Success {
    fn event_name(&self) -> &str {
        &self.name
    }

    fn is_silent(&self) -> bool {
        true
    }
}

/// `<Name>Failure(event, error)`: fired when a handler or task of the
/// originating event raised, iff that event opted into `failure`.
#[derive(Debug)]
pub struct Failure {
    name: Arc<str>,
    /// `Display`-formatted message of the error that caused this failure.
    pub error: String,
}
impl Failure {
    pub(crate) fn create(origin_name: &str, error: String) -> Self {
        Self {
            name: Arc::from(format!("{origin_name}Failure")),
            error,
        }
    }
}
impl Event for Failure {
    fn event_name(&self) -> &str {
        &self.name
    }

    fn is_silent(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_success_failure_names_are_derived_from_the_origin() {
        let done = Done::create("Boom", ValueHandle::new());
        assert_eq!(Event::event_name(&done), "BoomDone");

        let success = Success::create("Boom", ValueHandle::new());
        assert_eq!(Event::event_name(&success), "BoomSuccess");

        let failure = Failure::create("Boom", "kaboom".into());
        assert_eq!(Event::event_name(&failure), "BoomFailure");
    }
}
