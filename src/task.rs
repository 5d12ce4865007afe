//! The cooperative task scheduler: suspendable handler continuations,
//! advanced one step per [`Manager::tick`](crate::component::Manager::tick).
use crate::*;

/// Identifies a scheduled [`TaskSlot`] in the root [`Manager`]'s task set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u32);

/// A suspendable handler continuation.
///
/// A handler that wants to pause returns a boxed `Step` instead of a plain
/// [`HandlerOutcome::Value`](crate::handler::HandlerOutcome::Value), and the
/// scheduler calls [`Step::advance`] once per tick until it reports
/// [`StepYield::Ready`] or [`StepYield::Err`].
pub trait Step: Send {
    /// Advances the continuation by one step, possibly touching the manager
    /// (firing further events, registering ephemeral handlers, etc).
    fn advance(&mut self, manager: &mut Manager) -> StepYield;
}

/// What a [`Step`] reports after one [`Step::advance`] call.
pub enum StepYield {
    /// Nothing to record yet; keep the task, try again next tick. This is
    /// how a handler awaits without producing a value.
    Pending,
    /// The step suspended on a *nested* lazy sequence: the current task is
    /// replaced by a child task running `nested`, and the current step
    /// becomes the child's parent continuation, resumed once the child is
    /// exhausted.
    Spawn(Box<dyn Step>),
    /// A non-null value, stored into the originating event's
    /// [`ValueHandle`](crate::value::ValueHandle); the task continues on
    /// future ticks.
    Value(Box<dyn Any + Send>),
    /// The continuation is exhausted.
    Ready,
    /// The continuation raised.
    Err(crate::error::DynError),
}

/// A live task: the event it runs on behalf of, its current continuation,
/// and the parent continuation it resumes once exhausted, if it was spawned
/// as a nested suspension.
pub(crate) struct TaskSlot {
    pub(crate) pending: crate::manager::PendingEventId,
    pub(crate) step: Box<dyn Step>,
    pub(crate) parent: Option<Box<dyn Step>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ManagerConfig;
    use crate::event::FireOptions;

    define_event! {
        #[derive(Debug)]
        pub struct Slow;
    }

    /// A step that pauses `pauses` times, then returns `42`.
    struct CountThenValue {
        pauses: u32,
        done: bool,
    }

    impl Step for CountThenValue {
        fn advance(&mut self, _manager: &mut Manager) -> StepYield {
            if self.pauses > 0 {
                self.pauses -= 1;
                return StepYield::Pending;
            }
            if !self.done {
                self.done = true;
                return StepYield::Value(Box::new(42_i32));
            }
            StepYield::Ready
        }
    }

    #[test]
    fn suspended_handler_completes_after_enough_ticks() {
        let mut m = Manager::new(ManagerConfig::default());
        let root = Manager::root();
        m.add_handler(
            root,
            HandlerMeta {
                names: vec![Arc::from("Slow")],
                channel: None,
                priority: 0,
                filter: false,
                pass_event: true,
                owner: root,
            },
            Box::new(|_event, _m| {
                Ok(HandlerOutcome::Suspend(Box::new(CountThenValue { pauses: 3, done: false })))
            }),
        );

        let mut opts = FireOptions::default();
        opts.alert_done = true;
        let value = m.fire(root, Box::new(Slow), None, opts);

        // Tick 1 dispatches `Slow` and creates the task; ticks 2-4 each
        // consume one `Pending` yield; tick 5 consumes the `Value(42)` yield
        // (the task is kept, not yet exhausted); tick 6 consumes the `Ready`
        // yield, which is what actually completes the task and fires
        // `event_done`.
        for _ in 0..4 {
            m.tick();
            assert!(value.get::<i32>().is_none());
        }
        m.tick();
        assert_eq!(value.get::<i32>(), Some(42));
        assert!(!value.is_done());

        m.tick();
        assert!(value.is_done());
    }
}
