//! Handler metadata and the per-component three-bucket registry.
use crate::*;

/// Identifies a handler registered into a [`Manager`](crate::component::Manager).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub(crate) u32);

/// What a handler returns after running once.
pub enum HandlerOutcome {
    /// Nothing to record; dispatch continues to the next handler.
    None,
    /// A non-null return value, stored into the event's [`ValueHandle`].
    Value(Box<dyn Any + Send>),
    /// The handler suspended; `step` is scheduled as a task.
    Suspend(Box<dyn crate::task::Step>),
}

/// The result of running one handler: `Err` is a caught handler failure,
/// never a panic — panics are host-fatal and unwind the thread.
pub type HandlerResult = Result<HandlerOutcome, crate::error::DynError>;

/// A handler callable, bound into the [`Manager`](crate::component::Manager)
/// at registration time. Always receives the fired event; see
/// [`HandlerMeta::pass_event`] for why this flag currently only documents
/// intent rather than changing the call signature.
pub type HandlerClosure = Box<dyn FnMut(&dyn Event, &mut Manager) -> HandlerResult + Send>;

/// Metadata describing where and how a handler participates in dispatch.
#[derive(Clone)]
pub struct HandlerMeta {
    /// The event names this handler subscribes to; empty means wildcard.
    pub names: Vec<Arc<str>>,
    /// An explicit channel override; `None` falls back to the owning
    /// component's channel.
    pub channel: Option<Channel>,
    /// Higher runs first.
    pub priority: i32,
    /// When true and the handler returns a truthy outcome, dispatch of the
    /// remaining ordered handlers for this event halts.
    pub filter: bool,
    /// Kept for parity with handler registries that distinguish "receives
    /// the event object" from "receives unpacked arguments"; every handler
    /// in this crate receives the event object, so this currently only
    /// documents intent. See `DESIGN.md`.
    pub pass_event: bool,
    /// The component this handler is registered against.
    pub owner: ComponentId,
}

impl HandlerMeta {
    /// A handler with no names subscribes to every event name.
    pub fn is_wildcard_name(&self) -> bool {
        self.names.is_empty()
    }
}

pub(crate) struct HandlerSlot {
    pub(crate) meta: HandlerMeta,
    pub(crate) closure: HandlerClosure,
}

/// The three-bucket handler index a component owns: wildcard-name-and-channel
/// handlers (`globals`), wildcard-name handlers bound to a specific channel
/// (`name_wildcards`), and handlers keyed by the concrete event names they
/// subscribe to (`by_name`).
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    pub(crate) globals: Vec<HandlerId>,
    pub(crate) name_wildcards: Vec<HandlerId>,
    pub(crate) by_name: HashMap<Arc<str>, Vec<HandlerId>>,
}

impl Manager {
    /// Registers a handler on `owner`, classifying it into the appropriate
    /// bucket and clearing the dispatch cache.
    pub fn add_handler(&mut self, owner: ComponentId, meta: HandlerMeta, closure: HandlerClosure) -> HandlerId {
        let id = HandlerId(self.handlers.len() as u32);
        let wildcard_name = meta.is_wildcard_name();
        let node_channel = self.nodes[owner.0 as usize].channel.clone();
        let wildcard_channel = meta.channel.as_ref().unwrap_or(&node_channel).is_any();

        {
            let node = &mut self.nodes[owner.0 as usize];
            if wildcard_name && wildcard_channel {
                node.registry.globals.push(id);
            } else if wildcard_name {
                node.registry.name_wildcards.push(id);
            } else {
                for name in &meta.names {
                    node.registry.by_name.entry(name.clone()).or_default().push(id);
                }
            }
        }

        trace!("add_handler {id:?} on {owner:?} names={:?} channel={:?}", meta.names, meta.channel);
        self.handlers.push(Some(HandlerSlot { meta, closure }));
        self.clear_cache();
        self.recompute_ticks();
        id
    }

    /// Removes a previously registered handler.
    ///
    /// Returns [`ManagerError::UnknownHandler`] if `id` is not (or no
    /// longer) registered — a programming error surfaced to the caller,
    /// never as an event.
    pub fn remove_handler(&mut self, id: HandlerId) -> Result<(), ManagerError> {
        let slot = self
            .handlers
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .ok_or(ManagerError::UnknownHandler(id))?;

        let owner = slot.meta.owner;
        let wildcard_name = slot.meta.is_wildcard_name();
        let node_channel = self.nodes[owner.0 as usize].channel.clone();
        let wildcard_channel = slot.meta.channel.as_ref().unwrap_or(&node_channel).is_any();

        if let Some(node) = self.nodes.get_mut(owner.0 as usize) {
            if wildcard_name && wildcard_channel {
                node.registry.globals.retain(|h| *h != id);
            } else if wildcard_name {
                node.registry.name_wildcards.retain(|h| *h != id);
            } else {
                for name in &slot.meta.names {
                    if let Some(v) = node.registry.by_name.get_mut(name) {
                        v.retain(|h| *h != id);
                        if v.is_empty() {
                            node.registry.by_name.remove(name);
                        }
                    }
                }
            }
        }

        trace!("remove_handler {id:?} from {owner:?}");
        self.clear_cache();
        self.recompute_ticks();
        Ok(())
    }

    pub(crate) fn handler_meta(&self, id: HandlerId) -> Option<&HandlerMeta> {
        self.handlers.get(id.0 as usize).and_then(|s| s.as_ref()).map(|s| &s.meta)
    }

    /// Runs one handler, temporarily taking its closure out of storage so it
    /// may itself call back into the manager (e.g. to fire further events)
    /// without aliasing `self`. Returns `None` if the handler was removed
    /// (e.g. by an earlier handler in the same dispatch cycle).
    ///
    /// A handler may call [`Manager::request_self_removal`] to have itself
    /// removed the moment it returns — its own slot is still taken out of
    /// storage while it runs, so it cannot call [`Manager::remove_handler`]
    /// on its own id directly; this flag defers that removal to right after
    /// the slot is restored below.
    pub(crate) fn invoke_handler(&mut self, id: HandlerId, event: &dyn Event) -> Option<HandlerResult> {
        let mut slot = self.handlers.get_mut(id.0 as usize).and_then(Option::take)?;
        self.self_removal_requested = false;
        let result = (slot.closure)(event, self);
        let remove_self = std::mem::take(&mut self.self_removal_requested);
        if let Some(cell) = self.handlers.get_mut(id.0 as usize) {
            *cell = Some(slot);
        }
        if remove_self {
            let _ = self.remove_handler(id);
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_name_and_channel_is_global() {
        let mut m = Manager::new(ManagerConfig::default());
        let meta = HandlerMeta {
            names: vec![],
            channel: None,
            priority: 0,
            filter: false,
            pass_event: true,
            owner: Manager::root(),
        };
        m.add_handler(Manager::root(), meta, Box::new(|_, _| Ok(HandlerOutcome::None)));
        assert_eq!(m.nodes[0].registry.globals.len(), 1);
        assert!(m.nodes[0].registry.name_wildcards.is_empty());
    }

    #[test]
    fn wildcard_name_specific_channel_is_name_wildcard() {
        let mut m = Manager::new(ManagerConfig::default());
        let meta = HandlerMeta {
            names: vec![],
            channel: Some(Channel::named("x")),
            priority: 0,
            filter: false,
            pass_event: true,
            owner: Manager::root(),
        };
        m.add_handler(Manager::root(), meta, Box::new(|_, _| Ok(HandlerOutcome::None)));
        assert!(m.nodes[0].registry.globals.is_empty());
        assert_eq!(m.nodes[0].registry.name_wildcards.len(), 1);
    }

    #[test]
    fn remove_unknown_handler_is_an_error() {
        let mut m = Manager::new(ManagerConfig::default());
        let err = m.remove_handler(HandlerId(42)).unwrap_err();
        assert!(matches!(err, ManagerError::UnknownHandler(_)));
    }
}
