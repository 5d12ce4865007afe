//! The component tree: an arena of nodes owned by one root [`Manager`].
//!
//! Every component is a [`ComponentId`] — a handle into the arena the root
//! `Manager` owns — rather than a separate Rust object. This makes "every
//! component's root transitively resolves to the one root manager" true by
//! construction: there is exactly one `Manager` value per tree, and every
//! node lives inside it.
use crate::*;
use std::collections::VecDeque;
use std::time::Duration;

/// Identifies a node in a [`Manager`]'s component tree. Index `0` is always
/// the root.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub(crate) u32);

/// Identifies a registered tick callable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TickId(pub(crate) u32);

/// A periodic callable a component exposes, advanced once per [`Manager::tick`].
pub type TickClosure = Box<dyn FnMut(&mut Manager) -> Result<(), crate::error::DynError> + Send>;

pub(crate) struct TickSlot {
    pub(crate) owner: ComponentId,
    pub(crate) closure: TickClosure,
}

pub(crate) struct NodeSlot {
    pub(crate) parent: Option<ComponentId>,
    pub(crate) children: Vec<ComponentId>,
    pub(crate) channel: Channel,
    pub(crate) registry: HandlerRegistry,
    pub(crate) ticks: Vec<TickId>,
    /// Set by [`Manager::unregister_child`]; a detached node's id stays
    /// indexable in the arena (tasks/handlers may still reference it) but
    /// is no longer "in" the tree — see [`Manager::contains`].
    pub(crate) detached: bool,
}

/// Idle tick quantum and default channel.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// How long [`Manager::tick`] sleeps when both the queue and the tick
    /// set are empty. Defaults to 10ms.
    pub idle_quantum: Duration,
    /// The channel a newly registered component starts on.
    pub default_channel: Channel,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            idle_quantum: Duration::from_millis(10),
            default_channel: Channel::Any,
        }
    }
}

/// The root of a component tree: owns every node's handler registry, the
/// event queue, the resolution cache, the task set, and the tick set.
pub struct Manager {
    pub(crate) config: ManagerConfig,
    pub(crate) nodes: Vec<NodeSlot>,
    pub(crate) handlers: Vec<Option<HandlerSlot>>,
    pub(crate) ticks: Vec<Option<TickSlot>>,
    pub(crate) tick_order: Vec<TickId>,
    pub(crate) queue: VecDeque<QueuedEvent>,
    pub(crate) cache: HashMap<crate::manager::CacheKey, Vec<HandlerId>>,
    pub(crate) tasks: Vec<Option<TaskSlot>>,
    pub(crate) pending: Vec<Option<crate::manager::PendingEvent>>,
    pub(crate) running: bool,
    /// The [`PendingEventId`](crate::manager::PendingEventId) currently
    /// being dispatched, valid only for the duration of the handler-loop in
    /// [`Manager::dispatch`](crate::manager::Manager::dispatch) — lets an
    /// ephemeral handler (e.g. [`Wait`](crate::manager::Wait)'s) flip
    /// `alert_done` on the very event it was invoked for.
    pub(crate) current_dispatch: Option<crate::manager::PendingEventId>,
    /// Set by [`Manager::request_self_removal`] while a handler is running;
    /// checked by [`Manager::invoke_handler`](crate::handler::Manager::invoke_handler)
    /// right after the handler's closure is restored into storage, so a
    /// handler may remove itself mid-invocation without racing its own
    /// take-then-restore slot (spec §4.7 `_on_event` removing itself the
    /// moment it first runs).
    pub(crate) self_removal_requested: bool,
    /// Receives captured signal numbers once [`Manager::run`] installs
    /// handlers for them; drained once per [`Manager::tick`].
    pub(crate) signal_rx: Option<std::sync::mpsc::Receiver<i32>>,
}

impl Manager {
    /// Creates a fresh tree with a single root node.
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            nodes: vec![NodeSlot {
                parent: None,
                children: Vec::new(),
                channel: config.default_channel.clone(),
                registry: HandlerRegistry::default(),
                ticks: Vec::new(),
                detached: false,
            }],
            config,
            handlers: Vec::new(),
            ticks: Vec::new(),
            tick_order: Vec::new(),
            queue: VecDeque::new(),
            cache: HashMap::new(),
            tasks: Vec::new(),
            pending: Vec::new(),
            running: false,
            current_dispatch: None,
            self_removal_requested: false,
            signal_rx: None,
        }
    }

    /// The root's [`ComponentId`]; always index `0`.
    pub fn root() -> ComponentId {
        ComponentId(0)
    }

    /// True once `stop()` has not yet been called on a `run`/`start`ed manager.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// True if `id` is (still) part of this tree, i.e. its node exists and
    /// has not been detached via [`Manager::unregister_child`].
    pub fn contains(&self, id: ComponentId) -> bool {
        self.nodes.get(id.0 as usize).map(|n| !n.detached).unwrap_or(false)
    }

    /// The number of events currently queued.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// The channel a component is currently registered on.
    pub fn channel_of(&self, id: ComponentId) -> Option<Channel> {
        self.nodes.get(id.0 as usize).map(|n| n.channel.clone())
    }

    pub(crate) fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub(crate) fn recompute_ticks(&mut self) {
        let mut order = Vec::new();
        for node in &self.nodes {
            order.extend(node.ticks.iter().copied());
        }
        self.tick_order = order;
    }

    /// Attaches a new child under `parent` on the given channel, clearing
    /// the cache and recomputing the tick set.
    pub fn register_child(&mut self, parent: ComponentId, channel: Channel) -> ComponentId {
        let id = ComponentId(self.nodes.len() as u32);
        self.nodes.push(NodeSlot {
            parent: Some(parent),
            children: Vec::new(),
            channel,
            registry: HandlerRegistry::default(),
            ticks: Vec::new(),
            detached: false,
        });
        self.nodes[parent.0 as usize].children.push(id);
        self.clear_cache();
        self.recompute_ticks();
        debug!("registered component {id:?} under {parent:?}");
        id
    }

    /// Detaches `id` from its parent. Its handlers and ticks remain
    /// registered but stop receiving tree-wide dispatch once no live
    /// ancestor path reaches them; re-attach via [`Manager::register_child`]
    /// is not supported for an already-used id (build a new [`OrphanComponent`]
    /// instead).
    ///
    /// Returns [`ManagerError::CannotUnregisterRoot`] for the root, and
    /// [`ManagerError::UnknownComponent`] if `id` is unknown or already
    /// detached.
    pub fn unregister_child(&mut self, id: ComponentId) -> Result<(), ManagerError> {
        if id == Self::root() {
            return Err(ManagerError::CannotUnregisterRoot);
        }
        let node = self.nodes.get(id.0 as usize).ok_or(ManagerError::UnknownComponent(id))?;
        if node.detached {
            return Err(ManagerError::UnknownComponent(id));
        }
        let parent = node.parent.ok_or(ManagerError::UnknownComponent(id))?;

        self.nodes[parent.0 as usize].children.retain(|c| *c != id);
        self.nodes[id.0 as usize].parent = None;
        self.nodes[id.0 as usize].detached = true;
        self.clear_cache();
        self.recompute_ticks();
        debug!("unregistered component {id:?} from {parent:?}");
        Ok(())
    }

    /// Attaches a detached [`OrphanComponent`], migrating any events it
    /// pre-queued into the root's queue in their original relative order.
    pub fn attach_orphan(&mut self, parent: ComponentId, orphan: OrphanComponent) -> ComponentId {
        let id = self.register_child(parent, orphan.channel);
        for (meta, closure) in orphan.handlers {
            let mut meta = meta;
            meta.owner = id;
            self.add_handler(id, meta, closure);
        }
        for closure in orphan.ticks {
            self.add_tick(id, closure);
        }
        for queued in orphan.queue {
            self.queue.push_back(queued);
        }
        id
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Manager")
            .field("components", &self.nodes.len())
            .field("queued", &self.queue.len())
            .field("running", &self.running)
            .finish()
    }
}

/// A component built before it has a parent: handlers, ticks and even fired
/// events can be queued up, then migrated atomically into a tree via
/// [`Manager::attach_orphan`], preserving the relative order of any events
/// already queued on it.
#[derive(Default)]
pub struct OrphanComponent {
    channel: Channel,
    handlers: Vec<(HandlerMeta, HandlerClosure)>,
    ticks: Vec<TickClosure>,
    queue: VecDeque<QueuedEvent>,
}

impl Default for Channel {
    fn default() -> Self {
        Channel::Any
    }
}

impl OrphanComponent {
    /// Creates a detached component on the given channel.
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            handlers: Vec::new(),
            ticks: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    /// Queues a handler descriptor to be registered once attached.
    ///
    /// `meta.owner` is overwritten with the real [`ComponentId`] at attach
    /// time; any value may be supplied here.
    pub fn on(&mut self, meta: HandlerMeta, closure: HandlerClosure) -> &mut Self {
        self.handlers.push((meta, closure));
        self
    }

    /// Queues a tick callable to be registered once attached.
    pub fn add_tick(&mut self, closure: TickClosure) -> &mut Self {
        self.ticks.push(closure);
        self
    }

    /// Fires an event before this component has a root to dispatch through.
    /// The returned [`ValueHandle`] stays valid and becomes live once the
    /// event is actually dispatched after attaching.
    pub fn fire(&mut self, event: Box<dyn Event>, channels: Option<Vec<Channel>>, opts: FireOptions) -> ValueHandle {
        let channels = channels
            .filter(|c| !c.is_empty())
            .or_else(|| event.channels().filter(|c| !c.is_empty()))
            .unwrap_or_else(|| vec![self.channel.clone()]);
        let value = ValueHandle::new();
        self.queue.push_back(QueuedEvent {
            event,
            channels,
            opts,
            value: value.clone(),
        });
        value
    }
}

/// Descriptor-style registration surface returned by
/// [`Manager::build_child`], standing in for dynamic handler-discovery
/// introspection with an explicit, statically-typed registration call.
pub struct ComponentBuilder<'m> {
    manager: &'m mut Manager,
    id: ComponentId,
}

impl<'m> ComponentBuilder<'m> {
    /// The id of the component under construction.
    pub fn id(&self) -> ComponentId {
        self.id
    }

    /// Registers a handler against the component being built.
    pub fn on(
        &mut self,
        names: Vec<Arc<str>>,
        channel: Option<Channel>,
        priority: i32,
        filter: bool,
        pass_event: bool,
        closure: HandlerClosure,
    ) -> HandlerId {
        let meta = HandlerMeta {
            names,
            channel,
            priority,
            filter,
            pass_event,
            owner: self.id,
        };
        self.manager.add_handler(self.id, meta, closure)
    }

    /// Registers a tick callable against the component being built.
    pub fn add_tick(&mut self, closure: TickClosure) -> TickId {
        self.manager.add_tick(self.id, closure)
    }

    /// Overrides the component's channel after creation.
    pub fn channel(&mut self, channel: Channel) -> &mut Self {
        self.manager.nodes[self.id.0 as usize].channel = channel;
        self.manager.clear_cache();
        self
    }
}

impl Manager {
    /// Registers a new child and returns a builder for attaching its
    /// handlers and ticks.
    pub fn build_child(&mut self, parent: ComponentId, channel: Channel) -> ComponentBuilder<'_> {
        let id = self.register_child(parent, channel);
        ComponentBuilder { manager: self, id }
    }
}

/// Ergonomic, struct-based registration sugar for downstream components.
///
/// This crate implements the dispatch core, not concrete transport
/// components, but it still needs to expose a trait so any such component —
/// built elsewhere — has one to implement.
pub trait Component {
    /// The channel this component registers on; defaults to wildcard.
    fn channel(&self) -> Channel {
        Channel::Any
    }

    /// Called once, immediately after the component's node is created, to
    /// register its handlers and ticks.
    fn mount(&self, builder: &mut ComponentBuilder);
}

impl Manager {
    /// Registers a [`Component`] under `parent`, invoking its `mount` hook.
    pub fn register_component<C: Component>(&mut self, parent: ComponentId, component: &C) -> ComponentId {
        let mut builder = self.build_child(parent, component.channel());
        component.mount(&mut builder);
        builder.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn register_child_sets_parent_and_clears_cache() {
        let mut m = Manager::new(ManagerConfig::default());
        let child = m.register_child(Manager::root(), Channel::named("x"));
        assert_eq!(m.nodes[child.0 as usize].parent, Some(Manager::root()));
        assert!(m.nodes[0].children.contains(&child));
    }

    #[test]
    fn cannot_unregister_root() {
        let mut m = Manager::new(ManagerConfig::default());
        let err = m.unregister_child(Manager::root()).unwrap_err();
        assert!(matches!(err, ManagerError::CannotUnregisterRoot));
    }

    #[test]
    fn unregister_unknown_component_is_an_error() {
        let mut m = Manager::new(ManagerConfig::default());
        let err = m.unregister_child(ComponentId(99)).unwrap_err();
        assert!(matches!(err, ManagerError::UnknownComponent(_)));
    }

    #[test]
    fn contains_reflects_live_ids() {
        let mut m = Manager::new(ManagerConfig::default());
        let child = m.register_child(Manager::root(), Channel::Any);
        assert!(m.contains(child));
        assert!(!m.contains(ComponentId(50)));
    }

    #[test]
    fn contains_is_false_after_unregister() {
        let mut m = Manager::new(ManagerConfig::default());
        let child = m.register_child(Manager::root(), Channel::Any);
        assert!(m.contains(child));
        m.unregister_child(child).unwrap();
        assert!(!m.contains(child));
    }

    define_event! {
        #[derive(Debug)]
        pub struct First;
    }

    define_event! {
        #[derive(Debug)]
        pub struct Second;
    }

    #[test]
    fn events_queued_before_attach_dispatch_in_original_order() {
        let mut m = Manager::new(ManagerConfig::default());
        let root = Manager::root();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut orphan = OrphanComponent::new(Channel::Any);
        orphan.fire(Box::new(First), None, FireOptions::default());
        orphan.fire(Box::new(Second), None, FireOptions::default());

        let o = order.clone();
        m.add_handler(
            root,
            HandlerMeta {
                names: vec![],
                channel: None,
                priority: 0,
                filter: false,
                pass_event: true,
                owner: root,
            },
            Box::new(move |event, _m| {
                o.lock().unwrap().push(event.event_name().to_string());
                Ok(HandlerOutcome::None)
            }),
        );

        m.attach_orphan(root, orphan);
        m.tick();

        assert_eq!(*order.lock().unwrap(), vec!["First", "Second"]);
    }
}
