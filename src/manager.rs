//! The dispatcher: resolution + cache, `fire`, `tick`, `run`, `start`/`stop`,
//! and the `wait`/`call` rendezvous primitives.
use crate::*;
use std::error::Error as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Mutex;

/// Identifies an event actively moving through one dispatch cycle: created
/// when a [`QueuedEvent`] is dequeued, freed once [`Manager::event_done`]
/// fires (spec §3 "Event" lifetime: "freed after dispatch completes and all
/// descendant tasks complete").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingEventId(pub(crate) u32);

/// Bookkeeping for an event during its active dispatch: everything
/// [`Manager::dispatch`] and the task scheduler need *after* the original
/// `Box<dyn Event>` has been consumed by its handlers. The boxed event
/// itself is not retained here — see `DESIGN.md` "PendingEvent vs. Event".
pub(crate) struct PendingEvent {
    pub(crate) channels: Vec<Channel>,
    pub(crate) opts: FireOptions,
    pub(crate) value: ValueHandle,
    pub(crate) waiting_handlers: u32,
    pub(crate) name: Arc<str>,
}

/// The dispatch cache key: an event name plus its *normalized* channel set
/// (sorted + deduped, since `Channel: Ord`) so that channel-tuple order
/// never causes a spurious cache miss (spec §9 "Cache key identity").
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    name: Arc<str>,
    channels: Vec<Channel>,
}

impl Manager {
    fn normalized_channels(channels: &[Channel]) -> Vec<Channel> {
        let mut out = channels.to_vec();
        out.sort();
        out.dedup();
        out
    }

    pub(crate) fn current_dispatch(&self) -> Option<PendingEventId> {
        self.current_dispatch
    }

    /// Flips `alert_done` on the event currently being dispatched, if any.
    /// The mechanism behind [`Wait`]'s ephemeral "flip alert_done" handler
    /// (spec §4.7): since that handler runs *as a handler of* the very event
    /// being waited for, `current_dispatch` names exactly that event.
    pub(crate) fn request_done_alert(&mut self) {
        if let Some(id) = self.current_dispatch {
            if let Some(p) = self.pending.get_mut(id.0 as usize).and_then(Option::as_mut) {
                p.opts.alert_done = true;
            }
        }
    }

    /// The [`ValueHandle`] of the event currently being dispatched, if any —
    /// used by [`Wait`] to capture *which* firing of its event name it
    /// observed, so its companion `<name>Done` handler can later tell that
    /// firing apart from an unrelated one of the same name (spec §4.7,
    /// mirroring `state['event'] == source` in `manager.py`).
    pub(crate) fn current_dispatch_value(&self) -> Option<ValueHandle> {
        let id = self.current_dispatch?;
        self.pending.get(id.0 as usize).and_then(Option::as_ref).map(|p| p.value.clone())
    }

    /// Requests that the handler currently running be removed the moment it
    /// returns (spec §4.7 `_on_event` removing itself the moment it first
    /// runs). A no-op outside of a handler invocation.
    pub fn request_self_removal(&mut self) {
        self.self_removal_requested = true;
    }
}

// --- Fire / Enqueue (spec §4.3) -------------------------------------------

impl Manager {
    /// Determines the effective channel tuple, allocates a fresh
    /// [`ValueHandle`], and appends `(event, channels)` to the **root's**
    /// queue. Never dispatches synchronously; returns the placeholder value
    /// immediately (spec §4.3).
    pub fn fire(
        &mut self,
        origin: ComponentId,
        event: Box<dyn Event>,
        channels: Option<Vec<Channel>>,
        opts: FireOptions,
    ) -> ValueHandle {
        if !self.contains(origin) {
            warn!("fire() origin {origin:?} is no longer part of the tree; routing against the live root anyway");
        }
        let origin_channel = self
            .nodes
            .get(origin.0 as usize)
            .map(|n| n.channel.clone())
            .unwrap_or(Channel::Any);

        let channels = channels
            .filter(|c| !c.is_empty())
            .or_else(|| event.channels().filter(|c| !c.is_empty()))
            .unwrap_or_else(|| vec![origin_channel]);

        let value = ValueHandle::new();
        if !event.is_silent() {
            trace!("fire {:?} on {:?}", event.event_name(), channels);
        }
        self.queue.push_back(QueuedEvent {
            event,
            channels,
            opts,
            value: value.clone(),
        });
        value
    }

    /// Fires a synthesized lifecycle event directly against the given
    /// channels, bypassing the normal origin-channel resolution — used for
    /// `Started`/`Stopped`/`Error`/`<Name>Done`/`<Name>Success`/`<Name>Failure`.
    pub(crate) fn fire_synthetic(&mut self, event: Box<dyn Event>, channels: Vec<Channel>) -> ValueHandle {
        let value = ValueHandle::new();
        self.queue.push_back(QueuedEvent {
            event,
            channels,
            opts: FireOptions::default(),
            value: value.clone(),
        });
        value
    }
}

// --- Handler Resolution (spec §4.4) ---------------------------------------

impl Manager {
    fn matches_channel(effective: &Channel, owner: ComponentId, requested: &Channel) -> bool {
        match requested {
            // Rule 4: requested == "*" always matches.
            Channel::Any => true,
            // Rule 4/§9 open question: an instance-targeted channel accepts
            // any handler of that instance regardless of its own channel.
            Channel::Target(id) => *id == owner,
            Channel::Named(_) => effective == requested || effective.is_any(),
        }
    }

    fn collect_handlers_at(&self, node: ComponentId, name: &str, channel: &Channel, out: &mut Vec<HandlerId>) {
        let slot = &self.nodes[node.0 as usize];

        // Rule 5: globals are unconditional, even for instance-targeted dispatch.
        out.extend(slot.registry.globals.iter().copied());

        // Rule 1: wildcard-name handlers bound to a specific channel.
        for &hid in &slot.registry.name_wildcards {
            let meta = self.handler_meta(hid).expect("registry references a live handler");
            let effective = meta.channel.as_ref().unwrap_or(&slot.channel);
            if Self::matches_channel(effective, node, channel) {
                out.push(hid);
            }
        }

        // Rule 2: name-specific handlers.
        if let Some(ids) = slot.registry.by_name.get(name) {
            for &hid in ids {
                let meta = self.handler_meta(hid).expect("registry references a live handler");
                let effective = meta.channel.as_ref().unwrap_or(&slot.channel);
                if Self::matches_channel(effective, node, channel) {
                    out.push(hid);
                }
            }
        }

        for &child in &slot.children {
            self.collect_handlers_at(child, name, channel, out);
        }
    }

    fn order_handlers(&self, mut ids: Vec<HandlerId>) -> Vec<HandlerId> {
        ids.sort_by(|a, b| {
            let ma = self.handler_meta(*a).expect("registry references a live handler");
            let mb = self.handler_meta(*b).expect("registry references a live handler");
            // Descending (priority, filter), deterministic tie-break on
            // ascending HandlerId — spec §5 "Ordering guarantees".
            mb.priority.cmp(&ma.priority).then(mb.filter.cmp(&ma.filter)).then(a.0.cmp(&b.0))
        });
        ids
    }

    /// Collects the ordered handler list for `(name, channels)`, recursing
    /// over the whole tree from the root (spec §4.4).
    pub(crate) fn collect_handlers(&self, name: &str, channels: &[Channel]) -> Vec<HandlerId> {
        let mut found = Vec::new();
        for channel in channels {
            self.collect_handlers_at(Self::root(), name, channel, &mut found);
        }
        found.sort();
        found.dedup();
        self.order_handlers(found)
    }

    /// Resolves `(name, channels)` through the cache, computing and
    /// memoising on a miss (spec §4.4 "Resolution results are ... memoised").
    pub(crate) fn resolve(&mut self, name: Arc<str>, channels: &[Channel]) -> Vec<HandlerId> {
        let key = CacheKey {
            name: name.clone(),
            channels: Self::normalized_channels(channels),
        };
        if let Some(hit) = self.cache.get(&key) {
            return hit.clone();
        }
        let ids = self.collect_handlers(&name, channels);
        self.cache.insert(key, ids.clone());
        ids
    }
}

// --- Dispatcher (spec §4.5) -----------------------------------------------

fn value_is_truthy(value: &(dyn Any + Send)) -> bool {
    match value.downcast_ref::<bool>() {
        Some(b) => *b,
        // Rust has no Python-style truthiness; any stored non-bool value
        // counts as truthy for filter purposes, matching "returns truthy"
        // for ordinary (non-boolean) handler returns.
        None => true,
    }
}

fn error_chain(err: &crate::error::DynError) -> Vec<String> {
    let mut chain = Vec::new();
    let mut cur = err.source();
    while let Some(s) = cur {
        chain.push(s.to_string());
        cur = s.source();
    }
    chain
}

impl Manager {
    fn inc_waiting(&mut self, id: PendingEventId) {
        if let Some(p) = self.pending.get_mut(id.0 as usize).and_then(Option::as_mut) {
            p.waiting_handlers += 1;
        }
    }

    fn dec_waiting(&mut self, id: PendingEventId) {
        let hit_zero = if let Some(p) = self.pending.get_mut(id.0 as usize).and_then(Option::as_mut) {
            p.waiting_handlers = p.waiting_handlers.saturating_sub(1);
            p.waiting_handlers == 0
        } else {
            false
        };
        if hit_zero {
            self.event_done(id);
        }
    }

    /// Reports a trapped handler/task failure as an `Error` event, and as
    /// `<Name>Failure` too if the originating event opted in (spec §7.2/§7.4).
    fn report_error(&mut self, name: &Arc<str>, handler: Option<HandlerId>, err: &crate::error::DynError, opt_in_failure: bool, channels: &[Channel]) {
        error!("error while dispatching {name}: {err}");
        let chain = error_chain(err);
        let err_event = events::ErrorEvent::new(err.to_string(), chain, handler);
        self.fire_synthetic(Box::new(err_event), vec![Channel::Any]);
        if opt_in_failure {
            let failure = events::Failure::create(name, err.to_string());
            self.fire_synthetic(Box::new(failure), channels.to_vec());
        }
    }

    /// The single completion gate (spec §4.5 `_eventDone`): a no-op while
    /// `waiting_handlers > 0`; otherwise informs the [`ValueHandle`] and
    /// fires the opted-in lifecycle events, then frees the pending slot.
    pub(crate) fn event_done(&mut self, id: PendingEventId) {
        let (name, opts, value, channels, waiting) = match self.pending.get(id.0 as usize).and_then(Option::as_ref) {
            Some(p) => (p.name.clone(), p.opts, p.value.clone(), p.channels.clone(), p.waiting_handlers),
            None => return,
        };
        if waiting > 0 {
            return;
        }

        value.inform_done();

        if opts.alert_done {
            let done = events::Done::create(&name, value.clone());
            self.fire_synthetic(Box::new(done), channels.clone());
        }
        if opts.success && !value.has_errors() {
            let success = events::Success::create(&name, value.clone());
            self.fire_synthetic(Box::new(success), channels);
        }

        self.pending[id.0 as usize] = None;
    }

    /// Dispatches one queued `(event, channels)` pair: resolves the ordered
    /// handler list, invokes each in order, and handles its outcome (spec §4.5).
    pub(crate) fn dispatch(&mut self, queued: QueuedEvent) {
        let QueuedEvent { event, channels, opts, value } = queued;
        let name: Arc<str> = Arc::from(event.event_name());
        let silent = event.is_silent();

        let pending_id = PendingEventId(self.pending.len() as u32);
        self.pending.push(Some(PendingEvent {
            channels: channels.clone(),
            opts,
            value: value.clone(),
            waiting_handlers: 0,
            name: name.clone(),
        }));

        let ids = self.resolve(name.clone(), &channels);
        if !silent {
            trace!("dispatching {name} to {} candidate handler(s) on {:?}", ids.len(), channels);
        }

        self.current_dispatch = Some(pending_id);
        'handlers: for hid in ids {
            let result = match self.invoke_handler(hid, event.as_ref()) {
                Some(r) => r,
                // The handler was removed by an earlier handler in this
                // same cycle; skip it.
                None => continue,
            };

            let mut truthy = false;
            match result {
                Ok(HandlerOutcome::None) => {}
                Ok(HandlerOutcome::Value(v)) => {
                    truthy = value_is_truthy(v.as_ref());
                    value.set(v);
                }
                Ok(HandlerOutcome::Suspend(step)) => {
                    value.set_promise();
                    self.inc_waiting(pending_id);
                    self.tasks.push(Some(TaskSlot {
                        pending: pending_id,
                        step,
                        parent: None,
                    }));
                }
                Err(err) => {
                    value.set_errors();
                    let fresh_failure_opt_in = self
                        .pending
                        .get(pending_id.0 as usize)
                        .and_then(Option::as_ref)
                        .map(|p| p.opts.failure)
                        .unwrap_or(false);
                    self.report_error(&name, Some(hid), &err, fresh_failure_opt_in, &channels);
                }
            }

            let filter = self.handler_meta(hid).map(|m| m.filter).unwrap_or(false);
            if filter && truthy {
                break 'handlers;
            }
        }
        self.current_dispatch = None;

        self.event_done(pending_id);
    }

    /// Swaps the queue for a fresh empty one and dispatches every entry
    /// (spec §4.5 "Per dispatch cycle").
    pub(crate) fn flush_queue(&mut self) {
        let drained = std::mem::take(&mut self.queue);
        for queued in drained {
            self.dispatch(queued);
        }
    }
}

// --- Task Scheduler (spec §4.6) -------------------------------------------

impl Manager {
    /// Advances one task by a single step, acting on its [`StepYield`].
    pub(crate) fn advance_task(&mut self, task_id: TaskId) {
        let slot = match self.tasks.get_mut(task_id.0 as usize).and_then(Option::take) {
            Some(s) => s,
            None => return,
        };
        let TaskSlot { pending, mut step, parent } = slot;

        match step.advance(self) {
            StepYield::Pending => {
                self.tasks[task_id.0 as usize] = Some(TaskSlot { pending, step, parent });
            }
            StepYield::Value(v) => {
                if let Some(p) = self.pending.get(pending.0 as usize).and_then(Option::as_ref) {
                    p.value.set(v);
                }
                self.tasks[task_id.0 as usize] = Some(TaskSlot { pending, step, parent });
            }
            StepYield::Spawn(nested) => {
                // The current task is replaced by a child running `nested`;
                // `step` becomes the child's parent, resumed once the child
                // is exhausted. `waiting_handlers` is incremented for the
                // new child task, and it is primed depth-first immediately.
                self.inc_waiting(pending);
                let child_id = TaskId(self.tasks.len() as u32);
                self.tasks.push(Some(TaskSlot {
                    pending,
                    step: nested,
                    parent: Some(step),
                }));
                self.advance_task(child_id);
            }
            StepYield::Ready => {
                self.dec_waiting(pending);
                if let Some(parent_step) = parent {
                    self.tasks.push(Some(TaskSlot {
                        pending,
                        step: parent_step,
                        parent: None,
                    }));
                }
            }
            StepYield::Err(err) => {
                let (name, channels, failure_opt_in) = match self.pending.get(pending.0 as usize).and_then(Option::as_ref) {
                    Some(p) => (p.name.clone(), p.channels.clone(), p.opts.failure),
                    None => (Arc::from("?"), Vec::new(), false),
                };
                if let Some(p) = self.pending.get_mut(pending.0 as usize).and_then(Option::as_mut) {
                    p.value.set_errors();
                }
                self.report_error(&name, None, &err, failure_opt_in, &channels);
                self.dec_waiting(pending);
                if let Some(parent_step) = parent {
                    self.tasks.push(Some(TaskSlot {
                        pending,
                        step: parent_step,
                        parent: None,
                    }));
                }
            }
        }
    }
}

// --- Tick Set (spec §4.8) --------------------------------------------------

impl Manager {
    /// Registers a tick callable against `owner`, recomputing the root's
    /// tick set (spec §4.8).
    pub fn add_tick(&mut self, owner: ComponentId, closure: TickClosure) -> TickId {
        let id = TickId(self.ticks.len() as u32);
        self.ticks.push(Some(TickSlot { owner, closure }));
        self.nodes[owner.0 as usize].ticks.push(id);
        self.recompute_ticks();
        id
    }

    /// Removes a previously registered tick callable.
    pub fn remove_tick(&mut self, id: TickId) -> Result<(), ManagerError> {
        let slot = self.ticks.get_mut(id.0 as usize).and_then(Option::take).ok_or(ManagerError::UnknownTick(id))?;
        if let Some(node) = self.nodes.get_mut(slot.owner.0 as usize) {
            node.ticks.retain(|t| *t != id);
        }
        self.recompute_ticks();
        Ok(())
    }

    /// One pass of the run loop: periodic callables, then every current
    /// task advanced once, then the queue flushed; if both the queue and
    /// the tick set are empty, sleeps for the configured idle quantum
    /// (spec §4.8).
    pub fn tick(&mut self) {
        if let Some(rx) = &self.signal_rx {
            let mut signals = Vec::new();
            while let Ok(signum) = rx.try_recv() {
                signals.push(signum);
            }
            for signum in signals {
                info!("captured signal {signum}");
                self.fire_synthetic(Box::new(events::Signal { signum }), vec![Channel::Any]);
                self.stop();
            }
        }

        let tick_ids = self.tick_order.clone();
        for tick_id in tick_ids {
            let mut slot = match self.ticks.get_mut(tick_id.0 as usize).and_then(Option::take) {
                Some(s) => s,
                None => continue,
            };
            match (slot.closure)(self) {
                Ok(()) => {}
                Err(err) => {
                    error!("tick {tick_id:?} failed: {err}");
                    let chain = error_chain(&err);
                    let event = events::ErrorEvent::new(err.to_string(), chain, None);
                    self.fire_synthetic(Box::new(event), vec![Channel::Any]);
                }
            }
            if let Some(cell) = self.ticks.get_mut(tick_id.0 as usize) {
                *cell = Some(slot);
            }
        }

        let task_ids: Vec<TaskId> = self
            .tasks
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| TaskId(i as u32)))
            .collect();
        for task_id in task_ids {
            self.advance_task(task_id);
        }

        let was_idle = self.queue.is_empty() && self.tick_order.is_empty();
        self.flush_queue();

        if was_idle {
            std::thread::sleep(self.config.idle_quantum);
        }
    }
}

// --- Run Loop & Lifecycle (spec §4.9) -------------------------------------

/// Returned by [`Manager::start`]: lets the caller request a stop and
/// recover the [`Manager`] (and its state) once the background thread
/// exits, since `start()` moves the whole tree onto a new thread.
pub struct ManagerHandle {
    stop_requested: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<Manager>>,
}

impl ManagerHandle {
    /// Requests that the manager's run loop stop; idempotent.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Blocks until the background thread exits, returning the [`Manager`]
    /// so its final state (e.g. any remaining `ValueHandle`s) can be inspected.
    ///
    /// Panics if the manager's thread itself panicked.
    pub fn join(mut self) -> Manager {
        self.join.take().expect("join() already called").join().expect("manager thread panicked")
    }
}

impl Manager {
    fn install_signal_handlers(&mut self) -> Result<(), crate::error::DynError> {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("sparkbus-signals".into())
            .spawn(move || {
                for signum in signals.forever() {
                    if tx.send(signum).is_err() {
                        break;
                    }
                }
            })?;
        self.signal_rx = Some(rx);
        Ok(())
    }

    /// Idempotent on a stopped manager. Flips `running = false`, fires
    /// `Stopped`, then ticks three times to drain in-flight work (spec §4.9).
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        info!("manager stopping");
        self.fire_synthetic(Box::new(events::Stopped), vec![Channel::Any]);
        for _ in 0..3 {
            self.tick();
        }
    }

    /// Runs the loop in-place on the calling thread: optionally installs
    /// `SIGINT`/`SIGTERM` handlers that fire `Signal` and call `stop()`, sets
    /// `running = true`, fires `Started`, then ticks until `running` is
    /// false and the queue is drained (spec §4.9).
    ///
    /// The source auto-detects whether it's running on the interpreter's
    /// main thread to decide whether to install signal handlers; Rust has
    /// no portable, safe equivalent, so the caller states it explicitly
    /// (see `DESIGN.md`).
    pub fn run(&mut self, install_signal_handlers: bool) -> Result<(), crate::error::DynError> {
        if install_signal_handlers {
            self.install_signal_handlers()?;
        }
        self.running = true;
        info!("manager starting run loop");
        self.fire_synthetic(Box::new(events::Started), vec![Channel::Any]);
        while self.running || !self.queue.is_empty() {
            self.tick();
        }
        Ok(())
    }

    /// Spawns the run loop on a background thread marked as a daemon in
    /// spirit (it is not joined automatically; dropping the returned
    /// [`ManagerHandle`] does not stop the thread) and returns a handle to
    /// request a stop and recover the manager afterwards (spec §4.9
    /// "launches the run loop on a new background thread").
    pub fn start(mut self, install_signal_handlers: bool) -> Result<ManagerHandle, crate::error::DynError> {
        if install_signal_handlers {
            self.install_signal_handlers()?;
        }
        let stop_requested = Arc::new(AtomicBool::new(false));
        let stop_flag = stop_requested.clone();
        let join = std::thread::Builder::new().name("sparkbus-manager".into()).spawn(move || {
            self.running = true;
            self.fire_synthetic(Box::new(events::Started), vec![Channel::Any]);
            while self.running || !self.queue.is_empty() {
                if stop_flag.load(Ordering::SeqCst) && self.running {
                    self.stop();
                }
                self.tick();
            }
            self
        })?;
        Ok(ManagerHandle {
            stop_requested,
            join: Some(join),
        })
    }
}

// --- Rendezvous: wait / call (spec §4.7) ----------------------------------

struct WaitState {
    /// The [`ValueHandle`] of the specific firing of `event_name` the
    /// "source" handler observed — `None` until it has triggered once.
    /// Captured so the "done" handler below can tell *that* firing's
    /// `<name>Done` apart from an unrelated later firing of the same name
    /// (spec §4.7, `state['event'] == source` in `manager.py`).
    source: Option<ValueHandle>,
    /// The matching `<name>Done`'s final value, once it has arrived.
    value: Option<ValueHandle>,
}

/// `wait(event_name, channel)`: a [`Step`] that, once scheduled as a task,
/// installs two ephemeral handlers — one on `event_name` that, the first
/// time it fires, records *which* firing it was and flips that firing's
/// `alert_done` then removes itself (so a second, unrelated firing of the
/// same name never retriggers it); one on `<event_name>Done` that records
/// the final value only when it matches the captured firing — then pauses
/// until that value arrives, yields it once, and uninstalls the remaining
/// handler (spec §4.7, mirroring `waitEvent`'s `_on_event`/`_on_done` in
/// `manager.py`).
pub struct Wait {
    event_name: Arc<str>,
    channel: Channel,
    state: Arc<Mutex<WaitState>>,
    installed: bool,
    source_handler: Option<HandlerId>,
    done_handler: Option<HandlerId>,
    value_yielded: bool,
}

impl Wait {
    /// Waits for the next firing of `event_name` on `channel` to complete.
    pub fn new(event_name: impl Into<Arc<str>>, channel: Channel) -> Self {
        Self {
            event_name: event_name.into(),
            channel,
            state: Arc::new(Mutex::new(WaitState { source: None, value: None })),
            installed: false,
            source_handler: None,
            done_handler: None,
            value_yielded: false,
        }
    }

    fn install(&mut self, manager: &mut Manager) {
        let state = self.state.clone();
        let source = manager.add_handler(
            Manager::root(),
            HandlerMeta {
                names: vec![self.event_name.clone()],
                channel: Some(self.channel.clone()),
                priority: i32::MAX,
                filter: false,
                pass_event: true,
                owner: Manager::root(),
            },
            Box::new(move |_event, m| {
                let mut guard = state.lock().unwrap();
                if guard.source.is_none() {
                    guard.source = m.current_dispatch_value();
                    drop(guard);
                    m.request_done_alert();
                    m.request_self_removal();
                }
                Ok(HandlerOutcome::None)
            }),
        );

        let done_name: Arc<str> = Arc::from(format!("{}Done", self.event_name));
        let state = self.state.clone();
        let done = manager.add_handler(
            Manager::root(),
            HandlerMeta {
                names: vec![done_name],
                channel: None,
                priority: i32::MAX,
                filter: false,
                pass_event: true,
                owner: Manager::root(),
            },
            Box::new(move |event, _m| {
                if let Some(done) = event.downcast_ref::<crate::events::Done>() {
                    let mut guard = state.lock().unwrap();
                    let matches = guard.source.as_ref().is_some_and(|source| source.same_as(&done.value));
                    if matches {
                        guard.value = Some(done.value.clone());
                    }
                }
                Ok(HandlerOutcome::None)
            }),
        );

        self.source_handler = Some(source);
        self.done_handler = Some(done);
    }
}

impl Step for Wait {
    fn advance(&mut self, manager: &mut Manager) -> StepYield {
        if !self.installed {
            self.installed = true;
            self.install(manager);
            return StepYield::Pending;
        }

        if self.value_yielded {
            // The source handler already removed itself (spec §4.7) the
            // moment it first triggered; removing it again here is a no-op
            // we ignore, same as the done handler below.
            if let Some(source) = self.source_handler.take() {
                let _ = manager.remove_handler(source);
            }
            if let Some(done) = self.done_handler.take() {
                let _ = manager.remove_handler(done);
            }
            return StepYield::Ready;
        }

        let ready = self.state.lock().unwrap().value.take();
        match ready {
            None => StepYield::Pending,
            Some(value) => {
                self.value_yielded = true;
                StepYield::Value(Box::new(value))
            }
        }
    }
}

/// `call(event, channels)`: fires `event`, then waits on its name, then
/// yields the firing's [`ValueHandle`] — the composite rendezvous of spec §4.7.
pub struct Call {
    event: Option<Box<dyn Event>>,
    channels: Option<Vec<Channel>>,
    wait: Option<Wait>,
}

impl Call {
    /// Fires `event` on `channels` (or its own channel-resolution default)
    /// and waits for it to complete.
    pub fn new(event: Box<dyn Event>, channels: Option<Vec<Channel>>) -> Self {
        Self {
            event: Some(event),
            channels,
            wait: None,
        }
    }
}

impl Step for Call {
    fn advance(&mut self, manager: &mut Manager) -> StepYield {
        if let Some(event) = self.event.take() {
            let name: Arc<str> = Arc::from(event.event_name());
            let channel = self.channels.as_ref().and_then(|c| c.first().cloned()).unwrap_or(Channel::Any);
            manager.fire(Manager::root(), event, self.channels.take(), FireOptions::all());

            // Install the wait's ephemeral handlers *now*, in the same step
            // as the fire, so they are live before this tick's queue flush
            // dispatches the very event we just fired (spec §4.7 "fire
            // once, then wait" happens within one continuation step, not
            // across a tick boundary).
            let mut wait = Wait::new(name, channel);
            wait.advance(manager);
            self.wait = Some(wait);
            return StepYield::Pending;
        }

        match &mut self.wait {
            Some(wait) => wait.advance(manager),
            None => StepYield::Ready,
        }
    }
}

impl Manager {
    /// Convenience constructor for [`Wait`] (spec §4.7 `wait`).
    pub fn wait(event_name: impl Into<Arc<str>>, channel: Channel) -> Wait {
        Wait::new(event_name, channel)
    }

    /// Convenience constructor for [`Call`] (spec §4.7 `call`).
    pub fn call(event: Box<dyn Event>, channels: Option<Vec<Channel>>) -> Call {
        Call::new(event, channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ManagerConfig;

    define_event! {
        #[derive(Debug)]
        pub struct Ping;
    }

    define_event! {
        #[derive(Debug)]
        pub struct Echo;
    }

    define_event! {
        #[derive(Debug)]
        pub struct Boom;
    }

    #[test]
    fn fifo_queue_dispatches_in_fire_order() {
        let mut m = Manager::new(ManagerConfig::default());
        let root = Manager::root();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        m.add_handler(
            root,
            HandlerMeta {
                names: vec![Arc::from("Ping")],
                channel: None,
                priority: 0,
                filter: false,
                pass_event: true,
                owner: root,
            },
            Box::new(move |_e, _m| {
                o1.lock().unwrap().push("ping");
                Ok(HandlerOutcome::None)
            }),
        );
        let o2 = order.clone();
        m.add_handler(
            root,
            HandlerMeta {
                names: vec![Arc::from("Echo")],
                channel: None,
                priority: 0,
                filter: false,
                pass_event: true,
                owner: root,
            },
            Box::new(move |_e, _m| {
                o2.lock().unwrap().push("echo");
                Ok(HandlerOutcome::None)
            }),
        );

        m.fire(root, Box::new(Ping), None, FireOptions::default());
        m.fire(root, Box::new(Echo), None, FireOptions::default());
        m.tick();

        assert_eq!(*order.lock().unwrap(), vec!["ping", "echo"]);
    }

    #[test]
    fn priority_order_runs_high_priority_first() {
        let mut m = Manager::new(ManagerConfig::default());
        let root = Manager::root();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        m.add_handler(
            root,
            HandlerMeta {
                names: vec![Arc::from("Ping")],
                channel: None,
                priority: 1,
                filter: false,
                pass_event: true,
                owner: root,
            },
            Box::new(move |_e, _m| {
                o1.lock().unwrap().push("B");
                Ok(HandlerOutcome::None)
            }),
        );
        let o2 = order.clone();
        m.add_handler(
            root,
            HandlerMeta {
                names: vec![Arc::from("Ping")],
                channel: None,
                priority: 10,
                filter: false,
                pass_event: true,
                owner: root,
            },
            Box::new(move |_e, _m| {
                o2.lock().unwrap().push("A");
                Ok(HandlerOutcome::None)
            }),
        );

        m.fire(root, Box::new(Ping), None, FireOptions::default());
        m.tick();

        assert_eq!(*order.lock().unwrap(), vec!["A", "B"]);
    }

    #[test]
    fn filter_handler_short_circuits_lower_priority_handlers() {
        let mut m = Manager::new(ManagerConfig::default());
        let root = Manager::root();
        let order = Arc::new(Mutex::new(Vec::new()));

        m.add_handler(
            root,
            HandlerMeta {
                names: vec![Arc::from("Ping")],
                channel: None,
                priority: 10,
                filter: true,
                pass_event: true,
                owner: root,
            },
            Box::new(|_e, _m| Ok(HandlerOutcome::Value(Box::new(true)))),
        );
        let o1 = order.clone();
        m.add_handler(
            root,
            HandlerMeta {
                names: vec![Arc::from("Ping")],
                channel: None,
                priority: 1,
                filter: false,
                pass_event: true,
                owner: root,
            },
            Box::new(move |_e, _m| {
                o1.lock().unwrap().push("unreachable");
                Ok(HandlerOutcome::None)
            }),
        );

        m.fire(root, Box::new(Ping), None, FireOptions::default());
        m.tick();

        assert!(order.lock().unwrap().is_empty());
    }

    #[test]
    fn call_round_trip_yields_the_handlers_return_value() {
        let mut m = Manager::new(ManagerConfig::default());
        let root = Manager::root();
        let x = m.register_child(root, Channel::named("x"));
        m.add_handler(
            x,
            HandlerMeta {
                names: vec![Arc::from("Echo")],
                channel: None,
                priority: 0,
                filter: false,
                pass_event: true,
                owner: x,
            },
            Box::new(|_event, _m| Ok(HandlerOutcome::Value(Box::new("hi".to_string())))),
        );

        m.add_handler(
            root,
            HandlerMeta {
                names: vec![Arc::from("Ping")],
                channel: None,
                priority: 0,
                filter: false,
                pass_event: true,
                owner: root,
            },
            Box::new(|_event, _m| {
                Ok(HandlerOutcome::Suspend(Box::new(Manager::call(
                    Box::new(Echo),
                    Some(vec![Channel::named("x")]),
                ))))
            }),
        );

        // `call()` yields the firing's own `ValueHandle` (spec §4.7 "then
        // yield the firing's Value"), so the outer `Ping` event's value
        // holds a `ValueHandle`, not the `String` directly.
        let value = m.fire(root, Box::new(Ping), None, FireOptions::default());
        for _ in 0..10 {
            m.tick();
        }
        let echo_value = value.get::<ValueHandle>().expect("call() yields the firing's ValueHandle");
        assert_eq!(echo_value.get::<String>(), Some("hi".to_string()));
    }

    #[test]
    fn boom_handler_error_fires_error_and_optional_failure() {
        let mut m = Manager::new(ManagerConfig::default());
        let root = Manager::root();
        let saw_error = Arc::new(Mutex::new(false));
        let saw_failure = Arc::new(Mutex::new(false));

        m.add_handler(
            root,
            HandlerMeta {
                names: vec![Arc::from("Boom")],
                channel: None,
                priority: 0,
                filter: false,
                pass_event: true,
                owner: root,
            },
            Box::new(|_event, _m| Err("kaboom".into())),
        );

        let se = saw_error.clone();
        m.add_handler(
            root,
            HandlerMeta {
                names: vec![Arc::from("Error")],
                channel: None,
                priority: 0,
                filter: false,
                pass_event: true,
                owner: root,
            },
            Box::new(move |_event, _m| {
                *se.lock().unwrap() = true;
                Ok(HandlerOutcome::None)
            }),
        );

        let sf = saw_failure.clone();
        m.add_handler(
            root,
            HandlerMeta {
                names: vec![Arc::from("BoomFailure")],
                channel: None,
                priority: 0,
                filter: false,
                pass_event: true,
                owner: root,
            },
            Box::new(move |_event, _m| {
                *sf.lock().unwrap() = true;
                Ok(HandlerOutcome::None)
            }),
        );

        let mut opts = FireOptions::default();
        opts.failure = true;
        m.fire(root, Box::new(Boom), None, opts);
        m.tick();
        m.tick();

        assert!(*saw_error.lock().unwrap());
        assert!(*saw_failure.lock().unwrap());
    }

    #[test]
    fn stop_on_a_stopped_manager_is_a_no_op() {
        let mut m = Manager::new(ManagerConfig::default());
        assert!(!m.is_running());
        m.stop();
        assert!(!m.is_running());
    }

    #[test]
    fn adding_a_handler_invalidates_the_resolution_cache() {
        let mut m = Manager::new(ManagerConfig::default());
        let root = Manager::root();
        let seen = Arc::new(Mutex::new(0));

        // Prime the cache with a resolution that finds no handlers.
        m.fire(root, Box::new(Ping), None, FireOptions::default());
        m.tick();
        assert_eq!(*seen.lock().unwrap(), 0);

        let s = seen.clone();
        m.add_handler(
            root,
            HandlerMeta {
                names: vec![Arc::from("Ping")],
                channel: None,
                priority: 0,
                filter: false,
                pass_event: true,
                owner: root,
            },
            Box::new(move |_e, _m| {
                *s.lock().unwrap() += 1;
                Ok(HandlerOutcome::None)
            }),
        );

        m.fire(root, Box::new(Ping), None, FireOptions::default());
        m.tick();
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn removing_a_handler_invalidates_the_resolution_cache() {
        let mut m = Manager::new(ManagerConfig::default());
        let root = Manager::root();
        let seen = Arc::new(Mutex::new(0));
        let s = seen.clone();

        let id = m.add_handler(
            root,
            HandlerMeta {
                names: vec![Arc::from("Ping")],
                channel: None,
                priority: 0,
                filter: false,
                pass_event: true,
                owner: root,
            },
            Box::new(move |_e, _m| {
                *s.lock().unwrap() += 1;
                Ok(HandlerOutcome::None)
            }),
        );

        m.fire(root, Box::new(Ping), None, FireOptions::default());
        m.tick();
        assert_eq!(*seen.lock().unwrap(), 1);

        m.remove_handler(id).unwrap();
        m.fire(root, Box::new(Ping), None, FireOptions::default());
        m.tick();
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn wait_resumes_after_the_awaited_events_done_fires() {
        let mut m = Manager::new(ManagerConfig::default());
        let root = Manager::root();
        let resumed = Arc::new(Mutex::new(false));

        m.add_handler(
            root,
            HandlerMeta {
                names: vec![Arc::from("Echo")],
                channel: None,
                priority: 0,
                filter: false,
                pass_event: true,
                owner: root,
            },
            Box::new(|_event, _m| Ok(HandlerOutcome::None)),
        );

        let r = resumed.clone();
        m.add_handler(
            root,
            HandlerMeta {
                names: vec![Arc::from("Ping")],
                channel: None,
                priority: 0,
                filter: false,
                pass_event: true,
                owner: root,
            },
            Box::new(move |_event, _m| {
                let r = r.clone();
                Ok(HandlerOutcome::Suspend(Box::new(WaitThenMark { wait: Manager::wait("Echo", Channel::Any), resumed: r })))
            }),
        );

        // `wait` only catches a firing of "Echo" that happens *after* its
        // handlers are installed (spec §4.7's `_on_event` mirrors the
        // generator being live before the awaited event arrives), so `Ping`
        // is fired and ticked through far enough to get its task's `Wait`
        // installed before `Echo` is fired at all.
        m.fire(root, Box::new(Ping), None, FireOptions::default());
        m.tick();
        m.tick();

        let mut opts = FireOptions::default();
        opts.alert_done = true;
        m.fire(root, Box::new(Echo), None, opts);
        for _ in 0..10 {
            m.tick();
        }

        assert!(*resumed.lock().unwrap());
    }

    struct WaitThenMark {
        wait: Wait,
        resumed: Arc<Mutex<bool>>,
    }

    impl Step for WaitThenMark {
        fn advance(&mut self, manager: &mut Manager) -> StepYield {
            match self.wait.advance(manager) {
                StepYield::Value(v) => {
                    *self.resumed.lock().unwrap() = true;
                    StepYield::Value(v)
                }
                other => other,
            }
        }
    }
}
