//! Event pipes: a small, synchronous publish/subscribe graph.
//!
//! A [`EventPipe`] is a cheaply clonable handle to a pipe stage. Sending an event runs the stage's
//! logic (plain, filter, process, commit counting, ...) and then delivers the event to the
//! stage's subscribers and connected pipes, in the order in which they were attached. Handlers may
//! send further events from inside a handler; those are fully dispatched before the outer send
//! continues.
//!
//! Commits bracket a logical transaction. [`CommitScope`] sends [`CommitEvent::Begin`] when
//! created and [`CommitEvent::End`] when dropped. Plain pipes see every (nested) pair, commit pipes
//! ([`EventPipe::commit`]) only the outermost one, and optimized commit pipes
//! ([`EventPipe::optimized_commit`]) additionally hold back the events of a commit in a caller
//! defined accumulator and re-emit them, deduplicated, after the outermost commit ends.

use crate::dataflow::DataFlowEvent;
use crate::ircode::IRcodeEvent;
use crate::structure::StructureEvent;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// Commit bracket markers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitEvent {
    Begin,
    End,
}

/// Anything that can flow through an [`EventPipe`]: it must be able to carry commit markers.
pub trait PipeEvent: 'static {
    fn as_commit(&self) -> Option<CommitEvent>;
    fn from_commit(event: CommitEvent) -> Self;
}

/// A sub-family of events of `E` that handlers can subscribe to by type.
pub trait Topic<E>: Sized + 'static {
    fn extract(event: &E) -> Option<&Self>;
}

/// All events of the analysis core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Commit(CommitEvent),
    IRcode(IRcodeEvent),
    DataFlow(DataFlowEvent),
    Structure(StructureEvent),
}

impl PipeEvent for Event {
    fn as_commit(&self) -> Option<CommitEvent> {
        match self {
            Event::Commit(c) => Some(*c),
            _ => None,
        }
    }
    fn from_commit(event: CommitEvent) -> Self {
        Event::Commit(event)
    }
}

macro_rules! event_topic {
    ($variant:ident, $ty:ty) => {
        impl Topic<Event> for $ty {
            fn extract(event: &Event) -> Option<&Self> {
                match event {
                    Event::$variant(e) => Some(e),
                    _ => None,
                }
            }
        }
        impl From<$ty> for Event {
            fn from(e: $ty) -> Self {
                Event::$variant(e)
            }
        }
    };
}

event_topic!(Commit, CommitEvent);
event_topic!(IRcode, IRcodeEvent);
event_topic!(DataFlow, DataFlowEvent);
event_topic!(Structure, StructureEvent);

type Handler<E> = Rc<dyn Fn(&E)>;

enum Stage<E> {
    Handler(usize, Handler<E>),
    Pipe(EventPipe<E>),
}

impl<E> Clone for Stage<E> {
    fn clone(&self) -> Self {
        match self {
            Stage::Handler(id, h) => Stage::Handler(*id, h.clone()),
            Stage::Pipe(p) => Stage::Pipe(p.clone()),
        }
    }
}

struct OptimizedCommitState<E> {
    level: Cell<usize>,
    draining: Cell<bool>,
    filter: Box<dyn Fn(&E) -> bool>,
    commit_in: EventPipe<E>,
    output: EventPipe<E>,
    on_commit_end: Box<dyn Fn(&dyn Fn(&E))>,
}

enum PipeKind<E> {
    Plain,
    Filter(Box<dyn Fn(&E) -> bool>),
    Process(Box<dyn Fn(&E, &dyn Fn(&E))>),
    Commit(Cell<usize>),
    OptimizedCommit(OptimizedCommitState<E>),
    Combine {
        input: EventPipe<E>,
        output: EventPipe<E>,
    },
    Conditional {
        condition: Box<dyn Fn(&E) -> bool>,
        then: EventPipe<E>,
        otherwise: EventPipe<E>,
    },
}

struct PipeNode<E> {
    kind: PipeKind<E>,
    stages: RefCell<Vec<Stage<E>>>,
    next_id: Cell<usize>,
}

/// A handle to one stage of an event pipe graph.
pub struct EventPipe<E>(Rc<PipeNode<E>>);

impl<E> Clone for EventPipe<E> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<E> std::fmt::Debug for EventPipe<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let kind = match &self.0.kind {
            PipeKind::Plain => "Plain",
            PipeKind::Filter(_) => "Filter",
            PipeKind::Process(_) => "Process",
            PipeKind::Commit(_) => "Commit",
            PipeKind::OptimizedCommit(_) => "OptimizedCommit",
            PipeKind::Combine { .. } => "Combine",
            PipeKind::Conditional { .. } => "Conditional",
        };
        write!(f, "EventPipe({}, {} stages)", kind, self.0.stages.borrow().len())
    }
}

/// Returned by the subscribe methods; allows removing the handler again.
pub struct Subscription<E> {
    pipe: Weak<PipeNode<E>>,
    id: usize,
}

impl<E> Subscription<E> {
    pub fn unsubscribe(self) {
        if let Some(node) = self.pipe.upgrade() {
            node.stages
                .borrow_mut()
                .retain(|s| !matches!(s, Stage::Handler(id, _) if *id == self.id));
        }
    }
}

impl<E: PipeEvent> Default for EventPipe<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: PipeEvent> EventPipe<E> {
    fn with_kind(kind: PipeKind<E>) -> Self {
        Self(Rc::new(PipeNode {
            kind,
            stages: RefCell::new(vec![]),
            next_id: Cell::new(0),
        }))
    }

    /// A plain pipe, delivering everything it is sent.
    pub fn new() -> Self {
        Self::with_kind(PipeKind::Plain)
    }

    /// A pipe with its own commit nesting counter: only the outermost `Begin`/`End` pair passes.
    pub fn commit() -> Self {
        Self::with_kind(PipeKind::Commit(Cell::new(0)))
    }

    /// A pipe that is sent to through `input` and subscribed to through `output`.
    pub fn combine(input: EventPipe<E>, output: EventPipe<E>) -> Self {
        Self::with_kind(PipeKind::Combine { input, output })
    }

    /// A pipe routing each event to `then` if `condition` holds, and to `otherwise` if not.
    pub fn conditional(
        condition: impl Fn(&E) -> bool + 'static,
        then: EventPipe<E>,
        otherwise: EventPipe<E>,
    ) -> Self {
        Self::with_kind(PipeKind::Conditional {
            condition: Box::new(condition),
            then,
            otherwise,
        })
    }

    /// An optimized commit pipe. Returns the pipe itself and its `commit_in` pipe.
    ///
    /// Events not matching `filter` are dropped. Matching events sent outside of any commit are
    /// passed through immediately. Matching events sent inside a commit are sent to `commit_in`
    /// instead, whose subscribers are expected to accumulate them. Once the outermost commit ends,
    /// `on_commit_end` is called with a `next` callback and should drain the accumulator, emitting
    /// one event per accumulated item. Draining is never re-entered: work queued while draining
    /// (including by nested commits) is picked up by the running drain loop.
    pub fn optimized_commit(
        filter: impl Fn(&E) -> bool + 'static,
        on_commit_end: impl Fn(&dyn Fn(&E)) + 'static,
    ) -> (Self, Self) {
        let commit_in = Self::new();
        let pipe = Self::with_kind(PipeKind::OptimizedCommit(OptimizedCommitState {
            level: Cell::new(0),
            draining: Cell::new(false),
            filter: Box::new(filter),
            commit_in: commit_in.clone(),
            output: Self::new(),
            on_commit_end: Box::new(on_commit_end),
        }));
        (pipe, commit_in)
    }

    /// Is `self` the same pipe stage as `other`
    pub fn same(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// The pipe whose stages receive subscriptions and connections made on `self`.
    fn attach_point(&self) -> EventPipe<E> {
        match &self.0.kind {
            PipeKind::Combine { output, .. } => output.attach_point(),
            PipeKind::OptimizedCommit(state) => state.output.attach_point(),
            _ => self.clone(),
        }
    }

    fn add_stage(&self, stage: Stage<E>) {
        self.0.stages.borrow_mut().push(stage);
    }

    /// Deliver `event` to this stage's subscribers and connected pipes.
    fn deliver(&self, event: &E) {
        if let PipeKind::OptimizedCommit(state) = &self.0.kind {
            state.output.send(event);
            return;
        }
        // Snapshot, so that handlers may (un)subscribe while being run.
        let stages = self.0.stages.borrow().clone();
        for stage in stages {
            match stage {
                Stage::Handler(_, h) => h(event),
                Stage::Pipe(p) => p.send(event),
            }
        }
    }

    /// Send `event` into this pipe.
    pub fn send(&self, event: &E) {
        match &self.0.kind {
            PipeKind::Plain => self.deliver(event),
            PipeKind::Filter(predicate) => {
                if predicate(event) {
                    self.deliver(event)
                }
            }
            PipeKind::Process(f) => f(event, &|e| self.deliver(e)),
            PipeKind::Commit(level) => match event.as_commit() {
                Some(CommitEvent::Begin) => {
                    level.set(level.get() + 1);
                    if level.get() == 1 {
                        self.deliver(event);
                    }
                }
                Some(CommitEvent::End) => {
                    if level.get() == 0 {
                        return;
                    }
                    level.set(level.get() - 1);
                    if level.get() == 0 {
                        self.deliver(event);
                    }
                }
                None => self.deliver(event),
            },
            PipeKind::OptimizedCommit(state) => state.send(event),
            PipeKind::Combine { input, .. } => input.send(event),
            PipeKind::Conditional {
                condition,
                then,
                otherwise,
            } => {
                if condition(event) {
                    then.send(event)
                } else {
                    otherwise.send(event)
                }
            }
        }
    }

    /// Run `handler` on every event reaching this pipe.
    pub fn subscribe(&self, handler: impl Fn(&E) + 'static) -> Subscription<E> {
        let target = self.attach_point();
        let id = target.0.next_id.get();
        target.0.next_id.set(id + 1);
        target.add_stage(Stage::Handler(id, Rc::new(handler)));
        Subscription {
            pipe: Rc::downgrade(&target.0),
            id,
        }
    }

    /// Run `handler` on every event of topic `T` reaching this pipe.
    pub fn subscribe_topic<T: Topic<E>>(&self, handler: impl Fn(&T) + 'static) -> Subscription<E> {
        self.subscribe(move |e| {
            if let Some(t) = T::extract(e) {
                handler(t)
            }
        })
    }

    /// Feed everything reaching this pipe (after the stages attached so far) into `pipe`. Returns
    /// `pipe`, for chaining.
    pub fn connect(&self, pipe: EventPipe<E>) -> EventPipe<E> {
        self.attach_point().add_stage(Stage::Pipe(pipe.clone()));
        pipe
    }

    /// Undo [`Self::connect`].
    pub fn disconnect(&self, pipe: &EventPipe<E>) {
        self.attach_point()
            .0
            .stages
            .borrow_mut()
            .retain(|s| !matches!(s, Stage::Pipe(p) if p.same(pipe)));
    }

    /// A new downstream stage passing only the events matching `predicate`.
    pub fn filter(&self, predicate: impl Fn(&E) -> bool + 'static) -> EventPipe<E> {
        self.connect(Self::with_kind(PipeKind::Filter(Box::new(predicate))))
    }

    /// A new downstream stage passing only events of topic `T` (and commit markers).
    pub fn filter_topic<T: Topic<E>>(&self) -> EventPipe<E> {
        self.filter(topic_filter::<E, T>)
    }

    /// A new downstream stage which decides itself what to forward: `f` receives each event along
    /// with a `next` callback.
    pub fn process(&self, f: impl Fn(&E, &dyn Fn(&E)) + 'static) -> EventPipe<E> {
        self.connect(Self::with_kind(PipeKind::Process(Box::new(f))))
    }
}

/// Matches events of topic `T`, and commit markers.
pub fn topic_filter<E: PipeEvent, T: Topic<E>>(event: &E) -> bool {
    event.as_commit().is_some() || T::extract(event).is_some()
}

impl<E: PipeEvent> OptimizedCommitState<E> {
    fn send(&self, event: &E) {
        match event.as_commit() {
            Some(CommitEvent::Begin) => {
                self.level.set(self.level.get() + 1);
                if self.level.get() == 1 {
                    self.output.send(event);
                }
            }
            Some(CommitEvent::End) => {
                if self.level.get() == 0 {
                    return;
                }
                self.level.set(self.level.get() - 1);
                if self.level.get() == 0 {
                    self.output.send(event);
                    self.drain();
                }
            }
            None => {
                if !(self.filter)(event) {
                    return;
                }
                if self.level.get() > 0 {
                    self.commit_in.send(event);
                } else {
                    self.output.send(event);
                }
            }
        }
    }

    fn drain(&self) {
        if self.draining.replace(true) {
            return;
        }
        (self.on_commit_end)(&|e| self.output.send(e));
        self.draining.set(false);
    }
}

/// Brackets a commit on a pipe for as long as it is alive.
pub struct CommitScope<E: PipeEvent> {
    pipe: EventPipe<E>,
}

impl<E: PipeEvent> CommitScope<E> {
    pub fn new(pipe: &EventPipe<E>) -> Self {
        pipe.send(&E::from_commit(CommitEvent::Begin));
        Self { pipe: pipe.clone() }
    }
}

impl<E: PipeEvent> Drop for CommitScope<E> {
    fn drop(&mut self) {
        self.pipe.send(&E::from_commit(CommitEvent::End));
    }
}
