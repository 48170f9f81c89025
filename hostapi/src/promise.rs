//! Host-side asynchronous completion: promises and the job queue.
//!
//! Settling a promise never runs reactions inline. Each reaction becomes a
//! job on the instance's [`JobQueue`], and the embedder drains the queue
//! with [`run_until_idle`] between boundary calls. So no callback fires
//! inside the boundary call that registered it.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use crate::closure::Callable;
use crate::error::{BridgeError, CallError};
use crate::traits::CallContext;
use crate::types::HostValue;

/// Observable state of a promise.
#[derive(Debug, Clone, PartialEq)]
pub enum PromiseState {
    Pending,
    Fulfilled(HostValue),
    Rejected(HostValue),
}

type Outcome = Result<HostValue, HostValue>;

struct Reaction {
    on_fulfilled: Option<Callable>,
    on_rejected: Option<Callable>,
    target: PromiseRef,
}

enum State {
    Pending(Vec<Reaction>),
    Settled(Outcome),
}

pub struct Promise {
    state: RefCell<State>,
    /// Set once a resolver has been used; later resolver calls are ignored.
    locked: Cell<bool>,
}

/// Shared reference to a promise.
#[derive(Clone)]
pub struct PromiseRef(Rc<Promise>);

impl Default for PromiseRef {
    fn default() -> Self {
        Self::new()
    }
}

impl PromiseRef {
    /// A fresh pending promise.
    pub fn new() -> Self {
        Self(Rc::new(Promise {
            state: RefCell::new(State::Pending(Vec::new())),
            locked: Cell::new(false),
        }))
    }

    /// A promise resolved with `value`. A promise value is returned as is.
    pub fn resolved(jobs: &mut JobQueue, value: HostValue) -> Self {
        if let HostValue::Promise(p) = value {
            return p;
        }
        let p = Self::new();
        p.resolve(jobs, value);
        p
    }

    /// Create a promise and run `executor(resolve, reject)` synchronously.
    /// A value thrown by the executor rejects the promise.
    pub fn with_executor(cx: &mut dyn CallContext, executor: &Callable) -> Result<Self, BridgeError> {
        let p = Self::new();
        let (resolve, reject) = p.resolvers();
        match executor.call(cx, &[resolve.into(), reject.into()]) {
            Ok(_) => {}
            Err(CallError::Thrown(e)) => p.reject(cx.jobs(), e),
            Err(CallError::Fault(f)) => return Err(f),
        }
        Ok(p)
    }

    pub fn state(&self) -> PromiseState {
        match &*self.0.state.borrow() {
            State::Pending(_) => PromiseState::Pending,
            State::Settled(Ok(v)) => PromiseState::Fulfilled(v.clone()),
            State::Settled(Err(e)) => PromiseState::Rejected(e.clone()),
        }
    }

    /// Resolve, adopting the outcome of `value` if it is itself a promise.
    pub fn resolve(&self, jobs: &mut JobQueue, value: HostValue) {
        if self.0.locked.replace(true) {
            return;
        }
        self.resolve_unlocked(jobs, value);
    }

    pub fn reject(&self, jobs: &mut JobQueue, reason: HostValue) {
        if self.0.locked.replace(true) {
            return;
        }
        self.settle(jobs, Err(reason));
    }

    /// The `(resolve, reject)` pair for this promise, as host functions.
    pub fn resolvers(&self) -> (Callable, Callable) {
        let p = self.clone();
        let resolve = Callable::native("resolve", move |cx, args| {
            p.resolve(cx.jobs(), args.first().cloned().unwrap_or_default());
            Ok(HostValue::Undefined)
        });
        let p = self.clone();
        let reject = Callable::native("reject", move |cx, args| {
            p.reject(cx.jobs(), args.first().cloned().unwrap_or_default());
            Ok(HostValue::Undefined)
        });
        (resolve, reject)
    }

    /// Register reactions and return the derived promise.
    pub fn then(
        &self,
        jobs: &mut JobQueue,
        on_fulfilled: Option<Callable>,
        on_rejected: Option<Callable>,
    ) -> PromiseRef {
        let target = PromiseRef::new();
        self.subscribe(
            jobs,
            Reaction {
                on_fulfilled,
                on_rejected,
                target: target.clone(),
            },
        );
        target
    }

    fn resolve_unlocked(&self, jobs: &mut JobQueue, value: HostValue) {
        match value {
            HostValue::Promise(inner) if inner == *self => {
                self.settle(
                    jobs,
                    Err(HostValue::error("TypeError", "chaining cycle detected for promise")),
                );
            }
            HostValue::Promise(inner) => inner.subscribe(
                jobs,
                Reaction {
                    on_fulfilled: None,
                    on_rejected: None,
                    target: self.clone(),
                },
            ),
            value => self.settle(jobs, Ok(value)),
        }
    }

    fn settle(&self, jobs: &mut JobQueue, outcome: Outcome) {
        let mut state = self.0.state.borrow_mut();
        if let State::Settled(_) = &*state {
            return;
        }
        let State::Pending(reactions) = std::mem::replace(&mut *state, State::Settled(outcome.clone()))
        else {
            return;
        };
        for reaction in reactions {
            jobs.push(Job {
                reaction,
                outcome: outcome.clone(),
            });
        }
    }

    fn subscribe(&self, jobs: &mut JobQueue, reaction: Reaction) {
        let mut state = self.0.state.borrow_mut();
        match &mut *state {
            State::Pending(reactions) => reactions.push(reaction),
            State::Settled(outcome) => jobs.push(Job {
                reaction,
                outcome: outcome.clone(),
            }),
        }
    }
}

impl PartialEq for PromiseRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for PromiseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Promise({:?})", self.state())
    }
}

struct Job {
    reaction: Reaction,
    outcome: Outcome,
}

impl Job {
    fn run(self, cx: &mut dyn CallContext) -> Result<(), BridgeError> {
        let Reaction {
            on_fulfilled,
            on_rejected,
            target,
        } = self.reaction;
        let (handler, value, ok) = match self.outcome {
            Ok(v) => (on_fulfilled, v, true),
            Err(e) => (on_rejected, e, false),
        };
        match handler {
            Some(handler) => match handler.call(cx, &[value]) {
                Ok(result) => target.resolve_unlocked(cx.jobs(), result),
                Err(CallError::Thrown(e)) => target.settle(cx.jobs(), Err(e)),
                Err(CallError::Fault(f)) => return Err(f),
            },
            None if ok => target.resolve_unlocked(cx.jobs(), value),
            None => target.settle(cx.jobs(), Err(value)),
        }
        Ok(())
    }
}

/// Pending reaction jobs for one guest instance.
#[derive(Default)]
pub struct JobQueue {
    jobs: VecDeque<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn push(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    fn pop(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue").field("pending", &self.jobs.len()).finish()
    }
}

/// Run queued jobs, including any they enqueue, until the queue is empty.
/// Returns the number of jobs run. A fault aborts the drain and leaves the
/// remaining jobs queued.
pub fn run_until_idle(cx: &mut dyn CallContext) -> Result<usize, BridgeError> {
    let mut ran = 0;
    while let Some(job) = cx.jobs().pop() {
        job.run(cx)?;
        ran += 1;
    }
    Ok(ran)
}
