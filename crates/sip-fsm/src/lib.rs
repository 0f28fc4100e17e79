// parley-rs - The Parley SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Reusable finite-state-machine primitive.
//!
//! A [`StateMachine`] is built from a [`TransitionTable`] declaring
//! `(state, input) -> (next state, action)` tuples, an initial state and a
//! terminal subset. Inputs posted synchronously fail with
//! [`FsmError::UnexpectedInput`] when no transition is declared; the
//! [`AsyncFsm`] wrapper owns a queue task so inputs can also be posted
//! without waiting.
//!
//! Action callbacks run *before* the new state is published, so an observer
//! that wakes on a state change always sees the action's side effects.
//!
//! # Example
//! ```
//! use sip_fsm::{StateMachine, TransitionTable};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum State { Idle, Busy, Done }
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum Input { Start, Finish }
//!
//! let table = TransitionTable::new(State::Idle)
//!     .terminal(State::Done)
//!     .on(State::Idle, Input::Start, State::Busy)
//!     .on(State::Busy, Input::Finish, State::Done);
//! let mut fsm = StateMachine::new(table);
//! fsm.post(Input::Start).unwrap();
//! assert_eq!(fsm.state(), State::Busy);
//! assert!(fsm.post(Input::Start).is_err());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Error surfaced by FSM operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsmError {
    /// No transition is declared for the current state and this input.
    UnexpectedInput,
    /// The machine already reached a terminal state.
    Terminal,
    /// The async input queue is gone (machine dropped or stopped).
    Closed,
    /// `wait_for_state` gave up before the predicate matched.
    DeadlineExpired,
}

impl fmt::Display for FsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsmError::UnexpectedInput => write!(f, "input not valid in the current state"),
            FsmError::Terminal => write!(f, "state machine has terminated"),
            FsmError::Closed => write!(f, "state machine input queue is closed"),
            FsmError::DeadlineExpired => write!(f, "deadline expired waiting for state"),
        }
    }
}

impl std::error::Error for FsmError {}

/// Action hook executed while a transition is being applied.
pub type Action<S, I> = Arc<dyn Fn(&S, &I, &S) + Send + Sync>;

struct Transition<S, I> {
    next: S,
    action: Option<Action<S, I>>,
}

/// Declarative transition table: states, inputs, transitions, initial state
/// and terminal subset.
pub struct TransitionTable<S, I> {
    initial: S,
    terminal: Vec<S>,
    transitions: HashMap<(S, I), Transition<S, I>>,
}

impl<S, I> TransitionTable<S, I>
where
    S: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    I: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    pub fn new(initial: S) -> Self {
        Self {
            initial,
            terminal: Vec::new(),
            transitions: HashMap::new(),
        }
    }

    /// Marks a state as terminal; posting any input there is an error.
    pub fn terminal(mut self, state: S) -> Self {
        self.terminal.push(state);
        self
    }

    /// Declares a transition with no action.
    pub fn on(mut self, state: S, input: I, next: S) -> Self {
        self.transitions
            .insert((state, input), Transition { next, action: None });
        self
    }

    /// Declares a transition whose action runs before the new state becomes
    /// visible. The action receives (old state, input, new state).
    pub fn on_with<F>(mut self, state: S, input: I, next: S, action: F) -> Self
    where
        F: Fn(&S, &I, &S) + Send + Sync + 'static,
    {
        self.transitions.insert(
            (state, input),
            Transition {
                next,
                action: Some(Arc::new(action)),
            },
        );
        self
    }

    fn is_terminal(&self, state: &S) -> bool {
        self.terminal.iter().any(|t| t == state)
    }
}

/// Synchronous state machine. All methods take `&mut self`; wrap in
/// [`AsyncFsm`] when inputs arrive from multiple tasks.
pub struct StateMachine<S, I> {
    table: Arc<TransitionTable<S, I>>,
    state: S,
}

impl<S, I> StateMachine<S, I>
where
    S: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    I: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    pub fn new(table: TransitionTable<S, I>) -> Self {
        let state = table.initial.clone();
        Self {
            table: Arc::new(table),
            state,
        }
    }

    pub fn from_shared(table: Arc<TransitionTable<S, I>>) -> Self {
        let state = table.initial.clone();
        Self { table, state }
    }

    pub fn state(&self) -> S {
        self.state.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.table.is_terminal(&self.state)
    }

    /// Applies an input, running the declared action, and returns the new
    /// state. Fails with `UnexpectedInput` on an undeclared pair.
    pub fn post(&mut self, input: I) -> Result<S, FsmError> {
        if self.is_terminal() {
            return Err(FsmError::Terminal);
        }
        let key = (self.state.clone(), input.clone());
        let transition = self
            .table
            .transitions
            .get(&key)
            .ok_or(FsmError::UnexpectedInput)?;
        if let Some(action) = &transition.action {
            action(&self.state, &input, &transition.next);
        }
        debug!(from = ?self.state, to = ?transition.next, input = ?input, "fsm transition");
        self.state = transition.next.clone();
        Ok(self.state.clone())
    }
}

/// Asynchronous wrapper owning an input queue processed on its own task.
///
/// State is published through a `watch` channel after each action has run,
/// so `wait_for_state` observers always see consistent (state, side effect)
/// pairs, and no internal lock is held while a waiter sleeps.
pub struct AsyncFsm<S, I> {
    input_tx: mpsc::UnboundedSender<I>,
    state_rx: watch::Receiver<S>,
    state_tx: Arc<watch::Sender<S>>,
    inner: Arc<Mutex<StateMachine<S, I>>>,
}

impl<S, I> AsyncFsm<S, I>
where
    S: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    I: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    pub fn spawn(table: TransitionTable<S, I>) -> Self {
        let machine = StateMachine::new(table);
        let (state_tx, state_rx) = watch::channel(machine.state());
        let state_tx = Arc::new(state_tx);
        let inner = Arc::new(Mutex::new(machine));
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<I>();

        let worker = inner.clone();
        let worker_tx = state_tx.clone();
        tokio::spawn(async move {
            while let Some(input) = input_rx.recv().await {
                // Publish under the lock so observers see transitions in
                // the order they were applied.
                let mut fsm = worker.lock();
                match fsm.post(input) {
                    Ok(new_state) => {
                        let _ = worker_tx.send(new_state);
                    }
                    Err(err) => warn!(%err, "async fsm dropped input"),
                }
            }
        });

        Self {
            input_tx,
            state_rx,
            state_tx,
            inner,
        }
    }

    /// Current state.
    pub fn state(&self) -> S {
        self.state_rx.borrow().clone()
    }

    /// Posts an input synchronously, failing on an illegal transition.
    pub fn post(&self, input: I) -> Result<S, FsmError> {
        let mut fsm = self.inner.lock();
        let new_state = fsm.post(input)?;
        let _ = self.state_tx.send(new_state.clone());
        Ok(new_state)
    }

    /// Queues an input for the owned task; illegal transitions are logged
    /// and dropped rather than surfaced to the poster.
    pub fn post_async(&self, input: I) -> Result<(), FsmError> {
        self.input_tx.send(input).map_err(|_| FsmError::Closed)
    }

    /// Waits until the predicate matches the published state.
    ///
    /// Holds no FSM lock while waiting; the deadline bounds the wait.
    pub async fn wait_for_state<F>(&self, predicate: F, deadline: Duration) -> Result<S, FsmError>
    where
        F: Fn(&S) -> bool,
    {
        let mut rx = self.state_rx.clone();
        {
            let current = rx.borrow_and_update();
            if predicate(&current) {
                return Ok(current.clone());
            }
        }
        let waited = tokio::time::timeout(deadline, async {
            loop {
                if rx.changed().await.is_err() {
                    return Err(FsmError::Closed);
                }
                let current = rx.borrow_and_update();
                if predicate(&current) {
                    return Ok(current.clone());
                }
            }
        })
        .await;
        match waited {
            Ok(result) => result,
            Err(_) => Err(FsmError::DeadlineExpired),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum CallState {
        Idle,
        Ringing,
        Answered,
        Over,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum CallInput {
        Ring,
        Answer,
        HangUp,
    }

    fn call_table() -> TransitionTable<CallState, CallInput> {
        TransitionTable::new(CallState::Idle)
            .terminal(CallState::Over)
            .on(CallState::Idle, CallInput::Ring, CallState::Ringing)
            .on(CallState::Ringing, CallInput::Answer, CallState::Answered)
            .on(CallState::Ringing, CallInput::HangUp, CallState::Over)
            .on(CallState::Answered, CallInput::HangUp, CallState::Over)
    }

    #[test]
    fn legal_path_walks_the_table() {
        let mut fsm = StateMachine::new(call_table());
        assert_eq!(fsm.post(CallInput::Ring).unwrap(), CallState::Ringing);
        assert_eq!(fsm.post(CallInput::Answer).unwrap(), CallState::Answered);
        assert_eq!(fsm.post(CallInput::HangUp).unwrap(), CallState::Over);
        assert!(fsm.is_terminal());
    }

    #[test]
    fn illegal_input_is_typed_error() {
        let mut fsm = StateMachine::new(call_table());
        assert_eq!(fsm.post(CallInput::Answer), Err(FsmError::UnexpectedInput));
        assert_eq!(fsm.state(), CallState::Idle);
    }

    #[test]
    fn terminal_state_rejects_everything() {
        let mut fsm = StateMachine::new(call_table());
        fsm.post(CallInput::Ring).unwrap();
        fsm.post(CallInput::HangUp).unwrap();
        assert_eq!(fsm.post(CallInput::Ring), Err(FsmError::Terminal));
    }

    #[test]
    fn action_runs_before_state_changes() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let table = TransitionTable::new(CallState::Idle).on_with(
            CallState::Idle,
            CallInput::Ring,
            CallState::Ringing,
            move |old, _input, new| {
                assert_eq!(*old, CallState::Idle);
                assert_eq!(*new, CallState::Ringing);
                seen.fetch_add(1, Ordering::SeqCst);
            },
        );
        let mut fsm = StateMachine::new(table);
        fsm.post(CallInput::Ring).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn async_queue_processes_in_order() {
        let fsm = AsyncFsm::spawn(call_table());
        fsm.post_async(CallInput::Ring).unwrap();
        fsm.post_async(CallInput::Answer).unwrap();
        let state = fsm
            .wait_for_state(|s| *s == CallState::Answered, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(state, CallState::Answered);
    }

    #[tokio::test]
    async fn wait_for_state_times_out() {
        let fsm = AsyncFsm::spawn(call_table());
        let err = fsm
            .wait_for_state(|s| *s == CallState::Over, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, FsmError::DeadlineExpired);
    }

    #[tokio::test]
    async fn sync_post_on_async_fsm_surfaces_errors() {
        let fsm = AsyncFsm::spawn(call_table());
        assert_eq!(fsm.post(CallInput::Answer), Err(FsmError::UnexpectedInput));
        fsm.post(CallInput::Ring).unwrap();
        assert_eq!(fsm.state(), CallState::Ringing);
    }
}
