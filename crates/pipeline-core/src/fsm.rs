//! # State Machine Driver
//!
//! Drives a finite state machine whose states are entered by running a
//! [`StateAction`]. The action's return value is the requested next state; it
//! goes through a queue that other parts of the system may also push into via
//! a [`StateSender`]. A requested state that is not an allowed transition from
//! the current one is logged and skipped.
//!
//! Only one action runs at a time, and a running action is never abandoned:
//! stopping the machine waits for it to return.

use crate::domain::short_type_name;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Marker for types usable as FSM states, typically a fieldless enum.
pub trait FsmState: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Copy + Eq + Hash + Debug + Send + Sync + 'static> FsmState for T {}

/// Work performed when entering a state. Returns the requested next state.
#[async_trait]
pub trait StateAction<St>: Send + Sync + 'static {
    async fn enter(&self) -> St;

    fn name(&self) -> &str {
        short_type_name::<Self>()
    }
}

struct StateNode<St> {
    action: Arc<dyn StateAction<St>>,
    transitions: HashSet<St>,
}

/// Declares states and their allowed transitions. The first state declared is
/// the initial one.
pub struct FsmBuilder<St> {
    initial: Option<St>,
    states: HashMap<St, StateNode<St>>,
    errors: Vec<String>,
}

impl<St: FsmState> Default for FsmBuilder<St> {
    fn default() -> Self {
        Self {
            initial: None,
            states: HashMap::new(),
            errors: Vec::new(),
        }
    }
}

impl<St: FsmState> FsmBuilder<St> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(
        &mut self,
        state: St,
        action: impl StateAction<St>,
        transitions: impl IntoIterator<Item = St>,
    ) -> &mut Self {
        let node = StateNode {
            action: Arc::new(action),
            transitions: transitions.into_iter().collect(),
        };
        if self.states.insert(state, node).is_some() {
            self.errors.push(format!("state {state:?} declared twice"));
        }
        self.initial.get_or_insert(state);
        self
    }

    /// Validates the graph: at least one state, no duplicates and every
    /// transition leading to a declared state.
    pub fn build(self) -> Result<Fsm<St>> {
        let mut errors = self.errors;
        for (state, node) in &self.states {
            for target in &node.transitions {
                if !self.states.contains_key(target) {
                    errors.push(format!("transition {state:?} -> {target:?} leads to unknown state"));
                }
            }
        }

        let Some(initial) = self.initial else {
            return Err(Error::Config("fsm has no states".to_string()));
        };
        if !errors.is_empty() {
            return Err(Error::Config(errors.join(", ")));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        Ok(Fsm {
            initial,
            states: self.states,
            sender,
            receiver,
        })
    }
}

/// Pushes requested states into a running [`Fsm`].
#[derive(Clone)]
pub struct StateSender<St> {
    sender: mpsc::UnboundedSender<St>,
}

impl<St: FsmState> StateSender<St> {
    pub fn push(&self, state: St) {
        if self.sender.send(state).is_err() {
            warn!(?state, "State machine stopped, state dropped");
        }
    }
}

pub struct Fsm<St> {
    initial: St,
    states: HashMap<St, StateNode<St>>,
    sender: mpsc::UnboundedSender<St>,
    receiver: mpsc::UnboundedReceiver<St>,
}

impl<St: FsmState> Fsm<St> {
    pub fn sender(&self) -> StateSender<St> {
        StateSender {
            sender: self.sender.clone(),
        }
    }

    /// Runs the machine from its initial state until `cancel` fires.
    ///
    /// Cancellation is observed between states. The action of the current
    /// state always runs to completion, so long actions should watch the same
    /// token themselves.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut current = self.initial;
        info!(state = ?current, "State machine started");

        while !cancel.is_cancelled() {
            let node = self
                .states
                .get(&current)
                .ok_or_else(|| Error::Config(format!("unknown state {current:?}")))?;
            info!(state = ?current, action = node.action.name(), "Entering state");

            let requested = node.action.enter().await;
            if self.sender.send(requested).is_err() {
                break;
            }

            let next = loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    next = self.receiver.recv() => next,
                };
                match next {
                    Some(next) if node.transitions.contains(&next) => break Some(next),
                    Some(next) => warn!(from = ?current, to = ?next, "Transition not allowed, skipped"),
                    None => break None,
                }
            };

            match next {
                Some(next) => current = next,
                None => break,
            }
        }

        info!(state = ?current, "State machine stopped");
        Ok(())
    }
}
