//! Per-run state shared between the loop, hooks and tools.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tangent::Usage;

use crate::agent::Agent;
use crate::confirmation::ConfirmationDecision;
use crate::error::AgentError;

/// Container for external dependencies injected into tools.
///
/// The slot can be written once, and only before anything has read it; after
/// the first access it is frozen and further writes fail.
#[derive(Default)]
pub struct Dependencies {
    slot: OnceLock<Box<dyn Any + Send + Sync>>,
    accessed: AtomicBool,
}

impl Dependencies {
    pub fn set<T: Any + Send + Sync>(&self, value: T) -> Result<(), AgentError> {
        if self.accessed.load(Ordering::Acquire) {
            return Err(AgentError::DependenciesFrozen);
        }
        self.slot
            .set(Box::new(value))
            .map_err(|_| AgentError::DependenciesFrozen)
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.accessed.store(true, Ordering::Release);
        self.slot.get().and_then(|boxed| boxed.downcast_ref())
    }
}

impl std::fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependencies")
            .field("set", &self.slot.get().is_some())
            .finish()
    }
}

struct ContextInner {
    deps: Dependencies,
    usage: Mutex<Usage>,
    stream_downstream_events: AtomicBool,
    agents: Mutex<HashMap<String, Agent>>,
    confirmations: Mutex<Vec<ConfirmationDecision>>,
}

/// Context for one agent run.
///
/// Cheap to clone; all clones share the same state. The loop owns the
/// transcript, so the context only carries what tools and nested agents are
/// allowed to see: dependencies, cumulative usage, confirmation decisions and
/// the registry of participating agents.
#[derive(Clone)]
pub struct AgentRunContext {
    inner: Arc<ContextInner>,
}

impl Default for AgentRunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRunContext {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                deps: Dependencies::default(),
                usage: Mutex::new(Usage::default()),
                stream_downstream_events: AtomicBool::new(false),
                agents: Mutex::new(HashMap::new()),
                confirmations: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn deps(&self) -> &Dependencies {
        &self.inner.deps
    }

    /// Snapshot of the cumulative usage.
    pub fn usage(&self) -> Usage {
        *self.inner.usage.lock()
    }

    pub fn add_usage(&self, usage: Usage) {
        *self.inner.usage.lock() += usage;
    }

    pub fn stream_downstream_events(&self) -> bool {
        self.inner.stream_downstream_events.load(Ordering::Relaxed)
    }

    /// Forward nested-agent events into the parent stream.
    pub fn set_stream_downstream_events(&self, enabled: bool) {
        self.inner
            .stream_downstream_events
            .store(enabled, Ordering::Relaxed);
    }

    pub fn add_confirmation(&self, decision: ConfirmationDecision) {
        self.inner.confirmations.lock().push(decision);
    }

    pub fn add_confirmations(&self, decisions: impl IntoIterator<Item = ConfirmationDecision>) {
        self.inner.confirmations.lock().extend(decisions);
    }

    /// The recorded decision for a confirmation id, if any.
    pub fn decision_for(&self, confirmation_id: &str) -> Option<bool> {
        self.inner
            .confirmations
            .lock()
            .iter()
            .find(|d| d.confirmation_id == confirmation_id)
            .map(|d| d.confirmed)
    }

    /// Consume the decision for a confirmation id.
    ///
    /// Each decision authorizes or declines a single invocation, so the
    /// invoker removes it on use; a repeated call with the same id asks again.
    pub(crate) fn take_decision(&self, confirmation_id: &str) -> Option<bool> {
        let mut decisions = self.inner.confirmations.lock();
        let index = decisions
            .iter()
            .position(|d| d.confirmation_id == confirmation_id)?;
        Some(decisions.remove(index).confirmed)
    }

    /// Record an agent as a participant of this run.
    pub fn register_agent(&self, agent: &Agent) {
        self.inner
            .agents
            .lock()
            .insert(agent.id().to_string(), agent.clone());
    }

    pub fn agent(&self, id: &str) -> Option<Agent> {
        self.inner.agents.lock().get(id).cloned()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.inner.agents.lock().keys().cloned().collect()
    }
}

impl std::fmt::Debug for AgentRunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRunContext")
            .field("usage", &self.usage())
            .field("stream_downstream_events", &self.stream_downstream_events())
            .field("agents", &self.agent_ids())
            .finish()
    }
}
