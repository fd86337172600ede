use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use coderun_sandbox::{Language, SandboxRunner};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::driver::SessionDriver;
use crate::{
    AdmissionError, CancelError, EventStream, FailureCause, LimitPolicy, Problem, RegistryConfig,
    RegistryError, RunRequest, Session, SessionId, SessionState, SessionSummary, SessionUpdate,
    Subscription, WorkspaceId,
};

struct SessionEntry {
    session: Session,
    events: Arc<EventStream>,
    problems: Vec<Problem>,
    cancel: watch::Sender<bool>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, SessionEntry>,
    /// The one queued or running session per workspace
    active: HashMap<WorkspaceId, SessionId>,
    /// Terminal sessions per workspace, oldest first
    history: HashMap<WorkspaceId, VecDeque<SessionId>>,
    /// Most recently started session per workspace
    latest: HashMap<WorkspaceId, SessionId>,
}

pub(crate) struct Shared {
    pub(crate) runner: SandboxRunner,
    config: RegistryConfig,
    limits: LimitPolicy,
    state: Mutex<RegistryState>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, update: SessionUpdate) {
        // No receivers is fine
        let _ = self.updates.send(update);
    }

    pub(crate) fn record_problem(&self, id: SessionId, problem: Problem) {
        if let Some(entry) = self.lock().sessions.get_mut(&id) {
            entry.problems.push(problem);
        }
    }

    /// Move a session to a terminal state, release its workspace and apply
    /// retention. Returns the summary, or `None` if the transition was refused.
    pub(crate) fn finish(
        &self,
        id: SessionId,
        state: SessionState,
        failure: Option<FailureCause>,
        exit_code: Option<i32>,
    ) -> Option<SessionSummary> {
        debug_assert!(state.is_terminal());
        let mut guard = self.lock();
        let registry = &mut *guard;

        let entry = registry.sessions.get_mut(&id)?;
        if !entry.session.state.can_transition_to(state) {
            warn!(session_id = %id, from = %entry.session.state, to = %state, "Refused state transition");
            return None;
        }
        entry.session.state = state;
        entry.session.failure = failure;
        entry.session.exit_code = exit_code;
        entry.session.ended_at = Some(Utc::now());
        let workspace = entry.session.workspace_id.clone();
        let summary = entry.session.summary(entry.problems.len());

        if registry.active.get(&workspace) == Some(&id) {
            registry.active.remove(&workspace);
        }

        let keep = self.config.history_per_workspace.max(1);
        let history = registry.history.entry(workspace).or_default();
        history.push_back(id);
        while history.len() > keep {
            if let Some(old) = history.pop_front() {
                registry.sessions.remove(&old);
                debug!(session_id = %old, "Purged session from history");
            }
        }

        info!(session_id = %id, %state, ?exit_code, "Session finished");
        Some(summary)
    }

    pub(crate) fn completed(&self, summary: SessionSummary) {
        self.notify(SessionUpdate::Completed { session: summary });
    }
}

/// Owns every session, admits new runs and answers queries.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<Shared>,
}

impl SessionRegistry {
    pub fn new(runner: SandboxRunner, config: RegistryConfig, limits: LimitPolicy) -> Self {
        let (updates, _) = broadcast::channel(config.update_buffer.max(1));
        Self {
            shared: Arc::new(Shared {
                runner,
                config,
                limits,
                state: Mutex::new(RegistryState::default()),
                updates,
            }),
        }
    }

    pub fn runner(&self) -> &SandboxRunner {
        &self.shared.runner
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    pub fn limits(&self) -> &LimitPolicy {
        &self.shared.limits
    }

    /// Admit a run and start its first process.
    ///
    /// Returns as soon as the process is spawned; progress is observed
    /// through [`subscribe`](Self::subscribe) and [`wait`](Self::wait).
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, request: RunRequest) -> Result<SessionId, AdmissionError> {
        let workspace_id = request.workspace_id.trim();
        if workspace_id.is_empty() {
            return Err(AdmissionError::BadRequest("workspace id is empty".into()));
        }
        let workspace_id = WorkspaceId::from(workspace_id);
        let language: Language = request
            .language
            .parse()
            .map_err(|_| AdmissionError::InvalidLanguage(request.language.clone()))?;
        if request.source.trim().is_empty() {
            return Err(AdmissionError::BadRequest("source is empty".into()));
        }
        if request.source.len() > self.shared.config.max_source_bytes {
            return Err(AdmissionError::BadRequest(format!(
                "source is {} bytes, limit is {}",
                request.source.len(),
                self.shared.config.max_source_bytes
            )));
        }

        let policy = &self.shared.limits;
        let limits = request
            .limits
            .unwrap_or_default()
            .resolve(&policy.effective_defaults(), &policy.ceiling);

        // Reserve the workspace
        let session = Session::queued(workspace_id.clone(), language, request.source, limits);
        let id = session.id;
        let events = EventStream::new(id);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut registry = self.shared.lock();
            if let Some(active) = registry.active.get(&workspace_id) {
                debug!(workspace = %workspace_id, %active, "Rejecting run, workspace busy");
                return Err(AdmissionError::Busy {
                    workspace_id,
                    active: *active,
                });
            }
            registry.active.insert(workspace_id.clone(), id);
            registry.sessions.insert(
                id,
                SessionEntry {
                    session: session.clone(),
                    events: Arc::clone(&events),
                    problems: Vec::new(),
                    cancel: cancel_tx,
                },
            );
        }

        // Prepare and spawn outside the lock
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let started = self
            .shared
            .runner
            .prepare(language, &session.source, &limits)
            .and_then(|plan| {
                let process = self
                    .shared
                    .runner
                    .spawn(&plan, &plan.steps()[0], &limits, output_tx)?;
                Ok((plan, process))
            });

        let (plan, process) = match started {
            Ok(started) => started,
            Err(e) => {
                warn!(workspace = %workspace_id, %language, error = %e, "Failed to start run");
                let mut registry = self.shared.lock();
                registry.sessions.remove(&id);
                registry.active.remove(&workspace_id);
                return Err(AdmissionError::SandboxUnavailable(e.to_string()));
            }
        };

        let summary = {
            let mut registry = self.shared.lock();
            registry.latest.insert(workspace_id.clone(), id);
            match registry.sessions.get_mut(&id) {
                Some(entry) => {
                    entry.session.state = SessionState::Running;
                    entry.session.started_at = Some(Utc::now());
                    entry.session.summary(0)
                }
                None => session.summary(0),
            }
        };

        info!(session_id = %id, workspace = %workspace_id, %language, "Run started");
        self.shared.notify(SessionUpdate::Created { session: summary });
        self.shared.notify(SessionUpdate::StateChanged {
            session_id: id,
            state: SessionState::Running,
        });

        let driver = SessionDriver::new(
            Arc::clone(&self.shared),
            id,
            plan,
            limits,
            events,
            cancel_rx,
        );
        tokio::spawn(driver.run(process, output_rx));

        Ok(id)
    }

    /// Ask a running session to stop. The final state is `Cancelled` unless
    /// the process finished on its own first.
    pub fn cancel(&self, id: SessionId) -> Result<(), CancelError> {
        let registry = self.shared.lock();
        let entry = registry.sessions.get(&id).ok_or(CancelError::NotFound(id))?;
        if entry.session.state.is_terminal() {
            return Err(CancelError::AlreadyTerminal {
                id,
                state: entry.session.state,
            });
        }
        entry.cancel.send_replace(true);
        info!(session_id = %id, "Cancellation requested");
        Ok(())
    }

    pub fn get(&self, id: SessionId) -> Result<Session, RegistryError> {
        self.shared
            .lock()
            .sessions
            .get(&id)
            .map(|entry| entry.session.clone())
            .ok_or(RegistryError::NotFound(id))
    }

    /// Sessions newest first, optionally restricted to one workspace
    pub fn list(&self, workspace: Option<&str>) -> Vec<SessionSummary> {
        let registry = self.shared.lock();
        let mut summaries: Vec<_> = registry
            .sessions
            .values()
            .filter(|entry| workspace.map_or(true, |w| entry.session.workspace_id.as_str() == w))
            .map(|entry| entry.session.summary(entry.problems.len()))
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    /// Problems of one session, in the order they were reported
    pub fn problems(&self, id: SessionId) -> Result<Vec<Problem>, RegistryError> {
        self.shared
            .lock()
            .sessions
            .get(&id)
            .map(|entry| entry.problems.clone())
            .ok_or(RegistryError::NotFound(id))
    }

    /// Problems of the most recently started run in a workspace
    pub fn workspace_problems(&self, workspace: &str) -> Vec<Problem> {
        let registry = self.shared.lock();
        registry
            .latest
            .get(&WorkspaceId::from(workspace))
            .and_then(|id| registry.sessions.get(id))
            .map(|entry| entry.problems.clone())
            .unwrap_or_default()
    }

    /// Follow a session's events from `from` on (replaying what is buffered)
    pub fn subscribe(&self, id: SessionId, from: u64) -> Result<Subscription, RegistryError> {
        let events = self.events(id)?;
        Ok(events.subscribe(from))
    }

    pub fn events(&self, id: SessionId) -> Result<Arc<EventStream>, RegistryError> {
        self.shared
            .lock()
            .sessions
            .get(&id)
            .map(|entry| Arc::clone(&entry.events))
            .ok_or(RegistryError::NotFound(id))
    }

    /// Resolve once the session is terminal
    pub async fn wait(&self, id: SessionId) -> Result<Session, RegistryError> {
        let events = self.events(id)?;
        let mut subscription = events.subscribe(events.last_seq() + 1);
        while subscription.next().await.is_some() {}
        self.get(id)
    }

    pub fn updates(&self) -> broadcast::Receiver<SessionUpdate> {
        self.shared.updates.subscribe()
    }

    /// Number of queued or running sessions
    pub fn active_count(&self) -> usize {
        self.shared.lock().active.len()
    }

    /// Cancel every active session, e.g. on shutdown
    pub fn cancel_all(&self) -> usize {
        let registry = self.shared.lock();
        let mut count = 0;
        for id in registry.active.values() {
            if let Some(entry) = registry.sessions.get(id) {
                entry.cancel.send_replace(true);
                count += 1;
            }
        }
        count
    }
}
