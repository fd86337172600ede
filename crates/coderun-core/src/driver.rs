use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use coderun_diagnostics::{Diagnostic, DiagnosticsCollector};
use coderun_sandbox::{
    exit_signal, shell_exit_code, MemoryStrategy, OutputChunk, PlannedStep, ResourceLimits,
    RunPlan, SandboxError, SandboxProcess, StepKind, StreamKind,
};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::registry::Shared;
use crate::{EventKind, EventStream, FailureCause, LifecycleMarker, Problem, SessionId, SessionState};

/// How long to keep reading buffered output after a process is gone
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const SIGKILL: i32 = 9;
const SIGXCPU: i32 = 24;

/// How one step's process ended
enum StepOutcome {
    Exited(ExitStatus),
    TimedOut(Option<ExitStatus>),
    Cancelled(Option<ExitStatus>),
}

/// How the whole run ended
enum Verdict {
    Exited {
        status: ExitStatus,
        step: PlannedStep,
    },
    TimedOut(Option<ExitStatus>),
    Cancelled(Option<ExitStatus>),
    Internal(String),
}

/// Drives one session from its first spawned process to a terminal state.
///
/// The driver is the only task that publishes events for its session and the
/// only one that moves it to a terminal state, so a cancel racing a normal
/// exit resolves to whichever the driver observes first.
pub(crate) struct SessionDriver {
    shared: Arc<Shared>,
    session_id: SessionId,
    plan: RunPlan,
    limits: ResourceLimits,
    events: Arc<EventStream>,
    cancel: watch::Receiver<bool>,
    cancel_open: bool,
    collector: DiagnosticsCollector,
    memory_markers: &'static [&'static str],
    output_bytes: u64,
    truncated: bool,
    memory_exceeded: bool,
}

impl SessionDriver {
    pub(crate) fn new(
        shared: Arc<Shared>,
        session_id: SessionId,
        plan: RunPlan,
        limits: ResourceLimits,
        events: Arc<EventStream>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let language = plan.language();
        let memory_markers = shared
            .runner
            .toolchain(language)
            .map(|t| t.memory_exhaustion_markers())
            .unwrap_or(&[]);
        let collector = DiagnosticsCollector::new(language).with_root(plan.scratch_path());

        Self {
            shared,
            session_id,
            plan,
            limits,
            events,
            cancel,
            cancel_open: true,
            collector,
            memory_markers,
            output_bytes: 0,
            truncated: false,
            memory_exceeded: false,
        }
    }

    pub(crate) async fn run(
        mut self,
        first: SandboxProcess,
        output: mpsc::UnboundedReceiver<OutputChunk>,
    ) {
        let deadline = Instant::now() + self.limits.timeout;
        self.lifecycle(LifecycleMarker::Started);

        let steps = self.plan.steps().to_vec();
        let mut index = 0;
        let mut process = first;
        let mut output = output;

        let verdict = loop {
            let outcome = match self.drive_step(&mut process, &mut output, deadline).await {
                Ok(outcome) => outcome,
                Err(e) => break Verdict::Internal(e.to_string()),
            };

            match outcome {
                StepOutcome::Exited(status)
                    if steps[index].kind == StepKind::Compile
                        && status.success()
                        && index + 1 < steps.len() =>
                {
                    self.lifecycle(LifecycleMarker::Compiled);
                    index += 1;
                    let (tx, rx) = mpsc::unbounded_channel();
                    match self.shared.runner.spawn(&self.plan, &steps[index], &self.limits, tx) {
                        Ok(next) => {
                            process = next;
                            output = rx;
                        }
                        Err(e) => break Verdict::Internal(e.to_string()),
                    }
                }
                StepOutcome::Exited(status) => {
                    break Verdict::Exited {
                        status,
                        step: steps[index].clone(),
                    }
                }
                StepOutcome::TimedOut(status) => break Verdict::TimedOut(status),
                StepOutcome::Cancelled(status) => break Verdict::Cancelled(status),
            }
        };

        self.finish(verdict);
    }

    async fn drive_step(
        &mut self,
        process: &mut SandboxProcess,
        output: &mut mpsc::UnboundedReceiver<OutputChunk>,
        deadline: Instant,
    ) -> Result<StepOutcome, SandboxError> {
        let grace = self.shared.runner.policy().grace_period;
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        let mut output_open = true;

        let status = loop {
            tokio::select! {
                biased;

                changed = self.cancel.changed(), if self.cancel_open => {
                    if changed.is_err() {
                        self.cancel_open = false;
                    } else if *self.cancel.borrow() {
                        info!(session_id = %self.session_id, "Cancelling run");
                        let status = self.stop(process, output, grace).await;
                        return Ok(StepOutcome::Cancelled(status));
                    }
                }
                _ = &mut sleep => {
                    info!(
                        session_id = %self.session_id,
                        timeout_ms = self.limits.timeout.as_millis(),
                        "Run exceeded its time limit"
                    );
                    let status = self.stop(process, output, grace).await;
                    return Ok(StepOutcome::TimedOut(status));
                }
                chunk = output.recv(), if output_open => match chunk {
                    Some(chunk) => self.handle_output(chunk),
                    None => output_open = false,
                },
                status = process.wait() => break status?,
            }
        };

        process.reap_group();
        self.drain(output).await;
        debug!(
            session_id = %self.session_id,
            step = ?process.step(),
            code = ?status.code(),
            elapsed_ms = process.elapsed().as_millis(),
            "Step exited"
        );
        Ok(StepOutcome::Exited(status))
    }

    /// Terminate the process group and collect whatever it already wrote
    async fn stop(
        &mut self,
        process: &mut SandboxProcess,
        output: &mut mpsc::UnboundedReceiver<OutputChunk>,
        grace: Duration,
    ) -> Option<ExitStatus> {
        let status = match process.terminate(grace).await {
            Ok(termination) => {
                debug!(session_id = %self.session_id, forced = termination.was_forced(), "Process terminated");
                Some(termination.status())
            }
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Failed to terminate process");
                None
            }
        };
        self.drain(output).await;
        status
    }

    async fn drain(&mut self, output: &mut mpsc::UnboundedReceiver<OutputChunk>) {
        let until = Instant::now() + DRAIN_TIMEOUT;
        while let Ok(Some(chunk)) = tokio::time::timeout_at(until, output.recv()).await {
            self.handle_output(chunk);
        }
    }

    fn handle_output(&mut self, chunk: OutputChunk) {
        let kind = match chunk.stream {
            StreamKind::Stdout => EventKind::Stdout,
            StreamKind::Stderr => EventKind::Stderr,
        };

        if !self.truncated {
            let cap = self.limits.max_output_bytes;
            // Count the newline the reader stripped
            let size = chunk.len() as u64 + 1;
            if self.output_bytes + size <= cap {
                self.output_bytes += size;
                self.events.publish(kind, chunk.text.as_str());
            } else {
                let room = cap.saturating_sub(self.output_bytes) as usize;
                let head = truncate_at_char_boundary(&chunk.text, room);
                if !head.is_empty() {
                    self.events.publish(kind, head);
                }
                self.truncate();
            }
        }

        if chunk.stream == StreamKind::Stderr {
            if !self.memory_exceeded && self.memory_markers.iter().any(|m| chunk.text.contains(m)) {
                self.memory_exceeded = true;
            }
            if !self.truncated {
                for diagnostic in self.collector.push(&chunk.text) {
                    self.report(diagnostic);
                }
            }
        }
    }

    /// Stop forwarding output; everything past this point is discarded
    fn truncate(&mut self) {
        let cap = self.limits.max_output_bytes;
        self.output_bytes = cap;
        self.truncated = true;
        info!(session_id = %self.session_id, cap, "Output truncated");
        self.lifecycle(LifecycleMarker::Truncated);
    }

    /// Publish a parsed diagnostic. Its payload is charged against the
    /// output cap like any other output.
    fn report(&mut self, diagnostic: Diagnostic) {
        if self.truncated {
            return;
        }
        let problem = Problem::new(self.session_id, diagnostic);
        let payload = match serde_json::to_string(&problem) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode problem");
                return;
            }
        };
        let size = payload.len() as u64 + 1;
        if self.output_bytes + size > self.limits.max_output_bytes {
            self.truncate();
            return;
        }
        self.output_bytes += size;
        self.events.publish(EventKind::Diagnostic, payload);
        self.shared.record_problem(self.session_id, problem);
    }

    /// Publish a diagnostic describing a resource violation, regardless of
    /// the output cap
    fn report_violation(&mut self, diagnostic: Diagnostic) {
        let problem = Problem::new(self.session_id, diagnostic);
        match serde_json::to_string(&problem) {
            Ok(payload) => {
                self.events.publish(EventKind::Diagnostic, payload);
            }
            Err(e) => warn!(error = %e, "Failed to encode problem"),
        }
        self.shared.record_problem(self.session_id, problem);
    }

    fn lifecycle(&self, marker: LifecycleMarker) {
        self.events.publish(EventKind::Lifecycle, marker.to_string());
    }

    fn finish(mut self, verdict: Verdict) {
        for diagnostic in self.collector.finish() {
            self.report(diagnostic);
        }

        let (state, failure, exit_code, marker) = match verdict {
            Verdict::Exited { status, step } => {
                let code = shell_exit_code(&status);
                let signal = exit_signal(&status);

                if signal == Some(SIGXCPU) {
                    (
                        SessionState::TimedOut,
                        Some(FailureCause::Timeout),
                        Some(code),
                        LifecycleMarker::TimedOut,
                    )
                } else {
                    let address_space = step.command.memory == MemoryStrategy::AddressSpace;
                    let memory = !status.success()
                        && (self.memory_exceeded || (address_space && signal == Some(SIGKILL)));
                    let terminal = match signal {
                        Some(sig) => LifecycleMarker::Killed(sig),
                        None => LifecycleMarker::Exited(code),
                    };

                    if status.success() {
                        (SessionState::Succeeded, None, Some(code), terminal)
                    } else if memory {
                        self.report_violation(Diagnostic::error(format!(
                            "memory limit exceeded ({} MiB)",
                            self.limits.max_memory_mib()
                        )));
                        self.lifecycle(LifecycleMarker::MemoryLimitExceeded);
                        (SessionState::Failed, Some(FailureCause::MemoryLimit), Some(code), terminal)
                    } else if signal.is_some() {
                        (SessionState::Failed, Some(FailureCause::Signal), Some(code), terminal)
                    } else {
                        (SessionState::Failed, Some(FailureCause::NonZeroExit), Some(code), terminal)
                    }
                }
            }
            Verdict::TimedOut(status) => (
                SessionState::TimedOut,
                Some(FailureCause::Timeout),
                status.as_ref().map(shell_exit_code),
                LifecycleMarker::TimedOut,
            ),
            Verdict::Cancelled(status) => (
                SessionState::Cancelled,
                None,
                status.as_ref().map(shell_exit_code),
                LifecycleMarker::Cancelled,
            ),
            Verdict::Internal(message) => {
                warn!(session_id = %self.session_id, error = %message, "Internal fault");
                (
                    SessionState::Failed,
                    Some(FailureCause::Internal),
                    None,
                    LifecycleMarker::InternalError(message),
                )
            }
        };

        // State first, then the terminal event, then close, then notify
        let summary = self.shared.finish(self.session_id, state, failure, exit_code);
        self.lifecycle(marker);
        self.events.close();
        if let Some(summary) = summary {
            self.shared.completed(summary);
        }
    }
}

fn truncate_at_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
