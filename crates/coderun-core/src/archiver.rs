use std::path::{Path, PathBuf};

use coderun_logging::RunArchive;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{ArchiveError, SessionId, SessionRegistry, SessionUpdate};

/// Write every new session to a JSONL archive in `dir`.
///
/// Runs as an ordinary subscriber: each `Created` update starts a task that
/// replays the session's events from the beginning into its archive file.
pub fn spawn_archiver(registry: SessionRegistry, dir: PathBuf) -> JoinHandle<()> {
    let mut updates = registry.updates();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(SessionUpdate::Created { session }) => {
                    let registry = registry.clone();
                    let dir = dir.clone();
                    tokio::spawn(async move {
                        if let Err(e) = archive_run(&registry, session.id, &dir).await {
                            warn!(session_id = %session.id, error = %e, "Failed to archive run");
                        }
                    });
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Archiver fell behind, some runs were not archived");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Replay one session into a new archive file in `dir`, returning once its
/// `run_end` line is written
pub async fn archive_run(
    registry: &SessionRegistry,
    id: SessionId,
    dir: &Path,
) -> Result<PathBuf, ArchiveError> {
    let session = registry.get(id)?;
    let mut events = registry.subscribe(id, 1)?;

    let archive = RunArchive::in_dir(dir, &session.source)?;
    archive.write_start(
        &id.to_string(),
        session.workspace_id.as_str(),
        &session.language.to_string(),
        &session.source,
        serde_json::to_value(session.limits)?,
    );

    while let Some(event) = events.next().await {
        archive.write_event(event.seq, &event.kind.to_string(), &event.payload, event.timestamp);
    }

    let session = registry.get(id)?;
    let problems = registry.problems(id).map(|p| p.len()).unwrap_or(0);
    archive.write_end(
        &session.state.to_string(),
        session.exit_code,
        session.failure.map(|f| f.to_string()).as_deref(),
        problems,
        session.duration_secs().unwrap_or(0.0),
    );
    debug!(session_id = %id, path = %archive.path().display(), "Run archived");
    Ok(archive.path().to_path_buf())
}
