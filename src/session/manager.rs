//! Subprocess sessions and the manager that tracks them.
//!
//! A session owns a child process, a stdout reader task, a bounded event
//! channel, and a done signal. Construction launches the process and
//! reader; `stop` kills, reaps, and signals done exactly once.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::{now_nanos, NormalizedEvent, Provider, SessionConfig};
use crate::errors::{EngineError, EngineResult};
use crate::session::provider::ProviderRegistry;

/// Capacity of each session's event channel.
const EVENT_CHANNEL_BUFFER: usize = 64;

/// Parse one stdout line into a [`NormalizedEvent`].
///
/// The line must be JSON with a non-empty `type` field; anything else is
/// skipped (`None`). The payload is an independent copy of the line, so
/// later reuse of the reader's buffer cannot alter emitted events.
pub fn parse_event(line: &str, provider: &str, session_id: &str) -> Option<NormalizedEvent> {
    #[derive(serde::Deserialize)]
    struct RawEvent {
        #[serde(default, rename = "type")]
        event_type: String,
    }

    let raw: RawEvent = serde_json::from_str(line).ok()?;
    if raw.event_type.is_empty() {
        return None;
    }
    Some(NormalizedEvent {
        event_type: raw.event_type,
        provider: provider.to_string(),
        session_id: session_id.to_string(),
        payload: line.to_string(),
    })
}

/// A running code agent process.
pub struct Session {
    pub id: String,
    pub provider: Provider,
    pub config: SessionConfig,
    child: tokio::sync::Mutex<Option<Child>>,
    events: Mutex<Option<mpsc::Receiver<NormalizedEvent>>>,
    done: CancellationToken,
}

impl Session {
    /// The event channel, handed out once to the session's consumer.
    pub fn take_events(&self) -> Option<mpsc::Receiver<NormalizedEvent>> {
        self.events.lock().ok().and_then(|mut guard| guard.take())
    }

    /// A token cancelled when the session terminates.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Kill the process and reap its exit. Killing an already-exited
    /// process is not a failure; the done signal fires exactly once.
    pub async fn stop(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.done.cancel();
    }
}

/// Creates, tracks, and stops code agent sessions.
pub struct SessionManager {
    registry: Arc<ProviderRegistry>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    seq: AtomicI64,
}

impl SessionManager {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        SessionManager {
            registry,
            sessions: Mutex::new(HashMap::new()),
            seq: AtomicI64::new(0),
        }
    }

    /// Launch a session for the given provider and config.
    ///
    /// The subprocess environment is the provider env overlaid with the
    /// session env (session wins on key collision). A reader task consumes
    /// stdout line by line; malformed lines are skipped without
    /// terminating the session. When stdout closes, the event channel is
    /// closed and the done signal fires.
    pub async fn create(&self, provider: &str, config: SessionConfig) -> EngineResult<String> {
        let spec = self.registry.get(provider)?;

        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("ses-{}-{}-{}", provider, now_nanos(), seq);

        let mut env = spec.env.clone();
        env.extend(config.env.clone());

        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&env)
            .stdout(Stdio::piped())
            .stdin(Stdio::null());

        let mut child = command.spawn().map_err(|e| {
            EngineError::ProviderUnavailable(format!("start session {id}: {e}"))
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::ProviderUnavailable(format!("stdout pipe for {id} unavailable"))
        })?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        let done = CancellationToken::new();

        let session = Arc::new(Session {
            id: id.clone(),
            provider: provider.to_string(),
            config,
            child: tokio::sync::Mutex::new(Some(child)),
            events: Mutex::new(Some(rx)),
            done: done.clone(),
        });

        let reader_provider = provider.to_string();
        let reader_id = id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(event) = parse_event(&line, &reader_provider, &reader_id) {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
            // Dropping the sender closes the channel; done fires once.
            drop(tx);
            done.cancel();
        });

        tracing::debug!(session_id = %id, provider = %provider, "session started");

        self.sessions
            .lock()
            .map_err(|_| EngineError::SessionNotFound("session map lock poisoned".into()))?
            .insert(id.clone(), session);

        Ok(id)
    }

    /// A tracked session by id, or `session_not_found`.
    pub fn get(&self, session_id: &str) -> EngineResult<Arc<Session>> {
        self.sessions
            .lock()
            .map_err(|_| EngineError::SessionNotFound("session map lock poisoned".into()))?
            .get(session_id)
            .cloned()
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    /// Stop a session by id. A second stop for the same id returns
    /// `session_not_found` with no further side effects.
    pub async fn stop(&self, session_id: &str) -> EngineResult<()> {
        let session = {
            let mut sessions = self
                .sessions
                .lock()
                .map_err(|_| EngineError::SessionNotFound("session map lock poisoned".into()))?;
            sessions
                .remove(session_id)
                .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?
        };
        session.stop().await;
        tracing::debug!(session_id = %session_id, "session stopped");
        Ok(())
    }

    /// Stop every tracked session.
    pub async fn stop_all(&self) {
        let sessions: Vec<Arc<Session>> = match self.sessions.lock() {
            Ok(mut map) => map.drain().map(|(_, s)| s).collect(),
            Err(_) => return,
        };
        for session in sessions {
            session.stop().await;
        }
    }
}
