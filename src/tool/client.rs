//! Connection lifecycle and verb forwarding.

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::error::{CallError, CallResult, ConnectError};
use super::protocol::{Implementation, ToolInfo};
use super::session::{Connector, Response, Session};
use super::stdio::StdioConnector;
use super::verbs::VerbNames;
use crate::config::{Settings, SettingsError, ToolConfig};

/// Default deadline for spawn + handshake (15 minutes).
///
/// The first start of the tool parses the whole dbt project.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(900);

type AttemptFuture = BoxFuture<'static, Result<(), ConnectError>>;

/// Client behaviour that is independent of how the tool is launched.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline for one connect attempt.
    pub handshake_timeout: Duration,
    /// How verbs are spelled on the wire.
    pub verbs: VerbNames,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            verbs: VerbNames::default(),
        }
    }
}

/// Observable connection state.
///
/// A failed attempt leaves the client `Disconnected`; the failure is
/// available from [`ToolClient::last_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Slot {
    Disconnected,
    Connecting {
        attempt_id: u64,
        attempt: WeakShared<AttemptFuture>,
    },
    /// Disconnect was requested while an attempt was running. The attempt
    /// discards its session when it finishes; new attempts wait for that.
    Closing {
        attempt_id: u64,
        attempt: WeakShared<AttemptFuture>,
    },
    Ready {
        session_id: u64,
        session: Arc<dyn Session>,
    },
}

struct State {
    slot: Slot,
    last_error: Option<ConnectError>,
    next_id: u64,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_attempt(&self, id: u64) -> bool {
        matches!(&self.slot, Slot::Connecting { attempt_id, .. } if *attempt_id == id)
    }

    /// Whether the slot still refers to this attempt, live or superseded.
    fn owns_attempt(&self, id: u64) -> bool {
        match &self.slot {
            Slot::Connecting { attempt_id, .. } | Slot::Closing { attempt_id, .. } => {
                *attempt_id == id
            }
            _ => false,
        }
    }

    fn is_session(&self, id: u64) -> bool {
        matches!(&self.slot, Slot::Ready { session_id, .. } if *session_id == id)
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    state: Mutex<State>,
    /// Serialises calls; the transport is treated as single-user.
    call_lock: tokio::sync::Mutex<()>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the session if it is still the current one.
    fn take_session(&self, id: u64) -> Option<Arc<dyn Session>> {
        let mut state = self.state();
        if !state.is_session(id) {
            return None;
        }
        match mem::replace(&mut state.slot, Slot::Disconnected) {
            Slot::Ready { session, .. } => Some(session),
            _ => None,
        }
    }
}

/// Client for the external semantic-layer tool.
///
/// Owns at most one live connection. Cloning is cheap; every clone drives
/// the same connection. Build one per process and pass it to call sites.
///
/// # Example
///
/// ```ignore
/// use headless_bi::tool::{ClientConfig, ToolClient};
/// use headless_bi::config::ToolConfig;
///
/// let client = ToolClient::stdio(ToolConfig::dbt_mcp("./jaffle_shop"), ClientConfig::default());
/// client.ensure_ready().await?;
/// let metrics = client.list_metrics().await?;
/// client.disconnect().await;
/// ```
#[derive(Clone)]
pub struct ToolClient {
    inner: Arc<Inner>,
}

impl ToolClient {
    /// Create a disconnected client around a connector.
    pub fn new<C: Connector + 'static>(connector: C, config: ClientConfig) -> Self {
        Self::with_connector(Arc::new(connector), config)
    }

    /// Create a disconnected client around a shared connector.
    pub fn with_connector(connector: Arc<dyn Connector>, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                state: Mutex::new(State {
                    slot: Slot::Disconnected,
                    last_error: None,
                    next_id: 0,
                }),
                call_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Client that launches the tool as a child process.
    pub fn stdio(tool: ToolConfig, config: ClientConfig) -> Self {
        Self::new(StdioConnector::new(tool), config)
    }

    /// Client configured from a settings file.
    pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
        let tool = settings.tool.resolve()?;
        Ok(Self::stdio(tool, settings.client_config()))
    }

    /// Current connection state.
    ///
    /// An attempt that nobody is waiting on any more, or one superseded by
    /// [`disconnect`](Self::disconnect), reports `Disconnected`.
    pub fn state(&self) -> ConnectionState {
        // Dropped outside the lock; the last handle runs the attempt's cleanup
        let (state, _live) = {
            let state = self.inner.state();
            match &state.slot {
                Slot::Ready { .. } => (ConnectionState::Ready, None),
                Slot::Connecting { attempt, .. } => match attempt.upgrade() {
                    Some(live) => (ConnectionState::Connecting, Some(live)),
                    None => (ConnectionState::Disconnected, None),
                },
                Slot::Closing { .. } | Slot::Disconnected => (ConnectionState::Disconnected, None),
            }
        };
        state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Error from the most recent failed connect attempt, cleared on success.
    pub fn last_error(&self) -> Option<ConnectError> {
        self.inner.state().last_error.clone()
    }

    /// Verb naming in use.
    pub fn verbs(&self) -> &VerbNames {
        &self.inner.config.verbs
    }

    /// Identity the tool reported, when connected.
    pub fn server_info(&self) -> Option<Implementation> {
        match &self.inner.state().slot {
            Slot::Ready { session, .. } => session.server_info(),
            _ => None,
        }
    }

    /// Establish the connection.
    ///
    /// Returns immediately when already ready. When an attempt is already
    /// running, waits for it and returns its outcome. When an attempt was
    /// cut short by [`disconnect`](Self::disconnect), waits for it to shut
    /// down first. Otherwise starts a new attempt bounded by the handshake
    /// timeout. Dropping every waiter cancels the attempt and kills anything
    /// it started.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        loop {
            let (attempt, superseded) = {
                let mut state = self.inner.state();
                let running = match &state.slot {
                    Slot::Ready { .. } => return Ok(()),
                    Slot::Connecting { attempt, .. } => attempt.upgrade().map(|a| (a, false)),
                    Slot::Closing { attempt, .. } => attempt.upgrade().map(|a| (a, true)),
                    Slot::Disconnected => None,
                };
                match running {
                    Some(running) => running,
                    None => (self.start_attempt(&mut state), false),
                }
            };

            if superseded {
                debug!("waiting for superseded connect attempt to shut down");
                let _ = attempt.await;
                continue;
            }
            return attempt.await;
        }
    }

    /// Connect unless already ready.
    pub async fn ensure_ready(&self) -> Result<(), ConnectError> {
        if self.is_ready() {
            return Ok(());
        }
        self.connect().await
    }

    fn start_attempt(&self, state: &mut State) -> Shared<AttemptFuture> {
        let attempt_id = state.next_id();
        let inner = self.inner.clone();

        let attempt = async move {
            let _guard = AttemptGuard {
                inner: inner.clone(),
                attempt_id,
            };
            let timeout = inner.config.handshake_timeout;
            info!(timeout_secs = timeout.as_secs(), "connecting to semantic-layer tool");

            let outcome = match tokio::time::timeout(timeout, inner.connector.connect()).await {
                Ok(result) => result,
                Err(_) => Err(ConnectError::timeout(timeout)),
            };

            finish_attempt(&inner, attempt_id, outcome).await
        }
        .boxed()
        .shared();

        // Never polled yet, so the downgrade cannot fail
        if let Some(weak) = attempt.downgrade() {
            state.slot = Slot::Connecting {
                attempt_id,
                attempt: weak,
            };
        }
        attempt
    }

    /// Forward one verb to the tool.
    ///
    /// Fails with [`CallError::NotConnected`] unless the connection is ready.
    /// Errors from the tool come back unchanged. A broken transport, or
    /// dropping this future before it resolves, tears the connection down.
    pub async fn call(&self, verb: &str, params: Map<String, Value>) -> CallResult<Response> {
        self.with_session(verb, |session| async move { session.call_tool(verb, params).await })
            .await
    }

    /// List the verbs the tool advertises.
    pub async fn list_tools(&self) -> CallResult<Vec<ToolInfo>> {
        self.with_session("tools/list", |session| async move { session.list_tools().await })
            .await
    }

    async fn with_session<T, F, Fut>(&self, label: &str, f: F) -> CallResult<T>
    where
        F: FnOnce(Arc<dyn Session>) -> Fut,
        Fut: std::future::Future<Output = CallResult<T>>,
    {
        let _serial = self.inner.call_lock.lock().await;

        let (session_id, session) = match &self.inner.state().slot {
            Slot::Ready {
                session_id,
                session,
            } => (*session_id, session.clone()),
            _ => return Err(CallError::NotConnected),
        };

        debug!(verb = %label, "forwarding to tool");
        let mut guard = CallGuard {
            inner: &self.inner,
            session_id,
            armed: true,
        };
        let result = f(session).await;
        guard.armed = false;

        if let Err(err) = &result {
            if err.is_connection_lost() {
                warn!(verb = %label, error = %err, "lost connection to semantic-layer tool");
                if let Some(session) = self.inner.take_session(session_id) {
                    if let Err(e) = session.shutdown().await {
                        debug!(error = %e, "shutdown after connection loss failed");
                    }
                }
            }
        }
        result
    }

    /// Tear the connection down. Safe to call at any time, any number of times.
    ///
    /// An attempt still in flight is not interrupted, but its session is
    /// discarded when it completes, and the next [`connect`](Self::connect)
    /// waits for that before starting a fresh attempt.
    pub async fn disconnect(&self) {
        let session = {
            let mut state = self.inner.state();
            match mem::replace(&mut state.slot, Slot::Disconnected) {
                Slot::Ready { session, .. } => Some(session),
                Slot::Connecting {
                    attempt_id,
                    attempt,
                }
                | Slot::Closing {
                    attempt_id,
                    attempt,
                } => {
                    debug!("disconnect requested during connect attempt");
                    state.slot = Slot::Closing {
                        attempt_id,
                        attempt,
                    };
                    None
                }
                Slot::Disconnected => None,
            }
        };

        if let Some(session) = session {
            info!("disconnecting from semantic-layer tool");
            if let Err(e) = session.shutdown().await {
                warn!(error = %e, "error while shutting down tool");
            }
        }
    }
}

impl fmt::Debug for ToolClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolClient")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish()
    }
}

async fn finish_attempt(
    inner: &Arc<Inner>,
    attempt_id: u64,
    outcome: Result<Box<dyn Session>, ConnectError>,
) -> Result<(), ConnectError> {
    let stale = {
        let mut state = inner.state();
        let current = state.is_attempt(attempt_id);
        match outcome {
            Ok(session) if current => {
                let session_id = state.next_id();
                state.slot = Slot::Ready {
                    session_id,
                    session: Arc::from(session),
                };
                state.last_error = None;
                info!("semantic-layer tool ready");
                return Ok(());
            }
            Ok(session) => session,
            Err(err) => {
                if current {
                    state.last_error = Some(err.clone());
                }
                if state.owns_attempt(attempt_id) {
                    state.slot = Slot::Disconnected;
                }
                warn!(error = %err, "connect attempt failed");
                return Err(err);
            }
        }
    };

    // Disconnected while the handshake was running
    debug!("discarding session from superseded connect attempt");
    if let Err(e) = stale.shutdown().await {
        debug!(error = %e, "shutdown of superseded session failed");
    }
    release_attempt(inner, attempt_id);
    Err(ConnectError::failed("connection closed while connecting"))
}

/// Clear the slot if it still refers to this attempt.
fn release_attempt(inner: &Inner, attempt_id: u64) -> bool {
    let mut state = inner.state();
    if state.owns_attempt(attempt_id) {
        state.slot = Slot::Disconnected;
        return true;
    }
    false
}

/// Releases the slot when a connect attempt ends, including when it is
/// dropped before finishing.
struct AttemptGuard {
    inner: Arc<Inner>,
    attempt_id: u64,
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if release_attempt(&self.inner, self.attempt_id) {
            debug!("connect attempt cancelled");
        }
    }
}

/// Tears the session down when a call is dropped mid-flight.
struct CallGuard<'a> {
    inner: &'a Inner,
    session_id: u64,
    armed: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(session) = self.inner.take_session(self.session_id) else {
            return;
        };
        warn!("call cancelled mid-flight, dropping tool connection");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = session.shutdown().await {
                        debug!(error = %e, "shutdown after cancelled call failed");
                    }
                });
            }
            // No runtime: dropping the session kills the process
            Err(_) => drop(session),
        }
    }
}
