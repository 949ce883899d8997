//! Messaging session management
//!
//! Owns the single transport connection: connect, reconnect policy, logout
//! detection, group-name resolution and sending. Connection state is only
//! ever changed here.

use crate::config::Config;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Lifecycle of the transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// A connection state transition as seen by listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub state: ConnectionState,
    /// Only meaningful for `Closed`: false means credentials were revoked
    pub recoverable: bool,
}

/// A group visible to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub address: String,
    pub name: String,
}

/// What the transport reports about one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    Opened,
    Closed { logged_out: bool, reason: String },
}

/// Transport event tagged with the connection generation that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub generation: u64,
    pub kind: TransportEventKind,
}

impl TransportEvent {
    pub fn opened(generation: u64) -> Self {
        Self {
            generation,
            kind: TransportEventKind::Opened,
        }
    }

    pub fn closed(generation: u64, reason: impl Into<String>) -> Self {
        Self {
            generation,
            kind: TransportEventKind::Closed {
                logged_out: false,
                reason: reason.into(),
            },
        }
    }

    pub fn logged_out(generation: u64, reason: impl Into<String>) -> Self {
        Self {
            generation,
            kind: TransportEventKind::Closed {
                logged_out: true,
                reason: reason.into(),
            },
        }
    }
}

/// The messaging library behind the session
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start opening connection `generation`.
    ///
    /// Returns once the attempt is under way; whether it opens is reported
    /// through `events`. `Error::Auth` means the credentials are gone.
    async fn open(&self, generation: u64, events: mpsc::Sender<TransportEvent>) -> Result<()>;

    /// Groups the account participates in
    async fn list_groups(&self) -> Result<Vec<GroupInfo>>;

    /// Send one text message to a group address
    async fn send_text(&self, address: &str, text: &str) -> Result<()>;
}

/// Address of a group, valid only for the connection that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupResolution {
    pub group_name: String,
    pub address: String,
    generation: u64,
}

pub type StateListener = Box<dyn Fn(&StateChange) + Send + Sync>;

/// Manager for the single transport session
pub struct SessionManager<T: Transport> {
    transport: Arc<T>,
    events: mpsc::Sender<TransportEvent>,
    state: ConnectionState,
    generation: u64,
    logged_out: bool,
    group: Option<GroupResolution>,
    reconnect_delay: Duration,
    send_timeout: Duration,
    reconnect_requested: Option<Duration>,
    listener: Option<StateListener>,
}

impl<T: Transport> SessionManager<T> {
    pub fn new(transport: Arc<T>, events: mpsc::Sender<TransportEvent>, config: &Config) -> Self {
        Self {
            transport,
            events,
            state: ConnectionState::Disconnected,
            generation: 0,
            logged_out: false,
            group: None,
            reconnect_delay: config.reconnect_delay(),
            send_timeout: config.send_timeout(),
            reconnect_requested: None,
            listener: None,
        }
    }

    /// Register the state-change listener, replacing any previous one
    pub fn on_state_change(&mut self, listener: StateListener) {
        self.listener = Some(listener);
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// True once credentials were revoked; nothing reconnects after that
    pub fn is_terminal(&self) -> bool {
        self.logged_out
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cached group address, if one is valid for the current connection
    pub fn cached_group(&self) -> Option<&GroupResolution> {
        self.group
            .as_ref()
            .filter(|g| g.generation == self.generation)
    }

    /// Open the session. No-op while already connecting or open.
    pub async fn connect(&mut self) -> Result<()> {
        if self.logged_out {
            return Err(Error::Auth(
                "session was logged out; credentials must be refreshed".to_string(),
            ));
        }
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            return Ok(());
        }

        self.generation += 1;
        self.group = None;
        self.reconnect_requested = None;
        self.set_state(ConnectionState::Connecting, true);

        match self
            .transport
            .open(self.generation, self.events.clone())
            .await
        {
            Ok(()) => Ok(()),
            Err(Error::Auth(reason)) => {
                self.go_terminal(&reason);
                Err(Error::Auth(reason))
            }
            Err(e) => {
                warn!("Connection attempt {} failed: {}", self.generation, e);
                self.set_state(ConnectionState::Closed, true);
                self.reconnect_requested = Some(self.reconnect_delay);
                Ok(())
            }
        }
    }

    /// Apply a transport event; returns the transition it caused, if any.
    ///
    /// Every transition is also pushed to the `on_state_change` listener,
    /// which is the path the dispatcher reacts through. Events from a
    /// superseded connection are dropped.
    pub fn handle_event(&mut self, event: TransportEvent) -> Result<Option<StateChange>> {
        if event.generation != self.generation || self.logged_out {
            debug!(
                "Ignoring event from connection {} (current {})",
                event.generation, self.generation
            );
            return Ok(None);
        }

        match event.kind {
            TransportEventKind::Opened => {
                if self.state == ConnectionState::Open {
                    return Ok(None);
                }
                Ok(Some(self.set_state(ConnectionState::Open, true)))
            }
            TransportEventKind::Closed {
                logged_out: true,
                reason,
            } => {
                self.go_terminal(&reason);
                Err(Error::Auth(reason))
            }
            TransportEventKind::Closed {
                logged_out: false,
                reason,
            } => {
                if self.state == ConnectionState::Closed {
                    return Ok(None);
                }
                warn!(
                    "Connection closed: {} | reconnecting in {:?}",
                    reason, self.reconnect_delay
                );
                self.group = None;
                self.reconnect_requested = Some(self.reconnect_delay);
                Ok(Some(self.set_state(ConnectionState::Closed, true)))
            }
        }
    }

    /// Delay after which the owner should call `connect` again, if requested
    pub fn take_reconnect_request(&mut self) -> Option<Duration> {
        self.reconnect_requested.take()
    }

    /// Resolve a group name to its address on the current connection
    pub async fn resolve_group(&mut self, name: &str) -> Result<String> {
        if !self.is_open() {
            return Err(Error::TransportUnavailable);
        }
        if let Some(cached) = self.cached_group() {
            if cached.group_name == name {
                return Ok(cached.address.clone());
            }
        }

        let groups = match tokio::time::timeout(self.send_timeout, self.transport.list_groups()).await {
            Ok(Ok(groups)) => groups,
            Ok(Err(e)) => return Err(self.classify(e, "group lookup failed")),
            Err(_) => {
                return Err(Error::Send(format!(
                    "group lookup timed out after {:?}",
                    self.send_timeout
                )))
            }
        };

        let found = groups
            .into_iter()
            .find(|g| g.name == name)
            .ok_or_else(|| Error::GroupNotFound(name.to_string()))?;

        info!("Resolved group \"{}\" to {}", name, found.address);
        self.group = Some(GroupResolution {
            group_name: name.to_string(),
            address: found.address.clone(),
            generation: self.generation,
        });
        Ok(found.address)
    }

    /// Send one text message on the current connection
    pub async fn send_text(&mut self, address: &str, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(Error::TransportUnavailable);
        }

        match tokio::time::timeout(self.send_timeout, self.transport.send_text(address, text)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.classify(e, "send failed")),
            Err(_) => Err(Error::Send(format!(
                "send timed out after {:?}",
                self.send_timeout
            ))),
        }
    }

    /// Resolve `group` and send `text` to it
    pub async fn deliver(&mut self, group: &str, text: &str) -> Result<()> {
        let address = self.resolve_group(group).await?;
        self.send_text(&address, text).await
    }

    fn classify(&mut self, err: Error, context: &str) -> Error {
        match err {
            Error::Auth(reason) => {
                self.go_terminal(&reason);
                Error::Auth(reason)
            }
            Error::TransportUnavailable => Error::TransportUnavailable,
            Error::GroupNotFound(name) => Error::GroupNotFound(name),
            other => Error::Send(format!("{}: {}", context, other)),
        }
    }

    fn go_terminal(&mut self, reason: &str) {
        if self.logged_out {
            return;
        }
        error!("Logged out of messaging session: {}", reason);
        self.logged_out = true;
        self.group = None;
        self.reconnect_requested = None;
        self.set_state(ConnectionState::Closed, false);
        self.set_state(ConnectionState::Disconnected, false);
    }

    fn set_state(&mut self, state: ConnectionState, recoverable: bool) -> StateChange {
        if self.state != state {
            info!("Connection state: {} -> {}", self.state, state);
        }
        self.state = state;

        let change = StateChange { state, recoverable };
        if let Some(listener) = &self.listener {
            listener(&change);
        }
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Transport that opens on request and serves a fixed group list
    #[derive(Default)]
    struct StubTransport {
        groups: Vec<GroupInfo>,
        open_error: Mutex<Option<Error>>,
        list_calls: Mutex<u32>,
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn open(&self, _generation: u64, _events: mpsc::Sender<TransportEvent>) -> Result<()> {
            match self.open_error.lock().unwrap().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn list_groups(&self) -> Result<Vec<GroupInfo>> {
            *self.list_calls.lock().unwrap() += 1;
            Ok(self.groups.clone())
        }

        async fn send_text(&self, address: &str, text: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((address.to_string(), text.to_string()));
            Ok(())
        }
    }

    fn family() -> GroupInfo {
        GroupInfo {
            address: "1203630@g.us".to_string(),
            name: "Family".to_string(),
        }
    }

    fn manager(transport: Arc<StubTransport>) -> SessionManager<StubTransport> {
        let (tx, _rx) = mpsc::channel(8);
        let config = Config::for_test(&std::env::temp_dir());
        SessionManager::new(transport, tx, &config)
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let mut session = manager(Arc::new(StubTransport::default()));

        session.connect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(session.generation(), 1);

        session.connect().await.unwrap();
        assert_eq!(session.generation(), 1);

        session.handle_event(TransportEvent::opened(1)).unwrap();
        session.connect().await.unwrap();
        assert_eq!(session.generation(), 1);
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_stale_events_are_ignored() {
        let mut session = manager(Arc::new(StubTransport::default()));
        session.connect().await.unwrap();
        session.handle_event(TransportEvent::opened(1)).unwrap();

        session
            .handle_event(TransportEvent::closed(1, "stream errored"))
            .unwrap();
        assert_eq!(session.take_reconnect_request(), Some(Duration::from_secs(5)));
        session.connect().await.unwrap();
        assert_eq!(session.generation(), 2);

        // Late events from the first connection change nothing
        let change = session.handle_event(TransportEvent::opened(1)).unwrap();
        assert!(change.is_none());
        assert_eq!(session.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_listener_sees_every_transition() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut session = manager(Arc::new(StubTransport::default()));
        let sink = seen.clone();
        session.on_state_change(Box::new(move |change| {
            sink.lock().unwrap().push((change.state, change.recoverable));
        }));

        session.connect().await.unwrap();
        session.handle_event(TransportEvent::opened(1)).unwrap();
        let result = session.handle_event(TransportEvent::logged_out(1, "401"));
        assert!(matches!(result, Err(Error::Auth(_))));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (ConnectionState::Connecting, true),
                (ConnectionState::Open, true),
                (ConnectionState::Closed, false),
                (ConnectionState::Disconnected, false),
            ]
        );
    }

    #[tokio::test]
    async fn test_logout_is_terminal() {
        let mut session = manager(Arc::new(StubTransport::default()));
        session.connect().await.unwrap();
        let _ = session.handle_event(TransportEvent::logged_out(1, "401"));

        assert!(session.is_terminal());
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.take_reconnect_request().is_none());
        assert!(matches!(session.connect().await, Err(Error::Auth(_))));
    }

    #[tokio::test]
    async fn test_open_auth_failure_is_terminal() {
        let transport = Arc::new(StubTransport::default());
        *transport.open_error.lock().unwrap() = Some(Error::Auth("revoked".to_string()));
        let mut session = manager(transport);

        assert!(matches!(session.connect().await, Err(Error::Auth(_))));
        assert!(session.is_terminal());
    }

    #[tokio::test]
    async fn test_open_transient_failure_requests_reconnect() {
        let transport = Arc::new(StubTransport::default());
        *transport.open_error.lock().unwrap() =
            Some(Error::CommandFailed("bridge not running".to_string()));
        let mut session = manager(transport);

        session.connect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Closed);
        assert_eq!(session.take_reconnect_request(), Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_send_requires_open_connection() {
        let mut session = manager(Arc::new(StubTransport::default()));
        assert!(matches!(
            session.send_text("x@g.us", "hi").await,
            Err(Error::TransportUnavailable)
        ));
        assert!(matches!(
            session.resolve_group("Family").await,
            Err(Error::TransportUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_group_resolution_cached_per_connection() {
        let transport = Arc::new(StubTransport {
            groups: vec![family()],
            ..Default::default()
        });
        let mut session = manager(transport.clone());
        session.connect().await.unwrap();
        session.handle_event(TransportEvent::opened(1)).unwrap();

        assert_eq!(session.resolve_group("Family").await.unwrap(), "1203630@g.us");
        assert_eq!(session.resolve_group("Family").await.unwrap(), "1203630@g.us");
        assert_eq!(*transport.list_calls.lock().unwrap(), 1);

        // Reconnect invalidates the cache
        session.handle_event(TransportEvent::closed(1, "drop")).unwrap();
        assert!(session.cached_group().is_none());
        session.connect().await.unwrap();
        session.handle_event(TransportEvent::opened(2)).unwrap();
        session.resolve_group("Family").await.unwrap();
        assert_eq!(*transport.list_calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unknown_group() {
        let transport = Arc::new(StubTransport {
            groups: vec![family()],
            ..Default::default()
        });
        let mut session = manager(transport.clone());
        session.connect().await.unwrap();
        session.handle_event(TransportEvent::opened(1)).unwrap();

        let result = session.deliver("Work", "hello").await;
        assert!(matches!(result, Err(Error::GroupNotFound(ref name)) if name == "Work"));
        assert!(transport.sent.lock().unwrap().is_empty());

        session.deliver("Family", "hello").await.unwrap();
        assert_eq!(
            *transport.sent.lock().unwrap(),
            vec![("1203630@g.us".to_string(), "hello".to_string())]
        );
    }
}
