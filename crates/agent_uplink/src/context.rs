//! Shared connectivity state: the handshake state, where the agent lives and
//! who we are to it.
//!
//! A [`ConnectivityContext`] is built once by whatever composes the tracer and
//! shared by `Arc` between the communicator (reads host and identity to build
//! URLs) and the state machine (the only writer).

use crate::protocol::AgentIdentity;
use parking_lot::RwLock;
use std::fmt;
use tokio::sync::watch;

/// Handshake progress with the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    /// Nothing has run yet.
    Uninitialized,
    /// Looking for the agent host.
    Init,
    /// Host found, announce pending.
    Unannounced,
    /// Announced, readiness test pending.
    Announced,
    /// Data may be sent.
    Ready,
}

/// Events that move the handshake forward.
///
/// Failures are not events: a failed step leaves the state where it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeEvent {
    Init,
    LookupSucceeded,
    AnnounceSucceeded,
    TestSucceeded,
}

impl ConnectivityState {
    /// Transition table. `None` means the event is not accepted in this state.
    pub fn next(self, event: HandshakeEvent) -> Option<Self> {
        use ConnectivityState::{Announced, Init, Ready, Unannounced, Uninitialized};

        match (self, event) {
            (Uninitialized | Unannounced | Announced | Ready, HandshakeEvent::Init) => Some(Init),
            (Init, HandshakeEvent::LookupSucceeded) => Some(Unannounced),
            (Unannounced, HandshakeEvent::AnnounceSucceeded) => Some(Announced),
            (Announced, HandshakeEvent::TestSucceeded) => Some(Ready),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Init => "init",
            Self::Unannounced => "unannounced",
            Self::Announced => "announced",
            Self::Ready => "ready",
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Shared {
    state: ConnectivityState,
    host: String,
    port: u16,
    identity: Option<AgentIdentity>,
}

/// Consistent copy of the fields needed to build a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub entity_id: Option<String>,
}

/// Process-lifetime connectivity state, guarded by a read/write lock.
#[derive(Debug)]
pub struct ConnectivityContext {
    shared: RwLock<Shared>,
    changes: watch::Sender<ConnectivityState>,
}

impl ConnectivityContext {
    /// Creates a context pointing at `host:port`, in `Uninitialized`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let (changes, _) = watch::channel(ConnectivityState::Uninitialized);
        Self {
            shared: RwLock::new(Shared {
                state: ConnectivityState::Uninitialized,
                host: host.into(),
                port,
                identity: None,
            }),
            changes,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.shared.read().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectivityState::Ready
    }

    pub fn identity(&self) -> Option<AgentIdentity> {
        self.shared.read().identity.clone()
    }

    pub fn host(&self) -> String {
        self.shared.read().host.clone()
    }

    pub fn port(&self) -> u16 {
        self.shared.read().port
    }

    pub fn endpoint(&self) -> Endpoint {
        let shared = self.shared.read();
        Endpoint {
            host: shared.host.clone(),
            port: shared.port,
            entity_id: shared.identity.as_ref().map(|i| i.entity_id.clone()),
        }
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.changes.subscribe()
    }

    /// Applies `event`, returning the new state, or `None` if the table
    /// rejects it (state unchanged).
    pub(crate) fn apply(&self, event: HandshakeEvent) -> Option<ConnectivityState> {
        self.update(event, |_| {})
    }

    /// Records the discovered host and leaves `Init` in one write.
    pub(crate) fn complete_lookup(&self, host: String) -> Option<ConnectivityState> {
        self.update(HandshakeEvent::LookupSucceeded, |shared| shared.host = host)
    }

    /// Installs a new identity and leaves `Unannounced` in one write.
    pub(crate) fn complete_announce(&self, identity: AgentIdentity) -> Option<ConnectivityState> {
        self.update(HandshakeEvent::AnnounceSucceeded, |shared| {
            shared.identity = Some(identity);
        })
    }

    fn update(
        &self,
        event: HandshakeEvent,
        on_accept: impl FnOnce(&mut Shared),
    ) -> Option<ConnectivityState> {
        let next = {
            let mut shared = self.shared.write();
            let next = shared.state.next(event)?;
            on_accept(&mut shared);
            shared.state = next;
            next
        };
        self.changes.send_replace(next);
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(entity: &str) -> AgentIdentity {
        AgentIdentity {
            entity_id: entity.into(),
            host_id: "host".into(),
            serverless: false,
            cloud_provider: None,
        }
    }

    #[test]
    fn test_transition_table() {
        use ConnectivityState::*;

        assert_eq!(Uninitialized.next(HandshakeEvent::Init), Some(Init));
        assert_eq!(Init.next(HandshakeEvent::LookupSucceeded), Some(Unannounced));
        assert_eq!(Unannounced.next(HandshakeEvent::AnnounceSucceeded), Some(Announced));
        assert_eq!(Announced.next(HandshakeEvent::TestSucceeded), Some(Ready));
        for state in [Unannounced, Announced, Ready] {
            assert_eq!(state.next(HandshakeEvent::Init), Some(Init));
        }

        assert_eq!(Init.next(HandshakeEvent::Init), None);
        assert_eq!(Uninitialized.next(HandshakeEvent::LookupSucceeded), None);
        assert_eq!(Init.next(HandshakeEvent::TestSucceeded), None);
        assert_eq!(Ready.next(HandshakeEvent::AnnounceSucceeded), None);
    }

    #[test]
    fn test_rejected_event_leaves_context_untouched() {
        let context = ConnectivityContext::new("localhost", 1);
        assert_eq!(context.complete_lookup("10.0.0.1".into()), None);
        assert_eq!(context.host(), "localhost");
        assert_eq!(context.state(), ConnectivityState::Uninitialized);
    }

    #[test]
    fn test_identity_replaced_wholesale() {
        let context = ConnectivityContext::new("localhost", 1);
        context.apply(HandshakeEvent::Init);
        context.complete_lookup("localhost".into());
        context.complete_announce(identity("1"));
        assert_eq!(context.endpoint().entity_id.as_deref(), Some("1"));

        context.apply(HandshakeEvent::Init);
        context.complete_lookup("127.0.0.1".into());
        context.complete_announce(identity("2"));

        assert_eq!(context.identity(), Some(identity("2")));
        assert_eq!(context.host(), "127.0.0.1");
        assert_eq!(context.state(), ConnectivityState::Announced);
    }

    #[test]
    fn test_subscribers_see_changes() {
        let context = ConnectivityContext::new("localhost", 1);
        let rx = context.subscribe();
        context.apply(HandshakeEvent::Init);
        assert_eq!(*rx.borrow(), ConnectivityState::Init);
    }
}
