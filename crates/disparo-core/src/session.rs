use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentity {
    pub address: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionLifecycle {
    #[default]
    Uninitialized,
    AwaitingQr,
    Connected,
    Disconnected,
    Terminated,
}

impl SessionLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionLifecycle::Uninitialized => "uninitialized",
            SessionLifecycle::AwaitingQr => "awaiting_qr",
            SessionLifecycle::Connected => "connected",
            SessionLifecycle::Disconnected => "disconnected",
            SessionLifecycle::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed lifecycle events published by a session gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    Qr(String),
    Ready(Option<SessionIdentity>),
    Disconnected { reason: String, logged_out: bool },
}

/// Point-in-time projection of the gateway's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub connected: bool,
    pub has_pending_qr: bool,
    pub identity: Option<SessionIdentity>,
}

/// The application's own copy of the gateway state, driven by [`GatewayEvent`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub lifecycle: SessionLifecycle,
    pub last_qr: Option<String>,
    pub identity: Option<SessionIdentity>,
}

impl SessionState {
    pub fn apply(&mut self, event: &GatewayEvent) {
        match event {
            GatewayEvent::Qr(qr) => {
                self.last_qr = Some(qr.clone());
                if self.lifecycle != SessionLifecycle::Connected {
                    self.lifecycle = SessionLifecycle::AwaitingQr;
                }
            }
            GatewayEvent::Ready(identity) => {
                self.lifecycle = SessionLifecycle::Connected;
                self.last_qr = None;
                if identity.is_some() {
                    self.identity = identity.clone();
                }
            }
            GatewayEvent::Disconnected { logged_out, .. } => {
                self.lifecycle = if *logged_out {
                    SessionLifecycle::Terminated
                } else {
                    SessionLifecycle::Disconnected
                };
                if *logged_out {
                    self.identity = None;
                }
            }
        }
    }

    /// Reset ahead of a gateway restart. Dropping credentials also forgets the identity.
    pub fn begin_restart(&mut self, keep_credentials: bool) {
        self.lifecycle = SessionLifecycle::Uninitialized;
        self.last_qr = None;
        if !keep_credentials {
            self.identity = None;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lifecycle == SessionLifecycle::Connected
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connected: self.is_connected(),
            has_pending_qr: self.last_qr.is_some(),
            identity: self.identity.clone(),
        }
    }
}
