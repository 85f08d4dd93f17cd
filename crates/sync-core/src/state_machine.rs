use std::time::Duration;

use crate::{error::SyncError, retry::ReconnectPolicy, types::ConnectionState};

/// Close code for a clean, intentional close.
pub const NORMAL_CLOSE_CODE: u16 = 1000;
/// Close code reported when the transport dropped without a close frame.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Why a socket stopped delivering frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Clean close (code 1000).
    Normal,
    /// Unexpected drop or transport error; reconnect with backoff.
    Abnormal { code: Option<u16>, detail: String },
    /// The remote endpoint is down as a whole; wait the capped delay.
    EndpointUnavailable { detail: String },
}

impl CloseReason {
    pub fn abnormal(detail: impl Into<String>) -> Self {
        Self::Abnormal {
            code: None,
            detail: detail.into(),
        }
    }

    pub fn from_close_code(code: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match code {
            NORMAL_CLOSE_CODE => Self::Normal,
            1013 | 1014 => Self::EndpointUnavailable { detail },
            _ => Self::Abnormal {
                code: Some(code),
                detail,
            },
        }
    }

    fn describe(&self) -> Option<String> {
        match self {
            Self::Normal => None,
            Self::Abnormal {
                code: Some(code),
                detail,
            } => Some(format!("closed with code {code}: {detail}")),
            Self::Abnormal { code: None, detail } => Some(detail.clone()),
            Self::EndpointUnavailable { detail } => Some(format!("endpoint unavailable: {detail}")),
        }
    }
}

/// Action the connection driver must take after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionDirective {
    /// Open a new socket tagged with `generation`.
    Connect { generation: u64 },
    /// Sleep for `delay`, then report `on_reconnect_due`.
    Reconnect { delay: Duration, retry_count: u32 },
    /// Send a clean close (1000) on the open socket, then `finish_close`.
    CloseSocket,
    /// Nothing left to drive; release resources.
    Release,
    /// The input was stale or irrelevant.
    Ignore,
}

/// Finite-state machine for one push channel connection.
///
/// Each socket attempt gets a new generation; inputs tagged with an older
/// generation are ignored.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    retry_count: u32,
    generation: u64,
    last_error: Option<String>,
    policy: ReconnectPolicy,
}

impl ConnectionStateMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            retry_count: 0,
            generation: 0,
            last_error: None,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// `Idle -> Connecting`.
    pub fn subscribe(&mut self) -> Result<ConnectionDirective, SyncError> {
        if self.state != ConnectionState::Idle {
            return Err(SyncError::invalid_state(self.state, "subscribe"));
        }
        Ok(self.begin_connect())
    }

    /// `Connecting -> Open` when the handshake for the current generation succeeded.
    ///
    /// Returns `false` when the socket is stale and must be discarded.
    pub fn on_open(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Open;
        self.retry_count = 0;
        self.last_error = None;
        true
    }

    /// Whether an inbound frame from `generation` should be delivered.
    pub fn accepts_frame(&self, generation: u64) -> bool {
        generation == self.generation && self.state == ConnectionState::Open
    }

    /// Handle a handshake failure or a closed socket.
    pub fn on_close(&mut self, generation: u64, reason: &CloseReason) -> ConnectionDirective {
        if generation != self.generation
            || !matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Open
            )
        {
            return ConnectionDirective::Ignore;
        }

        let delay = match reason {
            CloseReason::Normal => {
                self.state = ConnectionState::Closed;
                return ConnectionDirective::Release;
            }
            CloseReason::Abnormal { .. } => self.policy.delay_for_attempt(self.retry_count),
            CloseReason::EndpointUnavailable { .. } => self.policy.unavailable_delay(),
        };

        self.last_error = reason.describe();
        self.state = ConnectionState::Reconnecting;
        self.retry_count = self.retry_count.saturating_add(1);
        ConnectionDirective::Reconnect {
            delay,
            retry_count: self.retry_count,
        }
    }

    /// `Reconnecting -> Connecting` once the backoff timer fired.
    pub fn on_reconnect_due(&mut self) -> ConnectionDirective {
        if self.state != ConnectionState::Reconnecting {
            return ConnectionDirective::Ignore;
        }
        self.begin_connect()
    }

    /// Explicit unsubscribe. Safe to call repeatedly.
    pub fn close(&mut self) -> ConnectionDirective {
        match self.state {
            ConnectionState::Open => {
                self.state = ConnectionState::Closing;
                ConnectionDirective::CloseSocket
            }
            ConnectionState::Idle | ConnectionState::Connecting | ConnectionState::Reconnecting => {
                self.state = ConnectionState::Closed;
                ConnectionDirective::Release
            }
            ConnectionState::Closing | ConnectionState::Closed => ConnectionDirective::Ignore,
        }
    }

    /// `Closing -> Closed` after the clean close was sent.
    pub fn finish_close(&mut self) {
        if self.state == ConnectionState::Closing {
            self.state = ConnectionState::Closed;
        }
    }

    fn begin_connect(&mut self) -> ConnectionDirective {
        self.generation = self.generation.saturating_add(1);
        self.state = ConnectionState::Connecting;
        ConnectionDirective::Connect {
            generation: self.generation,
        }
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}
