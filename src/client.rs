//! Reliable frame delivery to the remote collector.
//!
//! Each delivery is a request/reply exchange: the client sends a two-part
//! message (device tag, encoded frame) and waits for the acknowledgement
//! token. A missing reply closes the connection, opens a fresh one and
//! resends, up to `max_retries` attempts per frame. When every attempt
//! fails the client is left `Dropped` and reconnects on the next call.
//!
//! ```text
//!            Transmitted            Polling
//!   Idle ───────────────▶ Sent ──────────────▶ AwaitingReply ──Acknowledged──▶ Idle
//!    ▲                     │                    │   ▲    │
//!    │ Reconnected         │ AttemptFailed      │   └────┘ Malformed
//!    │                     ▼                    │
//!  Dropped ◀──(0 left)── Retrying ◀──(n left)───┘ AttemptFailed
//!                          │ Transmitted
//!                          └──────────▶ Sent
//! ```

use log::{debug, error, info, warn};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use crate::config::{Config, constants};
use crate::frame::{Frame, encode_frame};
use crate::wire;

/// States of the delivery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No request in flight.
    Idle,
    /// Request written, reply not yet polled.
    Sent,
    /// Waiting for the acknowledgement.
    AwaitingReply,
    /// Previous attempt failed, attempts remain.
    Retrying,
    /// Every attempt of the last call failed.
    Dropped,
}

/// Inputs driving [`ClientState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// The request was written to a connection.
    Transmitted,
    /// Started waiting for the reply.
    Polling,
    /// The acknowledgement token arrived.
    Acknowledged,
    /// A reply arrived that is not the acknowledgement token.
    Malformed,
    /// Connect, write or read failed or timed out. Carries the attempts left
    /// after this one.
    AttemptFailed { attempts_remaining: u32 },
    /// A fresh connection replaced a dropped one.
    Reconnected,
}

impl ClientState {
    /// Transition table. Returns `None` for events that cannot happen in
    /// the current state.
    pub fn on(self, event: ClientEvent) -> Option<ClientState> {
        use ClientEvent::*;
        use ClientState::*;

        match (self, event) {
            (Idle | Retrying, Transmitted) => Some(Sent),
            (Sent, Polling) => Some(AwaitingReply),
            (AwaitingReply, Acknowledged) => Some(Idle),
            (AwaitingReply, Malformed) => Some(AwaitingReply),
            (
                Idle | Sent | AwaitingReply | Retrying,
                AttemptFailed {
                    attempts_remaining: 0,
                },
            ) => Some(Dropped),
            (Idle | Sent | AwaitingReply | Retrying, AttemptFailed { .. }) => Some(Retrying),
            (Dropped, Reconnected) => Some(Idle),
            _ => None,
        }
    }
}

/// Retry bookkeeping for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempts_remaining: u32,
    pub connection_dropped: bool,
}

impl RetryState {
    fn fresh(max_retries: u32) -> Self {
        Self {
            attempts_remaining: max_retries,
            connection_dropped: false,
        }
    }

    /// Spend one attempt. Never goes below zero.
    fn consume(&mut self) -> u32 {
        self.attempts_remaining = self.attempts_remaining.saturating_sub(1);
        self.attempts_remaining
    }
}

/// One request/reply connection to the collector.
pub trait Connection {
    /// Send a multipart request.
    fn send_parts(&mut self, parts: &[&[u8]]) -> io::Result<()>;

    /// Wait up to `timeout` for a single-part reply. `Ok(None)` means the
    /// deadline passed without a reply.
    fn recv_reply(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>>;
}

/// Factory for fresh connections to the collector.
pub trait Connector {
    type Conn: Connection;

    fn connect(&self) -> io::Result<Self::Conn>;

    /// Human-readable peer description for logs.
    fn endpoint(&self) -> String;
}

/// Connects to the collector over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr, connect_timeout: Duration) -> Self {
        Self {
            addr,
            connect_timeout,
        }
    }
}

impl Connector for TcpConnector {
    type Conn = TcpConnection;

    fn connect(&self) -> io::Result<TcpConnection> {
        let stream = TcpStream::connect_timeout(&self.addr, self.connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(self.connect_timeout))?;
        Ok(TcpConnection { stream })
    }

    fn endpoint(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// TCP connection to the collector. The socket is shut down when dropped.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
}

impl Connection for TcpConnection {
    fn send_parts(&mut self, parts: &[&[u8]]) -> io::Result<()> {
        wire::write_message(&mut self.stream, parts)
    }

    fn recv_reply(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        // A zero timeout would mean "block forever" to the socket.
        self.stream
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        match wire::read_message(&mut self.stream) {
            Ok(parts) => Ok(Some(parts.into_iter().next().unwrap_or_default())),
            Err(e) if wire::is_timeout(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Tunables of the retrying client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub ack_token: Vec<u8>,
    pub max_malformed_replies: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: constants::DEFAULT_MAX_RETRIES,
            request_timeout: Duration::from_millis(constants::DEFAULT_REQUEST_TIMEOUT_MS),
            ack_token: constants::ACK_TOKEN.as_bytes().to_vec(),
            max_malformed_replies: constants::MAX_MALFORMED_REPLIES,
        }
    }
}

impl ClientConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            request_timeout: config.request_timeout,
            ..Self::default()
        }
    }
}

/// How one attempt ended.
enum Attempt<C> {
    Acknowledged(C),
    Failed(String),
}

/// Bounded-retry request/reply client for frame delivery.
pub struct ReliableNetworkClient<C: Connector = TcpConnector> {
    connector: C,
    config: ClientConfig,
    connection: Option<C::Conn>,
    state: ClientState,
    retry: RetryState,
}

impl<C: Connector> ReliableNetworkClient<C> {
    /// Create the client. The first connection is opened lazily.
    pub fn new(connector: C, config: ClientConfig) -> Self {
        let retry = RetryState::fresh(config.max_retries);
        Self {
            connector,
            config,
            connection: None,
            state: ClientState::Idle,
            retry,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn retry_state(&self) -> RetryState {
        self.retry
    }

    /// Whether the last call exhausted its attempts.
    pub fn is_dropped(&self) -> bool {
        self.retry.connection_dropped
    }

    /// Deliver one frame tagged with `tag`.
    ///
    /// Returns `true` once the collector acknowledged the frame, `false`
    /// when all attempts failed. Failures never escape as errors. The
    /// collector may receive the frame more than once if an
    /// acknowledgement is lost.
    pub fn send(&mut self, tag: &[u8], frame: &Frame) -> bool {
        let payload = encode_frame(frame);
        self.send_parts(&[tag, &payload])
    }

    /// Deliver an arbitrary multipart request with the same retry policy.
    pub fn send_parts(&mut self, request: &[&[u8]]) -> bool {
        if self.retry.connection_dropped {
            self.reconnect();
        }

        self.retry = RetryState::fresh(self.config.max_retries);

        while self.retry.attempts_remaining > 0 {
            let connection = match self.connection.take() {
                Some(connection) => connection,
                None => match self.connector.connect() {
                    Ok(connection) => connection,
                    Err(e) => {
                        if self.fail_attempt(&format!("connect failed: {}", e)) {
                            return false;
                        }
                        continue;
                    }
                },
            };

            match self.attempt(connection, request) {
                Attempt::Acknowledged(connection) => {
                    self.connection = Some(connection);
                    self.transition(ClientEvent::Acknowledged);
                    return true;
                }
                // The connection was dropped inside `attempt`.
                Attempt::Failed(reason) => {
                    if self.fail_attempt(&reason) {
                        return false;
                    }
                }
            }
        }

        // Only reachable with `max_retries == 0`.
        self.retry.connection_dropped = true;
        self.state = ClientState::Dropped;
        false
    }

    /// Transmit once and wait for the acknowledgement within one request
    /// timeout window. Malformed replies keep the window open but are
    /// bounded by `max_malformed_replies`.
    fn attempt(&mut self, mut connection: C::Conn, request: &[&[u8]]) -> Attempt<C::Conn> {
        if let Err(e) = connection.send_parts(request) {
            return Attempt::Failed(format!("send failed: {}", e));
        }
        self.transition(ClientEvent::Transmitted);
        self.transition(ClientEvent::Polling);

        let deadline = Instant::now() + self.config.request_timeout;
        let mut malformed = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Attempt::Failed("no response from server".to_string());
            }

            match connection.recv_reply(remaining) {
                Ok(Some(reply)) if reply == self.config.ack_token => {
                    return Attempt::Acknowledged(connection);
                }
                Ok(Some(reply)) => {
                    malformed += 1;
                    warn!(
                        "malformed response {:?} from server",
                        String::from_utf8_lossy(&reply)
                    );
                    self.transition(ClientEvent::Malformed);
                    if malformed >= self.config.max_malformed_replies {
                        return Attempt::Failed(format!(
                            "{} malformed responses from server",
                            malformed
                        ));
                    }
                }
                Ok(None) => return Attempt::Failed("no response from server".to_string()),
                Err(e) => return Attempt::Failed(format!("receive failed: {}", e)),
            }
        }
    }

    /// Record a failed attempt. Returns `true` when no attempts remain.
    fn fail_attempt(&mut self, reason: &str) -> bool {
        let attempts_remaining = self.retry.consume();
        self.transition(ClientEvent::AttemptFailed { attempts_remaining });

        if attempts_remaining == 0 {
            error!(
                "Server {} seems to be offline ({}), abandoning",
                self.connector.endpoint(),
                reason
            );
            self.retry.connection_dropped = true;
            return true;
        }

        warn!(
            "{} from {}, reconnecting and resending ({} attempt(s) left)",
            reason,
            self.connector.endpoint(),
            attempts_remaining
        );
        false
    }

    fn reconnect(&mut self) {
        info!("Reopening dropped connection to {}", self.connector.endpoint());
        self.connection = match self.connector.connect() {
            Ok(connection) => Some(connection),
            Err(e) => {
                // The send loop retries the connect and counts it as an attempt.
                debug!("Reconnect to {} failed: {}", self.connector.endpoint(), e);
                None
            }
        };
        self.retry.connection_dropped = false;
        self.transition(ClientEvent::Reconnected);
    }

    fn transition(&mut self, event: ClientEvent) {
        match self.state.on(event) {
            Some(next) => self.state = next,
            None => {
                error!(
                    "Invalid delivery transition {:?} on {:?}, dropping connection",
                    self.state, event
                );
                self.connection = None;
                self.retry.connection_dropped = true;
                self.state = ClientState::Dropped;
            }
        }
    }
}
