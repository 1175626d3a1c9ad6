//! Operator control channel.
//!
//! The collector side sends JSON-encoded commands over a single-part
//! request/reply exchange. Requests are handled one at a time on a
//! dedicated thread, and each one is answered with the JSON string `"ok"`.

use log::{debug, error, info, warn};
use serde_json::{Value, json};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::constants;
use crate::error::{NetworkError, RelayError};
use crate::modes::{ControlCommand, SharedModes};
use crate::wire;

/// Listens for control commands and applies them to the shared modes.
///
/// Connections are served one at a time. A peer that connects and stays
/// silent holds the listener until the idle timeout (30 s by default)
/// closes it, and other operators wait meanwhile.
pub struct ControlListener {
    listener: TcpListener,
    modes: SharedModes,
    idle_timeout: Duration,
}

impl ControlListener {
    /// Bind the control socket.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BindFailed`] if the address is unavailable.
    pub fn bind(addr: SocketAddr, modes: SharedModes) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).map_err(|e| NetworkError::BindFailed {
            address: addr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            listener,
            modes,
            idle_timeout: Duration::from_secs(constants::CONTROL_IDLE_TIMEOUT_SECONDS),
        })
    }

    /// Close connections that stay silent for longer than `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve connections sequentially. Only returns if the listener fails.
    pub fn serve(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!("Control listener on tcp://{}", addr),
            Err(e) => warn!("Control listener address unknown: {}", e),
        }

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => self.handle_connection(stream),
                Err(e) => warn!("Failed to accept control connection: {}", e),
            }
        }
    }

    /// Run [`serve`](Self::serve) on a thread named `control-listener`.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("control-listener".to_string())
            .spawn(move || self.serve())
    }

    fn handle_connection(&self, mut stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        debug!("Control connection from {}", peer);

        if let Err(e) = stream.set_read_timeout(Some(self.idle_timeout)) {
            warn!("Could not set idle timeout for {}: {}", peer, e);
        }

        loop {
            let request = match wire::read_message(&mut stream) {
                Ok(parts) => parts,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) if wire::is_timeout(&e) => {
                    debug!("Closing idle control connection from {}", peer);
                    break;
                }
                Err(e) => {
                    warn!("Bad control request from {}: {}", peer, e);
                    break;
                }
            };

            self.handle_request(&request);

            let reply = json!(constants::CONTROL_REPLY).to_string();
            if let Err(e) = wire::write_message(&mut stream, &[reply.as_bytes()]) {
                error!("Failed to reply to {}: {}", peer, e);
                break;
            }
        }
    }

    fn handle_request(&self, request: &[Vec<u8>]) {
        let Some(body) = request.first() else {
            return;
        };
        if request.len() > 1 {
            warn!(
                "Control request has {} parts, using the first",
                request.len()
            );
        }

        match serde_json::from_slice::<Value>(body) {
            Ok(value) => {
                let command = match value.as_str() {
                    Some(text) => ControlCommand::parse(text),
                    None => ControlCommand::Unknown(value.to_string()),
                };
                info!("Received control command '{}'", command.as_str());
                self.modes.apply(&command);
            }
            Err(e) => warn!(
                "Ignoring undecodable control request {:?}: {}",
                String::from_utf8_lossy(body),
                e
            ),
        }
    }
}

/// Send one command to a control listener and return its decoded reply.
///
/// # Errors
///
/// Returns [`NetworkError::RequestFailed`] if the listener cannot be
/// reached, does not answer within `timeout`, or answers with something
/// that is not JSON.
pub fn send_control_command(
    addr: SocketAddr,
    command: &str,
    timeout: Duration,
) -> Result<String, NetworkError> {
    let failed = |reason: String| NetworkError::RequestFailed {
        address: addr.to_string(),
        reason,
    };

    let mut stream =
        TcpStream::connect_timeout(&addr, timeout).map_err(|e| failed(e.to_string()))?;
    stream
        .set_read_timeout(Some(timeout))
        .and_then(|()| stream.set_write_timeout(Some(timeout)))
        .map_err(|e| failed(e.to_string()))?;

    let request = json!(command).to_string();
    wire::write_message(&mut stream, &[request.as_bytes()]).map_err(|e| failed(e.to_string()))?;

    let reply = wire::read_message(&mut stream).map_err(|e| failed(e.to_string()))?;
    let body = reply
        .first()
        .ok_or_else(|| failed("empty reply".to_string()))?;
    match serde_json::from_slice::<Value>(body).map_err(|e| failed(e.to_string()))? {
        Value::String(text) => Ok(text),
        other => Ok(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modes::{CaptureMode, DeliveryMode, Modes};
    use std::io::Write;

    fn listener(modes: &SharedModes) -> SocketAddr {
        let listener = ControlListener::bind("127.0.0.1:0".parse().unwrap(), modes.clone())
            .unwrap()
            .with_idle_timeout(Duration::from_secs(2));
        let addr = listener.local_addr().unwrap();
        listener.spawn().unwrap();
        addr
    }

    #[test]
    fn commands_update_modes_and_reply_ok() {
        let modes = SharedModes::new(Modes::default());
        let addr = listener(&modes);
        let timeout = Duration::from_secs(2);

        let reply = send_control_command(addr, "capture_mode_set_to_all_frames", timeout).unwrap();
        assert_eq!(reply, "ok");
        assert_eq!(
            modes.snapshot(),
            Modes {
                sending: DeliveryMode::Network,
                capture: CaptureMode::AllFrames
            }
        );

        modes.set_sending(DeliveryMode::Local);
        let reply = send_control_command(addr, "reboot", timeout).unwrap();
        assert_eq!(reply, "ok");
        assert_eq!(
            modes.snapshot(),
            Modes {
                sending: DeliveryMode::Network,
                capture: CaptureMode::AllFrames
            }
        );
    }

    #[test]
    fn unreachable_listener_is_a_request_failure() {
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let err = send_control_command(addr, "test", Duration::from_millis(500)).unwrap_err();
        assert!(matches!(err, NetworkError::RequestFailed { .. }));
    }

    #[test]
    fn silent_peer_holds_the_listener_until_idle_timeout() {
        let modes = SharedModes::new(Modes {
            sending: DeliveryMode::Local,
            capture: CaptureMode::MotionOnly,
        });
        let listener = ControlListener::bind("127.0.0.1:0".parse().unwrap(), modes.clone())
            .unwrap()
            .with_idle_timeout(Duration::from_millis(300));
        let addr = listener.local_addr().unwrap();
        listener.spawn().unwrap();

        let _silent = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(50));

        // Too short to outlast the silent peer.
        assert!(send_control_command(addr, "test", Duration::from_millis(100)).is_err());

        let reply = send_control_command(addr, "test", Duration::from_secs(2)).unwrap();
        assert_eq!(reply, "ok");
        assert_eq!(modes.snapshot().sending, DeliveryMode::Network);
    }

    #[test]
    fn undecodable_requests_change_nothing() {
        let modes = SharedModes::new(Modes::default());
        let addr = listener(&modes);

        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        wire::write_message(&mut stream, &[&b"{not json"[..]]).unwrap();
        stream.flush().unwrap();

        let reply = wire::read_message(&mut stream).unwrap();
        assert_eq!(reply, vec![b"\"ok\"".to_vec()]);
        assert_eq!(modes.snapshot(), Modes::default());

        // The same connection keeps serving requests.
        wire::write_message(&mut stream, &[&b"\"test\""[..]]).unwrap();
        let reply = wire::read_message(&mut stream).unwrap();
        assert_eq!(reply, vec![b"\"ok\"".to_vec()]);
        assert_eq!(modes.snapshot().sending, DeliveryMode::Network);
    }
}
