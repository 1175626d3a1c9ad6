use log::{debug, info, warn};
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use crate::config::{constants, validate_device_id};
use crate::error::{NetworkError, RelayError};
use crate::frame::{Frame, decode_frame};
use crate::wire;

/// Receiving end of frame delivery.
///
/// Answers every two-part `(tag, frame)` request with the acknowledgement
/// token once the handler has taken the frame. Requests of any other shape,
/// tags that are not plain device names, and frames the handler fails to
/// take get an error reply, so the sender's request/reply cycle completes
/// and the device keeps the frame.
///
/// Each connected device is served on its own thread; devices keep their
/// connection open between frames.
pub struct FrameCollector {
    listener: TcpListener,
}

impl FrameCollector {
    pub fn bind(addr: SocketAddr) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).map_err(|e| NetworkError::BindFailed {
            address: addr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, each served on a `collector-conn` thread.
    pub fn serve<F, E>(&self, handler: F)
    where
        F: Fn(&str, Frame) -> Result<(), E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        match self.listener.local_addr() {
            Ok(addr) => info!("Collecting frames on tcp://{}", addr),
            Err(e) => warn!("Collector address unknown: {}", e),
        }

        let handler = Arc::new(handler);
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let handler = Arc::clone(&handler);
            let spawned = thread::Builder::new()
                .name("collector-conn".to_string())
                .spawn(move || {
                    if let Err(e) = Self::handle_connection(stream, handler.as_ref()) {
                        warn!("Collector connection ended: {}", e);
                    }
                });
            if let Err(e) = spawned {
                warn!("Failed to start connection thread: {}", e);
            }
        }
    }

    /// Serve one peer until it disconnects.
    pub fn handle_connection<F, E>(mut stream: TcpStream, handler: &F) -> io::Result<()>
    where
        F: Fn(&str, Frame) -> Result<(), E>,
        E: fmt::Display,
    {
        loop {
            let parts = match wire::read_message(&mut stream) {
                Ok(parts) => parts,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };

            let reply = match parts.as_slice() {
                [tag, payload] => Self::accept(tag, payload, handler),
                other => {
                    warn!("Expected a 2-part frame request, got {} part(s)", other.len());
                    constants::COLLECTOR_ERROR_REPLY
                }
            };

            wire::write_message(&mut stream, &[reply.as_bytes()])?;
        }
    }

    fn accept<F, E>(tag: &[u8], payload: &[u8], handler: &F) -> &'static str
    where
        F: Fn(&str, Frame) -> Result<(), E>,
        E: fmt::Display,
    {
        let tag = String::from_utf8_lossy(tag);
        if let Err(e) = validate_device_id("tag", &tag) {
            warn!("Rejecting frame: {}", e);
            return constants::COLLECTOR_ERROR_REPLY;
        }

        let frame = match decode_frame(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Undecodable frame from device {}: {}", tag, e);
                return constants::COLLECTOR_ERROR_REPLY;
            }
        };

        debug!(
            "Frame {}x{} from device {}",
            frame.width(),
            frame.height(),
            tag
        );
        match handler(tag.as_ref(), frame) {
            Ok(()) => constants::ACK_TOKEN,
            Err(e) => {
                warn!("Could not take frame from device {}: {}", tag, e);
                constants::COLLECTOR_ERROR_REPLY
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;
    use image::RgbImage;
    use std::time::Duration;

    fn connect(handler: fn(&str, Frame) -> Result<(), String>) -> TcpStream {
        let collector = FrameCollector::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = collector.local_addr().unwrap();
        thread::spawn(move || collector.serve(handler));

        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
    }

    fn request(stream: &mut TcpStream, parts: &[&[u8]]) -> Vec<Vec<u8>> {
        wire::write_message(stream, parts).unwrap();
        wire::read_message(stream).unwrap()
    }

    #[test]
    fn rejects_malformed_requests_without_closing() {
        let mut stream = connect(|_, _| Ok(()));

        let reply = request(&mut stream, &[&b"only one part"[..]]);
        assert_eq!(reply, vec![b"error".to_vec()]);

        let reply = request(&mut stream, &[&b"1"[..], &b"short"[..]]);
        assert_eq!(reply, vec![b"error".to_vec()]);

        let frame = encode_frame(&Frame::now(RgbImage::new(2, 2)));
        let reply = request(&mut stream, &[&b"1"[..], &frame]);
        assert_eq!(reply, vec![b"ack".to_vec()]);
    }

    #[test]
    fn rejects_tags_that_are_not_device_names() {
        let mut stream = connect(|tag, _| panic!("handler called for {:?}", tag));
        let frame = encode_frame(&Frame::now(RgbImage::new(2, 2)));

        for tag in ["../escaped", "/abs", "a\\b", ""] {
            let reply = request(&mut stream, &[tag.as_bytes(), &frame]);
            assert_eq!(reply, vec![b"error".to_vec()], "{:?}", tag);
        }
    }

    #[test]
    fn handler_failure_is_not_acknowledged() {
        let mut stream = connect(|_, _| Err("disk full".to_string()));
        let frame = encode_frame(&Frame::now(RgbImage::new(2, 2)));

        let reply = request(&mut stream, &[&b"1"[..], &frame]);
        assert_eq!(reply, vec![b"error".to_vec()]);
    }
}
