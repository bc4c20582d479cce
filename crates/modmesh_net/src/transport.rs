use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use modmesh_proto::MeshError;

/// Largest frame either side accepts; larger length prefixes are refused
/// before any payload is buffered.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

/// Request/response exchange of opaque frames with a node at `address`.
pub trait Transport: Send + Sync {
    fn request(&self, address: &str, payload: &[u8], timeout: Duration)
        -> Result<Vec<u8>, MeshError>;
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!(
                "frame of {} bytes exceeds limit {}",
                payload.len(),
                MAX_FRAME_PAYLOAD
            ),
        ));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "frame length overflows u32"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Reads one frame. `Ok(None)` means the peer closed cleanly between frames.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0_u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "connection closed inside frame header",
                ))
            }
            Ok(read) => filled += read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit {}", len, MAX_FRAME_PAYLOAD),
        ));
    }
    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// One TCP connection per request, bounded by connect/read/write timeouts.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }

    fn connect(&self, address: &str, timeout: Duration) -> Result<TcpStream, MeshError> {
        let targets: Vec<SocketAddr> = address
            .to_socket_addrs()
            .map_err(|err| MeshError::Transport {
                address: address.to_string(),
                reason: format!("resolve failed: {}", err),
            })?
            .collect();
        let mut last_error = None;
        for target in targets {
            match TcpStream::connect_timeout(&target, timeout) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_error = Some(err),
            }
        }
        Err(match last_error {
            Some(err) => io_to_mesh_error(address, timeout, "connect", err),
            None => MeshError::Transport {
                address: address.to_string(),
                reason: "address resolved to no socket addresses".to_string(),
            },
        })
    }
}

impl Transport for TcpTransport {
    fn request(
        &self,
        address: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, MeshError> {
        let mut stream = self.connect(address, timeout)?;
        let io_error = |action: &str, err: io::Error| io_to_mesh_error(address, timeout, action, err);
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|err| io_error("set read timeout", err))?;
        stream
            .set_write_timeout(Some(timeout))
            .map_err(|err| io_error("set write timeout", err))?;
        stream.set_nodelay(true).map_err(|err| io_error("set nodelay", err))?;
        write_frame(&mut stream, payload).map_err(|err| io_error("write", err))?;
        match read_frame(&mut stream).map_err(|err| io_error("read", err))? {
            Some(response) => Ok(response),
            None => Err(MeshError::Transport {
                address: address.to_string(),
                reason: "connection closed before response".to_string(),
            }),
        }
    }
}

fn io_to_mesh_error(address: &str, timeout: Duration, action: &str, err: io::Error) -> MeshError {
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => MeshError::Timeout {
            address: address.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        },
        _ => MeshError::Transport {
            address: address.to_string(),
            reason: format!("{} failed: {}", action, err),
        },
    }
}

type FrameHandler = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, MeshError> + Send + Sync>;

/// Routes requests to in-process handlers keyed by address.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    handlers: Arc<Mutex<HashMap<String, FrameHandler>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(
        &self,
        address: &str,
        handler: impl Fn(&[u8]) -> Result<Vec<u8>, MeshError> + Send + Sync + 'static,
    ) {
        let mut handlers = self
            .handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.insert(address.to_string(), Arc::new(handler));
    }

    pub fn remove_handler(&self, address: &str) -> bool {
        let mut handlers = self
            .handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.remove(address).is_some()
    }
}

impl Transport for InMemoryTransport {
    fn request(
        &self,
        address: &str,
        payload: &[u8],
        _timeout: Duration,
    ) -> Result<Vec<u8>, MeshError> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(MeshError::Transport {
                address: address.to_string(),
                reason: "frame exceeds size limit".to_string(),
            });
        }
        let handler = {
            let handlers = self
                .handlers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            handlers.get(address).cloned()
        };
        let handler = handler.ok_or_else(|| MeshError::Transport {
            address: address.to_string(),
            reason: "connection refused".to_string(),
        })?;
        handler(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn frames_roundtrip_back_to_back() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"first").expect("write");
        write_frame(&mut buf, b"").expect("write empty");
        let mut reader = Cursor::new(buf);
        assert_eq!(read_frame(&mut reader).expect("read"), Some(b"first".to_vec()));
        assert_eq!(read_frame(&mut reader).expect("read"), Some(Vec::new()));
        assert_eq!(read_frame(&mut reader).expect("eof"), None);
    }

    #[test]
    fn oversized_length_prefix_is_refused() {
        let mut buf = ((MAX_FRAME_PAYLOAD + 1) as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(b"tail");
        let err = read_frame(&mut Cursor::new(buf)).expect_err("too large");
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_header_is_an_error() {
        let err = read_frame(&mut Cursor::new(vec![0_u8, 0])).expect_err("truncated");
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn tcp_transport_exchanges_one_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let request = read_frame(&mut stream).expect("read").expect("frame");
            let mut reply = b"echo:".to_vec();
            reply.extend_from_slice(&request);
            write_frame(&mut stream, &reply).expect("write");
        });
        let response = TcpTransport::new()
            .request(&address, b"ping", Duration::from_secs(2))
            .expect("request");
        assert_eq!(response, b"echo:ping".to_vec());
        server.join().expect("join");
    }

    #[test]
    fn tcp_transport_times_out_on_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            thread::sleep(Duration::from_millis(400));
            drop(stream);
        });
        let err = TcpTransport::new()
            .request(&address, b"ping", Duration::from_millis(100))
            .expect_err("timeout");
        assert!(matches!(err, MeshError::Timeout { .. }), "{err:?}");
        server.join().expect("join");
    }

    #[test]
    fn in_memory_transport_refuses_unknown_address() {
        let transport = InMemoryTransport::new();
        transport.register_handler("10.0.0.1:80", |payload| Ok(payload.to_vec()));
        assert_eq!(
            transport
                .request("10.0.0.1:80", b"x", Duration::from_secs(1))
                .expect("echo"),
            b"x".to_vec()
        );
        assert!(matches!(
            transport.request("10.0.0.2:80", b"x", Duration::from_secs(1)),
            Err(MeshError::Transport { .. })
        ));
        assert!(transport.remove_handler("10.0.0.1:80"));
    }
}
