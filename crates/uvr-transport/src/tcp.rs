//! Length-prefixed frames over one TCP stream.
//!
//! The byte stream is already ordered and reliable, so the 12-byte prefix is
//! written once per frame and the payload follows unfragmented. There is no
//! stall policy: a read either completes or fails.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};
use uvr_core::{BackendKind, FrameBuffer, TransportError};

use crate::wire::{FragmentHeader, PREFIX_LEN};
use crate::{RecvOutcome, ShutdownHandle, Transport};

pub struct TcpTransport<S: Read + Write + Send = TcpStream> {
    stream: S,
    shutdown: ShutdownHandle,
    last_span: Option<Duration>,
}

impl TcpTransport<TcpStream> {
    /// Sender side: listens on `local` and blocks until the receiver connects.
    pub fn accept(local: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(local).map_err(|source| TransportError::Bind {
            addr: local.to_string(),
            source,
        })?;
        info!(
            "TCP sender waiting for receiver on {}",
            listener.local_addr().map_err(TransportError::Socket)?
        );
        Self::accept_from(&listener)
    }

    /// Accepts exactly one connection from an already bound listener.
    pub fn accept_from(listener: &TcpListener) -> Result<Self, TransportError> {
        let (stream, peer) = listener.accept().map_err(TransportError::Socket)?;
        info!("TCP receiver connected from {}", peer);
        Self::from_tcp_stream(stream)
    }

    /// Receiver side: connects to the listening sender.
    pub fn connect(peer: SocketAddr) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(peer).map_err(|source| TransportError::Connect {
            addr: peer.to_string(),
            source,
        })?;
        info!("TCP receiver connected to {}", peer);
        Self::from_tcp_stream(stream)
    }

    fn from_tcp_stream(stream: TcpStream) -> Result<Self, TransportError> {
        stream.set_nodelay(true).map_err(TransportError::Socket)?;
        stream.set_nonblocking(false).map_err(TransportError::Socket)?;
        let unblock = stream.try_clone().map_err(TransportError::Socket)?;
        Ok(Self {
            stream,
            shutdown: ShutdownHandle::with_stream(unblock),
            last_span: None,
        })
    }
}

impl<S: Read + Write + Send> TcpTransport<S> {
    /// Wraps any blocking byte stream.
    pub fn from_stream(stream: S) -> Self {
        Self {
            stream,
            shutdown: ShutdownHandle::new(),
            last_span: None,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    fn read_frame(&mut self, frame: &mut FrameBuffer) -> Result<(), TransportError> {
        let mut prefix = [0u8; PREFIX_LEN];
        read_fully(&mut self.stream, &mut prefix)?;
        let started_at = Instant::now();
        let header = FragmentHeader::decode(&prefix)?;

        frame.clear();
        if header.total_size > frame.limit() {
            return Err(TransportError::FrameTooLarge {
                size: header.total_size,
                limit: frame.limit(),
            });
        }
        frame.set_timestamp(header.timestamp);
        if header.total_size == 0 {
            self.last_span = Some(Duration::ZERO);
            return Ok(());
        }

        let payload = frame.fill(header.total_size).map_err(|overflow| TransportError::FrameTooLarge {
            size: header.total_size,
            limit: overflow.limit,
        })?;
        if let Err(e) = read_fully(&mut self.stream, payload) {
            frame.clear();
            return Err(e);
        }
        self.last_span = Some(started_at.elapsed());
        Ok(())
    }
}

/// Loops on short reads until `buf` is full. End of stream is
/// [`TransportError::ConnectionClosed`].
fn read_fully(stream: &mut impl Read, buf: &mut [u8]) -> Result<(), TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(TransportError::ConnectionClosed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::Read(e)),
        }
    }
    Ok(())
}

impl<S: Read + Write + Send> Transport for TcpTransport<S> {
    fn kind(&self) -> BackendKind {
        BackendKind::Tcp
    }

    fn send(&mut self, frame: &FrameBuffer) -> Result<(), TransportError> {
        let prefix = FragmentHeader::new(frame.size(), frame.timestamp()).encode()?;
        self.stream.write_all(&prefix).map_err(TransportError::Write)?;
        self.stream.write_all(frame.as_slice()).map_err(TransportError::Write)?;
        self.stream.flush().map_err(TransportError::Write)?;
        trace!("TCP sent {} byte frame", frame.size());
        Ok(())
    }

    fn recv(&mut self, frame: &mut FrameBuffer) -> Result<RecvOutcome, TransportError> {
        match self.read_frame(frame) {
            Ok(()) => Ok(RecvOutcome::Complete),
            Err(_) if self.shutdown.is_shutdown() => Ok(RecvOutcome::Shutdown),
            Err(e) => Err(e),
        }
    }

    fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    fn last_frame_span(&self) -> Option<Duration> {
        self.last_span
    }

    fn deinit(&mut self) {
        self.shutdown.shutdown();
        debug!("TCP transport closed");
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use uvr_core::TimeValue;

    /// Reads from a script in fixed-size dribbles; writes are collected.
    struct Dribble {
        input: Cursor<Vec<u8>>,
        chunk: usize,
        reads: usize,
        output: Vec<u8>,
    }

    impl Dribble {
        fn new(input: Vec<u8>, chunk: usize) -> Self {
            Self {
                input: Cursor::new(input),
                chunk,
                reads: 0,
                output: Vec::new(),
            }
        }
    }

    impl Read for Dribble {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            let n = buf.len().min(self.chunk);
            self.input.read(&mut buf[..n])
        }
    }

    impl Write for Dribble {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn encoded(size: i32, payload: &[u8]) -> Vec<u8> {
        let mut out = size.to_le_bytes().to_vec();
        out.extend_from_slice(&11i32.to_le_bytes());
        out.extend_from_slice(&22i32.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn send_writes_prefix_once_then_payload() {
        let mut t = TcpTransport::from_stream(Dribble::new(Vec::new(), 1));
        let mut frame = FrameBuffer::with_limit(8192);
        frame.append(&[5u8; 5000]).unwrap();
        frame.set_timestamp(TimeValue::new(11, 22));
        t.send(&frame).unwrap();

        let out = &t.get_ref().output;
        assert_eq!(out.len(), PREFIX_LEN + 5000);
        assert_eq!(&out[..PREFIX_LEN], &encoded(5000, &[])[..]);
    }

    #[test]
    fn short_reads_are_stitched_together() {
        let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let mut t = TcpTransport::from_stream(Dribble::new(encoded(3000, &payload), 7));
        let mut frame = FrameBuffer::with_limit(8192);
        assert_eq!(t.last_frame_span(), None);

        assert_eq!(t.recv(&mut frame).unwrap(), RecvOutcome::Complete);
        assert_eq!(frame.as_slice(), &payload[..]);
        assert_eq!(frame.timestamp(), TimeValue::new(11, 22));
        assert!(t.last_frame_span().is_some());
    }

    #[test]
    fn zero_size_frame_skips_payload_read() {
        let mut t = TcpTransport::from_stream(Dribble::new(encoded(0, &[]), 64));
        let mut frame = FrameBuffer::with_limit(64);
        frame.append(b"stale").unwrap();

        assert_eq!(t.recv(&mut frame).unwrap(), RecvOutcome::Complete);
        assert_eq!(frame.size(), 0);
        // One read for the prefix, none for the payload.
        assert_eq!(t.get_ref().reads, 1);
    }

    #[test]
    fn eof_mid_frame_is_connection_closed() {
        let mut input = encoded(100, &[1u8; 40]);
        input.truncate(PREFIX_LEN + 40);
        let mut t = TcpTransport::from_stream(Dribble::new(input, 64));
        let mut frame = FrameBuffer::with_limit(256);

        assert!(matches!(t.recv(&mut frame), Err(TransportError::ConnectionClosed)));
        assert_eq!(frame.size(), 0);
    }

    #[test]
    fn negative_and_oversized_sizes_are_rejected() {
        let mut t = TcpTransport::from_stream(Dribble::new(encoded(-1, &[]), 64));
        let mut frame = FrameBuffer::with_limit(256);
        assert!(matches!(t.recv(&mut frame), Err(TransportError::Wire(_))));

        let mut t = TcpTransport::from_stream(Dribble::new(encoded(1000, &[0u8; 1000]), 64));
        assert!(matches!(
            t.recv(&mut frame),
            Err(TransportError::FrameTooLarge { size: 1000, limit: 256 })
        ));
    }
}
