//! Fragmenting transport shared by the raw-link and UDP backends.

use std::io;
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, trace};
use uvr_core::{BackendKind, FrameBuffer, TransportError};

use crate::clock::{Clock, MonotonicClock};
use crate::feedback::FeedbackNotifier;
use crate::reassembly::{Progress, ReassemblyState, ReassemblyStats, Reassembler};
use crate::socket::DatagramSocket;
use crate::wire::{DatagramCodec, FragmentHeader};
use crate::{RecvOutcome, ShutdownHandle, Transport, IDLE_POLL_INTERVAL};

pub struct DatagramTransport<S: DatagramSocket, C: Clock = MonotonicClock> {
    kind: BackendKind,
    socket: S,
    codec: DatagramCodec,
    reassembler: Reassembler<C>,
    send_buf: BytesMut,
    recv_buf: Vec<u8>,
    shutdown: ShutdownHandle,
    feedback: Option<FeedbackNotifier>,
    idle_poll: Duration,
}

impl<S: DatagramSocket, C: Clock> DatagramTransport<S, C> {
    pub fn new(kind: BackendKind, socket: S, codec: DatagramCodec, reassembler: Reassembler<C>) -> Self {
        let max_datagram = codec.max_datagram_len();
        let reassembler = reassembler.with_padding_allowance(codec.padding_allowance());
        Self {
            kind,
            socket,
            send_buf: BytesMut::with_capacity(max_datagram),
            // One spare byte so an oversized datagram is seen as oversized, not truncated.
            recv_buf: vec![0u8; max_datagram + 1],
            codec,
            reassembler,
            shutdown: ShutdownHandle::new(),
            feedback: None,
            idle_poll: IDLE_POLL_INTERVAL,
        }
    }

    /// Report aborted frames to the sender's feedback listener.
    pub fn with_feedback(mut self, feedback: FeedbackNotifier) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    pub fn codec(&self) -> &DatagramCodec {
        &self.codec
    }

    pub fn reassembly_stats(&self) -> ReassemblyStats {
        self.reassembler.stats()
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    /// Makes exactly one receive attempt and feeds the result to the reassembler.
    pub fn poll_recv(&mut self, frame: &mut FrameBuffer) -> Result<Progress, TransportError> {
        let progress = match self.socket.recv_datagram(&mut self.recv_buf) {
            Ok(n) => match self.codec.decode(&self.recv_buf[..n]) {
                Ok((header, payload)) => self.reassembler.on_fragment(&header, payload, frame),
                Err(e) => {
                    debug!("{} ignoring datagram: {}", self.kind, e);
                    self.reassembler.on_would_block(frame)
                }
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.reassembler.on_would_block(frame),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => match self.reassembler.state(frame) {
                ReassemblyState::AwaitingSize => Progress::Idle,
                ReassemblyState::Accumulating { .. } => Progress::Accumulating,
            },
            Err(e) => return Err(TransportError::Read(e)),
        };
        if progress == Progress::Aborted {
            if let Some(feedback) = &self.feedback {
                feedback.notify_stall();
            }
        }
        Ok(progress)
    }

    fn send_fragment(&mut self) -> Result<(), TransportError> {
        loop {
            match self.socket.send_datagram(&self.send_buf) {
                Ok(n) if n == self.send_buf.len() => return Ok(()),
                Ok(n) => {
                    return Err(TransportError::Write(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("datagram truncated to {} of {} bytes", n, self.send_buf.len()),
                    )))
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    thread::yield_now();
                }
                Err(e) => return Err(TransportError::Write(e)),
            }
        }
    }
}

impl<S: DatagramSocket, C: Clock> Transport for DatagramTransport<S, C> {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Emits `ceil(size / fragment_size)` datagrams; an empty frame emits none.
    fn send(&mut self, frame: &FrameBuffer) -> Result<(), TransportError> {
        let header = FragmentHeader::new(frame.size(), frame.timestamp());
        let mut fragments = 0usize;
        for payload in self.codec.fragments(frame.as_slice()) {
            self.codec.encode(&header, payload, &mut self.send_buf)?;
            self.send_fragment()?;
            fragments += 1;
        }
        trace!("{} sent {} bytes in {} fragments", self.kind, frame.size(), fragments);
        Ok(())
    }

    fn recv(&mut self, frame: &mut FrameBuffer) -> Result<RecvOutcome, TransportError> {
        loop {
            match self.poll_recv(frame)? {
                Progress::Complete => return Ok(RecvOutcome::Complete),
                Progress::Aborted => return Ok(RecvOutcome::Dropped),
                Progress::Accumulating => std::hint::spin_loop(),
                Progress::Idle => {
                    if self.shutdown.is_shutdown() {
                        return Ok(RecvOutcome::Shutdown);
                    }
                    thread::sleep(self.idle_poll);
                }
            }
        }
    }

    fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    fn last_frame_span(&self) -> Option<Duration> {
        self.reassembler.last_frame_span()
    }

    fn deinit(&mut self) {
        self.shutdown.shutdown();
        debug!("{} transport closed ({:?})", self.kind, self.reassembler.stats());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::wire::{LinkHeader, MIN_LINK_FRAME_LEN};
    use uvr_core::{FrameKind, LinkConfig, RecoverySignal, TimeValue, RECOVERY_REQUESTED};

    enum Step {
        Datagram(Vec<u8>),
        /// Nothing queued; the clock moves forward by the given amount.
        Empty(Duration),
        Interrupted,
    }

    struct ScriptedSocket {
        script: VecDeque<Step>,
        clock: ManualClock,
        received: Arc<AtomicUsize>,
        sent: Vec<Vec<u8>>,
    }

    impl DatagramSocket for ScriptedSocket {
        fn send_datagram(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.sent.push(buf.to_vec());
            Ok(buf.len())
        }

        fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.script.pop_front() {
                Some(Step::Datagram(d)) => {
                    self.received.fetch_add(1, Ordering::SeqCst);
                    buf[..d.len()].copy_from_slice(&d);
                    Ok(d.len())
                }
                Some(Step::Empty(by)) => {
                    self.clock.advance(by);
                    Err(io::ErrorKind::WouldBlock.into())
                }
                Some(Step::Interrupted) => Err(io::ErrorKind::Interrupted.into()),
                None => Err(io::ErrorKind::ConnectionAborted.into()),
            }
        }
    }

    fn envelopes(codec: &DatagramCodec, frame: &[u8]) -> Vec<Vec<u8>> {
        let header = FragmentHeader::new(frame.len(), TimeValue::new(7, 8));
        let mut out = BytesMut::new();
        codec
            .fragments(frame)
            .map(|p| {
                codec.encode(&header, p, &mut out).unwrap();
                out.to_vec()
            })
            .collect()
    }

    fn transport(
        script: Vec<Step>,
    ) -> (DatagramTransport<ScriptedSocket, ManualClock>, RecoverySignal, Arc<AtomicUsize>) {
        transport_with(BackendKind::Udp, DatagramCodec::udp(1450), script)
    }

    fn transport_with(
        kind: BackendKind,
        codec: DatagramCodec,
        script: Vec<Step>,
    ) -> (DatagramTransport<ScriptedSocket, ManualClock>, RecoverySignal, Arc<AtomicUsize>) {
        let clock = ManualClock::new();
        let signal = RecoverySignal::new();
        let received = Arc::new(AtomicUsize::new(0));
        let socket = ScriptedSocket {
            script: script.into(),
            clock: clock.clone(),
            received: Arc::clone(&received),
            sent: Vec::new(),
        };
        let reassembler = Reassembler::with_clock(Duration::from_millis(3), signal.clone(), clock);
        let t = DatagramTransport::new(kind, socket, codec, reassembler)
            .with_idle_poll(Duration::ZERO);
        (t, signal, received)
    }

    #[test]
    fn send_fragments_five_thousand_bytes_into_four_datagrams() {
        let (mut t, _, _) = transport(Vec::new());
        let mut frame = FrameBuffer::with_limit(10_000);
        frame.append(&[9u8; 5000]).unwrap();
        t.send(&frame).unwrap();

        let lens: Vec<usize> = t.socket.sent.iter().map(|d| d.len() - 12).collect();
        assert_eq!(lens, vec![1450, 1450, 1450, 650]);
        for d in &t.socket.sent {
            assert_eq!(&d[..4], &5000i32.to_le_bytes());
        }
    }

    #[test]
    fn empty_frame_sends_nothing() {
        let (mut t, _, _) = transport(Vec::new());
        t.send(&FrameBuffer::with_limit(16)).unwrap();
        assert!(t.socket.sent.is_empty());
    }

    #[test]
    fn recv_completes_after_four_receives() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
        let codec = DatagramCodec::udp(1450);
        let mut script = vec![Step::Empty(Duration::from_secs(1))];
        for d in envelopes(&codec, &data) {
            script.push(Step::Empty(Duration::from_millis(1)));
            script.push(Step::Datagram(d));
        }
        let (mut t, signal, received) = transport(script);
        let mut frame = FrameBuffer::with_limit(10_000);

        assert_eq!(t.recv(&mut frame).unwrap(), RecvOutcome::Complete);
        assert_eq!(received.load(Ordering::SeqCst), 4);
        assert_eq!(frame.as_slice(), &data[..]);
        assert_eq!(frame.timestamp(), TimeValue::new(7, 8));
        assert_eq!(signal.value(), 0);
        assert_eq!(t.last_frame_span(), Some(Duration::from_millis(3)));
    }

    #[test]
    fn missing_fragment_drops_frame_and_requests_keyframe() {
        let data = vec![1u8; 5000];
        let codec = DatagramCodec::udp(1450);
        let mut frags = envelopes(&codec, &data);
        frags.remove(2);
        let mut script: Vec<Step> = frags.drain(..2).map(Step::Datagram).collect();
        script.extend((0..4).map(|_| Step::Empty(Duration::from_millis(1))));
        let (mut t, signal, _) = transport(script);
        let mut frame = FrameBuffer::with_limit(10_000);

        assert_eq!(t.recv(&mut frame).unwrap(), RecvOutcome::Dropped);
        assert_eq!(frame.size(), 0);
        assert_eq!(signal.value(), RECOVERY_REQUESTED);
        assert_eq!(signal.service(), FrameKind::Key);
        assert_eq!(signal.value(), -6);
        assert_eq!(t.reassembly_stats().aborted, 1);
    }

    #[test]
    fn garbage_datagrams_are_ignored() {
        let codec = DatagramCodec::udp(1450);
        let mut script = vec![Step::Datagram(vec![1, 2, 3])];
        script.extend(envelopes(&codec, b"hello").into_iter().map(Step::Datagram));
        let (mut t, signal, _) = transport(script);
        let mut frame = FrameBuffer::with_limit(64);

        assert_eq!(t.recv(&mut frame).unwrap(), RecvOutcome::Complete);
        assert_eq!(frame.as_slice(), b"hello");
        assert_eq!(signal.value(), 0);
    }

    #[test]
    fn idle_recv_observes_shutdown() {
        let (mut t, _, _) = transport(vec![Step::Empty(Duration::ZERO)]);
        t.shutdown_handle().shutdown();
        let mut frame = FrameBuffer::with_limit(64);
        assert_eq!(t.recv(&mut frame).unwrap(), RecvOutcome::Shutdown);
    }

    #[test]
    fn raw_link_padded_final_fragment_completes() {
        let codec = DatagramCodec::raw_link(LinkHeader::from_config(&LinkConfig::default()), 1450);
        let data: Vec<u8> = (0..1460u32).map(|i| (i % 251 + 1) as u8).collect();
        let mut frags = envelopes(&codec, &data);
        let last = frags.last_mut().unwrap();
        assert_eq!(last.len(), 36);
        last.resize(MIN_LINK_FRAME_LEN, 0);

        let script = frags.into_iter().map(Step::Datagram).collect();
        let (mut t, signal, received) = transport_with(BackendKind::RawLink, codec, script);
        let mut frame = FrameBuffer::with_limit(10_000);

        assert_eq!(t.recv(&mut frame).unwrap(), RecvOutcome::Complete);
        assert_eq!(received.load(Ordering::SeqCst), 2);
        assert_eq!(frame.as_slice(), &data[..]);
        assert_eq!(signal.value(), 0);
        assert_eq!(t.reassembly_stats().aborted, 0);
    }

    #[test]
    fn interrupted_while_idle_observes_shutdown() {
        let (mut t, _, _) = transport(vec![Step::Interrupted]);
        t.shutdown_handle().shutdown();
        let mut frame = FrameBuffer::with_limit(64);
        assert_eq!(t.recv(&mut frame).unwrap(), RecvOutcome::Shutdown);
    }

    #[test]
    fn interrupted_mid_frame_keeps_accumulating() {
        let codec = DatagramCodec::udp(1450);
        let data = vec![3u8; 2000];
        let mut frags = envelopes(&codec, &data).into_iter();
        let script = vec![
            Step::Datagram(frags.next().unwrap()),
            Step::Interrupted,
            Step::Datagram(frags.next().unwrap()),
        ];
        let (mut t, signal, _) = transport(script);
        t.shutdown_handle().shutdown();
        let mut frame = FrameBuffer::with_limit(4096);

        assert_eq!(t.recv(&mut frame).unwrap(), RecvOutcome::Complete);
        assert_eq!(frame.as_slice(), &data[..]);
        assert_eq!(signal.value(), 0);
    }

    #[test]
    fn socket_errors_are_fatal() {
        let (mut t, _, _) = transport(Vec::new());
        let mut frame = FrameBuffer::with_limit(64);
        assert!(matches!(t.recv(&mut frame), Err(TransportError::Read(_))));
    }
}
