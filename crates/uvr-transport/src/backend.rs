//! Backend selection: one variant per transport, chosen once from config.

use std::net::{SocketAddr, UdpSocket};

use tracing::info;
use uvr_core::{
    BackendKind, ConfigError, FrameBuffer, RecoverySignal, Role, TransportConfig, TransportError,
    UvrError,
};

use crate::datagram::DatagramTransport;
use crate::feedback::FeedbackNotifier;
use crate::message::{MessageChannel, MessageTransport};
use crate::raw::RawLinkSocket;
use crate::reassembly::Reassembler;
use crate::socket::{udp_receiver, udp_sender};
use crate::tcp::TcpTransport;
use crate::wire::{DatagramCodec, LinkHeader};
use crate::{RecvOutcome, ShutdownHandle, Transport};

pub enum Backend {
    RawLink(DatagramTransport<RawLinkSocket>),
    Udp(DatagramTransport<UdpSocket>),
    Tcp(TcpTransport),
    ReliableMessage(MessageTransport),
}

impl Backend {
    /// Creates, binds and connects the socket described by `config`.
    ///
    /// Receivers raise `signal` whenever a frame is dropped. The
    /// reliable-message backend needs an established channel and is built
    /// with [`Backend::reliable_message`] instead.
    pub fn init(config: &TransportConfig, signal: &RecoverySignal) -> Result<Self, UvrError> {
        config.validate()?;
        info!("Initializing {} backend as {:?}", config.backend, config.role);

        let backend = match config.backend {
            BackendKind::RawLink => {
                let codec = DatagramCodec::raw_link(LinkHeader::from_config(&config.link), config.fragment_size);
                let socket = match config.role {
                    Role::Sender => RawLinkSocket::sender(&config.link)?,
                    Role::Receiver => RawLinkSocket::receiver(&config.link)?,
                };
                Backend::RawLink(datagram(config, socket, codec, signal)?)
            }
            BackendKind::Udp => {
                let codec = DatagramCodec::udp(config.fragment_size);
                let socket = match config.role {
                    Role::Sender => udp_sender(config.local_addr, required(config.peer_addr, "peer_addr", config)?)?,
                    Role::Receiver => udp_receiver(required(config.local_addr, "local_addr", config)?)?,
                };
                Backend::Udp(datagram(config, socket, codec, signal)?)
            }
            BackendKind::Tcp => Backend::Tcp(match config.role {
                Role::Sender => TcpTransport::accept(required(config.local_addr, "local_addr", config)?)?,
                Role::Receiver => TcpTransport::connect(required(config.peer_addr, "peer_addr", config)?)?,
            }),
            BackendKind::ReliableMessage => {
                return Err(TransportError::Unsupported {
                    backend: BackendKind::ReliableMessage,
                }
                .into())
            }
        };
        Ok(backend)
    }

    pub fn reliable_message(channel: Box<dyn MessageChannel>) -> Self {
        Backend::ReliableMessage(MessageTransport::new(channel))
    }

    fn inner(&self) -> &dyn Transport {
        match self {
            Backend::RawLink(t) => t,
            Backend::Udp(t) => t,
            Backend::Tcp(t) => t,
            Backend::ReliableMessage(t) => t,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Transport {
        match self {
            Backend::RawLink(t) => t,
            Backend::Udp(t) => t,
            Backend::Tcp(t) => t,
            Backend::ReliableMessage(t) => t,
        }
    }
}

fn required(addr: Option<SocketAddr>, field: &'static str, config: &TransportConfig) -> Result<SocketAddr, ConfigError> {
    addr.ok_or(ConfigError::MissingField {
        field,
        backend: config.backend,
    })
}

fn datagram<S: crate::socket::DatagramSocket>(
    config: &TransportConfig,
    socket: S,
    codec: DatagramCodec,
    signal: &RecoverySignal,
) -> Result<DatagramTransport<S>, TransportError> {
    let reassembler = Reassembler::new(config.stall_threshold(), signal.clone());
    let transport = DatagramTransport::new(config.backend, socket, codec, reassembler);
    match (config.role, config.feedback_addr) {
        (Role::Receiver, Some(target)) => Ok(transport.with_feedback(FeedbackNotifier::connect(target)?)),
        _ => Ok(transport),
    }
}

impl Transport for Backend {
    fn kind(&self) -> BackendKind {
        self.inner().kind()
    }

    fn send(&mut self, frame: &FrameBuffer) -> Result<(), TransportError> {
        self.inner_mut().send(frame)
    }

    fn recv(&mut self, frame: &mut FrameBuffer) -> Result<RecvOutcome, TransportError> {
        self.inner_mut().recv(frame)
    }

    fn shutdown_handle(&self) -> ShutdownHandle {
        self.inner().shutdown_handle()
    }

    fn last_frame_span(&self) -> Option<std::time::Duration> {
        self.inner().last_frame_span()
    }

    fn deinit(&mut self) {
        info!("Deinitializing {} backend", self.kind());
        self.inner_mut().deinit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::InProcessChannel;

    #[test]
    fn reliable_message_requires_a_channel() {
        let config = TransportConfig::new(BackendKind::ReliableMessage, Role::Sender);
        let err = Backend::init(&config, &RecoverySignal::new()).err().unwrap();
        assert!(matches!(
            err,
            UvrError::Transport(TransportError::Unsupported {
                backend: BackendKind::ReliableMessage
            })
        ));

        let (a, _b) = InProcessChannel::pair();
        assert_eq!(Backend::reliable_message(Box::new(a)).kind(), BackendKind::ReliableMessage);
    }

    #[test]
    fn invalid_config_is_rejected_before_any_socket_is_opened() {
        let config = TransportConfig::new(BackendKind::Udp, Role::Sender);
        let err = Backend::init(&config, &RecoverySignal::new()).err().unwrap();
        assert!(matches!(
            err,
            UvrError::Config(ConfigError::MissingField { field: "peer_addr", .. })
        ));
    }

    #[test]
    fn udp_receiver_binds_and_reports_kind() {
        let config = TransportConfig::new(BackendKind::Udp, Role::Receiver)
            .with_local_addr("127.0.0.1:0".parse().unwrap());
        let mut backend = Backend::init(&config, &RecoverySignal::new()).unwrap();
        assert_eq!(backend.kind(), BackendKind::Udp);
        backend.deinit();
        assert!(backend.shutdown_handle().is_shutdown());
    }
}
