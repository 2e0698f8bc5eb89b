use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Largest fragment payload the datagram backends carry.
pub const MAX_FRAGMENT_SIZE: usize = 1450;
/// Ethertype reserved for private experiments (IEEE 802 local experimental 1).
pub const DEFAULT_ETHERTYPE: u16 = 0x88b5;
/// Port the sender side binds.
pub const SENDER_PORT: u16 = 21221;
/// Port the receiver side binds.
pub const RECEIVER_PORT: u16 = 21222;

// MARK: - BackendKind

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[serde(alias = "raw", alias = "rawLink")]
    RawLink,
    Udp,
    Tcp,
    #[serde(alias = "webrtc", alias = "reliableMessage")]
    ReliableMessage,
}

impl BackendKind {
    /// Backends that fragment frames into datagrams and reassemble them.
    pub fn is_datagram(&self) -> bool {
        matches!(self, Self::RawLink | Self::Udp)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RawLink => write!(f, "raw-link"),
            Self::Udp => write!(f, "UDP"),
            Self::Tcp => write!(f, "TCP"),
            Self::ReliableMessage => write!(f, "reliable-message"),
        }
    }
}

// MARK: - Role

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Sender,
    Receiver,
}

// MARK: - MacAddr

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

impl FromStr for MacAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for byte in out.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| ConfigError::Parse(format!("MAC address '{s}' is too short")))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| ConfigError::Parse(format!("Invalid MAC octet '{part}' in '{s}'")))?;
        }
        if parts.next().is_some() {
            return Err(ConfigError::Parse(format!("MAC address '{s}' is too long")));
        }
        Ok(Self(out))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

// MARK: - LinkConfig

/// Link-layer settings for the raw-link backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    #[serde(alias = "interfaceIndex")]
    pub interface_index: i32,
    #[serde(alias = "destinationMac")]
    pub destination_mac: MacAddr,
    #[serde(alias = "sourceMac")]
    pub source_mac: MacAddr,
    pub ethertype: u16,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            interface_index: 3,
            destination_mac: MacAddr([0xe4, 0x5f, 0x01, 0xbe, 0xa8, 0xcf]),
            source_mac: MacAddr([0xd8, 0xbb, 0xc1, 0x4a, 0x07, 0xb7]),
            ethertype: DEFAULT_ETHERTYPE,
        }
    }
}

// MARK: - TransportConfig

/// Everything a backend needs at `init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub backend: BackendKind,
    pub role: Role,
    #[serde(alias = "localAddr")]
    pub local_addr: Option<SocketAddr>,
    #[serde(alias = "peerAddr")]
    pub peer_addr: Option<SocketAddr>,
    pub link: LinkConfig,
    #[serde(alias = "fragmentSize")]
    pub fragment_size: usize,
    #[serde(alias = "stallThresholdUs")]
    pub stall_threshold_us: u64,
    #[serde(alias = "targetFPS", alias = "targetFps")]
    pub target_fps: u32,
    #[serde(alias = "maxFrameSize")]
    pub max_frame_size: usize,
    /// Where the receiver reports stalls; the sender listens on it.
    #[serde(alias = "feedbackAddr")]
    pub feedback_addr: Option<SocketAddr>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Udp,
            role: Role::Sender,
            local_addr: None,
            peer_addr: None,
            link: LinkConfig::default(),
            fragment_size: MAX_FRAGMENT_SIZE,
            stall_threshold_us: 3_000,
            target_fps: 60,
            max_frame_size: 1920 * 1080 * 4,
            feedback_addr: None,
        }
    }
}

impl TransportConfig {
    pub fn new(backend: BackendKind, role: Role) -> Self {
        Self {
            backend,
            role,
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_micros(self.stall_threshold_us)
    }

    /// Interval between pacer ticks.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.target_fps.max(1) as u64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let max_fragment = if self.backend.is_datagram() {
            MAX_FRAGMENT_SIZE
        } else {
            usize::MAX
        };
        if self.fragment_size == 0 || self.fragment_size > max_fragment {
            return Err(ConfigError::FragmentSize {
                got: self.fragment_size,
                max: max_fragment,
            });
        }
        if self.target_fps == 0 {
            return Err(ConfigError::ZeroFrameRate);
        }
        if self.stall_threshold_us == 0 {
            return Err(ConfigError::ZeroStallThreshold);
        }
        let max_frame = i32::MAX as usize;
        if self.max_frame_size == 0 || self.max_frame_size > max_frame {
            return Err(ConfigError::MaxFrameSize {
                got: self.max_frame_size,
                max: max_frame,
            });
        }

        // UDP sender and TCP receiver dial out; UDP receiver and TCP sender bind.
        let needs = match (self.backend, self.role) {
            (BackendKind::Udp, Role::Sender) | (BackendKind::Tcp, Role::Receiver) => {
                Some(("peer_addr", self.peer_addr.is_some()))
            }
            (BackendKind::Udp, Role::Receiver) | (BackendKind::Tcp, Role::Sender) => {
                Some(("local_addr", self.local_addr.is_some()))
            }
            _ => None,
        };
        if let Some((field, false)) = needs {
            return Err(ConfigError::MissingField {
                field,
                backend: self.backend,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = TransportConfig::default();
        assert_eq!(cfg.fragment_size, 1450);
        assert_eq!(cfg.stall_threshold(), Duration::from_millis(3));
        assert_eq!(cfg.target_fps, 60);
        assert_eq!(cfg.frame_interval(), Duration::from_nanos(16_666_666));
        assert_eq!(cfg.link.ethertype, 0x88b5);
    }

    #[test]
    fn deserializes_camel_case_fields() {
        let json = r#"{
            "backend": "raw",
            "role": "receiver",
            "fragmentSize": 1200,
            "stallThresholdUs": 2500,
            "targetFPS": 90,
            "link": {"interfaceIndex": 2, "destinationMac": "9c:da:3e:a3:d8:29"}
        }"#;

        let cfg = TransportConfig::from_json(json).expect("valid camelCase config");
        assert_eq!(cfg.backend, BackendKind::RawLink);
        assert_eq!(cfg.role, Role::Receiver);
        assert_eq!(cfg.fragment_size, 1200);
        assert_eq!(cfg.stall_threshold(), Duration::from_micros(2500));
        assert_eq!(cfg.target_fps, 90);
        assert_eq!(cfg.link.interface_index, 2);
        assert_eq!(cfg.link.destination_mac.to_string(), "9c:da:3e:a3:d8:29");
        assert_eq!(cfg.link.source_mac, LinkConfig::default().source_mac);
    }

    #[test]
    fn deserializes_snake_case_fields() {
        let json = r#"{
            "backend": "udp",
            "role": "receiver",
            "local_addr": "127.0.0.1:21222",
            "target_fps": 30
        }"#;

        let cfg = TransportConfig::from_json(json).expect("valid snake_case config");
        assert_eq!(cfg.local_addr, Some("127.0.0.1:21222".parse().unwrap()));
        assert_eq!(cfg.target_fps, 30);
    }

    #[test]
    fn rejects_oversized_fragments_for_datagram_backends() {
        let mut cfg = TransportConfig::new(BackendKind::RawLink, Role::Sender);
        cfg.fragment_size = 1451;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::FragmentSize { got: 1451, max: 1450 })
        );

        cfg.backend = BackendKind::ReliableMessage;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn requires_addresses_per_role() {
        let cfg = TransportConfig::new(BackendKind::Udp, Role::Sender);
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::MissingField { field: "peer_addr", backend: BackendKind::Udp })
        );
        let cfg = TransportConfig::new(BackendKind::Tcp, Role::Sender);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingField { field: "local_addr", .. })
        ));
    }

    #[test]
    fn mac_addr_parsing() {
        let mac: MacAddr = "e4:5f:01:be:a8:cf".parse().unwrap();
        assert_eq!(mac.0, [0xe4, 0x5f, 0x01, 0xbe, 0xa8, 0xcf]);
        assert!("e4:5f:01".parse::<MacAddr>().is_err());
        assert!("e4:5f:01:be:a8:cf:00".parse::<MacAddr>().is_err());
        assert!("zz:5f:01:be:a8:cf".parse::<MacAddr>().is_err());
    }
}
