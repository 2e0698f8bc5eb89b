//! Per-backend envelope layout.
//!
//! # Datagram envelope (raw-link, UDP)
//!
//! ```text
//! [0..14]   link header   raw-link only: dst MAC, src MAC, ethertype (BE)
//! [+0..4]   total_size    i32 LE  size of the whole frame, repeated on every fragment
//! [+4..8]   sec           i32 LE  timestamp seconds
//! [+8..12]  usec          i32 LE  timestamp microseconds
//! [+12..]   payload       ≤ 1450 bytes
//! ```
//!
//! # Stream envelope (TCP)
//!
//! The same 12-byte `total_size` + timestamp prefix, written once per frame
//! and followed by exactly `total_size` payload bytes.
//!
//! Integer fields are little-endian, the byte order of every host the
//! protocol has shipped on.

use bytes::{Buf, BufMut, BytesMut};
use uvr_core::{LinkConfig, TimeValue, WireError, MAX_FRAGMENT_SIZE};

pub const SIZE_FIELD_LEN: usize = 4;
pub const TIMESTAMP_LEN: usize = 8;
/// `total_size` + timestamp.
pub const PREFIX_LEN: usize = SIZE_FIELD_LEN + TIMESTAMP_LEN;
pub const LINK_HEADER_LEN: usize = 14;
/// Ethernet pads shorter frames with zeros up to this length (FCS excluded).
pub const MIN_LINK_FRAME_LEN: usize = 60;

// ── FragmentHeader ────────────────────────────────────────────────────────────

/// Fields carried ahead of every fragment (datagram) or frame (stream).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub total_size: usize,
    pub timestamp: TimeValue,
}

impl FragmentHeader {
    pub fn new(total_size: usize, timestamp: TimeValue) -> Self {
        Self { total_size, timestamp }
    }

    pub fn encode(&self) -> Result<[u8; PREFIX_LEN], WireError> {
        let mut out = [0u8; PREFIX_LEN];
        self.encode_into(&mut &mut out[..])?;
        Ok(out)
    }

    pub fn encode_into(&self, out: &mut impl BufMut) -> Result<(), WireError> {
        let size = i32::try_from(self.total_size)
            .map_err(|_| WireError::FrameTooLarge(self.total_size))?;
        out.put_i32_le(size);
        out.put_i32_le(self.timestamp.sec);
        out.put_i32_le(self.timestamp.usec);
        Ok(())
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < PREFIX_LEN {
            return Err(WireError::Truncated {
                len: buf.len(),
                expected: PREFIX_LEN,
            });
        }
        let size = buf.get_i32_le();
        let sec = buf.get_i32_le();
        let usec = buf.get_i32_le();
        let total_size = usize::try_from(size).map_err(|_| WireError::NegativeSize(size))?;
        Ok(Self {
            total_size,
            timestamp: TimeValue::new(sec, usec),
        })
    }
}

// ── LinkHeader ────────────────────────────────────────────────────────────────

/// Fixed Ethernet header written identically on every raw-link fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkHeader([u8; LINK_HEADER_LEN]);

impl LinkHeader {
    pub fn from_config(link: &LinkConfig) -> Self {
        let mut bytes = [0u8; LINK_HEADER_LEN];
        bytes[0..6].copy_from_slice(&link.destination_mac.0);
        bytes[6..12].copy_from_slice(&link.source_mac.0);
        bytes[12..14].copy_from_slice(&link.ethertype.to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; LINK_HEADER_LEN] {
        &self.0
    }
}

// ── DatagramCodec ─────────────────────────────────────────────────────────────

/// Splits frames into envelopes and parses them back.
///
/// The segment layout (optional link header, prefix, payload) is fixed when
/// the codec is built and never changes for the lifetime of a transport.
#[derive(Debug, Clone)]
pub struct DatagramCodec {
    link: Option<LinkHeader>,
    fragment_size: usize,
}

impl DatagramCodec {
    pub fn udp(fragment_size: usize) -> Self {
        Self {
            link: None,
            fragment_size: fragment_size.clamp(1, MAX_FRAGMENT_SIZE),
        }
    }

    pub fn raw_link(link: LinkHeader, fragment_size: usize) -> Self {
        Self {
            link: Some(link),
            fragment_size: fragment_size.clamp(1, MAX_FRAGMENT_SIZE),
        }
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    pub fn link_header(&self) -> Option<&LinkHeader> {
        self.link.as_ref()
    }

    /// Bytes preceding the payload in every datagram.
    pub fn header_len(&self) -> usize {
        self.link.map_or(0, |_| LINK_HEADER_LEN) + PREFIX_LEN
    }

    /// Largest datagram this codec will ever produce or accept.
    pub fn max_datagram_len(&self) -> usize {
        self.header_len() + MAX_FRAGMENT_SIZE
    }

    /// Most trailing zero bytes the link may append to a short envelope.
    /// Zero for UDP, whose datagram length is exact.
    pub fn padding_allowance(&self) -> usize {
        match self.link {
            Some(_) => MIN_LINK_FRAME_LEN.saturating_sub(self.header_len()),
            None => 0,
        }
    }

    pub fn fragment_count(&self, total_size: usize) -> usize {
        total_size.div_ceil(self.fragment_size)
    }

    /// Payload slices, each at most `fragment_size` bytes. Empty input yields
    /// no fragments.
    pub fn fragments<'a>(&self, frame: &'a [u8]) -> std::slice::Chunks<'a, u8> {
        frame.chunks(self.fragment_size)
    }

    /// Writes one complete envelope into `out`, replacing its contents.
    pub fn encode(
        &self,
        header: &FragmentHeader,
        payload: &[u8],
        out: &mut BytesMut,
    ) -> Result<(), WireError> {
        if payload.len() > self.fragment_size {
            return Err(WireError::OversizedFragment {
                len: payload.len(),
                max: self.fragment_size,
            });
        }
        out.clear();
        out.reserve(self.header_len() + payload.len());
        if let Some(link) = &self.link {
            out.put_slice(link.as_bytes());
        }
        header.encode_into(out)?;
        out.put_slice(payload);
        Ok(())
    }

    /// Parses one received datagram into its header and payload.
    ///
    /// The link header is skipped without inspection; the socket has already
    /// filtered on ethertype.
    pub fn decode<'a>(&self, datagram: &'a [u8]) -> Result<(FragmentHeader, &'a [u8]), WireError> {
        let header_len = self.header_len();
        if datagram.len() < header_len {
            return Err(WireError::Truncated {
                len: datagram.len(),
                expected: header_len,
            });
        }
        let prefix_start = header_len - PREFIX_LEN;
        let header = FragmentHeader::decode(&datagram[prefix_start..header_len])?;
        let payload = &datagram[header_len..];
        if payload.len() > MAX_FRAGMENT_SIZE {
            return Err(WireError::OversizedFragment {
                len: payload.len(),
                max: MAX_FRAGMENT_SIZE,
            });
        }
        Ok((header, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvr_core::MacAddr;

    fn link() -> LinkHeader {
        LinkHeader::from_config(&LinkConfig::default())
    }

    #[test]
    fn prefix_layout_is_little_endian() {
        let header = FragmentHeader::new(5000, TimeValue::new(0x0102_0304, 7));
        let bytes = header.encode().unwrap();
        assert_eq!(
            bytes,
            [0x88, 0x13, 0, 0, 0x04, 0x03, 0x02, 0x01, 7, 0, 0, 0]
        );
        assert_eq!(FragmentHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn rejects_negative_size() {
        let mut bytes = [0u8; PREFIX_LEN];
        bytes[..4].copy_from_slice(&(-1i32).to_le_bytes());
        assert_eq!(FragmentHeader::decode(&bytes), Err(WireError::NegativeSize(-1)));
    }

    #[test]
    fn link_header_layout() {
        let cfg = LinkConfig {
            destination_mac: MacAddr([1, 2, 3, 4, 5, 6]),
            source_mac: MacAddr([7, 8, 9, 10, 11, 12]),
            ..LinkConfig::default()
        };
        assert_eq!(
            LinkHeader::from_config(&cfg).as_bytes(),
            &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 0x88, 0xb5]
        );
    }

    #[test]
    fn raw_link_envelope_carries_link_header_on_every_fragment() {
        let codec = DatagramCodec::raw_link(link(), 1450);
        let frame = vec![0xab; 3000];
        let header = FragmentHeader::new(frame.len(), TimeValue::new(1, 2));
        let mut out = BytesMut::new();

        for payload in codec.fragments(&frame) {
            codec.encode(&header, payload, &mut out).unwrap();
            assert_eq!(&out[..LINK_HEADER_LEN], link().as_bytes());
            assert_eq!(out.len(), LINK_HEADER_LEN + PREFIX_LEN + payload.len());
            let (decoded, body) = codec.decode(&out).unwrap();
            assert_eq!(decoded, header);
            assert_eq!(body, payload);
        }
    }

    #[test]
    fn scenario_fragment_sizes() {
        let codec = DatagramCodec::udp(1450);
        let frame = vec![0u8; 5000];
        let sizes: Vec<usize> = codec.fragments(&frame).map(<[u8]>::len).collect();
        assert_eq!(sizes, vec![1450, 1450, 1450, 650]);
        assert_eq!(codec.fragment_count(5000), 4);
        assert_eq!(codec.fragment_count(0), 0);
    }

    #[test]
    fn round_trip_preserves_payload_for_any_fragment_size() {
        for &(size, fragment) in &[(0usize, 1usize), (1, 1), (1449, 1450), (1451, 1450), (10_000, 7), (4096, 1024)] {
            let codec = DatagramCodec::udp(fragment);
            let frame: Vec<u8> = (0..size).map(|i| (i * 31 % 251) as u8).collect();
            let header = FragmentHeader::new(size, TimeValue::new(3, 4));
            let mut out = BytesMut::new();
            let mut rebuilt = Vec::new();

            for payload in codec.fragments(&frame) {
                codec.encode(&header, payload, &mut out).unwrap();
                let (decoded, body) = codec.decode(&out).unwrap();
                assert_eq!(decoded.total_size, size);
                assert!(body.len() <= fragment);
                rebuilt.extend_from_slice(body);
            }
            assert_eq!(rebuilt, frame, "size={size} fragment={fragment}");
        }
    }

    #[test]
    fn only_raw_link_envelopes_may_be_padded() {
        assert_eq!(DatagramCodec::raw_link(link(), 1450).padding_allowance(), 34);
        assert_eq!(DatagramCodec::udp(1450).padding_allowance(), 0);
    }

    #[test]
    fn decode_rejects_runts() {
        let codec = DatagramCodec::raw_link(link(), 1450);
        assert_eq!(
            codec.decode(&[0u8; 20]),
            Err(WireError::Truncated { len: 20, expected: 26 })
        );
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let codec = DatagramCodec::udp(100);
        let header = FragmentHeader::new(101, TimeValue::ZERO);
        let mut out = BytesMut::new();
        assert_eq!(
            codec.encode(&header, &[0u8; 101], &mut out),
            Err(WireError::OversizedFragment { len: 101, max: 100 })
        );
    }
}
