//! Packet codec: outer framed packets and inner (post-decrypt) headers.
//!
//! Wire format per §6: `[2-byte big-endian header length][header JSON][body bytes]`.
//! The outer header recognizes only `type` and `line`; everything else in
//! the header is a transport/crypto concern and is round-tripped opaquely
//! as extra JSON fields rather than typed here.

use serde::{Deserialize, Serialize};

use telehash_transport_udp::NetworkPath;

use crate::error::SwitchError;

const MAX_HEADER_LEN: usize = u16::MAX as usize;

/// The well-known outer header fields the core inspects.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OuterHeader {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
    /// Any other header fields the transport or crypto layer attached
    /// (e.g. open-packet fingerprints). Preserved verbatim on decode so
    /// the crypto envelope can still read them.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl OuterHeader {
    pub fn open() -> Self {
        Self {
            kind: "open".to_string(),
            line: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn line(line_id: impl Into<String>) -> Self {
        Self {
            kind: "line".to_string(),
            line: Some(line_id.into()),
            extra: serde_json::Map::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.kind == "open"
    }

    pub fn is_line(&self) -> bool {
        self.kind == "line"
    }
}

/// A fully framed outer packet: header plus opaque body bytes.
#[derive(Clone, Debug)]
pub struct OuterPacket {
    pub header: OuterHeader,
    pub body: Vec<u8>,
}

impl OuterPacket {
    pub fn new(header: OuterHeader, body: Vec<u8>) -> Self {
        Self { header, body }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SwitchError> {
        let header_json =
            serde_json::to_vec(&self.header).map_err(|_| SwitchError::InvalidPacket)?;
        if header_json.len() > MAX_HEADER_LEN {
            return Err(SwitchError::InvalidPacket);
        }

        let mut out = Vec::with_capacity(2 + header_json.len() + self.body.len());
        out.extend_from_slice(&(header_json.len() as u16).to_be_bytes());
        out.extend_from_slice(&header_json);
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SwitchError> {
        if bytes.len() < 2 {
            return Err(SwitchError::InvalidPacket);
        }
        let header_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        if bytes.len() < 2 + header_len {
            return Err(SwitchError::InvalidPacket);
        }
        let header_json = &bytes[2..2 + header_len];
        let header: OuterHeader =
            serde_json::from_slice(header_json).map_err(|_| SwitchError::InvalidPacket)?;
        let body = bytes[2 + header_len..].to_vec();
        Ok(Self { header, body })
    }
}

/// Inner (post-decrypt) header carried inside a line packet's sealed body.
///
/// `seq` presence is the reliability signal per §4.7: its presence marks
/// the channel reliable, its absence marks it unreliable.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct InnerHeader {
    #[serde(rename = "c", skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl InnerHeader {
    pub fn is_relay(&self) -> bool {
        self.kind.as_deref() == Some("relay") && self.channel_id.is_some()
    }
}

/// A decoded inner packet: header plus application payload.
///
/// `path` is not part of the wire format: the ingress dispatcher attaches
/// the network path the outer packet arrived on (§4.7 "Receive") after
/// unsealing, so the application can see which path carried a given
/// packet. It is always `None` on a packet built for sending.
#[derive(Clone, Debug)]
pub struct InnerPacket {
    pub header: InnerHeader,
    pub payload: Vec<u8>,
    pub path: Option<NetworkPath>,
}

impl InnerPacket {
    pub fn encode(&self) -> Result<Vec<u8>, SwitchError> {
        let header_json =
            serde_json::to_vec(&self.header).map_err(|_| SwitchError::InvalidPacket)?;
        if header_json.len() > MAX_HEADER_LEN {
            return Err(SwitchError::InvalidPacket);
        }
        let mut out = Vec::with_capacity(2 + header_json.len() + self.payload.len());
        out.extend_from_slice(&(header_json.len() as u16).to_be_bytes());
        out.extend_from_slice(&header_json);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SwitchError> {
        if bytes.len() < 2 {
            return Err(SwitchError::InvalidPacket);
        }
        let header_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        if bytes.len() < 2 + header_len {
            return Err(SwitchError::InvalidPacket);
        }
        let header: InnerHeader = serde_json::from_slice(&bytes[2..2 + header_len])
            .map_err(|_| SwitchError::InvalidPacket)?;
        let payload = bytes[2 + header_len..].to_vec();
        Ok(Self { header, payload, path: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outer_packet_roundtrips() {
        let pkt = OuterPacket::new(OuterHeader::line("abc123"), b"ciphertext".to_vec());
        let encoded = pkt.encode().unwrap();
        let decoded = OuterPacket::decode(&encoded).unwrap();
        assert!(decoded.header.is_line());
        assert_eq!(decoded.header.line.as_deref(), Some("abc123"));
        assert_eq!(decoded.body, b"ciphertext");
    }

    #[test]
    fn decode_rejects_truncated_header() {
        let bytes = [0u8, 10, 1, 2];
        assert!(matches!(
            OuterPacket::decode(&bytes),
            Err(SwitchError::InvalidPacket)
        ));
    }

    #[test]
    fn inner_header_seq_presence_is_reliability_signal() {
        let reliable = InnerHeader {
            seq: Some(0),
            ..Default::default()
        };
        let unreliable = InnerHeader::default();
        assert!(reliable.seq.is_some());
        assert!(unreliable.seq.is_none());
    }
}
