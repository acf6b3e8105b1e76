//! Crypto envelope collaborator (§4.4).
//!
//! The real RSA/ECC line handshake and symmetric line cipher are out of
//! scope; this module only specifies the contract the switch drives and,
//! behind `#[cfg(test)]`, a fake implementation sufficient to exercise
//! the line and channel state machines end-to-end without real crypto.

use crate::error::SwitchError;
use crate::hashname::Hashname;
use crate::packet::{InnerPacket, OuterHeader, OuterPacket};

/// Long-term RSA public key, opaque to the switch beyond equality.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RsaPublicKey(pub Vec<u8>);

/// Long-term RSA private key, opaque to the switch.
#[derive(Clone)]
pub struct RsaPrivateKey(pub Vec<u8>);

/// Derived per-line symmetric context.
#[derive(Clone)]
pub struct LineKey(pub Vec<u8>);

/// Result of decomposing an inbound open packet.
pub struct DecomposedOpen {
    pub remote_pubkey: RsaPublicKey,
    pub remote_hashname: Hashname,
    pub remote_ephemeral_pub: Vec<u8>,
    pub remote_line_id: String,
    pub at: u64,
}

/// Handshake and per-line seal/unseal operations, per §4.4.
pub trait CryptoEnvelope: Send + Sync + 'static {
    /// Generate a fresh ephemeral keypair `(private, public)` for a line.
    fn generate_ephemeral(&self) -> (Vec<u8>, Vec<u8>);

    /// Derive the hashname for a long-term public key.
    fn hashname_of(&self, pubkey: &RsaPublicKey) -> Hashname;

    /// Parse and authenticate an inbound open packet.
    fn decompose_open(
        &self,
        local_key: &RsaPrivateKey,
        outer: &OuterPacket,
    ) -> Result<DecomposedOpen, SwitchError>;

    /// Build an outbound open packet addressed to `dest_pubkey`, carrying
    /// `local_pub` so the recipient's `decompose_open` can authenticate
    /// and derive this side's hashname.
    fn make_open(
        &self,
        local_key: &RsaPrivateKey,
        local_pub: &RsaPublicKey,
        local_hashname: &Hashname,
        local_ephemeral_pub: &[u8],
        local_line_id: &str,
        dest_pubkey: &RsaPublicKey,
    ) -> Result<OuterPacket, SwitchError>;

    /// Derive the symmetric line context from the local ephemeral private
    /// key and the remote ephemeral public key.
    fn line_activate(
        &self,
        local_ephemeral_prv: &[u8],
        remote_ephemeral_pub: &[u8],
    ) -> Result<LineKey, SwitchError>;

    /// Seal an inner packet under a line's symmetric context.
    fn seal(&self, line_key: &LineKey, inner: &InnerPacket) -> Result<OuterPacket, SwitchError>;

    /// Unseal a line packet's body into its inner packet.
    fn unseal(&self, line_key: &LineKey, outer: &OuterPacket) -> Result<InnerPacket, SwitchError>;

    /// Verify a remote public key's signature/intermediates against the
    /// claimed local hashname. A failure here means the open is silently
    /// dropped (logged at notice) per §4.4 — never propagated as an error.
    fn verify(&self, remote_pubkey: &RsaPublicKey, local_hashname: &Hashname) -> bool;
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    //! A non-cryptographic stand-in sufficient for exercising the line
    //! and channel FSMs: "sealing" is XOR with the line key's bytes
    //! repeated, hashnames are sha256 of the public key. Never use
    //! outside tests.

    use sha2::{Digest, Sha256};

    use super::*;

    #[derive(Default)]
    pub struct FakeCryptoEnvelope;

    fn xor_with(key: &[u8], data: &[u8]) -> Vec<u8> {
        if key.is_empty() {
            return data.to_vec();
        }
        data.iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % key.len()])
            .collect()
    }

    impl CryptoEnvelope for FakeCryptoEnvelope {
        fn generate_ephemeral(&self) -> (Vec<u8>, Vec<u8>) {
            let prv: Vec<u8> = (0..32).map(|_| rand::random::<u8>()).collect();
            let publ = Sha256::digest(&prv).to_vec();
            (prv, publ)
        }

        fn hashname_of(&self, pubkey: &RsaPublicKey) -> Hashname {
            let digest = Sha256::digest(&pubkey.0);
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(&digest);
            Hashname::from_bytes(bytes)
        }

        fn decompose_open(
            &self,
            _local_key: &RsaPrivateKey,
            outer: &OuterPacket,
        ) -> Result<DecomposedOpen, SwitchError> {
            let extra = &outer.header.extra;
            let pubkey_hex = extra
                .get("open_pub")
                .and_then(|v| v.as_str())
                .ok_or(SwitchError::InvalidPacket)?;
            let ephemeral_hex = extra
                .get("open_eph")
                .and_then(|v| v.as_str())
                .ok_or(SwitchError::InvalidPacket)?;
            let line_id = extra
                .get("open_line")
                .and_then(|v| v.as_str())
                .ok_or(SwitchError::InvalidPacket)?
                .to_string();

            let pubkey = RsaPublicKey(hex::decode(pubkey_hex).map_err(|_| SwitchError::InvalidPacket)?);
            let ephemeral_pub =
                hex::decode(ephemeral_hex).map_err(|_| SwitchError::InvalidPacket)?;
            let remote_hashname = self.hashname_of(&pubkey);

            Ok(DecomposedOpen {
                remote_pubkey: pubkey,
                remote_hashname,
                remote_ephemeral_pub: ephemeral_pub,
                remote_line_id: line_id,
                at: 0,
            })
        }

        fn make_open(
            &self,
            _local_key: &RsaPrivateKey,
            local_pub: &RsaPublicKey,
            _local_hashname: &Hashname,
            local_ephemeral_pub: &[u8],
            local_line_id: &str,
            _dest_pubkey: &RsaPublicKey,
        ) -> Result<OuterPacket, SwitchError> {
            let mut header = OuterHeader::open();
            header.extra.insert(
                "open_pub".to_string(),
                serde_json::Value::String(hex::encode(&local_pub.0)),
            );
            header.extra.insert(
                "open_eph".to_string(),
                serde_json::Value::String(hex::encode(local_ephemeral_pub)),
            );
            header.extra.insert(
                "open_line".to_string(),
                serde_json::Value::String(local_line_id.to_string()),
            );
            Ok(OuterPacket::new(header, Vec::new()))
        }

        fn line_activate(
            &self,
            local_ephemeral_prv: &[u8],
            remote_ephemeral_pub: &[u8],
        ) -> Result<LineKey, SwitchError> {
            // Both sides must land on the same key from their own prv +
            // the other's pub. Since `generate_ephemeral` derives
            // `pub = sha256(prv)`, re-deriving our own pub here and
            // combining the pair in a fixed (sorted) order makes the
            // result independent of which side computes it first,
            // standing in for a real DH shared-secret's commutativity.
            let local_pub = Sha256::digest(local_ephemeral_prv).to_vec();
            let remote_pub = remote_ephemeral_pub.to_vec();
            let (lo, hi) = if local_pub <= remote_pub {
                (local_pub, remote_pub)
            } else {
                (remote_pub, local_pub)
            };
            let mut material = lo;
            material.extend_from_slice(&hi);
            Ok(LineKey(Sha256::digest(&material).to_vec()))
        }

        fn seal(&self, line_key: &LineKey, inner: &InnerPacket) -> Result<OuterPacket, SwitchError> {
            let plain = inner.encode()?;
            let body = xor_with(&line_key.0, &plain);
            Ok(OuterPacket::new(OuterHeader::line(""), body))
        }

        fn unseal(&self, line_key: &LineKey, outer: &OuterPacket) -> Result<InnerPacket, SwitchError> {
            let plain = xor_with(&line_key.0, &outer.body);
            InnerPacket::decode(&plain)
        }

        fn verify(&self, _remote_pubkey: &RsaPublicKey, _local_hashname: &Hashname) -> bool {
            true
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn line_activate_is_symmetric_between_both_sides() {
            let crypto = FakeCryptoEnvelope;
            let (prv_a, pub_a) = crypto.generate_ephemeral();
            let (prv_b, pub_b) = crypto.generate_ephemeral();

            let key_a = crypto.line_activate(&prv_a, &pub_b).unwrap();
            let key_b = crypto.line_activate(&prv_b, &pub_a).unwrap();

            assert_eq!(key_a.0, key_b.0);
        }

        #[test]
        fn seal_then_unseal_roundtrips_with_a_shared_key() {
            let crypto = FakeCryptoEnvelope;
            let (prv_a, pub_a) = crypto.generate_ephemeral();
            let (prv_b, pub_b) = crypto.generate_ephemeral();
            let key_a = crypto.line_activate(&prv_a, &pub_b).unwrap();
            let key_b = crypto.line_activate(&prv_b, &pub_a).unwrap();

            let inner = InnerPacket {
                header: InnerHeader {
                    channel_id: Some("c1".to_string()),
                    ..Default::default()
                },
                payload: b"hello".to_vec(),
                path: None,
            };
            let outer = crypto.seal(&key_a, &inner).unwrap();
            let decoded = crypto.unseal(&key_b, &outer).unwrap();
            assert_eq!(decoded.payload, b"hello");
        }
    }
}
