//! Handshake signing for gateway authentication.
//!
//! Builds the canonical `v2` auth payload, signs it with the device key and
//! packages the proof for the `connect` request. The gateway re-derives the
//! payload on its side and verifies the signature against the raw public
//! key sent alongside it.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use crate::device::Device;
use crate::protocol::{self, AUTH_VERSION, CLIENT_ID, CLIENT_MODE, ROLE, SCOPES};

/// Signature material for one `connect` attempt.
#[derive(Debug, Clone)]
pub struct AuthSignature {
    /// Signature over the canonical payload, base64url without padding.
    pub signature: String,
    /// Raw Ed25519 public key, base64url without padding.
    pub public_key: String,
    /// Epoch milliseconds at which the payload was signed.
    pub signed_at: u64,
}

/// Build the canonical auth payload.
///
/// Fields are pipe-joined in a fixed order so client and gateway sign the
/// exact same bytes:
///
/// ```text
/// v2|<deviceId>|<clientId>|<mode>|<role>|<scopes,comma,sorted>|<signedAt>|<token>|<nonce>
/// ```
pub fn canonical_payload(device_id: &str, token: &str, nonce: &str, signed_at: u64) -> String {
    let mut scopes = SCOPES.to_vec();
    scopes.sort_unstable();

    [
        AUTH_VERSION,
        device_id,
        CLIENT_ID,
        CLIENT_MODE,
        ROLE,
        &scopes.join(","),
        &signed_at.to_string(),
        token,
        nonce,
    ]
    .join("|")
}

/// Sign a `connect` attempt with the device key.
///
/// `token` is the shared or device token going into the auth payload;
/// `nonce` is the challenge nonce, empty when the gateway issued none.
pub fn sign_connect(device: &Device, token: &str, nonce: &str) -> AuthSignature {
    let signed_at = protocol::epoch_ms();
    let payload = canonical_payload(&device.device_id, token, nonce, signed_at);
    let signature = device.sign(payload.as_bytes());

    AuthSignature {
        signature: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
        public_key: URL_SAFE_NO_PAD.encode(device.verifying_key().as_bytes()),
        signed_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    fn verify(sig: &AuthSignature, payload: &str) -> bool {
        let key_bytes: [u8; 32] = URL_SAFE_NO_PAD
            .decode(&sig.public_key)
            .unwrap()
            .try_into()
            .unwrap();
        let key = VerifyingKey::from_bytes(&key_bytes).unwrap();
        let sig_bytes: [u8; 64] = URL_SAFE_NO_PAD
            .decode(&sig.signature)
            .unwrap()
            .try_into()
            .unwrap();
        key.verify(payload.as_bytes(), &Signature::from_bytes(&sig_bytes))
            .is_ok()
    }

    #[test]
    fn canonical_payload_field_order() {
        let payload = canonical_payload("device123", "tok", "nonce9", 1_700_000_000_000);
        assert_eq!(
            payload,
            "v2|device123|gateway-client|backend|operator|operator.read,operator.write|1700000000000|tok|nonce9"
        );
    }

    #[test]
    fn canonical_payload_keeps_empty_fields() {
        let payload = canonical_payload("device123", "", "", 1);
        // Empty token and nonce still occupy their slots
        assert!(payload.ends_with("|1||"));
    }

    #[test]
    fn signature_verifies_and_encodings_are_unpadded() {
        let device = Device::load_or_create().unwrap();
        let sig = sign_connect(&device, "tok", "nonce9");

        let payload = canonical_payload(&device.device_id, "tok", "nonce9", sig.signed_at);
        assert!(verify(&sig, &payload));
        assert!(!sig.signature.contains('='));
        assert!(!sig.public_key.contains('='));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let device = Device::load_or_create().unwrap();
        let sig = sign_connect(&device, "tok", "nonce9");

        let tampered = canonical_payload(&device.device_id, "other", "nonce9", sig.signed_at);
        assert!(!verify(&sig, &tampered));
    }
}
