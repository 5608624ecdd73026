//! Tamper-evident (not confidential) envelope used to move a [`Command`] or
//! [`CommandResponse`] across a socket or broker. A direct port of the
//! Python original's `itsdangerous.URLSafeSerializer`: a JSON payload,
//! HMAC-SHA256 signed, both halves base64-url encoded and joined with `.`.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::Sha256;

use crate::core::errors::CoreError;

type HmacSha256 = Hmac<Sha256>;

pub struct Serializer {
    secret: Vec<u8>,
}

impl Serializer {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Serializes `value` into a signed, URL-safe envelope: `<payload>.<signature>`.
    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<String, CoreError> {
        let payload = serde_json::to_vec(value)?;
        let payload_b64 = URL_SAFE_NO_PAD.encode(&payload);
        let signature = self.sign(payload_b64.as_bytes());
        let signature_b64 = URL_SAFE_NO_PAD.encode(signature);
        Ok(format!("{payload_b64}.{signature_b64}"))
    }

    /// Verifies the envelope's signature and decodes its payload. Any
    /// signature mismatch is an [`CoreError::Integrity`], never a silent
    /// fallback to the unsigned payload.
    pub fn unserialize<T: DeserializeOwned>(&self, envelope: &str) -> Result<T, CoreError> {
        let (payload_b64, signature_b64) = envelope
            .split_once('.')
            .ok_or_else(|| CoreError::integrity("envelope missing signature separator"))?;

        let expected = self.sign(payload_b64.as_bytes());
        let given = URL_SAFE_NO_PAD.decode(signature_b64)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| CoreError::integrity(format!("invalid secret key: {e}")))?;
        mac.update(payload_b64.as_bytes());
        if mac.verify_slice(&given).is_err() {
            let _ = expected;
            return Err(CoreError::integrity("signature verification failed"));
        }

        let payload = URL_SAFE_NO_PAD.decode(payload_b64)?;
        serde_json::from_slice(&payload).map_err(CoreError::from)
    }

    fn sign(&self, payload_b64: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(payload_b64);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::Command;

    #[test]
    fn round_trips_a_command() {
        let ser = Serializer::new("test-secret");
        let cmd = Command::new("reload_dataset");
        let envelope = ser.serialize(&cmd).unwrap();
        let decoded: Command = ser.unserialize(&envelope).unwrap();
        assert_eq!(decoded.guid, cmd.guid);
        assert_eq!(decoded.name, "reload_dataset");
    }

    #[test]
    fn rejects_tampered_payload() {
        let ser = Serializer::new("test-secret");
        let cmd = Command::new("reload_dataset");
        let envelope = ser.serialize(&cmd).unwrap();
        let mut tampered = envelope.clone();
        tampered.replace_range(0..1, if tampered.starts_with('A') { "B" } else { "A" });
        let result: Result<Command, CoreError> = ser.unserialize(&tampered);
        assert!(matches!(result, Err(CoreError::Integrity(_))));
    }

    #[test]
    fn rejects_wrong_secret() {
        let a = Serializer::new("secret-a");
        let b = Serializer::new("secret-b");
        let envelope = a.serialize(&Command::new("list_datasets")).unwrap();
        let result: Result<Command, CoreError> = b.unserialize(&envelope);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_envelope_without_separator() {
        let ser = Serializer::new("test-secret");
        let result: Result<Command, CoreError> = ser.unserialize("not-an-envelope");
        assert!(matches!(result, Err(CoreError::Integrity(_))));
    }
}
