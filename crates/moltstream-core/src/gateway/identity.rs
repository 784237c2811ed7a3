//! Device identity used to sign the connect handshake.
//!
//! The identity file is shared with the OpenClaw tooling
//! (`~/.openclaw/identity/device.json`):
//!
//! ```json
//! { "version": 1, "deviceId": "…", "publicKeyPem": "…", "privateKeyPem": "…" }
//! ```
//!
//! The private key never leaves this module; the handshake only carries the
//! raw public key and a signature, both base64url without padding.

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::Deserialize;
use std::path::Path;

/// Version tag prefixed to every signing payload.
pub const SIGNATURE_VERSION: &str = "v2";

const PAYLOAD_DELIMITER: &str = "|";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityFile {
    device_id: String,
    private_key_pem: String,
    #[serde(default)]
    public_key_pem: Option<String>,
}

/// Fields covered by the handshake signature, in wire order.
#[derive(Debug, Clone)]
pub struct SigningInput<'a> {
    pub device_id: &'a str,
    pub client_id: &'a str,
    pub client_mode: &'a str,
    pub role: &'a str,
    pub scopes: &'a [String],
    pub signed_at_ms: u64,
    pub token: &'a str,
    pub nonce: &'a str,
}

impl SigningInput<'_> {
    /// `v2|deviceId|clientId|clientMode|role|scopes|signedAtMs|token|nonce`
    ///
    /// Field order and delimiter are part of the wire contract; the gateway
    /// rebuilds the same string to verify.
    pub fn payload(&self) -> String {
        let signed_at = self.signed_at_ms.to_string();
        let scopes = self.scopes.join(",");
        [
            SIGNATURE_VERSION,
            self.device_id,
            self.client_id,
            self.client_mode,
            self.role,
            scopes.as_str(),
            signed_at.as_str(),
            self.token,
            self.nonce,
        ]
        .join(PAYLOAD_DELIMITER)
    }
}

/// Ed25519 keypair plus the stable device id.
#[derive(Clone)]
pub struct DeviceIdentity {
    device_id: String,
    signing_key: SigningKey,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("public_key", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

impl DeviceIdentity {
    pub fn new(device_id: impl Into<String>, signing_key: SigningKey) -> Self {
        Self {
            device_id: device_id.into(),
            signing_key,
        }
    }

    /// Load the identity file. Called once at startup.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read device identity from {:?}", path))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse device identity from {:?}", path))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let file: IdentityFile = serde_json::from_str(content)?;
        if file.device_id.trim().is_empty() {
            bail!("deviceId is empty");
        }
        let signing_key = SigningKey::from_pkcs8_pem(&file.private_key_pem)
            .map_err(|e| anyhow::anyhow!("invalid privateKeyPem: {}", e))?;

        if let Some(public_pem) = &file.public_key_pem {
            use ed25519_dalek::pkcs8::DecodePublicKey;
            let public = VerifyingKey::from_public_key_pem(public_pem)
                .map_err(|e| anyhow::anyhow!("invalid publicKeyPem: {}", e))?;
            if public != signing_key.verifying_key() {
                bail!("publicKeyPem does not match privateKeyPem");
            }
        }

        Ok(Self::new(file.device_id, signing_key))
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Raw 32-byte public key, base64url.
    pub fn public_key_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.verifying_key().as_bytes())
    }

    /// Sign `payload`, returning the 64-byte signature as base64url.
    pub fn sign(&self, payload: &str) -> String {
        let signature = self.signing_key.sign(payload.as_bytes());
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
    use ed25519_dalek::pkcs8::{EncodePrivateKey, EncodePublicKey};
    use ed25519_dalek::{Signature, Verifier};

    fn test_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    #[test]
    fn payload_field_order() {
        let scopes = vec!["operator.read".to_string(), "operator.write".to_string()];
        let input = SigningInput {
            device_id: "dev",
            client_id: "gateway-client",
            client_mode: "backend",
            role: "operator",
            scopes: &scopes,
            signed_at_ms: 1700000000000,
            token: "tok",
            nonce: "n-1",
        };
        assert_eq!(
            input.payload(),
            "v2|dev|gateway-client|backend|operator|operator.read,operator.write|1700000000000|tok|n-1"
        );
    }

    #[test]
    fn signature_verifies_with_public_key() {
        let identity = DeviceIdentity::new("dev", test_key());
        let signature = identity.sign("hello");

        let bytes = URL_SAFE_NO_PAD.decode(signature).unwrap();
        let signature = Signature::from_slice(&bytes).unwrap();
        let public = URL_SAFE_NO_PAD.decode(identity.public_key_base64()).unwrap();
        let public = VerifyingKey::from_bytes(public.as_slice().try_into().unwrap()).unwrap();
        assert!(public.verify(b"hello", &signature).is_ok());
        assert!(public.verify(b"hullo", &signature).is_err());
    }

    #[test]
    fn loads_pem_identity_file() {
        let key = test_key();
        let private_pem = key.to_pkcs8_pem(LineEnding::LF).unwrap();
        let public_pem = key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        let json = serde_json::json!({
            "version": 1,
            "deviceId": "abc123",
            "publicKeyPem": public_pem,
            "privateKeyPem": private_pem.as_str(),
        });

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("device.json");
        std::fs::write(&path, json.to_string()).unwrap();

        let identity = DeviceIdentity::load(&path).unwrap();
        assert_eq!(identity.device_id(), "abc123");
        assert_eq!(identity.verifying_key(), key.verifying_key());
    }

    #[test]
    fn rejects_mismatched_public_key() {
        let key = test_key();
        let other = SigningKey::from_bytes(&[9u8; 32]);
        let json = serde_json::json!({
            "deviceId": "abc123",
            "publicKeyPem": other.verifying_key().to_public_key_pem(LineEnding::LF).unwrap(),
            "privateKeyPem": key.to_pkcs8_pem(LineEnding::LF).unwrap().as_str(),
        });
        assert!(DeviceIdentity::from_json(&json.to_string()).is_err());
    }

    #[test]
    fn debug_output_hides_private_key() {
        let identity = DeviceIdentity::new("dev", test_key());
        let rendered = format!("{:?}", identity);
        assert!(rendered.contains("dev"));
        assert!(!rendered.contains("signing_key"));
    }
}
