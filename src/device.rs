//! Device identity management for gateway authentication.
//!
//! This module handles:
//! - Ed25519 signing keypair generation and persistence
//! - Device ID derivation from the public key
//! - Storage of the gateway-issued device token
//!
//! The identity file holds the keypair and is written with owner-only
//! permissions. Key material is never logged.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use zeroize::Zeroize;

use crate::config::Config;

/// Stored device identity as persisted to `device-identity.json`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoredIdentity {
    /// SHA-256 of the raw public key, lowercase hex.
    pub device_id: String,
    /// Base64-encoded Ed25519 verifying key.
    pub public_key: String,
    /// Base64-encoded Ed25519 signing key seed.
    pub private_key: String,
    /// Gateway-issued token, set after the first successful handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
}

/// Runtime device identity with parsed keys.
pub struct Device {
    /// Stable device ID derived from the public key.
    pub device_id: String,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    device_token: Option<String>,
    /// Path to the identity file.
    config_path: PathBuf,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("device_id", &self.short_id())
            .field("has_device_token", &self.device_token.is_some())
            .field("config_path", &self.config_path)
            .finish_non_exhaustive()
    }
}

/// Global mutex to prevent race conditions when multiple threads
/// try to load/create the device simultaneously.
/// This is especially important in tests where multiple threads
/// share the same config directory.
static DEVICE_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

impl Device {
    /// Load the existing device identity, or create one on first use.
    ///
    /// The keypair lives in `device-identity.json` under the config directory.
    /// An identity file that exists but cannot be read is an error: the
    /// gateway's device registration is keyed to it, so it is never
    /// overwritten with a fresh keypair. Uses a process-wide mutex to prevent
    /// race conditions when multiple threads (e.g., parallel tests) call
    /// this simultaneously.
    pub fn load_or_create() -> Result<Self> {
        // Hold lock for entire load/create operation to prevent races
        let _guard = DEVICE_LOCK
            .lock()
            .map_err(|_| anyhow::anyhow!("Device lock poisoned by a previous panic"))?;

        let config_path = Self::identity_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            Self::create_new(&config_path)
        }
    }

    fn identity_path() -> Result<PathBuf> {
        Ok(Config::config_dir()?.join("device-identity.json"))
    }

    /// Load device from the identity file.
    fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read identity file")?;

        let stored: StoredIdentity =
            serde_json::from_str(&content).context("Failed to parse identity file")?;

        let mut secret_bytes = BASE64
            .decode(&stored.private_key)
            .context("Invalid private key encoding")?;

        let key_bytes: [u8; 32] = secret_bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Invalid private key length"))?;

        let signing_key = SigningKey::from_bytes(&key_bytes);
        secret_bytes.zeroize();

        let verifying_key = signing_key.verifying_key();
        let derived_id = Self::compute_device_id(&verifying_key);

        let device = Self {
            device_id: derived_id.clone(),
            signing_key,
            verifying_key,
            device_token: stored.device_token,
            config_path: path.clone(),
        };

        // A stale ID would desync us from the gateway's device registry,
        // so repair it in place rather than failing the load
        if stored.device_id != derived_id {
            log::warn!(
                "[Gateway] Stored device ID {} does not match key (derives to {}), repairing",
                truncate_id(&stored.device_id),
                device.short_id()
            );
            device.save()?;
        }

        log::info!("[Gateway] Loaded device identity: id={}", device.short_id());

        Ok(device)
    }

    /// Create a new device with a fresh keypair.
    fn create_new(path: &PathBuf) -> Result<Self> {
        let mut signing_secret = [0u8; 32];
        rand::rng().fill_bytes(&mut signing_secret);
        let signing_key = SigningKey::from_bytes(&signing_secret);
        signing_secret.zeroize();

        let verifying_key = signing_key.verifying_key();
        let device_id = Self::compute_device_id(&verifying_key);

        let device = Self {
            device_id,
            signing_key,
            verifying_key,
            device_token: None,
            config_path: path.clone(),
        };
        device.save()?;

        log::info!(
            "[Gateway] Created new device identity: id={}",
            device.short_id()
        );

        Ok(device)
    }

    /// Compute the device ID from the verifying key.
    ///
    /// The ID is SHA256(raw public key) as lowercase hex.
    fn compute_device_id(verifying_key: &VerifyingKey) -> String {
        let hash = Sha256::digest(verifying_key.as_bytes());
        hash.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Sign a message with the device key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Get the verifying key (public key) as a base64 string.
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.verifying_key.as_bytes())
    }

    /// Verifying key for signature checks.
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    /// Gateway-issued device token, if one has been stored.
    pub fn device_token(&self) -> Option<&str> {
        self.device_token.as_deref()
    }

    /// First 12 hex chars of the device ID, for log lines.
    pub fn short_id(&self) -> &str {
        truncate_id(&self.device_id)
    }

    /// Store the gateway-issued device token and persist it.
    pub fn set_device_token(&mut self, token: String) -> Result<()> {
        if self.device_token.as_deref() == Some(token.as_str()) {
            return Ok(());
        }
        self.device_token = Some(token);
        self.save()
    }

    /// Save the identity file with owner-only permissions.
    pub fn save(&self) -> Result<()> {
        let stored = StoredIdentity {
            device_id: self.device_id.clone(),
            public_key: BASE64.encode(self.verifying_key.as_bytes()),
            private_key: BASE64.encode(self.signing_key.to_bytes()),
            device_token: self.device_token.clone(),
        };

        let content =
            serde_json::to_string_pretty(&stored).context("Failed to serialize identity")?;

        fs::write(&self.config_path, content).context("Failed to write identity file")?;

        #[cfg(unix)]
        {
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&self.config_path, perms)
                .context("Failed to set identity file permissions")?;
        }

        Ok(())
    }
}

/// Truncate a device ID to its first 12 chars for logging.
pub fn truncate_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;

    fn test_device() -> Device {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        let signing_key = SigningKey::from_bytes(&secret);
        let verifying_key = signing_key.verifying_key();
        Device {
            device_id: Device::compute_device_id(&verifying_key),
            signing_key,
            verifying_key,
            device_token: None,
            config_path: PathBuf::from("/nonexistent/device-identity.json"),
        }
    }

    #[test]
    fn test_device_id_format() {
        let device = test_device();

        // SHA-256 hex: 64 lowercase hex chars
        assert_eq!(device.device_id.len(), 64);
        assert!(device
            .device_id
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_device_id_is_deterministic() {
        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let a = Device::compute_device_id(&signing_key.verifying_key());
        let b = Device::compute_device_id(&signing_key.verifying_key());
        assert_eq!(a, b);
    }

    #[test]
    fn test_sign_verifies_against_public_key() {
        let device = test_device();
        let message = b"auth payload";
        let signature = device.sign(message);
        assert!(device.verifying_key().verify(message, &signature).is_ok());
    }

    #[test]
    fn test_short_id_truncates() {
        let device = test_device();
        assert_eq!(device.short_id().len(), 12);
        assert!(device.device_id.starts_with(device.short_id()));
        // Short inputs pass through untouched
        assert_eq!(truncate_id("abc"), "abc");
    }

    #[test]
    fn test_stored_identity_omits_absent_token() {
        let stored = StoredIdentity {
            device_id: "d".repeat(64),
            public_key: "pk".to_string(),
            private_key: "sk".to_string(),
            device_token: None,
        };
        let json = serde_json::to_string(&stored).unwrap();
        assert!(!json.contains("device_token"));

        let with_token = StoredIdentity {
            device_token: Some("tok_123".to_string()),
            ..serde_json::from_str(&json).unwrap()
        };
        let json = serde_json::to_string(&with_token).unwrap();
        assert!(json.contains("tok_123"));
    }

    #[test]
    fn test_load_or_create_is_stable() {
        let first = Device::load_or_create().unwrap();
        let second = Device::load_or_create().unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert_eq!(first.public_key_base64(), second.public_key_base64());
    }

    #[test]
    fn test_unreadable_identity_is_an_error_and_left_intact() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("device-identity.json");
        fs::write(&path, "not json").unwrap();

        assert!(Device::load_from_file(&path).is_err());
        // The file is left for inspection, not replaced
        assert_eq!(fs::read_to_string(&path).unwrap(), "not json");
    }

    #[test]
    fn test_invalid_key_encoding_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("device-identity.json");
        let stored = StoredIdentity {
            device_id: "d".repeat(64),
            public_key: "pk".to_string(),
            private_key: "***not base64***".to_string(),
            device_token: None,
        };
        fs::write(&path, serde_json::to_string(&stored).unwrap()).unwrap();

        assert!(Device::load_from_file(&path).is_err());
    }

    #[test]
    fn test_debug_redacts_key_material() {
        let device = test_device();
        let debug = format!("{:?}", device);
        assert!(!debug.contains(&device.public_key_base64()));
        assert!(debug.contains(device.short_id()));
    }
}
