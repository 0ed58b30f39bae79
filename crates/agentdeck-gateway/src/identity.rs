//! Device identity and signed authentication claims.
//!
//! Each installation owns a persistent Ed25519 keypair. The device id is the
//! SHA-256 fingerprint of the raw public-key bytes, so it is reproducible
//! across restarts and detectable when the persisted file is corrupted. The
//! gateway binds a long-lived device trust relationship on top of the
//! short-lived bearer token by verifying a signed, time-stamped claim during
//! the authentication handshake.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use agentdeck_core::prelude::*;

/// Schema version of the persisted identity file.
const IDENTITY_VERSION: u32 = 1;

/// Version tag of the signed claim payload.
const CLAIM_VERSION: &str = "v1";

/// Server error fragments that signal a device identity mismatch.
const MISMATCH_MARKERS: &[&str] = &["device token mismatch", "device identity mismatch"];

/// Returns `true` when a gateway auth error message signals that the server
/// no longer trusts this device identity.
pub fn is_identity_mismatch(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    MISMATCH_MARKERS.iter().any(|m| lower.contains(m))
}

/// Persisted identity file shape.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityFile {
    version: u32,
    device_id: String,
    /// Raw public key, base64.
    public_key: String,
    /// Raw 32-byte private seed, base64.
    private_key: String,
    created_at_ms: i64,
}

/// An in-memory device identity.
#[derive(Clone)]
pub struct DeviceIdentity {
    signing_key: SigningKey,
    pub device_id: String,
    pub created_at_ms: i64,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material through Debug.
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("created_at_ms", &self.created_at_ms)
            .finish()
    }
}

impl DeviceIdentity {
    fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let device_id = fingerprint(&signing_key.verifying_key());
        Self {
            signing_key,
            device_id,
            created_at_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.signing_key.verifying_key().to_bytes())
    }
}

/// Device id derivation: SHA-256 over the canonical raw public-key bytes
/// (not any encoded container), rendered as lowercase hex.
pub fn fingerprint(key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(key.to_bytes()))
}

/// A signed, time-stamped assertion of device identity, presented during the
/// gateway authentication handshake. Recomputed per attempt, never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthClaim {
    /// The device fingerprint.
    pub id: String,
    /// Raw public key, base64.
    pub public_key: String,
    /// Signature over the claim payload, base64.
    pub signature: String,
    /// Unix milliseconds at signing time.
    pub signed_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Inputs of a claim, supplied by the transport per authentication attempt.
#[derive(Debug, Clone)]
pub struct ClaimParams {
    pub client_id: String,
    pub client_mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub token: String,
    pub nonce: Option<String>,
}

/// Owns the persisted device identity file.
pub struct IdentityStore {
    path: PathBuf,
    current: Mutex<Option<DeviceIdentity>>,
}

impl IdentityStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            current: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted identity, creating one lazily if absent.
    ///
    /// The stored fingerprint is re-derived from the key material on every
    /// load; a mismatch means tampering or corruption and triggers a silent
    /// regeneration.
    pub fn load_or_create(&self) -> Result<DeviceIdentity> {
        {
            let guard = self.current.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(identity) = guard.as_ref() {
                return Ok(identity.clone());
            }
        }

        let identity = match self.load_from_disk() {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                info!("no device identity on disk, generating a new keypair");
                let identity = DeviceIdentity::generate();
                self.persist(&identity)?;
                identity
            }
            Err(err) => {
                warn!("device identity file invalid ({err}), regenerating");
                let identity = DeviceIdentity::generate();
                self.persist(&identity)?;
                identity
            }
        };

        let mut guard = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(identity.clone());
        Ok(identity)
    }

    /// Destroy the persisted identity and generate a fresh one.
    ///
    /// Only called on a confirmed identity-mismatch signal from the gateway;
    /// the transport bounds this to one rotation per connection attempt.
    pub fn rotate(&self) -> Result<DeviceIdentity> {
        warn!("rotating device identity after gateway mismatch signal");
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }

        let identity = DeviceIdentity::generate();
        self.persist(&identity)?;

        let mut guard = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(identity.clone());
        Ok(identity)
    }

    /// Build a signed claim for an authentication attempt.
    pub fn build_claim(&self, params: &ClaimParams) -> Result<AuthClaim> {
        let identity = self.load_or_create()?;
        let signed_at = Utc::now().timestamp_millis();
        let payload = claim_payload(&identity.device_id, params, signed_at);
        let signature = identity.signing_key.sign(payload.as_bytes());

        Ok(AuthClaim {
            id: identity.device_id.clone(),
            public_key: identity.public_key_b64(),
            signature: BASE64.encode(signature.to_bytes()),
            signed_at,
            nonce: params.nonce.clone(),
        })
    }

    fn load_from_disk(&self) -> Result<Option<DeviceIdentity>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let raw = std::fs::read_to_string(&self.path)?;
        let file: IdentityFile = serde_json::from_str(&raw)?;

        if file.version != IDENTITY_VERSION {
            return Err(Error::crypto(format!(
                "unsupported identity file version {}",
                file.version
            )));
        }

        let seed: [u8; 32] = BASE64
            .decode(&file.private_key)
            .map_err(|e| Error::crypto(format!("invalid private key encoding: {e}")))?
            .try_into()
            .map_err(|_| Error::crypto("private key is not 32 bytes"))?;
        let signing_key = SigningKey::from_bytes(&seed);

        let derived = fingerprint(&signing_key.verifying_key());
        if derived != file.device_id {
            return Err(Error::crypto("stored device id does not match key material"));
        }
        if BASE64.encode(signing_key.verifying_key().to_bytes()) != file.public_key {
            return Err(Error::crypto("stored public key does not match private key"));
        }

        Ok(Some(DeviceIdentity {
            signing_key,
            device_id: file.device_id,
            created_at_ms: file.created_at_ms,
        }))
    }

    fn persist(&self, identity: &DeviceIdentity) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = IdentityFile {
            version: IDENTITY_VERSION,
            device_id: identity.device_id.clone(),
            public_key: identity.public_key_b64(),
            private_key: BASE64.encode(identity.signing_key.to_bytes()),
            created_at_ms: identity.created_at_ms,
        };

        std::fs::write(&self.path, serde_json::to_string_pretty(&file)?)?;
        restrict_permissions(&self.path)?;
        debug!("persisted device identity {}", identity.device_id);
        Ok(())
    }
}

/// Versioned, pipe-delimited payload the device signature covers.
///
/// Scopes are sorted so the payload is independent of caller ordering; an
/// absent nonce is an empty trailing segment, keeping the field count fixed.
fn claim_payload(device_id: &str, params: &ClaimParams, signed_at: i64) -> String {
    let mut scopes = params.scopes.clone();
    scopes.sort();

    format!(
        "{CLAIM_VERSION}|{device_id}|{client_id}|{client_mode}|{role}|{scopes}|{signed_at}|{token}|{nonce}",
        client_id = params.client_id,
        client_mode = params.client_mode,
        role = params.role,
        scopes = scopes.join(","),
        token = params.token,
        nonce = params.nonce.as_deref().unwrap_or(""),
    )
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
