//! Instance credentials
//!
//! On first boot the instance generates an RSA-2048 keypair, registers the
//! public half with the control service, persists the returned token next to
//! the private key, then confirms the token. Later boots read the stored
//! record. The private key never leaves this module except as the means to
//! decrypt secrets embedded in overlays.
//!
//! # Handshake
//!
//! ```text
//! load ──NotFound──► generate keypair ──► POST /register (201)
//!   │                                          │
//!   │                               persist {privateKey, token, ...}
//!   │                                          │
//!   │                                  POST /confirm (200)
//!   ▼                                          ▼
//! token ◄──────────────────────────────────── token
//! ```

use std::fmt;

use aws_lc_rs::encoding::AsDer;
use aws_lc_rs::rsa::{
    KeySize, OaepPrivateDecryptingKey, OaepPublicEncryptingKey, PrivateDecryptingKey,
    PublicEncryptingKey, OAEP_SHA256_MGF1SHA256,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use pkcs8::der::asn1::AnyRef;
use pkcs8::der::{Decode, Encode};
use pkcs8::{AlgorithmIdentifierRef, PrivateKeyInfo};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use tether_common::protocol::{ConfirmRequest, IssueDate, RegisterRequest};
use tether_common::store::{get_json, put_json};
use tether_common::{
    Error, MetadataStore, Result, SharedStore, StoreError, CREDENTIALS_KEY, MANAGEMENT_DATABASE,
};

use crate::api::SharedControlApi;

/// Age after which a rotation warning is logged
pub const TOKEN_ROTATION_DAYS: i64 = 7;

const PEM_PRIVATE_KEY: &str = "PRIVATE KEY";
const PEM_RSA_PRIVATE_KEY: &str = "RSA PRIVATE KEY";
const PEM_PUBLIC_KEY: &str = "PUBLIC KEY";

/// Persisted credentials record
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// PEM private key (PKCS#8, or PKCS#1 in older records)
    pub private_key: String,
    /// PEM SubjectPublicKeyInfo public key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Instance token
    pub token: String,
    /// Token serial
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<u64>,
    /// When the token was issued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_date: Option<IssueDate>,
    /// Fields returned by the control service that are not interpreted
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key.as_ref().map(|_| "<pem>"))
            .field("token", &"<redacted>")
            .field("serial", &self.serial)
            .field("issue_date", &self.issue_date)
            .finish()
    }
}

impl Credentials {
    /// Whether the token is older than the rotation threshold
    pub fn needs_rotation(&self) -> bool {
        let Some(issued) = self.issue_date.as_ref().and_then(IssueDate::to_datetime) else {
            return false;
        };
        Utc::now() - issued > ChronoDuration::days(TOKEN_ROTATION_DAYS)
    }

    /// Decryptor for overlay secrets bound to this record's private key
    pub fn decryptor(&self) -> Result<SecretDecryptor> {
        SecretDecryptor::from_pem(&self.private_key)
    }
}

/// Read the stored credentials record
pub async fn stored_credentials(store: &dyn MetadataStore) -> Result<Credentials> {
    Ok(get_json(store, MANAGEMENT_DATABASE, CREDENTIALS_KEY).await?)
}

/// Freshly generated RSA keypair in PEM form
pub struct GeneratedKeyPair {
    /// PKCS#8 private key
    pub private_pem: String,
    /// SubjectPublicKeyInfo public key
    pub public_pem: String,
}

/// Generate an RSA-2048 keypair (public exponent 65537)
pub fn generate_keypair() -> Result<GeneratedKeyPair> {
    let private = PrivateDecryptingKey::generate(KeySize::Rsa2048)
        .map_err(|_| Error::crypto("RSA key generation failed"))?;
    let private_der = private
        .as_der()
        .map_err(|_| Error::crypto("failed to encode private key"))?;
    let public_der = private
        .public_key()
        .as_der()
        .map_err(|_| Error::crypto("failed to encode public key"))?;

    Ok(GeneratedKeyPair {
        private_pem: pem::encode(&pem::Pem::new(PEM_PRIVATE_KEY, private_der.as_ref().to_vec())),
        public_pem: pem::encode(&pem::Pem::new(PEM_PUBLIC_KEY, public_der.as_ref().to_vec())),
    })
}

/// Decrypts base64 RSA-OAEP(SHA-256) secrets
pub struct SecretDecryptor {
    key: OaepPrivateDecryptingKey,
}

impl SecretDecryptor {
    /// Parse a PEM private key (PKCS#8 `PRIVATE KEY` or PKCS#1 `RSA PRIVATE KEY`)
    pub fn from_pem(private_pem: &str) -> Result<Self> {
        let parsed = pem::parse(private_pem)
            .map_err(|e| Error::crypto(format!("invalid private key PEM: {}", e)))?;
        let pkcs8 = match parsed.tag() {
            PEM_PRIVATE_KEY => parsed.contents().to_vec(),
            PEM_RSA_PRIVATE_KEY => pkcs1_to_pkcs8(parsed.contents())?,
            other => {
                return Err(Error::crypto(format!(
                    "unsupported private key type '{}'",
                    other
                )))
            }
        };
        let private = PrivateDecryptingKey::from_pkcs8(&pkcs8)
            .map_err(|e| Error::crypto(format!("private key rejected: {}", e)))?;
        let key = OaepPrivateDecryptingKey::new(private)
            .map_err(|_| Error::crypto("private key unusable for OAEP"))?;
        Ok(Self { key })
    }

    /// Decrypt one base64 ciphertext to its UTF-8 plaintext
    pub fn decrypt(&self, ciphertext_b64: &str) -> Result<String> {
        let ciphertext = BASE64
            .decode(ciphertext_b64.trim())
            .map_err(|e| Error::crypto(format!("secret is not valid base64: {}", e)))?;
        let mut out = vec![0u8; self.key.min_output_size()];
        let plaintext = self
            .key
            .decrypt(&OAEP_SHA256_MGF1SHA256, &ciphertext, &mut out, None)
            .map_err(|_| Error::crypto("could not decrypt secret"))?;
        String::from_utf8(plaintext.to_vec())
            .map_err(|_| Error::crypto("decrypted secret is not UTF-8"))
    }
}

/// Decrypt one overlay secret with the stored private key
pub fn decrypt_secret(credentials: &Credentials, ciphertext_b64: &str) -> Result<String> {
    credentials.decryptor()?.decrypt(ciphertext_b64)
}

/// Encrypt a secret for the holder of `public_pem` (the control-service side of
/// [`decrypt_secret`])
pub fn encrypt_secret(public_pem: &str, plaintext: &str) -> Result<String> {
    let parsed = pem::parse(public_pem)
        .map_err(|e| Error::crypto(format!("invalid public key PEM: {}", e)))?;
    if parsed.tag() != PEM_PUBLIC_KEY {
        return Err(Error::crypto(format!(
            "unsupported public key type '{}'",
            parsed.tag()
        )));
    }
    let public = PublicEncryptingKey::from_der(parsed.contents())
        .map_err(|e| Error::crypto(format!("public key rejected: {}", e)))?;
    let key = OaepPublicEncryptingKey::new(public)
        .map_err(|_| Error::crypto("public key unusable for OAEP"))?;
    let mut out = vec![0u8; key.ciphertext_size()];
    let ciphertext = key
        .encrypt(&OAEP_SHA256_MGF1SHA256, plaintext.as_bytes(), &mut out, None)
        .map_err(|_| Error::crypto("could not encrypt secret"))?;
    Ok(BASE64.encode(ciphertext))
}

/// Re-wrap a PKCS#1 RSAPrivateKey as a PKCS#8 PrivateKeyInfo
fn pkcs1_to_pkcs8(pkcs1_der: &[u8]) -> Result<Vec<u8>> {
    pkcs1::RsaPrivateKey::from_der(pkcs1_der)
        .map_err(|e| Error::crypto(format!("invalid PKCS#1 private key: {}", e)))?;
    let algorithm = AlgorithmIdentifierRef {
        oid: pkcs1::ALGORITHM_OID,
        parameters: Some(AnyRef::NULL),
    };
    PrivateKeyInfo::new(algorithm, pkcs1_der)
        .to_der()
        .map_err(|e| Error::crypto(format!("failed to encode private key: {}", e)))
}

/// Loads or issues the instance credentials
pub struct CredentialManager {
    store: SharedStore,
    api: SharedControlApi,
}

impl CredentialManager {
    /// Create a manager persisting into `store` and talking to `api`
    pub fn new(store: SharedStore, api: SharedControlApi) -> Self {
        Self { store, api }
    }

    /// Read stored credentials; `None` when none were ever issued
    pub async fn load(&self) -> Result<Option<Credentials>> {
        match stored_credentials(self.store.as_ref()).await {
            Ok(creds) => Ok(Some(creds)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Generate a keypair, register it and persist the issued credentials
    pub async fn issue(&self, instance_id: &str) -> Result<Credentials> {
        info!(instance_id = %instance_id, "Registering with control service to get token");

        let keypair = tokio::task::spawn_blocking(generate_keypair)
            .await
            .map_err(|e| Error::crypto(format!("key generation task failed: {}", e)))??;

        let response = self
            .api
            .register(
                instance_id,
                &RegisterRequest {
                    public_key: keypair.public_pem.clone(),
                },
            )
            .await?;

        let credentials = Credentials {
            private_key: keypair.private_pem,
            public_key: response.public_key.or(Some(keypair.public_pem)),
            token: response.token,
            serial: response.serial,
            issue_date: response.issue_date.or_else(|| Some(IssueDate::now())),
            extra: response.extra,
        };

        debug!("Saving token");
        put_json(
            self.store.as_ref(),
            MANAGEMENT_DATABASE,
            CREDENTIALS_KEY,
            &credentials,
        )
        .await
        .map_err(|e: StoreError| {
            Error::credentials(format!("could not save token: {}", e))
        })?;
        info!("Saved token locally, confirming instance");

        Ok(credentials)
    }

    /// Confirm issued credentials with the control service
    pub async fn confirm(&self, instance_id: &str, credentials: &Credentials) -> Result<()> {
        let request = ConfirmRequest {
            serial: credentials.serial.unwrap_or(0),
            public_key: credentials.public_key.clone(),
        };
        self.api
            .confirm(instance_id, &credentials.token, &request)
            .await
    }

    /// Return the instance token, issuing and confirming credentials if needed
    pub async fn ensure_token(&self, instance_id: &str) -> Result<String> {
        if let Some(credentials) = self.load().await? {
            info!("Returning existing token");
            if credentials.needs_rotation() {
                warn!(
                    max_age_days = TOKEN_ROTATION_DAYS,
                    "Management API token is too old, should re-issue"
                );
            }
            return Ok(credentials.token);
        }

        let credentials = self.issue(instance_id).await?;
        self.confirm(instance_id, &credentials).await?;
        Ok(credentials.token)
    }
}
