//! Recipient identities and share envelopes.
//!
//! Every operator (trust holder) is represented by an X25519 keypair. The
//! public half, a [`RecipientIdentity`], is handed out of band to whoever
//! initializes the cluster; the secret half, an [`IdentityKeypair`], never
//! leaves the operator's machine.
//!
//! Envelopes are RFC 9180 HPKE single-shot seals in base mode with
//! DHKEM(X25519, HKDF-SHA256), HKDF-SHA256 and AES-256-GCM:
//!
//! ```text
//! envelope = version (1) || purpose (1) || index (1) || enc (32) || ciphertext
//! aad      = purpose label || 0x00 || index || recipient fingerprint
//! ```
//!
//! The header travels in clear but every byte of it is bound through the
//! AAD, so an envelope opens only for its recipient, only for its purpose,
//! and only at its share position. A sealed root credential never opens as
//! an unseal share.

use std::fmt;

use hpke::aead::AesGcm256;
use hpke::kdf::HkdfSha256;
use hpke::kem::X25519HkdfSha256;
use hpke::{Deserializable, Kem as KemTrait, OpModeR, OpModeS, Serializable};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::crypto::{self, EncryptionKey};
use crate::error::IdentityError;

type Kem = X25519HkdfSha256;
type Kdf = HkdfSha256;
type Aead = AesGcm256;

const HPKE_INFO: &[u8] = b"quorum-hpke-v1";

const ENVELOPE_VERSION: u8 = 1;

/// HPKE encapsulated key size for X25519.
const ENC_LEN: usize = 32;

/// Version, purpose and index bytes plus the encapsulated key.
const ENVELOPE_HEADER_LEN: usize = 3 + ENC_LEN;

const PURPOSE_SHARE: u8 = 1;
const PURPOSE_ROOT_CREDENTIAL: u8 = 2;

/// Fingerprints are the first 20 bytes of SHA-256(public key).
const FINGERPRINT_BYTES: usize = 20;

const MAX_LABEL_LEN: usize = 64;

/// What an envelope holds. Authenticated together with the ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopePurpose {
    /// Unseal share at 1-based position `index`.
    Share { index: u8 },
    /// The root credential, sealed to the bootstrap identity.
    RootCredential,
}

impl EnvelopePurpose {
    fn tag(self) -> u8 {
        match self {
            Self::Share { .. } => PURPOSE_SHARE,
            Self::RootCredential => PURPOSE_ROOT_CREDENTIAL,
        }
    }

    fn index(self) -> u8 {
        match self {
            Self::Share { index } => index,
            Self::RootCredential => 0,
        }
    }

    fn label(self) -> &'static [u8] {
        match self {
            Self::Share { .. } => b"quorum-unseal-share",
            Self::RootCredential => b"quorum-root-credential",
        }
    }

    fn from_header(tag: u8, index: u8) -> Result<Self, IdentityError> {
        match (tag, index) {
            (PURPOSE_SHARE, 1..) => Ok(Self::Share { index }),
            (PURPOSE_ROOT_CREDENTIAL, 0) => Ok(Self::RootCredential),
            _ => Err(IdentityError::MalformedEnvelope {
                reason: format!("unknown purpose {tag} at index {index}"),
            }),
        }
    }

    /// `label || 0x00 || index || fingerprint`
    fn aad(self, fingerprint: &str) -> Vec<u8> {
        let label = self.label();
        let mut aad = Vec::with_capacity(label.len() + 2 + fingerprint.len());
        aad.extend_from_slice(label);
        aad.push(0);
        aad.push(self.index());
        aad.extend_from_slice(fingerprint.as_bytes());
        aad
    }
}

impl fmt::Display for EnvelopePurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Share { index } => write!(f, "unseal share {index}"),
            Self::RootCredential => f.write_str("root credential"),
        }
    }
}

/// A recipient's public identity: a label plus an X25519 public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientIdentity {
    label: String,
    public_key: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct PublicIdentityFile {
    label: String,
    public_key: String,
}

#[derive(Serialize, Deserialize)]
struct SecretIdentityFile {
    label: String,
    secret_key: String,
}

impl RecipientIdentity {
    /// Build an identity from a label and raw public key.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidLabel`] if the label is not usable in
    /// an artifact name.
    pub fn new(label: impl Into<String>, public_key: [u8; 32]) -> Result<Self, IdentityError> {
        let label = label.into();
        validate_label(&label)?;
        Ok(Self { label, public_key })
    }

    /// Human-readable label chosen by the operator.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Raw X25519 public key.
    #[must_use]
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Lowercase hex fingerprint (40 characters).
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let digest = crypto::sha256(&self.public_key);
        hex::encode(&digest[..FINGERPRINT_BYTES])
    }

    /// Parse a public identity file.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Parse`] for malformed JSON and
    /// [`IdentityError::InvalidKey`] for a bad key encoding.
    pub fn from_json(json: &str) -> Result<Self, IdentityError> {
        let file: PublicIdentityFile =
            serde_json::from_str(json).map_err(|e| IdentityError::Parse {
                reason: e.to_string(),
            })?;
        let public_key = decode_key(&file.public_key)?;
        Self::new(file.label, public_key)
    }

    /// Serialize as a public identity file.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Parse`] if serialization fails.
    pub fn to_json(&self) -> Result<String, IdentityError> {
        let file = PublicIdentityFile {
            label: self.label.clone(),
            public_key: hex::encode(self.public_key),
        };
        serde_json::to_string_pretty(&file).map_err(|e| IdentityError::Parse {
            reason: e.to_string(),
        })
    }

    /// Seal `plaintext` for `purpose` so that only this identity can open it.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Seal`] if HPKE rejects the public key (for
    /// example a low-order point) or encryption fails.
    pub fn seal(
        &self,
        purpose: EnvelopePurpose,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, IdentityError> {
        let recipient = <Kem as KemTrait>::PublicKey::from_bytes(&self.public_key).map_err(|e| {
            IdentityError::InvalidKey {
                reason: e.to_string(),
            }
        })?;
        let aad = purpose.aad(&self.fingerprint());
        let (enc, ciphertext) = hpke::single_shot_seal::<Aead, Kdf, Kem, _>(
            &OpModeS::Base,
            &recipient,
            HPKE_INFO,
            plaintext,
            &aad,
            &mut OsRng,
        )
        .map_err(|e| IdentityError::Seal {
            reason: e.to_string(),
        })?;

        let mut envelope =
            Vec::with_capacity(ENVELOPE_HEADER_LEN.saturating_add(ciphertext.len()));
        envelope.push(ENVELOPE_VERSION);
        envelope.push(purpose.tag());
        envelope.push(purpose.index());
        envelope.extend_from_slice(&enc.to_bytes());
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }
}

impl fmt::Display for RecipientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label, self.fingerprint())
    }
}

/// An operator's secret identity. Zeroized on drop; `Debug` is redacted.
#[derive(Clone)]
pub struct IdentityKeypair {
    label: String,
    secret: EncryptionKey,
}

impl IdentityKeypair {
    /// Generate a fresh keypair.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidLabel`] for an unusable label.
    pub fn generate(label: impl Into<String>) -> Result<Self, IdentityError> {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_secret(label, EncryptionKey::from_bytes(secret.to_bytes()))
    }

    /// Wrap an existing secret key.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidLabel`] for an unusable label.
    pub fn from_secret(
        label: impl Into<String>,
        secret: EncryptionKey,
    ) -> Result<Self, IdentityError> {
        let label = label.into();
        validate_label(&label)?;
        Ok(Self { label, secret })
    }

    /// The label of this identity.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The public identity to hand to the initializing operator.
    #[must_use]
    pub fn identity(&self) -> RecipientIdentity {
        RecipientIdentity {
            label: self.label.clone(),
            public_key: self.public_key(),
        }
    }

    fn public_key(&self) -> [u8; 32] {
        let secret = StaticSecret::from(*self.secret.as_bytes());
        PublicKey::from(&secret).to_bytes()
    }

    /// Open an unseal share envelope addressed to this identity.
    ///
    /// # Errors
    ///
    /// - [`IdentityError::WrongPurpose`] if the envelope holds something else,
    ///   such as the sealed root credential.
    /// - [`IdentityError::DecryptionFailed`] if the envelope was sealed to a
    ///   different identity or any part of it has been altered.
    pub fn open_share(&self, envelope: &[u8]) -> Result<Zeroizing<Vec<u8>>, IdentityError> {
        match self.open(envelope)? {
            (EnvelopePurpose::Share { .. }, plaintext) => Ok(plaintext),
            (other, _) => Err(IdentityError::WrongPurpose {
                expected: "unseal share",
                actual: other.to_string(),
            }),
        }
    }

    /// Open the sealed root credential.
    ///
    /// # Errors
    ///
    /// As [`IdentityKeypair::open_share`], with the purposes swapped.
    pub fn open_root_credential(
        &self,
        envelope: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, IdentityError> {
        match self.open(envelope)? {
            (EnvelopePurpose::RootCredential, plaintext) => Ok(plaintext),
            (other, _) => Err(IdentityError::WrongPurpose {
                expected: "root credential",
                actual: other.to_string(),
            }),
        }
    }

    fn open(
        &self,
        envelope: &[u8],
    ) -> Result<(EnvelopePurpose, Zeroizing<Vec<u8>>), IdentityError> {
        if envelope.len() < ENVELOPE_HEADER_LEN {
            return Err(IdentityError::EnvelopeTooShort {
                actual: envelope.len(),
            });
        }
        let (header, ciphertext) = envelope.split_at(ENVELOPE_HEADER_LEN);
        let [version, tag, index, enc @ ..] = header else {
            return Err(IdentityError::EnvelopeTooShort {
                actual: envelope.len(),
            });
        };
        if *version != ENVELOPE_VERSION {
            return Err(IdentityError::UnsupportedEnvelope { version: *version });
        }
        let purpose = EnvelopePurpose::from_header(*tag, *index)?;

        let encapped = <Kem as KemTrait>::EncappedKey::from_bytes(enc).map_err(|e| {
            IdentityError::MalformedEnvelope {
                reason: e.to_string(),
            }
        })?;
        let secret =
            <Kem as KemTrait>::PrivateKey::from_bytes(self.secret.as_bytes()).map_err(|e| {
                IdentityError::InvalidKey {
                    reason: e.to_string(),
                }
            })?;
        let fingerprint = self.identity().fingerprint();
        let aad = purpose.aad(&fingerprint);

        hpke::single_shot_open::<Aead, Kdf, Kem>(
            &OpModeR::Base,
            &secret,
            &encapped,
            HPKE_INFO,
            ciphertext,
            &aad,
        )
        .map(|plaintext| (purpose, Zeroizing::new(plaintext)))
        .map_err(|_| IdentityError::DecryptionFailed { fingerprint })
    }

    /// Parse a secret identity file.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Parse`] or [`IdentityError::InvalidKey`].
    pub fn from_json(json: &str) -> Result<Self, IdentityError> {
        let file: SecretIdentityFile =
            serde_json::from_str(json).map_err(|e| IdentityError::Parse {
                reason: e.to_string(),
            })?;
        let secret = Zeroizing::new(file.secret_key);
        let bytes = decode_key(&secret)?;
        Self::from_secret(file.label, EncryptionKey::from_bytes(bytes))
    }

    /// Serialize as a secret identity file. Handle the output like the key.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Parse`] if serialization fails.
    pub fn to_json(&self) -> Result<Zeroizing<String>, IdentityError> {
        let file = SecretIdentityFile {
            label: self.label.clone(),
            secret_key: hex::encode(self.secret.as_bytes()),
        };
        let json = serde_json::to_string_pretty(&file).map_err(|e| IdentityError::Parse {
            reason: e.to_string(),
        });
        drop(Zeroizing::new(file.secret_key));
        json.map(Zeroizing::new)
    }
}

impl fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeypair")
            .field("label", &self.label)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

fn decode_key(encoded: &str) -> Result<[u8; 32], IdentityError> {
    let bytes = hex::decode(encoded.trim()).map_err(|e| IdentityError::InvalidKey {
        reason: format!("hex decode failed: {e}"),
    })?;
    bytes.try_into().map_err(|b: Vec<u8>| IdentityError::InvalidKey {
        reason: format!("expected 32 bytes, got {}", b.len()),
    })
}

fn validate_label(label: &str) -> Result<(), IdentityError> {
    let invalid = |reason: &str| IdentityError::InvalidLabel {
        label: label.to_owned(),
        reason: reason.to_owned(),
    };
    if label.is_empty() {
        return Err(invalid("label is empty"));
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(invalid("label is longer than 64 characters"));
    }
    if label.starts_with('.') {
        return Err(invalid("label may not start with '.'"));
    }
    if !label
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid("only ASCII letters, digits, '-', '_' and '.' are allowed"));
    }
    Ok(())
}
