use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

type Aes256Gcm12 = AesGcm<Aes256, aes_gcm::aead::consts::U12>;
type Aes256Gcm16 = AesGcm<Aes256, aes_gcm::aead::consts::U16>;

const TAG_LEN: usize = 16;
const IV_LEN: usize = 12;
// Changing either constant is a breaking migration for every stored envelope.
const PBKDF2_ITERATIONS: u32 = 100_000;
const PBKDF2_SALT: &[u8] = b"aiguard-master-salt";

#[derive(thiserror::Error, Debug)]
pub enum VaultError {
	#[error("decryption failed")]
	DecryptionFailed,
	#[error("encryption failed")]
	EncryptionFailed,
	#[error("malformed envelope: {0}")]
	Malformed(&'static str),
}

/// What `encrypt` hands back: the sealed envelope plus the stable handle
/// chosen for this credential.
#[derive(Debug, Clone)]
pub struct Sealed {
	pub envelope: String,
	pub key_id: String,
}

/// A decrypted credential. The api key is wrapped so it never lands in logs.
pub struct Unsealed {
	pub api_key: SecretString,
	pub key_id: String,
	pub metadata: Option<serde_json::Value>,
	pub encrypted_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopePayload {
	key: String,
	key_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	metadata: Option<serde_json::Value>,
	encrypted_at: DateTime<Utc>,
}

/// Authenticated encryption of provider credentials under a single process
/// master key. Rotation is a pure function over two explicit keys; nothing
/// here mutates process-wide state.
pub struct CryptoVault {
	key: [u8; 32],
}

impl CryptoVault {
	pub fn new(material: &SecretString) -> Self {
		Self {
			key: derive_master_key(material.expose_secret().as_bytes()),
		}
	}

	pub fn encrypt(
		&self,
		api_key: &str,
		metadata: Option<serde_json::Value>,
	) -> Result<Sealed, VaultError> {
		let mut key_id_bytes = [0u8; 16];
		rand::rng().fill_bytes(&mut key_id_bytes);
		let key_id = hex::encode(key_id_bytes);

		let payload = EnvelopePayload {
			key: api_key.to_string(),
			key_id: key_id.clone(),
			metadata,
			encrypted_at: Utc::now(),
		};
		let plaintext = serde_json::to_vec(&payload).map_err(|_| VaultError::EncryptionFailed)?;

		let mut iv = [0u8; IV_LEN];
		rand::rng().fill_bytes(&mut iv);
		let cipher =
			Aes256Gcm12::new_from_slice(&self.key).map_err(|_| VaultError::EncryptionFailed)?;
		// aes-gcm appends the tag; the envelope layout wants IV || TAG || CT.
		let sealed = cipher
			.encrypt(Nonce::from_slice(&iv), plaintext.as_ref())
			.map_err(|_| VaultError::EncryptionFailed)?;
		let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

		let mut out = Vec::with_capacity(IV_LEN + TAG_LEN + ciphertext.len());
		out.extend_from_slice(&iv);
		out.extend_from_slice(tag);
		out.extend_from_slice(ciphertext);

		Ok(Sealed {
			envelope: BASE64.encode(out),
			key_id,
		})
	}

	pub fn decrypt(&self, envelope: &str) -> Result<Unsealed, VaultError> {
		let raw = BASE64
			.decode(envelope.trim())
			.map_err(|_| VaultError::Malformed("not base64"))?;
		if raw.len() < IV_LEN + TAG_LEN {
			return Err(VaultError::Malformed("too short"));
		}

		// Envelopes written by older deployments used a 16-byte IV; accept
		// both by attempting 12 first.
		let plaintext = self
			.open(&raw, IV_LEN)
			.or_else(|_| self.open(&raw, 16))
			.map_err(|_| VaultError::DecryptionFailed)?;

		let payload: EnvelopePayload =
			serde_json::from_slice(&plaintext).map_err(|_| VaultError::Malformed("bad payload"))?;
		Ok(Unsealed {
			api_key: SecretString::from(payload.key),
			key_id: payload.key_id,
			metadata: payload.metadata,
			encrypted_at: payload.encrypted_at,
		})
	}

	fn open(&self, raw: &[u8], iv_len: usize) -> Result<Vec<u8>, VaultError> {
		if raw.len() < iv_len + TAG_LEN {
			return Err(VaultError::DecryptionFailed);
		}
		let iv = &raw[..iv_len];
		let tag = &raw[iv_len..iv_len + TAG_LEN];
		let ciphertext = &raw[iv_len + TAG_LEN..];

		let mut joined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
		joined.extend_from_slice(ciphertext);
		joined.extend_from_slice(tag);

		match iv_len {
			IV_LEN => {
				let cipher =
					Aes256Gcm12::new_from_slice(&self.key).map_err(|_| VaultError::DecryptionFailed)?;
				cipher
					.decrypt(Nonce::from_slice(iv), joined.as_ref())
					.map_err(|_| VaultError::DecryptionFailed)
			},
			16 => {
				let cipher =
					Aes256Gcm16::new_from_slice(&self.key).map_err(|_| VaultError::DecryptionFailed)?;
				cipher
					.decrypt(Nonce::from_slice(iv), joined.as_ref())
					.map_err(|_| VaultError::DecryptionFailed)
			},
			_ => Err(VaultError::DecryptionFailed),
		}
	}

	/// Re-seal an envelope under a new master key. Both keys stay local to
	/// this call; the process-wide vault is untouched.
	pub fn rotate(
		envelope: &str,
		old_master: &SecretString,
		new_master: &SecretString,
	) -> Result<String, VaultError> {
		let old = CryptoVault::new(old_master);
		let new = CryptoVault::new(new_master);
		let opened = old.decrypt(envelope)?;
		let resealed = new.encrypt_with_key_id(
			opened.api_key.expose_secret(),
			opened.metadata,
			&opened.key_id,
		)?;
		Ok(resealed.envelope)
	}

	/// Like `encrypt` but preserving an existing key id, so rotation keeps
	/// the stable handle.
	fn encrypt_with_key_id(
		&self,
		api_key: &str,
		metadata: Option<serde_json::Value>,
		key_id: &str,
	) -> Result<Sealed, VaultError> {
		let payload = EnvelopePayload {
			key: api_key.to_string(),
			key_id: key_id.to_string(),
			metadata,
			encrypted_at: Utc::now(),
		};
		let plaintext = serde_json::to_vec(&payload).map_err(|_| VaultError::EncryptionFailed)?;

		let mut iv = [0u8; IV_LEN];
		rand::rng().fill_bytes(&mut iv);
		let cipher =
			Aes256Gcm12::new_from_slice(&self.key).map_err(|_| VaultError::EncryptionFailed)?;
		let sealed = cipher
			.encrypt(Nonce::from_slice(&iv), plaintext.as_ref())
			.map_err(|_| VaultError::EncryptionFailed)?;
		let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

		let mut out = Vec::with_capacity(IV_LEN + TAG_LEN + ciphertext.len());
		out.extend_from_slice(&iv);
		out.extend_from_slice(tag);
		out.extend_from_slice(ciphertext);

		Ok(Sealed {
			envelope: BASE64.encode(out),
			key_id: key_id.to_string(),
		})
	}
}

impl std::fmt::Debug for CryptoVault {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("CryptoVault {{ key: <redacted> }}")
	}
}

/// 32-byte master key: raw when the material is long enough, PBKDF2-SHA256
/// stretched otherwise.
fn derive_master_key(material: &[u8]) -> [u8; 32] {
	let mut key = [0u8; 32];
	if material.len() >= 32 {
		key.copy_from_slice(&material[..32]);
	} else {
		pbkdf2::pbkdf2_hmac::<sha2::Sha256>(material, PBKDF2_SALT, PBKDF2_ITERATIONS, &mut key);
	}
	key
}
