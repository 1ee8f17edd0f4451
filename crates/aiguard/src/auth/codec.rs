use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};

/// Wire prefix shared by every token and by the stored identifier.
pub const TOKEN_PREFIX: &str = "pat_";

const ID_HEX_LEN: usize = 16;
const SECRET_B64_LEN: usize = 32;

/// A freshly minted token. The full string is shown to the creator exactly
/// once; only its identifier and slow hash are ever stored.
pub struct MintedToken {
	/// `pat_<16 hex>` — the indexed lookup identifier.
	pub id: String,
	/// `pat_<16 hex>_<32 url-safe base64>` — the full wire string.
	pub token: SecretString,
}

pub fn mint() -> MintedToken {
	let mut id_bytes = [0u8; 8];
	let mut secret_bytes = [0u8; 24];
	let mut rng = rand::rng();
	rng.fill_bytes(&mut id_bytes);
	rng.fill_bytes(&mut secret_bytes);

	let id = format!("{TOKEN_PREFIX}{}", hex::encode(id_bytes));
	let secret = URL_SAFE_NO_PAD.encode(secret_bytes);
	MintedToken {
		token: SecretString::from(format!("{id}_{secret}")),
		id,
	}
}

/// Reconstruct the wire string from its parts. Inverse of [`parse`].
pub fn format(id: &str, secret: &str) -> String {
	format!("{id}_{secret}")
}

/// Mint a fresh secret under an existing identifier (rotation keeps the
/// lookup id stable).
pub fn mint_with_id(id: &str) -> MintedToken {
	let mut secret_bytes = [0u8; 24];
	rand::rng().fill_bytes(&mut secret_bytes);
	let secret = URL_SAFE_NO_PAD.encode(secret_bytes);
	MintedToken {
		token: SecretString::from(format!("{id}_{secret}")),
		id: id.to_string(),
	}
}

/// Split a candidate wire string into its lookup identifier and secret.
/// Returns `None` for anything that does not match the token shape.
pub fn parse(token: &str) -> Option<(String, &str)> {
	let rest = token.strip_prefix(TOKEN_PREFIX)?;
	let (id_part, secret) = rest.split_once('_')?;
	if id_part.len() != ID_HEX_LEN
		|| !id_part
			.chars()
			.all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
	{
		return None;
	}
	if secret.len() != SECRET_B64_LEN
		|| !secret
			.chars()
			.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
	{
		return None;
	}
	Some((format!("{TOKEN_PREFIX}{id_part}"), secret))
}

impl std::fmt::Debug for MintedToken {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MintedToken")
			.field("id", &self.id)
			.field("token", &"<redacted>")
			.finish()
	}
}

impl MintedToken {
	pub fn expose(&self) -> &str {
		self.token.expose_secret()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn minted_tokens_parse_back() {
		for _ in 0..32 {
			let minted = mint();
			let raw = minted.expose();
			assert!(raw.starts_with("pat_"));
			assert_eq!(raw.len(), 4 + 16 + 1 + 32);

			let (id, secret) = parse(raw).expect("minted token must parse");
			assert_eq!(id, minted.id);
			assert_eq!(format(&id, secret), raw);
		}
	}

	#[test]
	fn rejects_malformed_tokens() {
		assert!(parse("").is_none());
		assert!(parse("pat_").is_none());
		assert!(parse("sk-abcdef").is_none());
		// identifier too short
		assert!(parse("pat_00112233_AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").is_none());
		// uppercase hex in identifier
		assert!(parse("pat_00112233445566AA_AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").is_none());
		// secret wrong length
		assert!(parse("pat_0011223344556677_short").is_none());
		// secret with invalid characters
		assert!(parse("pat_0011223344556677_AAAAAAAAAAAAAAAAAAAAAAAAAAAAAA+/").is_none());
	}

	#[test]
	fn identifier_keeps_wire_prefix() {
		let (id, _) = parse("pat_0011223344556677_AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap();
		assert_eq!(id, "pat_0011223344556677");
	}

	#[test]
	fn debug_never_shows_secret() {
		let minted = mint();
		let dbg = format!("{minted:?}");
		assert!(dbg.contains(&minted.id));
		assert!(!dbg.contains(minted.expose()));
	}
}
