use super::AuthError;

/// bcrypt cost for PAT secrets. Raising this invalidates nothing (hashes
/// embed their cost) but slows verification for new tokens.
pub const BCRYPT_COST: u32 = 10;

/// Slow-hash the *full* wire string, identifier included. Swapping secrets
/// between two stored tokens therefore never verifies.
pub fn hash_token(token: &str) -> Result<String, AuthError> {
	bcrypt::hash(token, BCRYPT_COST).map_err(|_| AuthError::Invalid)
}

/// Constant-time comparison happens inside bcrypt's verifier.
pub fn verify_token(token: &str, hash: &str) -> bool {
	bcrypt::verify(token, hash).unwrap_or(false)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::auth::codec;

	#[test]
	fn hash_verifies_only_original() {
		let minted = codec::mint();
		let hash = hash_token(minted.expose()).unwrap();
		assert!(verify_token(minted.expose(), &hash));

		let other = codec::mint();
		assert!(!verify_token(other.expose(), &hash));
	}

	#[test]
	fn hash_covers_identifier_segment() {
		let a = codec::mint();
		let b = codec::mint();
		let (_, a_secret) = codec::parse(a.expose()).unwrap();
		let hash_b = hash_token(b.expose()).unwrap();
		// b's secret presented under a's identifier must not verify.
		let spliced = codec::format(&a.id, a_secret);
		assert!(!verify_token(&spliced, &hash_b));
	}

	#[test]
	fn verify_tolerates_garbage_hash() {
		assert!(!verify_token("pat_x_y", "not-a-bcrypt-hash"));
	}
}
