//! Wire format of the state-cookie payload. The pair is sealed by the
//! [`TokenEncryptor`](crate::crypto::TokenEncryptor) before it reaches the
//! browser, so the separator never needs escaping: state and nonce are
//! URL-safe base64 and cannot contain `;`.

pub struct StateCookieCodec;

impl StateCookieCodec {
	pub fn encode(state: &str, nonce: &str) -> String {
		format!("{state};{nonce}")
	}

	/// Decodes a payload produced by [`encode`](Self::encode). Fails unless
	/// the input splits into exactly two non-empty halves on a single `;`.
	pub fn decode(value: &str) -> Option<(String, String)> {
		let (state, nonce) = value.split_once(';')?;
		if state.is_empty() || nonce.is_empty() || nonce.contains(';') {
			return None;
		}
		Some((state.to_string(), nonce.to_string()))
	}
}
