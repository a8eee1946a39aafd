use aws_lc_rs::aead::{AES_256_GCM, Aad, LessSafeKey, Nonce, UnboundKey};
use aws_lc_rs::hkdf;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

const STATE_COOKIE_AAD: &[u8] = b"authgate_state_cookie";
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
	#[error("encryption failed")]
	EncryptionFailed,
}

/// Authenticated symmetric encryption for short strings. The only consumer is
/// the state cookie; the sealed value must survive a round trip through a
/// Set-Cookie header, so output is URL-safe base64.
pub trait TokenEncryptor: Send + Sync {
	fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError>;
	/// Returns None for anything that is not an intact ciphertext produced by
	/// this encryptor: wrong key, truncation, bit flips, bad base64.
	fn decrypt(&self, ciphertext: &str) -> Option<String>;
}

/// AES-256-GCM with a key derived from the configured secret via HKDF-SHA256.
/// A random 96-bit nonce is prefixed to each ciphertext.
pub struct AesGcmTokenEncryptor {
	key: LessSafeKey,
}

impl AesGcmTokenEncryptor {
	pub fn new(secret: &SecretString) -> anyhow::Result<Self> {
		let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]);
		let prk = salt.extract(secret.expose_secret().as_bytes());
		let info = [STATE_COOKIE_AAD];
		let okm = prk
			.expand(&info, hkdf::HKDF_SHA256)
			.map_err(|_| anyhow::anyhow!("HKDF expansion failed"))?;
		let mut key_bytes = [0u8; 32];
		okm
			.fill(&mut key_bytes)
			.map_err(|_| anyhow::anyhow!("HKDF fill failed"))?;
		let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes)
			.map_err(|_| anyhow::anyhow!("invalid derived key"))?;
		Ok(Self {
			key: LessSafeKey::new(unbound),
		})
	}
}

impl TokenEncryptor for AesGcmTokenEncryptor {
	fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
		let mut nonce_bytes = [0u8; NONCE_LEN];
		rand::rng().fill_bytes(&mut nonce_bytes);
		let nonce = Nonce::assume_unique_for_key(nonce_bytes);

		let mut in_out = Vec::with_capacity(plaintext.len() + AES_256_GCM.tag_len());
		in_out.extend_from_slice(plaintext.as_bytes());
		self
			.key
			.seal_in_place_append_tag(nonce, Aad::from(STATE_COOKIE_AAD), &mut in_out)
			.map_err(|_| CryptoError::EncryptionFailed)?;

		let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
		sealed.extend_from_slice(&nonce_bytes);
		sealed.extend_from_slice(&in_out);
		Ok(URL_SAFE_NO_PAD.encode(sealed))
	}

	fn decrypt(&self, ciphertext: &str) -> Option<String> {
		let mut data = match URL_SAFE_NO_PAD.decode(ciphertext) {
			Ok(data) => data,
			Err(err) => {
				debug!("state cookie is not valid base64: {err}");
				return None;
			},
		};
		if data.len() < NONCE_LEN + AES_256_GCM.tag_len() {
			return None;
		}

		let nonce = Nonce::try_assume_unique_for_key(&data[..NONCE_LEN]).ok()?;
		let plaintext_len = {
			let in_out = &mut data[NONCE_LEN..];
			let plaintext = self
				.key
				.open_in_place(nonce, Aad::from(STATE_COOKIE_AAD), in_out)
				.ok()?;
			plaintext.len()
		};
		data.copy_within(NONCE_LEN..NONCE_LEN + plaintext_len, 0);
		data.truncate(plaintext_len);
		String::from_utf8(data).ok()
	}
}
