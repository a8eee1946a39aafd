use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::clock::Clock;

/// Parsed result of an IdP token-endpoint exchange. Serializable so that
/// distributed session stores can persist it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
	/// The raw compact JWT; injected verbatim into the configured header.
	pub id_token_jwt: String,
	pub access_token: Option<String>,
	pub refresh_token: Option<String>,
	/// Absolute seconds since epoch; absent when the IdP omitted
	/// `expires_in` (RFC 6749 §5.1 does not require it).
	pub access_token_expiry: Option<i64>,
	/// Absolute seconds since epoch, from the id_token `exp` claim.
	pub id_token_expiry: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
	#[error("token response body is not valid JSON")]
	InvalidBody,
	#[error("unsupported token_type `{0}`")]
	UnsupportedTokenType(String),
	#[error("token response has no id_token")]
	MissingIdToken,
	#[error("id_token is not a decodable compact JWT")]
	MalformedIdToken,
	#[error("id_token audience does not include the client_id")]
	AudienceMismatch,
	#[error("id_token nonce does not match the state cookie")]
	NonceMismatch,
	#[error("id_token has no exp claim")]
	MissingExpiry,
}

/// Parses IdP token-endpoint bodies. Signature verification belongs to the
/// JWKS layer; this parser owns the structural and binding checks.
pub trait TokenResponseParser: Send + Sync {
	/// Parses the body of an authorization-code exchange. `nonce` is the
	/// value bound into the state cookie when the flow started; the
	/// id_token must echo it.
	fn parse(&self, client_id: &str, nonce: &str, body: &str) -> Result<TokenResponse, ParseError>;

	/// Parses the body of a refresh exchange, carrying forward any field the
	/// response omits (IdPs routinely omit id_token and refresh_token on
	/// refresh).
	fn parse_refresh_token_response(
		&self,
		existing: &TokenResponse,
		client_id: &str,
		body: &str,
	) -> Result<TokenResponse, ParseError>;
}

#[derive(Deserialize)]
struct RawTokenResponse {
	token_type: Option<String>,
	id_token: Option<String>,
	access_token: Option<String>,
	refresh_token: Option<String>,
	expires_in: Option<i64>,
}

pub struct DefaultTokenResponseParser {
	clock: Arc<dyn Clock>,
}

impl DefaultTokenResponseParser {
	pub fn new(clock: Arc<dyn Clock>) -> Self {
		Self { clock }
	}

	fn decode(body: &str) -> Result<RawTokenResponse, ParseError> {
		let raw: RawTokenResponse = serde_json::from_str(body).map_err(|err| {
			debug!("token response is not JSON: {err}");
			ParseError::InvalidBody
		})?;
		match raw.token_type.as_deref() {
			Some(token_type) if token_type.eq_ignore_ascii_case("bearer") => Ok(raw),
			Some(other) => Err(ParseError::UnsupportedTokenType(other.to_string())),
			None => Err(ParseError::UnsupportedTokenType(String::new())),
		}
	}

	fn id_token_claims(id_token: &str, client_id: &str) -> Result<(Map<String, Value>, i64), ParseError> {
		let mut parts = id_token.split('.');
		let (Some(_header), Some(payload), Some(_signature), None) =
			(parts.next(), parts.next(), parts.next(), parts.next())
		else {
			return Err(ParseError::MalformedIdToken);
		};
		let payload = URL_SAFE_NO_PAD
			.decode(payload)
			.map_err(|_| ParseError::MalformedIdToken)?;
		let claims: Value = serde_json::from_slice(&payload).map_err(|_| ParseError::MalformedIdToken)?;
		let Value::Object(claims) = claims else {
			return Err(ParseError::MalformedIdToken);
		};
		if !audience_matches(&claims, client_id) {
			return Err(ParseError::AudienceMismatch);
		}
		let expiry = claims
			.get("exp")
			.and_then(Value::as_i64)
			.ok_or(ParseError::MissingExpiry)?;
		Ok((claims, expiry))
	}

	fn access_token_expiry(&self, expires_in: Option<i64>) -> Option<i64> {
		expires_in.map(|seconds| self.clock.now_unix_secs() + seconds)
	}
}

impl TokenResponseParser for DefaultTokenResponseParser {
	fn parse(&self, client_id: &str, nonce: &str, body: &str) -> Result<TokenResponse, ParseError> {
		let raw = Self::decode(body)?;
		let id_token = raw.id_token.ok_or(ParseError::MissingIdToken)?;
		let (claims, id_token_expiry) = Self::id_token_claims(&id_token, client_id)?;
		if claims.get("nonce").and_then(Value::as_str) != Some(nonce) {
			return Err(ParseError::NonceMismatch);
		}
		Ok(TokenResponse {
			id_token_jwt: id_token,
			access_token: raw.access_token,
			refresh_token: raw.refresh_token,
			access_token_expiry: self.access_token_expiry(raw.expires_in),
			id_token_expiry,
		})
	}

	fn parse_refresh_token_response(
		&self,
		existing: &TokenResponse,
		client_id: &str,
		body: &str,
	) -> Result<TokenResponse, ParseError> {
		let raw = Self::decode(body)?;
		// No nonce check on refresh: the nonce binds the original
		// authorization request, not subsequent grants.
		let (id_token_jwt, id_token_expiry) = match raw.id_token {
			Some(id_token) => {
				let (_claims, expiry) = Self::id_token_claims(&id_token, client_id)?;
				(id_token, expiry)
			},
			None => (existing.id_token_jwt.clone(), existing.id_token_expiry),
		};
		Ok(TokenResponse {
			id_token_jwt,
			access_token: raw.access_token.or_else(|| existing.access_token.clone()),
			refresh_token: raw.refresh_token.or_else(|| existing.refresh_token.clone()),
			access_token_expiry: self
				.access_token_expiry(raw.expires_in)
				.or(existing.access_token_expiry),
			id_token_expiry,
		})
	}
}

fn audience_matches(claims: &Map<String, Value>, client_id: &str) -> bool {
	match claims.get("aud") {
		Some(Value::String(aud)) => aud == client_id,
		Some(Value::Array(auds)) => auds.iter().any(|aud| aud.as_str() == Some(client_id)),
		_ => false,
	}
}
