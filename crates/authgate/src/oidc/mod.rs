//! The per-request OIDC authentication state machine. For each check the
//! filter either admits the request with token headers attached, redirects
//! the user agent through the Authorization Code flow, transparently
//! refreshes expired tokens, or tears the session down.

use std::collections::BTreeSet;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use cookie::Cookie;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use rand::RngCore;
use secrecy::ExposeSecret;
use tracing::{debug, info, trace, warn};
use url::form_urlencoded;

use crate::client::HttpClient;
use crate::clock::Clock;
use crate::config::OIDCConfig;
use crate::crypto::TokenEncryptor;
use crate::ext_authz::{
	CheckRequest, Code, Decision, DeniedResponse, HttpRequest, OkResponse, append_header,
};
use crate::session::{SessionIdGenerator, SessionStore};

mod state_cookie;
mod token_response;

pub use state_cookie::StateCookieCodec;
pub use token_response::{
	DefaultTokenResponseParser, ParseError, TokenResponse, TokenResponseParser,
};

#[cfg(test)]
mod filter_tests;

const FILTER_NAME: &str = "oidc";
const MANDATORY_SCOPE: &str = "openid";
const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// The relying-party filter. Holds no mutable state of its own; everything
/// request-scoped lives on the stack of a single [`process`](Self::process)
/// call, so one instance serves concurrent checks.
#[derive(Clone)]
pub struct OidcFilter {
	config: OIDCConfig,
	http: Arc<dyn HttpClient>,
	parser: Arc<dyn TokenResponseParser>,
	cryptor: Arc<dyn TokenEncryptor>,
	session_id_generator: Arc<dyn SessionIdGenerator>,
	session_store: Arc<dyn SessionStore>,
	clock: Arc<dyn Clock>,
}

impl OidcFilter {
	pub fn new(
		config: OIDCConfig,
		http: Arc<dyn HttpClient>,
		parser: Arc<dyn TokenResponseParser>,
		cryptor: Arc<dyn TokenEncryptor>,
		session_id_generator: Arc<dyn SessionIdGenerator>,
		session_store: Arc<dyn SessionStore>,
		clock: Arc<dyn Clock>,
	) -> anyhow::Result<Self> {
		config.validate()?;
		Ok(Self {
			config,
			http,
			parser,
			cryptor,
			session_id_generator,
			session_store,
			clock,
		})
	}

	pub fn name(&self) -> &'static str {
		FILTER_NAME
	}

	/// Decides one check request. Never fails; every outcome is a
	/// [`Decision`] carrying the status code and the response envelope.
	pub async fn process(&self, request: &CheckRequest) -> Decision {
		debug!(
			source = %request.source.principal,
			source_address = %request.source.address,
			destination = %request.destination.principal,
			destination_address = %request.destination.address,
			"processing check request"
		);

		let Some(http_req) = &request.http else {
			info!("check request has no http attributes");
			let mut denied = DeniedResponse::default();
			Self::set_standard_response_headers(&mut denied.headers);
			return Decision::denied(Code::InvalidArgument, denied);
		};

		let session_id = self.session_id_from_cookie(http_req);

		if self.matches_logout_request(http_req) {
			if let Some(session_id) = &session_id {
				// Best effort; the redirect goes out either way.
				self.session_store.remove(session_id);
			}
			return Decision::denied(Code::Unauthenticated, self.logout_response());
		}

		// An existing id-token header passes through untouched. Whether it is
		// still valid is the downstream system's decision.
		if http_req.headers.contains_key(&self.config.id_token.header) {
			return Decision::ok(OkResponse::default());
		}

		let Some(session_id) = session_id else {
			let session_id = self.session_id_generator.generate();
			let mut denied = self.redirect_to_idp_response();
			Self::set_cookie(
				&mut denied.headers,
				&self.session_id_cookie_name(),
				&session_id,
				None,
			);
			return Decision::denied(Code::Unauthenticated, denied);
		};

		if self.matches_callback_request(http_req) {
			return self.retrieve_token(http_req, &session_id).await;
		}

		let token_response = self
			.session_store
			.get(&session_id)
			.filter(|token_response| self.required_tokens_present(token_response));
		let Some(token_response) = token_response else {
			return Decision::denied(Code::Unauthenticated, self.redirect_to_idp_response());
		};

		if !self.tokens_expired(&token_response) {
			return Decision::ok(self.tokens_to_ok_response(&token_response));
		}

		if let Some(refresh_token) = token_response.refresh_token.clone() {
			match self.refresh_token(&token_response, &refresh_token).await {
				Some(refreshed) => {
					self.session_store.set(&session_id, refreshed.clone());
					return Decision::ok(self.tokens_to_ok_response(&refreshed));
				},
				None => {
					debug!("token refresh failed, evicting session and requiring re-auth");
					self.session_store.remove(&session_id);
				},
			}
		}

		Decision::denied(Code::Unauthenticated, self.redirect_to_idp_response())
	}

	/// Exchanges the authorization code arriving on the callback for tokens
	/// and stores them under the caller's session id.
	async fn retrieve_token(&self, http_req: &HttpRequest, session_id: &str) -> Decision {
		trace!("exchanging authorization code");

		let mut denied = DeniedResponse::default();
		Self::set_standard_response_headers(&mut denied.headers);
		// Best effort at deleting the state cookie for all outcomes.
		Self::delete_cookie(&mut denied.headers, &self.state_cookie_name());

		let Some(encrypted_state) = Self::cookie_from_headers(http_req, &self.state_cookie_name())
		else {
			info!("callback request is missing the state cookie");
			return Decision::denied(Code::InvalidArgument, denied);
		};
		let Some(state_cookie) = self.cryptor.decrypt(&encrypted_state) else {
			info!("state cookie failed to decrypt");
			return Decision::denied(Code::InvalidArgument, denied);
		};
		let Some((state, nonce)) = StateCookieCodec::decode(&state_cookie) else {
			info!("state cookie has an invalid encoding");
			return Decision::denied(Code::InvalidArgument, denied);
		};

		let mut query_state = None;
		let mut code = None;
		for (key, value) in form_urlencoded::parse(http_req.query().as_bytes()) {
			match key.as_ref() {
				"state" if query_state.is_none() => query_state = Some(value.into_owned()),
				"code" if code.is_none() => code = Some(value.into_owned()),
				_ => {},
			}
		}
		let (Some(query_state), Some(code)) = (query_state, code) else {
			info!("callback query does not contain the expected state and code parameters");
			return Decision::denied(Code::InvalidArgument, denied);
		};
		if query_state != state {
			info!("callback state does not match the state cookie");
			return Decision::denied(Code::InvalidArgument, denied);
		}

		let authorization = format!(
			"Basic {}",
			STANDARD.encode(format!(
				"{}:{}",
				self.config.client_id,
				self.config.client_secret.expose_secret()
			))
		);
		let body = form_urlencoded::Serializer::new(String::new())
			.append_pair("code", &code)
			.append_pair("grant_type", "authorization_code")
			.append_pair("redirect_uri", &self.config.callback.to_url())
			.finish();

		let response = self
			.http
			.post(
				&self.config.token.to_url(),
				&[
					(CONTENT_TYPE, FORM_URLENCODED.to_string()),
					(AUTHORIZATION, authorization),
				],
				body,
			)
			.await;
		let response = match response {
			Ok(response) => response,
			Err(err) => {
				info!("error reaching the token endpoint: {err}");
				return Decision::denied(Code::Internal, denied);
			},
		};
		if response.status != StatusCode::OK {
			info!(
				status = response.status.as_u16(),
				"token endpoint rejected the code exchange"
			);
			return Decision::denied(Code::Unknown, denied);
		}

		let token_response = match self
			.parser
			.parse(&self.config.client_id, &nonce, &response.body)
		{
			Ok(token_response) => token_response,
			Err(err) => {
				info!("invalid token response: {err}");
				return Decision::denied(Code::InvalidArgument, denied);
			},
		};

		// Access-token forwarding is configured, so its absence is an error.
		if self.config.access_token.is_some() && token_response.access_token.is_none() {
			info!("token response is missing the expected access token");
			return Decision::denied(Code::InvalidArgument, denied);
		}

		self.session_store.set(session_id, token_response);

		Self::set_redirect_headers(&self.config.landing_page, &mut denied);
		Decision::denied(Code::Unauthenticated, denied)
	}

	/// <https://openid.net/specs/openid-connect-core-1_0.html#RefreshTokens>
	async fn refresh_token(
		&self,
		existing: &TokenResponse,
		refresh_token: &str,
	) -> Option<TokenResponse> {
		// Client credentials ride in the body here (RFC 6749 §2.3.1
		// alternative form), unlike the Basic-auth code exchange.
		let body = form_urlencoded::Serializer::new(String::new())
			.append_pair("client_id", &self.config.client_id)
			.append_pair("client_secret", self.config.client_secret.expose_secret())
			.append_pair("grant_type", "refresh_token")
			.append_pair("refresh_token", refresh_token)
			.append_pair("scope", &self.space_delimited_scopes())
			.finish();

		let response = self
			.http
			.post(
				&self.config.token.to_url(),
				&[(CONTENT_TYPE, FORM_URLENCODED.to_string())],
				body,
			)
			.await;
		let response = match response {
			Ok(response) => response,
			Err(err) => {
				info!("error refreshing tokens: {err}");
				return None;
			},
		};
		if response.status != StatusCode::OK {
			info!(
				status = response.status.as_u16(),
				"token endpoint rejected the refresh"
			);
			return None;
		}

		match self
			.parser
			.parse_refresh_token_response(existing, &self.config.client_id, &response.body)
		{
			Ok(refreshed) => Some(refreshed),
			Err(err) => {
				info!("invalid refresh response: {err}");
				None
			},
		}
	}

	fn redirect_to_idp_response(&self) -> DeniedResponse {
		let mut denied = DeniedResponse::default();
		Self::set_standard_response_headers(&mut denied.headers);

		let state = random_token();
		let nonce = random_token();

		let query = form_urlencoded::Serializer::new(String::new())
			.append_pair("client_id", &self.config.client_id)
			.append_pair("nonce", &nonce)
			.append_pair("redirect_uri", &self.config.callback.to_url())
			.append_pair("response_type", "code")
			.append_pair("scope", &self.space_delimited_scopes())
			.append_pair("state", &state)
			.finish();
		let location = format!("{}?{}", self.config.authorization.to_url(), query);
		Self::set_redirect_headers(&location, &mut denied);

		// The state cookie binds the authorization request to this browser.
		match self
			.cryptor
			.encrypt(&StateCookieCodec::encode(&state, &nonce))
		{
			Ok(sealed) => Self::set_cookie(
				&mut denied.headers,
				&self.state_cookie_name(),
				&sealed,
				Some(self.config.timeout),
			),
			Err(err) => warn!("failed to seal state cookie: {err}"),
		}
		denied
	}

	fn logout_response(&self) -> DeniedResponse {
		let mut denied = DeniedResponse::default();
		if let Some(logout) = &self.config.logout {
			Self::set_redirect_headers(&logout.redirect_to_uri, &mut denied);
		}
		Self::set_standard_response_headers(&mut denied.headers);
		Self::delete_cookie(&mut denied.headers, &self.state_cookie_name());
		Self::delete_cookie(&mut denied.headers, &self.session_id_cookie_name());
		denied
	}

	fn matches_logout_request(&self, http_req: &HttpRequest) -> bool {
		match &self.config.logout {
			Some(logout) => http_req.path_only() == logout.path,
			None => false,
		}
	}

	fn matches_callback_request(&self, http_req: &HttpRequest) -> bool {
		trace!(
			scheme = %http_req.scheme,
			host = %http_req.host,
			path = %http_req.path,
			"checking for callback match"
		);
		let callback = &self.config.callback;
		let path_matches = http_req.path_only() == callback.path;
		// TODO the default-port shortcut should also require the request's own
		// scheme to match the configured one; kept lenient to match deployed
		// behavior.
		let host_matches = http_req.host == callback.host_with_port()
			|| (callback.scheme == "https" && callback.port == 443 && http_req.host == callback.hostname)
			|| (callback.scheme == "http" && callback.port == 80 && http_req.host == callback.hostname);
		host_matches && path_matches
	}

	fn required_tokens_present(&self, token_response: &TokenResponse) -> bool {
		self.config.access_token.is_none() || token_response.access_token.is_some()
	}

	fn tokens_expired(&self, token_response: &TokenResponse) -> bool {
		let now = self.clock.now_unix_secs();
		if token_response.id_token_expiry < now {
			return true;
		}
		// expires_in is optional (RFC 6749 §5.1); only enforce when known.
		matches!(token_response.access_token_expiry, Some(expiry) if expiry < now)
	}

	fn tokens_to_ok_response(&self, token_response: &TokenResponse) -> OkResponse {
		let mut ok = OkResponse::default();
		append_header(
			&mut ok.headers,
			&self.config.id_token.header,
			&Self::encode_header_value(&self.config.id_token.preamble, &token_response.id_token_jwt),
		);
		if let Some(access_token_config) = &self.config.access_token
			&& let Some(access_token) = &token_response.access_token
		{
			append_header(
				&mut ok.headers,
				&access_token_config.header,
				&Self::encode_header_value(&access_token_config.preamble, access_token),
			);
		}
		ok
	}

	fn space_delimited_scopes(&self) -> String {
		let mut scopes = BTreeSet::new();
		scopes.insert(MANDATORY_SCOPE);
		for scope in &self.config.scopes {
			scopes.insert(scope.as_str());
		}
		scopes.into_iter().collect::<Vec<_>>().join(" ")
	}

	fn session_id_from_cookie(&self, http_req: &HttpRequest) -> Option<String> {
		let name = self.session_id_cookie_name();
		let cookie = Self::cookie_from_headers(http_req, &name);
		if cookie.is_none() {
			debug!(cookie = %name, "session id cookie missing");
		}
		cookie
	}

	fn cookie_from_headers(http_req: &HttpRequest, name: &str) -> Option<String> {
		let header = http_req.headers.get("cookie")?;
		for cookie in Cookie::split_parse(header.as_str()) {
			let Ok(cookie) = cookie else {
				continue;
			};
			if cookie.name() == name {
				return Some(cookie.value().to_string());
			}
		}
		None
	}

	fn cookie_name(&self, name: &str) -> String {
		if self.config.cookie_name_prefix.is_empty() {
			format!("__Host-authservice-{name}-cookie")
		} else {
			format!(
				"__Host-{}-authservice-{name}-cookie",
				self.config.cookie_name_prefix
			)
		}
	}

	fn state_cookie_name(&self) -> String {
		self.cookie_name("state")
	}

	fn session_id_cookie_name(&self) -> String {
		self.cookie_name("session-id")
	}

	fn set_standard_response_headers(headers: &mut HeaderMap) {
		append_header(headers, "cache-control", "no-cache");
		append_header(headers, "pragma", "no-cache");
	}

	fn set_redirect_headers(location: &str, denied: &mut DeniedResponse) {
		denied.status = Some(StatusCode::FOUND);
		append_header(&mut denied.headers, "location", location);
	}

	/// Renders a Set-Cookie value with directives in lexicographic order so
	/// the emitted bytes are stable across runs.
	fn encode_set_cookie(name: &str, value: &str, max_age: Option<i64>) -> String {
		let mut directives = vec![
			"HttpOnly".to_string(),
			"Path=/".to_string(),
			"SameSite=Lax".to_string(),
			"Secure".to_string(),
		];
		if let Some(max_age) = max_age {
			directives.push(format!("Max-Age={max_age}"));
		}
		directives.sort();
		format!("{name}={value}; {}", directives.join("; "))
	}

	fn set_cookie(headers: &mut HeaderMap, name: &str, value: &str, max_age: Option<i64>) {
		append_header(
			headers,
			"set-cookie",
			&Self::encode_set_cookie(name, value, max_age),
		);
	}

	fn delete_cookie(headers: &mut HeaderMap, name: &str) {
		Self::set_cookie(headers, name, "deleted", Some(0));
	}

	fn encode_header_value(preamble: &str, value: &str) -> String {
		if preamble.is_empty() {
			value.to_string()
		} else {
			format!("{preamble} {value}")
		}
	}
}

fn random_token() -> String {
	let mut bytes = [0u8; 32];
	rand::rng().fill_bytes(&mut bytes);
	URL_SAFE_NO_PAD.encode(bytes)
}
