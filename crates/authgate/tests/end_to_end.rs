//! Drives the filter with its production collaborators (real encryptor,
//! parser, session store, and reqwest client) against a mock IdP: full login
//! round trip, admission, and transparent refresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use secrecy::SecretString;
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use authgate::client::ReqwestHttpClient;
use authgate::clock::SystemClock;
use authgate::config::{Endpoint, HeaderForwardConfig, OIDCConfig};
use authgate::crypto::{AesGcmTokenEncryptor, TokenEncryptor};
use authgate::ext_authz::{CheckRequest, Code, DeniedResponse, HttpRequest, Peer};
use authgate::oidc::{DefaultTokenResponseParser, OidcFilter, TokenResponse};
use authgate::session::{InMemorySessionStore, RandomSessionIdGenerator, SessionStore};

const STATE_COOKIE: &str = "__Host-cookie-prefix-authservice-state-cookie";
const SESSION_ID_COOKIE: &str = "__Host-cookie-prefix-authservice-session-id-cookie";

fn endpoint(scheme: &str, hostname: &str, port: u16, path: &str) -> Endpoint {
	Endpoint {
		scheme: scheme.to_string(),
		hostname: hostname.to_string(),
		port,
		path: path.to_string(),
	}
}

fn config(idp: &MockServer) -> OIDCConfig {
	let address = idp.address();
	OIDCConfig {
		authorization: endpoint("https", "acme-idp.tld", 443, "/authorization"),
		token: endpoint("http", &address.ip().to_string(), address.port(), "/token"),
		jwks_uri: endpoint("https", "acme-idp.tld", 443, "/jwks"),
		callback: endpoint("https", "me.tld", 443, "/callback"),
		client_id: "example-app".to_string(),
		client_secret: SecretString::new("ZXhhbXBsZS1hcHAtc2VjcmV0".into()),
		cryptor_secret: SecretString::new("xxx123".into()),
		scopes: vec![],
		cookie_name_prefix: "cookie-prefix".to_string(),
		id_token: HeaderForwardConfig {
			header: "authorization".to_string(),
			preamble: "Bearer".to_string(),
		},
		access_token: None,
		landing_page: "/landing-page".to_string(),
		logout: None,
		timeout: 300,
		idp_timeout_seconds: Some(5),
	}
}

struct Env {
	filter: OidcFilter,
	cryptor: Arc<AesGcmTokenEncryptor>,
	store: Arc<InMemorySessionStore>,
}

fn env(idp: &MockServer) -> Env {
	let config = config(idp);
	let cryptor = Arc::new(AesGcmTokenEncryptor::new(&config.cryptor_secret).unwrap());
	let store = Arc::new(InMemorySessionStore::new());
	let clock = Arc::new(SystemClock);
	let idp_timeout = config.idp_timeout_seconds.map(Duration::from_secs);
	let filter = OidcFilter::new(
		config,
		Arc::new(ReqwestHttpClient::new(idp_timeout).unwrap()),
		Arc::new(DefaultTokenResponseParser::new(clock.clone())),
		cryptor.clone(),
		Arc::new(RandomSessionIdGenerator),
		store.clone(),
		clock,
	)
	.unwrap();
	Env {
		filter,
		cryptor,
		store,
	}
}

fn request(path: &str, cookies: Option<&str>) -> CheckRequest {
	let mut headers = HashMap::new();
	if let Some(cookies) = cookies {
		headers.insert("cookie".to_string(), cookies.to_string());
	}
	CheckRequest {
		source: Peer::default(),
		destination: Peer::default(),
		http: Some(HttpRequest {
			scheme: "https".to_string(),
			host: "me.tld".to_string(),
			path: path.to_string(),
			headers,
		}),
	}
}

fn set_cookie_value(denied: &DeniedResponse, name: &str) -> Option<String> {
	denied.headers.get_all("set-cookie").iter().find_map(|value| {
		let cookie = cookie::Cookie::parse(value.to_str().ok()?.to_string()).ok()?;
		(cookie.name() == name).then(|| cookie.value().to_string())
	})
}

fn location(denied: &DeniedResponse) -> String {
	denied.headers.get("location").unwrap().to_str().unwrap().to_string()
}

fn now_unix() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap()
		.as_secs() as i64
}

fn id_token(nonce: &str, exp: i64) -> String {
	let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&json!({"alg": "RS256"})).unwrap());
	let payload = URL_SAFE_NO_PAD.encode(
		serde_json::to_vec(&json!({
			"sub": "user@me.tld",
			"aud": "example-app",
			"nonce": nonce,
			"exp": exp,
		}))
		.unwrap(),
	);
	format!("{header}.{payload}.fakesignature")
}

#[tokio::test]
async fn full_login_round_trip_then_admission() {
	let idp = MockServer::start().await;
	let env = env(&idp);

	// 1. Unauthenticated request: redirected to the IdP with fresh cookies.
	let decision = env.filter.process(&request("/private", None)).await;
	assert_eq!(decision.code, Code::Unauthenticated);
	let denied = decision.response.denied().unwrap();
	let sealed_state = set_cookie_value(denied, STATE_COOKIE).expect("state cookie issued");
	let session_id = set_cookie_value(denied, SESSION_ID_COOKIE).expect("session cookie issued");

	// Recover the (state, nonce) pair the filter bound into the cookie.
	let payload = env.cryptor.decrypt(&sealed_state).expect("state cookie decrypts");
	let (state, nonce) = payload.split_once(';').unwrap();
	let auth_url = location(denied);
	assert!(auth_url.starts_with("https://acme-idp.tld/authorization?"));
	assert!(auth_url.contains(&format!("state={state}")));
	assert!(auth_url.contains(&format!("nonce={nonce}")));

	// 2. The IdP answers the code exchange.
	let jwt = id_token(nonce, now_unix() + 3600);
	Mock::given(method("POST"))
		.and(path("/token"))
		.and(header("content-type", "application/x-www-form-urlencoded"))
		.and(header_exists("authorization"))
		.and(body_string_contains("grant_type=authorization_code"))
		.and(body_string_contains("code=value"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"token_type": "Bearer",
			"id_token": jwt,
			"access_token": "expected_access_token",
			"refresh_token": "expected_refresh_token",
			"expires_in": 3600,
		})))
		.expect(1)
		.mount(&idp)
		.await;

	// 3. Callback: code is exchanged, tokens land in the store.
	let cookies = format!("{STATE_COOKIE}={sealed_state}; {SESSION_ID_COOKIE}={session_id}");
	let decision = env
		.filter
		.process(&request(
			&format!("/callback?code=value&state={state}"),
			Some(&cookies),
		))
		.await;
	assert_eq!(decision.code, Code::Unauthenticated);
	let denied = decision.response.denied().unwrap();
	assert_eq!(location(denied), "/landing-page");
	assert!(
		set_cookie_value(denied, STATE_COOKIE).as_deref() == Some("deleted"),
		"state cookie must be cleared after the callback"
	);
	let stored = env.store.get(&session_id).expect("session persisted");
	assert_eq!(stored.id_token_jwt, jwt);
	assert_eq!(stored.access_token.as_deref(), Some("expected_access_token"));

	// 4. The next request is admitted with the id token attached.
	let decision = env
		.filter
		.process(&request(
			"/private",
			Some(&format!("{SESSION_ID_COOKIE}={session_id}")),
		))
		.await;
	assert_eq!(decision.code, Code::Ok);
	let headers = decision.response.ok_headers().unwrap();
	assert_eq!(
		headers.get("authorization").unwrap().to_str().unwrap(),
		format!("Bearer {jwt}")
	);
}

#[tokio::test]
async fn expired_session_is_refreshed_transparently() {
	let idp = MockServer::start().await;
	let env = env(&idp);

	let jwt = id_token("original-nonce", now_unix() + 3600);
	env.store.set(
		"session123",
		TokenResponse {
			id_token_jwt: jwt.clone(),
			access_token: Some("stale_access_token".to_string()),
			refresh_token: Some("expected_refresh_token".to_string()),
			// The access token is already past due; the id token is not.
			access_token_expiry: Some(now_unix() - 60),
			id_token_expiry: now_unix() + 3600,
		},
	);

	Mock::given(method("POST"))
		.and(path("/token"))
		.and(body_string_contains("grant_type=refresh_token"))
		.and(body_string_contains("refresh_token=expected_refresh_token"))
		.and(body_string_contains("client_secret="))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"token_type": "Bearer",
			"access_token": "fresh_access_token",
			"expires_in": 3600,
		})))
		.expect(1)
		.mount(&idp)
		.await;

	let decision = env
		.filter
		.process(&request(
			"/private",
			Some(&format!("{SESSION_ID_COOKIE}=session123")),
		))
		.await;

	assert_eq!(decision.code, Code::Ok);
	let headers = decision.response.ok_headers().unwrap();
	assert_eq!(
		headers.get("authorization").unwrap().to_str().unwrap(),
		format!("Bearer {jwt}")
	);
	let stored = env.store.get("session123").unwrap();
	assert_eq!(stored.access_token.as_deref(), Some("fresh_access_token"));
	// The IdP did not rotate the refresh token, so the old one is kept.
	assert_eq!(
		stored.refresh_token.as_deref(),
		Some("expected_refresh_token")
	);
}

#[tokio::test]
async fn rejected_refresh_forces_a_new_login() {
	let idp = MockServer::start().await;
	let env = env(&idp);

	env.store.set(
		"session123",
		TokenResponse {
			id_token_jwt: id_token("original-nonce", now_unix() - 60),
			access_token: None,
			refresh_token: Some("revoked_refresh_token".to_string()),
			access_token_expiry: None,
			id_token_expiry: now_unix() - 60,
		},
	);

	Mock::given(method("POST"))
		.and(path("/token"))
		.respond_with(ResponseTemplate::new(400).set_body_json(json!({
			"error": "invalid_grant",
		})))
		.expect(1)
		.mount(&idp)
		.await;

	let decision = env
		.filter
		.process(&request(
			"/private",
			Some(&format!("{SESSION_ID_COOKIE}=session123")),
		))
		.await;

	assert_eq!(decision.code, Code::Unauthenticated);
	let denied = decision.response.denied().unwrap();
	assert!(location(denied).starts_with("https://acme-idp.tld/authorization?"));
	assert_eq!(env.store.get("session123"), None);
}
