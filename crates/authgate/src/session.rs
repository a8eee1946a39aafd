use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use tracing::debug;

use crate::oidc::TokenResponse;

/// Server-side session state keyed by the opaque id carried in the session
/// cookie. Implementations must be safe under concurrent calls; each
/// operation is individually atomic and races resolve last-write-wins.
pub trait SessionStore: Send + Sync {
	fn get(&self, session_id: &str) -> Option<TokenResponse>;
	fn set(&self, session_id: &str, token_response: TokenResponse);
	/// No-op when the id is absent.
	fn remove(&self, session_id: &str);
}

pub trait SessionIdGenerator: Send + Sync {
	fn generate(&self) -> String;
}

/// 32 random bytes as URL-safe base64; unguessable and cookie-safe.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomSessionIdGenerator;

impl SessionIdGenerator for RandomSessionIdGenerator {
	fn generate(&self) -> String {
		let mut bytes = [0u8; 32];
		rand::rng().fill_bytes(&mut bytes);
		URL_SAFE_NO_PAD.encode(bytes)
	}
}

struct StoredSession {
	token_response: TokenResponse,
	created_at: Instant,
}

/// Single-process store. Deployments with multiple replicas need a shared
/// implementation behind the same trait.
#[derive(Default)]
pub struct InMemorySessionStore {
	entries: RwLock<HashMap<String, StoredSession>>,
}

impl InMemorySessionStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.entries.read().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Drops sessions created longer than `max_age` ago, regardless of token
	/// expiry. Intended for a periodic janitor task owned by the service
	/// shell; returns the number of evicted sessions.
	pub fn remove_older_than(&self, max_age: Duration) -> usize {
		let mut entries = self.entries.write().unwrap();
		let before = entries.len();
		entries.retain(|_, session| session.created_at.elapsed() < max_age);
		let evicted = before - entries.len();
		if evicted > 0 {
			debug!(evicted, "evicted dormant sessions");
		}
		evicted
	}
}

impl SessionStore for InMemorySessionStore {
	fn get(&self, session_id: &str) -> Option<TokenResponse> {
		self
			.entries
			.read()
			.unwrap()
			.get(session_id)
			.map(|session| session.token_response.clone())
	}

	fn set(&self, session_id: &str, token_response: TokenResponse) {
		self.entries.write().unwrap().insert(
			session_id.to_string(),
			StoredSession {
				token_response,
				created_at: Instant::now(),
			},
		);
	}

	fn remove(&self, session_id: &str) {
		self.entries.write().unwrap().remove(session_id);
	}
}
