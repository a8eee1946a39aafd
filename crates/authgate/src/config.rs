use http::header::HeaderName;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

/// A structured endpoint; `to_url` renders `scheme://hostname[:port]/path`,
/// omitting the port when it is the scheme default.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Endpoint {
	pub scheme: String,
	pub hostname: String,
	pub port: u16,
	pub path: String,
}

impl Endpoint {
	pub fn to_url(&self) -> String {
		if self.is_default_port() {
			format!("{}://{}{}", self.scheme, self.hostname, self.path)
		} else {
			format!("{}://{}:{}{}", self.scheme, self.hostname, self.port, self.path)
		}
	}

	pub fn is_default_port(&self) -> bool {
		(self.scheme == "https" && self.port == 443) || (self.scheme == "http" && self.port == 80)
	}

	pub fn host_with_port(&self) -> String {
		format!("{}:{}", self.hostname, self.port)
	}

	fn validate(&self, field: &str) -> anyhow::Result<()> {
		if self.scheme != "http" && self.scheme != "https" {
			anyhow::bail!("{field}: scheme must be http or https, got `{}`", self.scheme);
		}
		if self.hostname.is_empty() {
			anyhow::bail!("{field}: hostname must not be empty");
		}
		if self.port == 0 {
			anyhow::bail!("{field}: port must be > 0");
		}
		if !self.path.starts_with('/') {
			anyhow::bail!("{field}: path must start with `/`");
		}
		Ok(())
	}
}

/// Names the upstream header a token is injected into and the preamble
/// (e.g. `Bearer`) prepended to the value.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HeaderForwardConfig {
	pub header: String,
	#[serde(default)]
	pub preamble: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LogoutConfig {
	pub path: String,
	pub redirect_to_uri: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OIDCConfig {
	pub authorization: Endpoint,
	pub token: Endpoint,
	pub jwks_uri: Endpoint,
	pub callback: Endpoint,
	pub client_id: String,
	pub client_secret: SecretString,
	/// Input keying material for the state-cookie encryptor.
	pub cryptor_secret: SecretString,
	/// Additional scopes; `openid` is always requested.
	#[serde(default)]
	pub scopes: Vec<String>,
	#[serde(default)]
	pub cookie_name_prefix: String,
	pub id_token: HeaderForwardConfig,
	/// When set, the access token is forwarded upstream and its presence in
	/// the IdP response becomes mandatory.
	#[serde(default)]
	pub access_token: Option<HeaderForwardConfig>,
	pub landing_page: String,
	#[serde(default)]
	pub logout: Option<LogoutConfig>,
	/// State-cookie Max-Age, seconds.
	pub timeout: i64,
	/// Outbound timeout for IdP token-endpoint requests, seconds.
	#[serde(default)]
	pub idp_timeout_seconds: Option<u64>,
}

impl OIDCConfig {
	pub fn validate(&self) -> anyhow::Result<()> {
		self.authorization.validate("authorization")?;
		self.token.validate("token")?;
		self.jwks_uri.validate("jwks_uri")?;
		self.callback.validate("callback")?;
		if self.client_id.is_empty() {
			anyhow::bail!("client_id must not be empty");
		}
		if self.client_secret.expose_secret().is_empty() {
			anyhow::bail!("client_secret must not be empty");
		}
		if self.cryptor_secret.expose_secret().is_empty() {
			anyhow::bail!("cryptor_secret must not be empty");
		}
		if self.landing_page.is_empty() {
			anyhow::bail!("landing_page must not be empty");
		}
		if self.timeout <= 0 {
			anyhow::bail!("timeout must be > 0 seconds");
		}
		Self::validate_header(&self.id_token, "id_token")?;
		if let Some(access_token) = &self.access_token {
			Self::validate_header(access_token, "access_token")?;
		}
		if let Some(logout) = &self.logout {
			if logout.path.is_empty() {
				anyhow::bail!("logout.path must not be empty");
			}
			if logout.redirect_to_uri.is_empty() {
				anyhow::bail!("logout.redirect_to_uri must not be empty");
			}
		}
		Ok(())
	}

	fn validate_header(forward: &HeaderForwardConfig, field: &str) -> anyhow::Result<()> {
		if forward.header.is_empty() {
			anyhow::bail!("{field}.header must not be empty");
		}
		HeaderName::from_bytes(forward.header.as_bytes())
			.map_err(|_| anyhow::anyhow!("{field}.header `{}` is not a valid header name", forward.header))?;
		Ok(())
	}
}
