use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use http::header::HeaderName;
use tracing::debug;

const DEFAULT_IDP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct HttpResponse {
	pub status: StatusCode,
	pub body: String,
}

/// Transport-level failure: connect error, TLS failure, timeout, or a body
/// that could not be read. A non-2xx status is NOT an error; callers decide
/// what a status means.
#[derive(Debug, thiserror::Error)]
#[error("request to {url} failed: {message}")]
pub struct HttpClientError {
	pub url: String,
	pub message: String,
}

/// Minimal outbound surface toward the IdP token endpoint. Cancellation is
/// cooperative: dropping the returned future aborts the in-flight request.
#[async_trait]
pub trait HttpClient: Send + Sync {
	async fn post(
		&self,
		url: &str,
		headers: &[(HeaderName, String)],
		body: String,
	) -> Result<HttpResponse, HttpClientError>;
}

pub struct ReqwestHttpClient {
	client: reqwest::Client,
}

impl ReqwestHttpClient {
	pub fn new(timeout: Option<Duration>) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(timeout.unwrap_or(DEFAULT_IDP_TIMEOUT))
			.redirect(reqwest::redirect::Policy::none())
			.build()?;
		Ok(Self { client })
	}
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
	async fn post(
		&self,
		url: &str,
		headers: &[(HeaderName, String)],
		body: String,
	) -> Result<HttpResponse, HttpClientError> {
		let mut request = self.client.post(url).body(body);
		for (name, value) in headers {
			request = request.header(name, value.as_str());
		}
		let response = request.send().await.map_err(|err| HttpClientError {
			url: url.to_string(),
			message: err.to_string(),
		})?;
		let status = response.status();
		let body = response.text().await.map_err(|err| HttpClientError {
			url: url.to_string(),
			message: format!("reading body: {err}"),
		})?;
		debug!(url, status = status.as_u16(), "token endpoint responded");
		Ok(HttpResponse { status, body })
	}
}
