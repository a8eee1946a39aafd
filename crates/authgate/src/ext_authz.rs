//! The external-authorization envelope: the request attributes the proxy
//! forwards for each inbound HTTP request, and the allow/deny decision the
//! filter hands back. The gRPC transport shell lives outside this crate.

use std::collections::HashMap;

use http::{HeaderMap, HeaderValue, StatusCode, header::HeaderName};
use tracing::warn;

/// Status codes the shell maps onto the gRPC-level result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Code {
	Ok,
	Unauthenticated,
	InvalidArgument,
	Internal,
	Unknown,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Peer {
	pub principal: String,
	pub address: String,
}

/// The HTTP attributes of the request under check. `headers` keys arrive
/// lowercased from the proxy; `path` still carries the query string.
#[derive(Clone, Debug, Default)]
pub struct HttpRequest {
	pub scheme: String,
	pub host: String,
	pub path: String,
	pub headers: HashMap<String, String>,
}

impl HttpRequest {
	/// The path component with the query stripped.
	pub fn path_only(&self) -> &str {
		split_path(&self.path).0
	}

	/// The raw query string (empty when there is none).
	pub fn query(&self) -> &str {
		split_path(&self.path).1
	}
}

/// Splits a request path on the first `?`; everything before is the path,
/// everything after is the query string.
pub fn split_path(path: &str) -> (&str, &str) {
	match path.split_once('?') {
		Some((path, query)) => (path, query),
		None => (path, ""),
	}
}

#[derive(Clone, Debug, Default)]
pub struct CheckRequest {
	pub source: Peer,
	pub destination: Peer,
	pub http: Option<HttpRequest>,
}

/// Header mutations applied to the request before it continues upstream.
#[derive(Clone, Debug, Default)]
pub struct OkResponse {
	pub headers: HeaderMap,
}

/// A terminal response returned to the user agent. `status` is None when the
/// shell should pick the HTTP status from the gRPC code.
#[derive(Clone, Debug, Default)]
pub struct DeniedResponse {
	pub status: Option<StatusCode>,
	pub headers: HeaderMap,
}

#[derive(Clone, Debug)]
pub enum CheckResponse {
	Ok(OkResponse),
	Denied(DeniedResponse),
}

impl CheckResponse {
	pub fn ok_headers(&self) -> Option<&HeaderMap> {
		match self {
			CheckResponse::Ok(ok) => Some(&ok.headers),
			CheckResponse::Denied(_) => None,
		}
	}

	pub fn denied(&self) -> Option<&DeniedResponse> {
		match self {
			CheckResponse::Ok(_) => None,
			CheckResponse::Denied(denied) => Some(denied),
		}
	}
}

/// What the filter decided for one check: the gRPC-level code plus the
/// response envelope to relay.
#[derive(Clone, Debug)]
pub struct Decision {
	pub code: Code,
	pub response: CheckResponse,
}

impl Decision {
	pub fn ok(ok: OkResponse) -> Self {
		Self {
			code: Code::Ok,
			response: CheckResponse::Ok(ok),
		}
	}

	pub fn denied(code: Code, denied: DeniedResponse) -> Self {
		Self {
			code,
			response: CheckResponse::Denied(denied),
		}
	}
}

/// Appends a header, dropping (with a warning) names or values that cannot be
/// represented on the wire. Configured names are validated up front, so this
/// only fires for values derived from runtime data.
pub fn append_header(headers: &mut HeaderMap, name: &str, value: &str) {
	let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
		warn!(header = name, "dropping response header with invalid name");
		return;
	};
	let Ok(value) = HeaderValue::from_str(value) else {
		warn!(header = %name, "dropping response header with invalid value");
		return;
	};
	headers.append(name, value);
}
