//! OpenID Connect relying-party filter for external-authorization proxies.
//!
//! The filter consumes a [`CheckRequest`](ext_authz::CheckRequest) describing
//! an inbound HTTP request and emits a [`Decision`](ext_authz::Decision):
//! admit with validated identity headers, redirect through the Authorization
//! Code flow, refresh tokens transparently, or terminate the session. The
//! gRPC transport shell, JWKS retrieval, and signature verification live
//! outside this crate; everything the filter needs from them is injected
//! behind the capability traits in [`client`], [`crypto`], [`session`],
//! [`clock`], and [`oidc`].

pub mod client;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod ext_authz;
pub mod oidc;
pub mod session;

pub use config::OIDCConfig;
pub use ext_authz::{CheckRequest, CheckResponse, Code, Decision};
pub use oidc::{OidcFilter, TokenResponse};
