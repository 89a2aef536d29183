//! API authentication middleware.
//!
//! Reads `ASTRAFORGE_API_KEY` **once at startup** and caches the SHA-256
//! digest in `AppState`. When set, every protected request must carry the
//! key in the `X-Api-Key` header; comparison is constant-time over the
//! digest. When unset, the server logs a warning once and allows
//! unauthenticated access (dev mode).
//!
//! Issued keys are 32-byte URL-safe random tokens; only their SHA-256 hash
//! is ever stored.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Axum middleware enforcing `X-Api-Key` auth on protected routes.
/// Attach via `axum::middleware::from_fn_with_state`.
pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    // `api_key_hash` is `None` in dev mode (no key configured).
    let expected_hash = match &state.api_key_hash {
        Some(h) => h,
        None => return next.run(req).await,
    };

    let provided = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    // Hash the provided key to a fixed-length digest, then compare in
    // constant time.
    let provided_hash = Sha256::digest(provided.as_bytes());
    if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
        return (
            axum::http::StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({ "error": "invalid or missing API key" })),
        )
            .into_response();
    }

    next.run(req).await
}

/// Mint a fresh API key. Returns `(token, sha256_hash)`; the token is shown
/// once and only the hash is retained.
pub fn generate_api_key() -> (String, Vec<u8>) {
    // 32 random bytes from two v4 UUIDs, URL-safe encoded.
    let mut raw = [0u8; 32];
    raw[..16].copy_from_slice(Uuid::new_v4().as_bytes());
    raw[16..].copy_from_slice(Uuid::new_v4().as_bytes());
    let token = URL_SAFE_NO_PAD.encode(raw);
    let hash = Sha256::digest(token.as_bytes()).to_vec();
    (token, hash)
}

/// Startup-time hash of the configured API key, if any.
pub fn api_key_hash_from_env() -> Option<Vec<u8>> {
    match std::env::var("ASTRAFORGE_API_KEY") {
        Ok(key) if !key.is_empty() => {
            tracing::info!("API key auth enabled");
            Some(Sha256::digest(key.as_bytes()).to_vec())
        }
        _ => {
            tracing::warn!("API key auth DISABLED — set ASTRAFORGE_API_KEY to enable");
            None
        }
    }
}
