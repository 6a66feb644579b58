//! HTTP Basic-auth middleware and standalone verifier.
//!
//! A successful check inserts the configured [`Principal`] as a request
//! extension, where [`argos_api::Caller`] picks it up.

use std::sync::Arc;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use argos_api::ApiError;
use argos_core::principal::{Capability, Principal};
use axum::{
  extract::{Request, State},
  http::{HeaderMap, header::AUTHORIZATION},
  middleware::Next,
  response::Response,
};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};

/// Credentials accepted as valid for this server instance.
#[derive(Clone)]
pub struct AuthConfig {
  pub username:      String,
  /// PHC string produced by argon2, e.g. `$argon2id$v=19$…`
  pub password_hash: String,
  /// Granted to whoever presents these credentials.
  pub capabilities:  Vec<Capability>,
}

/// Check the `Authorization` header and return the principal it proves.
pub fn verify_auth(headers: &HeaderMap, config: &AuthConfig) -> Result<Principal, ApiError> {
  let header_val = headers
    .get(AUTHORIZATION)
    .and_then(|v| v.to_str().ok())
    .ok_or(ApiError::Unauthorized)?;

  let encoded = header_val
    .strip_prefix("Basic ")
    .ok_or(ApiError::Unauthorized)?;

  let decoded = B64.decode(encoded).map_err(|_| ApiError::Unauthorized)?;
  let creds   = std::str::from_utf8(&decoded).map_err(|_| ApiError::Unauthorized)?;

  let (username, password) = creds.split_once(':').ok_or(ApiError::Unauthorized)?;

  if username != config.username {
    return Err(ApiError::Unauthorized);
  }

  let parsed_hash = PasswordHash::new(&config.password_hash)
    .map_err(|_| ApiError::Unauthorized)?;

  Argon2::default()
    .verify_password(password.as_bytes(), &parsed_hash)
    .map_err(|_| ApiError::Unauthorized)?;

  Ok(Principal::new(username, config.capabilities.iter().copied()))
}

/// Middleware for the client routes.
pub async fn require_auth(
  State(config): State<Arc<AuthConfig>>,
  mut request: Request,
  next: Next,
) -> Result<Response, ApiError> {
  let principal = verify_auth(request.headers(), &config)?;
  request.extensions_mut().insert(principal);
  Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
  use argon2::{PasswordHasher, password_hash::SaltString};
  use axum::http::{Request, header};
  use rand_core::OsRng;

  use super::*;

  fn make_config(password: &str) -> AuthConfig {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
      .hash_password(password.as_bytes(), &salt)
      .unwrap()
      .to_string();

    AuthConfig {
      username:      "registrar".to_string(),
      password_hash: hash,
      capabilities:  vec![Capability::Enroll],
    }
  }

  fn basic(user: &str, pass: &str) -> String {
    let encoded = B64.encode(format!("{user}:{pass}"));
    format!("Basic {encoded}")
  }

  fn headers(value: Option<&str>) -> HeaderMap {
    let mut req = Request::builder();
    if let Some(value) = value {
      req = req.header(header::AUTHORIZATION, value);
    }
    req.body(()).unwrap().headers().clone()
  }

  #[test]
  fn correct_credentials_yield_the_principal() {
    let config = make_config("secret");
    let principal = verify_auth(&headers(Some(&basic("registrar", "secret"))), &config).unwrap();
    assert_eq!(principal.id, "registrar");
    assert!(principal.can(Capability::Enroll));
    assert!(!principal.can(Capability::Schedule));
  }

  #[test]
  fn wrong_password() {
    let config = make_config("secret");
    let result = verify_auth(&headers(Some(&basic("registrar", "wrong"))), &config);
    assert!(matches!(result, Err(ApiError::Unauthorized)));
  }

  #[test]
  fn wrong_username() {
    let config = make_config("secret");
    let result = verify_auth(&headers(Some(&basic("mallory", "secret"))), &config);
    assert!(matches!(result, Err(ApiError::Unauthorized)));
  }

  #[test]
  fn missing_header() {
    let config = make_config("secret");
    assert!(matches!(verify_auth(&headers(None), &config), Err(ApiError::Unauthorized)));
  }

  #[test]
  fn invalid_base64() {
    let config = make_config("secret");
    let result = verify_auth(&headers(Some("Basic !!!not-base64!!!")), &config);
    assert!(matches!(result, Err(ApiError::Unauthorized)));
  }
}
