//! Bearer-token checks for trigger and admin endpoints.

use axum::http::{HeaderMap, header::AUTHORIZATION};
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

use crate::error::FleetError;

/// Require `Authorization: Bearer <expected>`. Fails closed when no token is
/// configured.
pub fn require_bearer(
    headers: &HeaderMap,
    expected: Option<&SecretString>,
    scope: &str,
) -> Result<(), FleetError> {
    let Some(expected) = expected else {
        return Err(FleetError::Auth(format!("{scope} token not configured")));
    };

    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or_else(|| FleetError::Auth("missing bearer token".into()))?;

    let expected = expected.expose_secret().as_bytes();
    let matches: bool = presented.len() == expected.len()
        && presented.as_bytes().ct_eq(expected).into();
    if !matches {
        return Err(FleetError::Auth(format!("invalid {scope} token")));
    }
    Ok(())
}
