//! User id extraction from bearer credentials.
//!
//! Credentials are JWT-shaped: `header.payload.signature`. Only the payload
//! segment is read; the signature is the server's business. No I/O happens
//! here, so the resolver can run on every reconnect to pick up a rotated
//! credential.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use crate::error::ClientError;

/// Payload fields checked for the user id, in priority order.
const ID_FIELDS: [&str; 3] = ["userId", "sub", "id"];

/// Identifier of the authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(String);

impl UserId {
    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Resolve the user id carried by `credential`.
///
/// Accepts an optional `Bearer ` prefix. The second dot-delimited segment is
/// decoded as base64url (padding optional) JSON, and the id is taken from
/// `userId`, then `sub`, then `id`. String and integer ids are accepted.
///
/// # Errors
///
/// Returns [`ClientError::InvalidCredential`] when the credential does not
/// have exactly three segments, the payload does not decode to a JSON object,
/// or none of the id fields holds a usable value.
pub fn resolve_user_id(credential: &str) -> Result<UserId, ClientError> {
    let credential = credential.trim();
    let credential = credential.strip_prefix("Bearer ").unwrap_or(credential);

    let segments: Vec<&str> = credential.split('.').collect();
    let [_, payload, _] = segments.as_slice() else {
        return Err(ClientError::InvalidCredential(format!(
            "expected 3 segments, found {}",
            segments.len()
        )));
    };

    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| ClientError::InvalidCredential(format!("payload is not base64url: {e}")))?;

    let claims: serde_json::Value = serde_json::from_slice(&decoded)
        .map_err(|e| ClientError::InvalidCredential(format!("payload is not JSON: {e}")))?;
    let Some(claims) = claims.as_object() else {
        return Err(ClientError::InvalidCredential(
            "payload is not a JSON object".to_string(),
        ));
    };

    ID_FIELDS
        .iter()
        .filter_map(|field| claims.get(*field))
        .find_map(id_from_value)
        .map(UserId)
        .ok_or_else(|| ClientError::InvalidCredential("no userId, sub or id claim".to_string()))
}

fn id_from_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}
