use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use std::sync::Arc;

use crate::models::BookerId;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Booker,
    /// Class provider; may close out sessions.
    Provider,
}

/// Caller identity. Authentication happens upstream; the gateway in front of
/// this service forwards the verified user id and role as headers.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: BookerId,
    pub role: Role,
}

impl AuthUser {
    pub fn is_provider(&self) -> bool {
        self.role == Role::Provider
    }
}

impl FromRequestParts<Arc<crate::AppState>> for AuthUser {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &Arc<crate::AppState>,
    ) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<BookerId>().ok())
            .ok_or(StatusCode::UNAUTHORIZED)?;

        let role = match parts.headers.get(USER_ROLE_HEADER).map(|v| v.to_str()) {
            None => Role::Booker,
            Some(Ok(raw)) if raw.eq_ignore_ascii_case("booker") => Role::Booker,
            Some(Ok(raw)) if raw.eq_ignore_ascii_case("provider") => Role::Provider,
            Some(_) => return Err(StatusCode::FORBIDDEN),
        };

        Ok(AuthUser { user_id, role })
    }
}
