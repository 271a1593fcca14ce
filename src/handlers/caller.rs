//! Bearer-token extractor for authenticated routes.

use crate::{
    errors::AppError,
    models::identity::Role,
    services::access_guard::Caller,
    state::AppState,
};
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

/// Minimum role of every authenticated route (upload, list, delete).
pub const AUTHENTICATED_ROLE: Role = Role::ReadWriteSelf;

/// Taking a `Caller` argument makes a handler require a valid token of at
/// least [`AUTHENTICATED_ROLE`]; the request is rejected with 401 before the
/// handler body runs otherwise.
impl FromRequestParts<AppState> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        let caller = state.guard.authorize(header, AUTHENTICATED_ROLE).await?;
        Ok(caller)
    }
}
