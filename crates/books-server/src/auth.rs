//! Caller Identity
//!
//! The OAuth layer in front of this server asserts the signed-in user as
//! `x-auth-*` headers. The first request from a subject creates its billing
//! record.

use axum::{
    Json,
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
};

use books_billing::UserId;

use crate::handlers::ErrorResponse;
use crate::state::AppState;

pub const SUBJECT_HEADER: &str = "x-auth-subject";
pub const EMAIL_HEADER: &str = "x-auth-email";
pub const NAME_HEADER: &str = "x-auth-name";

/// Authenticated caller
#[derive(Clone, Debug)]
pub struct AuthUser {
    pub user_id: UserId,
    pub subject: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let subject = header(parts, SUBJECT_HEADER).ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Sign in required".into(),
                    code: "UNAUTHENTICATED".into(),
                }),
            )
        })?;

        let record = state
            .store
            .upsert_user(
                subject,
                header(parts, EMAIL_HEADER),
                header(parts, NAME_HEADER),
            )
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "User upsert failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: e.user_message().into(),
                        code: "STORAGE_ERROR".into(),
                    }),
                )
            })?;

        Ok(Self {
            user_id: record.user_id,
            subject: record.subject,
        })
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
