// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Axum extractor for the calling user.
//!
//! ```rust,ignore
//! async fn my_handler(Auth(user): Auth) -> impl IntoResponse {
//!     // user is AuthenticatedUser
//! }
//! ```

use axum::{extract::FromRequestParts, http::request::Parts};

use super::{AuthError, AuthenticatedUser};

/// Extractor for authenticated users.
pub struct Auth(pub AuthenticatedUser);

impl<S> FromRequestParts<S> for Auth
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // A layer may already have resolved the caller
        if let Some(user) = parts.extensions.get::<AuthenticatedUser>().cloned() {
            return Ok(Auth(user));
        }

        let user = AuthenticatedUser::from_headers(&parts.headers)?;
        parts.extensions.insert(user.clone());
        Ok(Auth(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<Auth, AuthError> {
        let (mut parts, _) = request.into_parts();
        Auth::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn extracts_user_from_header() {
        let request = Request::builder()
            .header("x-user-id", "user_123")
            .body(())
            .unwrap();
        let Auth(user) = extract(request).await.unwrap();
        assert_eq!(user.user_id, "user_123");
    }

    #[tokio::test]
    async fn rejects_missing_header() {
        let request = Request::builder().body(()).unwrap();
        assert!(matches!(
            extract(request).await,
            Err(AuthError::MissingIdentity)
        ));
    }

    #[tokio::test]
    async fn prefers_resolved_extension() {
        let mut request = Request::builder()
            .header("x-user-id", "from-header")
            .body(())
            .unwrap();
        request.extensions_mut().insert(AuthenticatedUser {
            user_id: "from-layer".into(),
            session_id: None,
        });
        let Auth(user) = extract(request).await.unwrap();
        assert_eq!(user.user_id, "from-layer");
    }
}
