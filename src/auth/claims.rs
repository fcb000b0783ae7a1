// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Authenticated caller representation.

use axum::http::HeaderMap;

use super::AuthError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// Longest accepted user id.
const MAX_USER_ID_LEN: usize = 256;

/// Identity of the caller as forwarded by the upstream gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub session_id: Option<String>,
}

impl AuthenticatedUser {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, AuthError> {
        let user_id = headers
            .get(USER_ID_HEADER)
            .ok_or(AuthError::MissingIdentity)?
            .to_str()
            .map_err(|_| AuthError::InvalidIdentity)?
            .trim();

        if user_id.is_empty()
            || user_id.len() > MAX_USER_ID_LEN
            || user_id.chars().any(char::is_control)
        {
            return Err(AuthError::InvalidIdentity);
        }

        let session_id = headers
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Ok(Self {
            user_id: user_id.to_string(),
            session_id,
        })
    }
}
