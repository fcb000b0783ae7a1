// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Caller Identity
//!
//! The router runs behind an authenticating gateway which verifies the end
//! user and forwards the identity in trusted headers:
//!
//! - `x-user-id` → canonical `user_id` (required)
//! - `x-session-id` → client session, used as the default assignment session
//!
//! Requests without a usable `x-user-id` are rejected with 401.

pub mod claims;
pub mod error;
pub mod extractor;

pub use claims::AuthenticatedUser;
pub use error::AuthError;
pub use extractor::Auth;
