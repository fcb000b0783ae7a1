// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use crate::gateway::InferenceGateway;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<InferenceGateway>,
}

impl AppState {
    pub fn new(gateway: Arc<InferenceGateway>) -> Self {
        Self { gateway }
    }
}
