// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Per-`(user_id, session_id)` discovery state: materialized MCP tool
//! metadata, never a live connection (`SPEC_FULL.md` §3, §4.3).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::mcp::ServerDiscoveryState;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    pub discovery_complete: bool,
    pub per_server: HashMap<String, ServerDiscoveryState>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }
}
