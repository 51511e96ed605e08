// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod jwt;
pub mod llm;
pub mod mcp_client;
pub mod oauth2_client;
pub mod repositories;
