// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # aegis-core
//!
//! The orchestration crate behind one deployed agent: stateful request
//! handling, the agent tool-call loop with human-in-the-loop governance,
//! per-user MCP discovery, and OAuth2 brokering for downstream tool access.
//!
//! ## Subsystems
//!
//! | Subsystem | Key modules |
//! |---|---|
//! | Stateful request handling | [`domain::task`], [`application::request_handler`] |
//! | Agent tool-call loop | [`application::agent_loop`], [`application::hitl_gate`] |
//! | MCP discovery & invocation | [`application::mcp_registry`], [`application::kernel`], [`infrastructure::mcp_client`] |
//! | Auth brokering | [`application::authorizer`], [`application::oauth_broker`], [`infrastructure::jwt`] |
//!
//! ## Layer Structure
//!
//! ```text
//! presentation/   ← HTTP + SSE API (axum)
//!     ↓
//! application/    ← Use-cases, service traits, orchestration
//!     ↓
//! domain/         ← Aggregates, value objects, domain events, repository traits
//!     ↓
//! infrastructure/ ← In-memory/Redis repos, LLM provider adapters, MCP/OAuth2/JWT clients
//! ```

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
