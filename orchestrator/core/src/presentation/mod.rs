// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`aegis-core`)
//!
//! HTTP surface that translates external requests into application service
//! calls. **No business logic lives here** — all real work is delegated to
//! the application services in `crate::application`.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`api`] | HTTP/SSE (Axum) | Request handler, resume, and auth-verify endpoints |

pub mod api;
