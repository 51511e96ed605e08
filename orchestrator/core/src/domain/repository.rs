// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Repository Pattern - Storage Backend Abstraction
//
// Defines pluggable storage backends for the three aggregates this crate
// persists: AgentTask, OAuth2 token storage, and per-session MCP discovery
// state. In-memory backends are always available; Redis is opt-in behind
// the `redis-backend` feature.

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::auth::OAuth2AuthData;
use crate::domain::identity::{RequestId, SessionId, TaskId, UserId};
use crate::domain::session_state::SessionState;
use crate::domain::task::AgentTask;

#[derive(Debug, Clone, Default)]
pub enum StorageBackend {
    #[default]
    InMemory,
    Redis(RedisConfig),
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub connection_string: String,
}

/// Repository interface for the `AgentTask` aggregate (Stateful Request
/// Handler context). Tasks are scoped by owner: `find_by_id` alone never
/// authorizes access — callers must additionally check `AgentTask::assert_owner`.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn save(&self, task: &AgentTask) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: TaskId) -> Result<Option<AgentTask>, RepositoryError>;

    async fn find_by_session(&self, session_id: SessionId) -> Result<Vec<AgentTask>, RepositoryError>;

    /// Look up a task by its outstanding `pending_request_id` — the index a
    /// `resume` call walks in from (`SPEC_FULL.md` §4.1: "look up task via
    /// the index `request_id → task_id`").
    async fn find_by_pending_request_id(&self, request_id: RequestId) -> Result<Option<AgentTask>, RepositoryError>;

    async fn delete(&self, id: TaskId) -> Result<(), RepositoryError>;
}

/// Repository interface for OAuth2 token storage, keyed by user and the
/// composite `(auth_server, scopes)` key (`SPEC_FULL.md` §4.7.2).
#[async_trait]
pub trait AuthStorageRepository: Send + Sync {
    async fn save_token(
        &self,
        user_id: &UserId,
        composite_key: &str,
        data: &OAuth2AuthData,
    ) -> Result<(), RepositoryError>;

    async fn find_token(
        &self,
        user_id: &UserId,
        composite_key: &str,
    ) -> Result<Option<OAuth2AuthData>, RepositoryError>;

    async fn delete_token(&self, user_id: &UserId, composite_key: &str) -> Result<(), RepositoryError>;
}

/// Repository interface for per-`(user_id, session_id)` MCP discovery state
/// (`SPEC_FULL.md` §4.3).
#[async_trait]
pub trait SessionStateRepository: Send + Sync {
    async fn save(
        &self,
        user_id: &UserId,
        session_id: SessionId,
        state: &SessionState,
    ) -> Result<(), RepositoryError>;

    async fn find(
        &self,
        user_id: &UserId,
        session_id: SessionId,
    ) -> Result<Option<SessionState>, RepositoryError>;

    /// Clear a materialized discovery result, forcing the next request to
    /// re-run discovery — used after an OAuth callback completes so the
    /// newly authorized server's tools are picked up (`SPEC_FULL.md` §6,
    /// verify endpoint side effect).
    async fn delete(&self, user_id: &UserId, session_id: SessionId) -> Result<(), RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for RepositoryError {
    fn from(err: redis::RedisError) -> Self {
        RepositoryError::Backend(err.to_string())
    }
}

use crate::infrastructure::repositories::{
    InMemoryAuthStorageRepository, InMemorySessionStateRepository, InMemoryTaskRepository,
};

/// Factory for creating a [`TaskRepository`] from the configured storage
/// backend. The Redis-backed implementation lives behind the
/// `redis-backend` feature and is constructed by the composition root,
/// which holds the `redis::aio::ConnectionManager`.
pub fn create_task_repository(backend: &StorageBackend) -> Arc<dyn TaskRepository> {
    match backend {
        StorageBackend::InMemory => Arc::new(InMemoryTaskRepository::new()),
        StorageBackend::Redis(_) => {
            #[cfg(feature = "redis-backend")]
            {
                panic!("redis-backed TaskRepository is constructed at the composition root, not via this factory")
            }
            #[cfg(not(feature = "redis-backend"))]
            {
                panic!("redis-backend feature not enabled")
            }
        }
    }
}

pub fn create_auth_storage_repository(backend: &StorageBackend) -> Arc<dyn AuthStorageRepository> {
    match backend {
        StorageBackend::InMemory => Arc::new(InMemoryAuthStorageRepository::new()),
        StorageBackend::Redis(_) => {
            #[cfg(feature = "redis-backend")]
            {
                panic!("redis-backed AuthStorageRepository is constructed at the composition root")
            }
            #[cfg(not(feature = "redis-backend"))]
            {
                panic!("redis-backend feature not enabled")
            }
        }
    }
}

pub fn create_session_state_repository(backend: &StorageBackend) -> Arc<dyn SessionStateRepository> {
    match backend {
        StorageBackend::InMemory => Arc::new(InMemorySessionStateRepository::new()),
        StorageBackend::Redis(_) => {
            #[cfg(feature = "redis-backend")]
            {
                panic!("redis-backed SessionStateRepository is constructed at the composition root")
            }
            #[cfg(not(feature = "redis-backend"))]
            {
                panic!("redis-backend feature not enabled")
            }
        }
    }
}
