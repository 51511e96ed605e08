// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory repository implementations, backed by `dashmap` rather than a
//! `Mutex<HashMap<..>>` so concurrent tasks across different owners never
//! contend on a single lock. These are the default `StorageBackend::InMemory`
//! implementations; Redis-backed equivalents are built by the composition
//! root behind the `redis-backend` feature.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::auth::OAuth2AuthData;
use crate::domain::identity::{RequestId, SessionId, TaskId, UserId};
use crate::domain::repository::{
    AuthStorageRepository, RepositoryError, SessionStateRepository, TaskRepository,
};
use crate::domain::session_state::SessionState;
use crate::domain::task::AgentTask;

#[derive(Default)]
pub struct InMemoryTaskRepository {
    tasks: DashMap<TaskId, AgentTask>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn save(&self, task: &AgentTask) -> Result<(), RepositoryError> {
        self.tasks.insert(task.task_id, task.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<AgentTask>, RepositoryError> {
        Ok(self.tasks.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_by_session(&self, session_id: SessionId) -> Result<Vec<AgentTask>, RepositoryError> {
        Ok(self
            .tasks
            .iter()
            .filter(|entry| entry.value().session_id == session_id)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn find_by_pending_request_id(&self, request_id: RequestId) -> Result<Option<AgentTask>, RepositoryError> {
        Ok(self
            .tasks
            .iter()
            .find(|entry| entry.value().pending_request_id == Some(request_id))
            .map(|entry| entry.value().clone()))
    }

    async fn delete(&self, id: TaskId) -> Result<(), RepositoryError> {
        self.tasks.remove(&id);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryAuthStorageRepository {
    tokens: DashMap<(UserId, String), OAuth2AuthData>,
}

impl InMemoryAuthStorageRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthStorageRepository for InMemoryAuthStorageRepository {
    async fn save_token(
        &self,
        user_id: &UserId,
        composite_key: &str,
        data: &OAuth2AuthData,
    ) -> Result<(), RepositoryError> {
        self.tokens
            .insert((user_id.clone(), composite_key.to_string()), data.clone());
        Ok(())
    }

    async fn find_token(
        &self,
        user_id: &UserId,
        composite_key: &str,
    ) -> Result<Option<OAuth2AuthData>, RepositoryError> {
        let key = (user_id.clone(), composite_key.to_string());
        Ok(self.tokens.get(&key).map(|entry| entry.value().clone()))
    }

    async fn delete_token(&self, user_id: &UserId, composite_key: &str) -> Result<(), RepositoryError> {
        self.tokens.remove(&(user_id.clone(), composite_key.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemorySessionStateRepository {
    states: DashMap<(UserId, SessionId), SessionState>,
}

impl InMemorySessionStateRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStateRepository for InMemorySessionStateRepository {
    async fn save(
        &self,
        user_id: &UserId,
        session_id: SessionId,
        state: &SessionState,
    ) -> Result<(), RepositoryError> {
        self.states.insert((user_id.clone(), session_id), state.clone());
        Ok(())
    }

    async fn find(
        &self,
        user_id: &UserId,
        session_id: SessionId,
    ) -> Result<Option<SessionState>, RepositoryError> {
        let key = (user_id.clone(), session_id);
        Ok(self.states.get(&key).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, user_id: &UserId, session_id: SessionId) -> Result<(), RepositoryError> {
        self.states.remove(&(user_id.clone(), session_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::identity::UserId;

    #[tokio::test]
    async fn task_repository_round_trips() {
        let repo = InMemoryTaskRepository::new();
        let task = AgentTask::new(SessionId::new(), UserId::from("user-1".to_string()));
        repo.save(&task).await.unwrap();
        let found = repo.find_by_id(task.task_id).await.unwrap().unwrap();
        assert_eq!(found.task_id, task.task_id);
    }

    #[tokio::test]
    async fn auth_storage_isolates_by_user_and_key() {
        let repo = InMemoryAuthStorageRepository::new();
        let user_a = UserId::from("a".to_string());
        let user_b = UserId::from("b".to_string());
        let data = OAuth2AuthData {
            access_token: "tok".into(),
            refresh_token: None,
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            scopes: vec!["repo".into()],
        };
        repo.save_token(&user_a, "key", &data).await.unwrap();
        assert!(repo.find_token(&user_a, "key").await.unwrap().is_some());
        assert!(repo.find_token(&user_b, "key").await.unwrap().is_none());
    }
}
