// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Repository Factory - Application Layer
//!
//! Creates concrete repository implementations from the storage backend
//! configuration. The domain layer only knows the traits; this is the one
//! place that names concrete infrastructure types.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Wire `RunQueue` / `RunRepository` to a backend

use sqlx::PgPool;
use std::sync::Arc;

use crate::domain::repository::{RepositoryError, RunQueue, RunRepository, StorageBackend};
use crate::infrastructure::repositories::{
    InMemoryOrchestrationStore, PostgresRunQueue, PostgresRunRepository,
};

/// Queue and run repository handles that share one backing store.
#[derive(Clone)]
pub struct OrchestrationRepositories {
    pub queue: Arc<dyn RunQueue>,
    pub runs: Arc<dyn RunRepository>,
}

impl OrchestrationRepositories {
    pub fn in_memory() -> Self {
        let store = InMemoryOrchestrationStore::new();
        Self {
            queue: Arc::new(store.clone()),
            runs: Arc::new(store),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            queue: Arc::new(PostgresRunQueue::new(pool.clone())),
            runs: Arc::new(PostgresRunRepository::new(pool)),
        }
    }
}

/// The in-memory backend ignores `pool`; PostgreSQL requires it.
pub fn create_orchestration_repositories(
    backend: &StorageBackend,
    pool: Option<PgPool>,
) -> Result<OrchestrationRepositories, RepositoryError> {
    match backend {
        StorageBackend::InMemory => Ok(OrchestrationRepositories::in_memory()),
        StorageBackend::PostgreSQL(_) => pool
            .map(OrchestrationRepositories::postgres)
            .ok_or_else(|| RepositoryError::Database("PostgreSQL backend selected without a connection pool".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repository::PostgresConfig;

    #[test]
    fn test_in_memory_handles_share_state() {
        let repos = create_orchestration_repositories(&StorageBackend::InMemory, None).unwrap();
        assert!(Arc::strong_count(&repos.queue) >= 1);
    }

    #[test]
    fn test_postgres_without_pool_is_rejected() {
        let backend = StorageBackend::PostgreSQL(PostgresConfig {
            connection_string: "postgres://localhost/paygate".to_string(),
            max_connections: 5,
        });
        assert!(create_orchestration_repositories(&backend, None).is_err());
    }
}
