// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod cancel_run;
pub mod repository_factory;
pub mod run_query;
pub mod step_executor;
pub mod submit_run;
pub mod worker;

// Re-export use cases for convenience
pub use cancel_run::{CancelRunError, CancelRunUseCase, StandardCancelRunUseCase};
pub use repository_factory::{create_orchestration_repositories, OrchestrationRepositories};
pub use run_query::RunQueryService;
pub use step_executor::{AlwaysContinue, ExecutionHooks, StepExecutor};
pub use submit_run::{AcceptedRun, StandardSubmitRunUseCase, SubmitRunError, SubmitRunUseCase};
pub use worker::{OrchestratorWorker, OrchestratorWorkerConfig, TickOutcome};
