// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Read-side service over persisted runs: list, detail, summary, timeline.

use std::sync::Arc;

use crate::domain::projection::{
    build_timeline, clamp_list_limit, RunListItem, RunSummary, TimelineRow,
};
use crate::domain::repository::{RepositoryError, RunRepository};
use crate::domain::run::{Run, RunId};

#[derive(Clone)]
pub struct RunQueryService {
    runs: Arc<dyn RunRepository>,
}

impl RunQueryService {
    pub fn new(runs: Arc<dyn RunRepository>) -> Self {
        Self { runs }
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, RepositoryError> {
        self.runs.find_by_id(run_id).await
    }

    pub async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<RunListItem>, RepositoryError> {
        self.runs.list_recent(clamp_list_limit(limit)).await
    }

    pub async fn summary(&self, run_id: &RunId) -> Result<Option<RunSummary>, RepositoryError> {
        let Some(run) = self.runs.find_by_id(run_id).await? else {
            return Ok(None);
        };
        let steps = self.runs.step_outcomes(run_id).await?;
        Ok(Some(RunSummary::build(&run, &steps)))
    }

    /// Empty when the run is unknown or has no recorded steps yet.
    pub async fn timeline(&self, run_id: &RunId) -> Result<Vec<TimelineRow>, RepositoryError> {
        let Some(run) = self.runs.find_by_id(run_id).await? else {
            return Ok(Vec::new());
        };
        let steps = self.runs.step_outcomes(run_id).await?;
        Ok(build_timeline(&run, &steps))
    }
}
