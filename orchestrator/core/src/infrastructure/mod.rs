// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod db;
pub mod event_bus;
pub mod http_executor;
pub mod repositories;

pub use event_bus::{EventBus, EventBusError, EventReceiver, RunEventReceiver};
pub use http_executor::HttpCandidateExecutor;
