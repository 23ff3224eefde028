// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Paygate orchestration core
//!
//! Durable, multi-step orchestration of paid service calls: a persistent run
//! queue with idempotent enqueue and exclusive claims, a polling worker, and
//! a step executor with per-step retry, ranked fallback, fail-fast and
//! cooperative cancellation.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - [`domain`]: run aggregate, retry policy, ports
//! - [`application`]: use cases, step executor, worker
//! - [`infrastructure`]: in-memory and PostgreSQL stores, event bus, HTTP executor
//! - [`presentation`]: axum router

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
