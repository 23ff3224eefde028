// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Run / queue aggregates, the retry policy, the Execute capability contract
//! and the repository interfaces. No I/O lives here.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Orchestration model and persistence contracts

pub mod config;
pub mod events;
pub mod execute;
pub mod projection;
pub mod repository;
pub mod retry_policy;
pub mod run;
pub mod validation;
