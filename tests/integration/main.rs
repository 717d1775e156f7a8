//! Integration tests for gpulane.
//!
//! Most scenarios run against the in-memory store. The `redis_store` tests
//! need a running Redis:
//! Run: docker run -d -p 6379:6379 redis:7
//! Then: cargo test --test integration --features integration

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod admission_scenario;
mod common;
mod executor_race;
mod lock_exclusion;
mod recovery;
mod redis_store;
