//! Testing toolkit for the migration core.
//!
//! Provides a multi-node cluster fixture wired entirely in-process: shared
//! migration/topic/leaders tables, one backend + worker + shard directory
//! per node, and the in-memory status router as the RPC transport. The
//! scripted work runner stands in for the real partition work routines,
//! with per-ntp result queues and hold/release gating for mid-flight
//! scenarios.
//!
//! The end-to-end suites live beside the fixture: lifecycle scenarios in
//! `scenario_tests`, structural invariants and idempotence properties in
//! `invariant_tests`.

pub mod utils;

mod scenario_tests;

pub use utils::{eventually, ScriptedWorkRunner, TestCluster, TestNode};
