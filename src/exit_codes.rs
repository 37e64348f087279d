//! Stable process exit codes for the orchestrator CLI.

/// Workflow completed, or a read-only command succeeded.
pub const OK: i32 = 0;
/// Any failure: config errors, phase failures, gate revisions, interruption.
pub const FAILURE: i32 = 1;
