// Orchestration-facing cache operations.

pub mod cache;
