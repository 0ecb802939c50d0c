//! External collaborators: each one consumes the core's central snapshot
//! and/or dispatch channel and nothing else (spec.md §6). None of them can
//! observe a half-merged state and none of them feed back into the merge.

pub mod backfill;
pub mod db;
pub mod mqtt;
pub mod tuya;
pub mod ws;
