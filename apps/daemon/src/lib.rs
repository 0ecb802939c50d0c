//! Acquisition and processing daemon for a residential solar fleet.
//!
//! Wires together, per plugin instance, a poller task; a single processor
//! task that owns every merge/filter/dispatch decision; a supervisor and
//! health monitor pair that keep pollers alive; and the external
//! collaborators (UI, MQTT, persistence, plug control) that only ever read
//! from central state.

pub mod collaborators;
pub mod lifecycle;
pub mod poller;
pub mod processor;
pub mod supervisor;
