//! Participant-side services built on the board model.
//!
//! ARCHITECTURE
//! ============
//! `replication` is the synchronous protocol state machine and
//! `persistence` the authority's write scheduler. `participant` runs both
//! on one worker task and talks to the relay through a `transport` link.

pub mod participant;
pub mod persistence;
pub mod replication;
pub mod transport;
