//! Real-time collaborative canvas core.
//!
//! ARCHITECTURE
//! ============
//! - `board`: ranks, draw order, the object store and edit locks. Pure,
//!   synchronous, one instance per participant.
//! - `frame`: replication messages and their protobuf wire mapping.
//! - `services`: the replication state machine, the authority's persistence
//!   gateway and the participant worker that drives both.
//! - `db`: durable bucket storage (Postgres or in-process).
//! - `state` + `routes`: the websocket relay that fans frames out per room.

pub mod board;
pub mod config;
pub mod db;
pub mod frame;
pub mod routes;
pub mod services;
pub mod state;
