//! Canvas core: ranks, draw order, objects, locks.
//!
//! Everything under this module is synchronous and owned by a single
//! participant worker. Networking and storage live in `services`.

pub mod lock;
pub mod object;
pub mod order;
pub mod rank;
pub mod store;
