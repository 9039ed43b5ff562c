//! Grove: Transactional Hierarchical Content Repository
//!
//! A hierarchical content repository core built around per-session overlay
//! caches with optimistic atomic commits, an ordered asynchronous change bus,
//! a two-tier lock registry with lease expiry, and a streaming backup codec.

pub mod backup;
pub mod bus;
pub mod changes;
pub mod config;
pub mod document;
pub mod error;
pub mod lock;
pub mod logging;
pub mod repository;
pub mod session;
pub mod store;
pub mod txn;
pub mod types;
pub mod value;
