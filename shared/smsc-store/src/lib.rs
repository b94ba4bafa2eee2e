//! SMSC Store
//!
//! Persistence for operators, routing rules and message status history.
//! PostgreSQL through a deadpool connection pool, plus an in-memory
//! repository for tests and database-less deployments.

mod error;
mod memory;
mod pool;
mod postgres;
mod repository;
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryRepository;
pub use pool::{PoolConfig, StorePool};
pub use postgres::PgRepository;
pub use repository::Repository;
