//! Lease/release connection pool: a bounded `MySqlConnection` pool with a
//! FIFO waiter queue, generic over `ManageConnection` the way bb8 is.

pub mod config;
pub mod error;
pub mod manager;
pub mod pool;

pub use config::PoolConfig;
pub use error::PoolError;
pub use manager::{ManageConnection, MySqlConnectionManager};
pub use pool::{Pool, PoolState, PooledConnection};
