//! `ManageConnection`: the database-specific half of the pool, adapted from
//! bb8's `Send + Sync` trait to this crate's single-threaded model (no
//! bound beyond `'static`, since nothing here ever crosses a thread).

use async_trait::async_trait;
use rt_core::LoopHandle;
use rt_mysql::{ConnectOptions, MySqlConnection, MySqlError};

#[async_trait(?Send)]
pub trait ManageConnection: 'static {
    type Connection;
    type Error: std::fmt::Display + Clone + 'static;

    async fn connect(&self) -> Result<Self::Connection, Self::Error>;
    async fn is_valid(&self, conn: &Self::Connection) -> Result<(), Self::Error>;
}

/// The only `ManageConnection` this crate ships: opens a fresh
/// `MySqlConnection` per lease-miss and validates idle connections with a
/// `COM_PING` before handing them back out.
pub struct MySqlConnectionManager {
    handle: LoopHandle,
    opts: ConnectOptions,
}

impl MySqlConnectionManager {
    pub fn new(handle: LoopHandle, opts: ConnectOptions) -> Self {
        Self { handle, opts }
    }
}

#[async_trait(?Send)]
impl ManageConnection for MySqlConnectionManager {
    type Connection = MySqlConnection;
    type Error = MySqlError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        MySqlConnection::connect(&self.handle, &self.opts).await
    }

    async fn is_valid(&self, conn: &Self::Connection) -> Result<(), Self::Error> {
        conn.ping().await
    }
}
