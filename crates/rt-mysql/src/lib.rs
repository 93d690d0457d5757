//! Binary-protocol MySQL client driven by `rt-core`'s event loop: handshake
//! and `caching_sha2_password` auth, a mutex-serialized command channel, and
//! the `COM_QUERY`/`COM_STMT_*` result-set state machines.

pub mod config;
pub mod conn;
pub mod error;
pub mod handshake;
pub mod mutex;
pub mod packet;
pub mod resultset;
pub mod socket;
pub mod value;

pub use config::DatabaseConfig;
pub use conn::{ConnectOptions, MySqlConnection, PreparedHandle, QueryResult};
pub use error::MySqlError;
pub use resultset::{ColumnDef, ErrPacket, OkPacket};
pub use value::Value;
