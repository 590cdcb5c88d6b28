// Library modules
pub mod activation;
pub mod bus;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod names;
pub mod notify;
pub mod policy;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod recv;
pub mod reply;
pub mod resource;
pub mod send;
pub mod server;

#[cfg(test)]
mod integration_test_full;

// Re-export commonly used types
pub use bus::Bus;
pub use config::Config;
pub use connection::{ConnFlags, Connection, MatchPredicate};
pub use error::{BusError, BusResult};
pub use policy::{AllowAll, Policy};
pub use pool::{Pool, PoolRange};
pub use server::{Server, Session};
