mod auth;
mod buffer_pool;
pub mod cluster;
mod connection;
pub mod constant;
pub mod error;
pub mod metrics;
mod opts;
pub mod policy;
mod pool;
mod prepared;
pub mod protocol;
mod request_handler;
mod result;
mod session;
mod statement;
mod stream;
pub mod timestamp;

pub use auth::{Authenticator, AuthenticatorProvider, PlainTextAuthProvider};
pub use opts::Opts;
pub use prepared::PreparedStatement;
pub use result::{QueryResult, TracingInfo};
pub use session::Session;
pub use statement::{Batch, BatchStatement, BoundStatement, Statement, StatementConfig, Value};

#[cfg(test)]
mod constant_test;
#[cfg(test)]
mod opts_test;
#[cfg(test)]
mod result_test;
#[cfg(test)]
mod statement_test;
#[cfg(test)]
mod stream_test;
#[cfg(test)]
mod timestamp_test;
