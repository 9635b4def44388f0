#![allow(clippy::needless_return)]
#![warn(clippy::await_holding_lock, clippy::inefficient_to_string)]

pub mod connection;
pub mod error;
pub mod params;
pub mod rows;

pub use connection::{Connection, DbState, Options, RunResult};
pub use error::Error;
pub use params::ParamValues;
pub use rows::{Column, Row, Rows, ValueType};

pub use rusqlite::types::Value;

/// The result returned on method calls in this crate.
pub type Result<T> = std::result::Result<T, Error>;
