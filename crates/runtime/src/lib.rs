#![allow(clippy::needless_return)]
#![warn(clippy::await_holding_lock, clippy::inefficient_to_string)]

pub mod data_dir;
pub mod error;
pub mod host;
pub mod resource;
pub mod runtime;

mod bridge;
mod broadcast;
mod cache;
mod canvas;
mod clone;
mod console;
mod crypto;
mod fetch;
mod ffi;
mod fs_ops;
mod import_provider;
mod locks;
mod navigator;
mod performance;
mod pool;
mod process;
mod serve;
mod sqlite;
mod storage;
mod streams;
mod timers;
mod urls;

pub use data_dir::DataDir;
pub use error::{ErrorKind, HostError, HostResult};
pub use host::{HostOptions, HostState};
pub use runtime::{Module, RuntimeHandle};
