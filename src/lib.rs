#![warn(clippy::all)]
#![allow(clippy::large_enum_variant)]

pub mod client;
pub mod encoding;
pub mod error;
pub mod kv;
pub mod raft;
pub mod state;

pub use client::Client;
pub use error::{Error, Result};
pub use raft::{Options, Server};
