#![forbid(unsafe_code)]

//! Atom Publishing Protocol server backed by a bare git repository.
//!
//! Every successful mutation through the protocol surface becomes exactly one
//! commit on `refs/heads/master`; on startup the in-memory model is rebuilt
//! from the latest commit.

pub mod atom;
pub mod config;
pub mod error;
pub mod model;
pub mod server;
pub mod store;

pub use config::Config;
pub use error::ApiError;
pub use model::Model;
pub use store::GitStore;
