//! Command-line configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "atomgit", version, about = "Atom Publishing Protocol server backed by git")]
pub struct Config {
    /// TCP bind address.
    #[arg(long, default_value = "127.0.0.1:8357", value_name = "ADDR")]
    pub listen: SocketAddr,

    /// Path of the bare git repository holding all feeds and entries.
    #[arg(long, default_value = ".atompub", value_name = "PATH")]
    pub gitdir: PathBuf,
}
