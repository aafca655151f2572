//! A programmable TCP traffic generator: walks a directed action graph,
//! drives TCP transfers (optionally through a SOCKS5 proxy), and reports
//! per-transfer timing and an aggregate summary.

#[macro_use]
extern crate log;
extern crate mio;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate md5;
extern crate serde_json;
extern crate serde_yaml;

pub mod action;
pub mod app;
pub mod config;
pub mod driver;
pub mod error;
pub mod graph;
pub mod peer;
pub mod socks5;
pub mod transfer;
pub mod transport;

pub use app::run_from_path;
pub use driver::{Driver, Summary};
pub use error::TgenError;
pub use graph::Graph;
