//! Local database layer for Tally

mod connection;
mod migrations;

pub use connection::Database;
