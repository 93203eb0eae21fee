//! SQLite-backed stores: the directory shard kept by server nodes and the
//! chat log kept by clients.

#[macro_use]
extern crate tracing;

pub mod chatlog;
pub mod directory;

use err_derive::Error;

#[derive(Debug, Error)]
pub enum Error {
	#[error(display = "IO error: {}", _0)]
	Io(#[error(source)] std::io::Error),

	#[error(display = "sqlite error: {}", _0)]
	Sqlite(#[error(source)] rusqlite::Error),

	#[error(display = "invalid stored address: {}", _0)]
	BadAddress(#[error(source)] std::net::AddrParseError),
}
