//! Rookery error types

use err_derive::Error;

#[derive(Debug, Error)]
pub enum Error {
	#[error(display = "IO error: {}", _0)]
	Io(#[error(source)] std::io::Error),

	#[error(display = "Store error: {}", _0)]
	Db(#[error(source)] rookery_db::Error),

	#[error(display = "Invalid address: {}", _0)]
	BadAddress(#[error(source)] std::net::AddrParseError),

	#[error(display = "Malformed wire message: {}", _0)]
	Wire(String),

	#[error(display = "Timed out waiting for a reply")]
	Timeout(#[error(source)] tokio::time::error::Elapsed),

	#[error(display = "Crypto error: {}", _0)]
	Crypto(String),

	#[error(display = "{}", _0)]
	Message(String),
}

impl From<&str> for Error {
	fn from(v: &str) -> Error {
		Error::Message(v.to_string())
	}
}

impl From<String> for Error {
	fn from(v: String) -> Error {
		Error::Message(v)
	}
}

impl From<std::num::ParseIntError> for Error {
	fn from(e: std::num::ParseIntError) -> Error {
		Error::Wire(format!("invalid integer field: {}", e))
	}
}

/// Turn an `Option` into a `Result` with a message error, the way most of the
/// command handlers want it.
pub trait OkOrMessage {
	type S;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<Self::S, Error>;
}

impl<T> OkOrMessage for Option<T> {
	type S = T;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<T, Error> {
		match self {
			Some(x) => Ok(x),
			None => Err(Error::Message(message.into())),
		}
	}
}
