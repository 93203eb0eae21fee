//! The client-side message log: one sqlite database per local username,
//! recording both sides of every conversation.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
	pub id: i64,
	pub author: String,
	pub receiver: String,
	pub text: String,
	pub date_time: String,
	pub seen: bool,
}

pub struct ChatLog {
	db: Mutex<Connection>,
}

impl ChatLog {
	pub fn open(dir: &Path, username: &str) -> Result<Self, Error> {
		std::fs::create_dir_all(dir)?;
		let path = dir.join(format!("{}.db", username));
		let conn = Connection::open(&path)?;
		conn.execute_batch(
			"CREATE TABLE IF NOT EXISTS messages (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				author TEXT NOT NULL,
				receiver TEXT NOT NULL,
				text TEXT NOT NULL,
				date_time DATETIME DEFAULT CURRENT_TIMESTAMP,
				seen BOOLEAN DEFAULT 0
			);",
		)?;
		debug!("Chat log open at {}", path.display());
		Ok(ChatLog {
			db: Mutex::new(conn),
		})
	}

	pub fn insert_message(
		&self,
		author: &str,
		receiver: &str,
		text: &str,
		seen: bool,
	) -> Result<(), Error> {
		let db = self.db.lock().unwrap();
		db.execute(
			"INSERT INTO messages (author, receiver, text, seen) VALUES (?1, ?2, ?3, ?4)",
			params![author, receiver, text, seen],
		)?;
		Ok(())
	}

	/// Chronological history with `partner`: everything we sent, plus the
	/// messages from them we have already marked seen. Unseen incoming
	/// messages are fetched separately so callers can surface them as new.
	pub fn conversation(&self, me: &str, partner: &str) -> Result<Vec<StoredMessage>, Error> {
		self.query_messages(
			"SELECT id, author, receiver, text, date_time, seen FROM messages
			 WHERE (author = ?1 AND receiver = ?2)
			    OR (author = ?2 AND receiver = ?1 AND seen = 1)
			 ORDER BY date_time ASC, id ASC",
			params![me, partner],
		)
	}

	pub fn unseen_from(&self, me: &str, partner: &str) -> Result<Vec<StoredMessage>, Error> {
		self.query_messages(
			"SELECT id, author, receiver, text, date_time, seen FROM messages
			 WHERE author = ?2 AND receiver = ?1 AND seen = 0
			 ORDER BY date_time ASC, id ASC",
			params![me, partner],
		)
	}

	pub fn mark_seen(&self, me: &str, partner: &str) -> Result<(), Error> {
		let db = self.db.lock().unwrap();
		db.execute(
			"UPDATE messages SET seen = 1 WHERE author = ?2 AND receiver = ?1",
			params![me, partner],
		)?;
		Ok(())
	}

	/// Unread message count per conversation partner.
	pub fn unread_counts(&self, me: &str) -> Result<Vec<(String, u32)>, Error> {
		let db = self.db.lock().unwrap();
		let mut stmt = db.prepare(
			"SELECT author, COUNT(*) FROM messages
			 WHERE receiver = ?1 AND seen = 0
			 GROUP BY author",
		)?;
		let rows = stmt.query_map(params![me], |r| {
			Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?))
		})?;
		let mut out = vec![];
		for row in rows {
			out.push(row?);
		}
		Ok(out)
	}

	/// The most recent message of every conversation, newest conversation
	/// first. Drives the chat list preview of whatever UI sits on top.
	pub fn chat_previews(&self, me: &str) -> Result<Vec<(String, String)>, Error> {
		let db = self.db.lock().unwrap();
		let mut stmt = db.prepare(
			"WITH ranked AS (
				SELECT
					CASE WHEN author = ?1 THEN receiver ELSE author END AS partner,
					text,
					date_time,
					ROW_NUMBER() OVER (
						PARTITION BY CASE WHEN author = ?1 THEN receiver ELSE author END
						ORDER BY date_time DESC, id DESC
					) AS rn
				FROM messages
				WHERE ?1 IN (author, receiver)
			)
			SELECT partner, text FROM ranked WHERE rn = 1 ORDER BY date_time DESC",
		)?;
		let rows = stmt.query_map(params![me], |r| {
			Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
		})?;
		let mut out = vec![];
		for row in rows {
			out.push(row?);
		}
		Ok(out)
	}

	fn query_messages(
		&self,
		sql: &str,
		args: &[&dyn rusqlite::ToSql],
	) -> Result<Vec<StoredMessage>, Error> {
		let db = self.db.lock().unwrap();
		let mut stmt = db.prepare(sql)?;
		let rows = stmt.query_map(args, |r| {
			Ok(StoredMessage {
				id: r.get(0)?,
				author: r.get(1)?,
				receiver: r.get(2)?,
				text: r.get(3)?,
				date_time: r.get(4)?,
				seen: r.get(5)?,
			})
		})?;
		let mut out = vec![];
		for row in rows {
			out.push(row?);
		}
		Ok(out)
	}
}
