//! The directory shard owned by a server node: locally registered users plus
//! the replica rows this node holds on behalf of other nodes.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::Error;

/// A username -> endpoint row of the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEntry {
	pub username: String,
	pub ip: IpAddr,
	pub port: u16,
}

/// One sqlite database per node, under `<dir>/<name>.db`.
///
/// The `users` table holds the rows this node owns; `replic_users` holds the
/// rows replicated here by other nodes, keyed by the owner's address.
pub struct DirectoryStore {
	db: Mutex<Connection>,
}

impl DirectoryStore {
	pub fn open(dir: &Path, name: &str) -> Result<Self, Error> {
		std::fs::create_dir_all(dir)?;
		let path = dir.join(format!("{}.db", name));
		let conn = Connection::open(&path)?;
		conn.execute_batch(
			"CREATE TABLE IF NOT EXISTS users (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				username TEXT NOT NULL UNIQUE,
				ip TEXT NOT NULL,
				port INTEGER NOT NULL
			);
			CREATE TABLE IF NOT EXISTS replic_users (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				username TEXT NOT NULL UNIQUE,
				ip TEXT NOT NULL,
				port INTEGER NOT NULL,
				owner TEXT NOT NULL
			);",
		)?;
		debug!("Directory store open at {}", path.display());
		Ok(DirectoryStore {
			db: Mutex::new(conn),
		})
	}

	/// Insert or replace the endpoint registered for `username`.
	pub fn upsert_user(&self, username: &str, ip: IpAddr, port: u16) -> Result<(), Error> {
		let db = self.db.lock().unwrap();
		db.execute(
			"INSERT INTO users (username, ip, port) VALUES (?1, ?2, ?3)
			 ON CONFLICT(username) DO UPDATE SET ip = excluded.ip, port = excluded.port",
			params![username, ip.to_string(), port],
		)?;
		Ok(())
	}

	pub fn resolve_user(&self, username: &str) -> Result<Option<(IpAddr, u16)>, Error> {
		let db = self.db.lock().unwrap();
		let row = db
			.query_row(
				"SELECT ip, port FROM users WHERE username = ?1",
				params![username],
				|r| Ok((r.get::<_, String>(0)?, r.get::<_, u16>(1)?)),
			)
			.optional()?;
		match row {
			Some((ip, port)) => Ok(Some((ip.parse()?, port))),
			None => Ok(None),
		}
	}

	pub fn delete_user(&self, username: &str) -> Result<(), Error> {
		let db = self.db.lock().unwrap();
		db.execute("DELETE FROM users WHERE username = ?1", params![username])?;
		Ok(())
	}

	/// Every locally owned row, for full-shard replication pushes.
	pub fn all_users(&self) -> Result<Vec<UserEntry>, Error> {
		let db = self.db.lock().unwrap();
		Self::collect_entries(&db, "SELECT username, ip, port FROM users", params![])
	}

	/// Rows whose key hash falls outside `[lower, upper]`, candidates for
	/// shard correction after a range change.
	pub fn users_outside(
		&self,
		lower: u64,
		upper: u64,
		hash: impl Fn(&str) -> u64,
	) -> Result<Vec<UserEntry>, Error> {
		let all = self.all_users()?;
		Ok(all
			.into_iter()
			.filter(|u| {
				let h = hash(&u.username);
				h < lower || h > upper
			})
			.collect())
	}

	/// Insert or replace a replica row contributed by `owner`.
	pub fn upsert_replica(&self, entry: &UserEntry, owner: IpAddr) -> Result<(), Error> {
		let db = self.db.lock().unwrap();
		db.execute(
			"INSERT INTO replic_users (username, ip, port, owner) VALUES (?1, ?2, ?3, ?4)
			 ON CONFLICT(username) DO UPDATE
			 SET ip = excluded.ip, port = excluded.port, owner = excluded.owner",
			params![
				entry.username,
				entry.ip.to_string(),
				entry.port,
				owner.to_string()
			],
		)?;
		Ok(())
	}

	pub fn replicas_of(&self, owner: IpAddr) -> Result<Vec<UserEntry>, Error> {
		let db = self.db.lock().unwrap();
		Self::collect_entries(
			&db,
			"SELECT username, ip, port FROM replic_users WHERE owner = ?1",
			params![owner.to_string()],
		)
	}

	pub fn drop_replicas(&self, owner: IpAddr) -> Result<usize, Error> {
		let db = self.db.lock().unwrap();
		let n = db.execute(
			"DELETE FROM replic_users WHERE owner = ?1",
			params![owner.to_string()],
		)?;
		Ok(n)
	}

	/// Distinct owners present in the replica table. Used to rebuild the
	/// in-memory replicants set after a restart.
	pub fn replica_owners(&self) -> Result<Vec<IpAddr>, Error> {
		let db = self.db.lock().unwrap();
		let mut stmt = db.prepare("SELECT DISTINCT owner FROM replic_users")?;
		let rows = stmt.query_map(params![], |r| r.get::<_, String>(0))?;
		let mut out = vec![];
		for row in rows {
			out.push(row?.parse()?);
		}
		Ok(out)
	}

	fn collect_entries(
		db: &Connection,
		sql: &str,
		args: &[&dyn rusqlite::ToSql],
	) -> Result<Vec<UserEntry>, Error> {
		let mut stmt = db.prepare(sql)?;
		let rows = stmt.query_map(args, |r| {
			Ok((
				r.get::<_, String>(0)?,
				r.get::<_, String>(1)?,
				r.get::<_, u16>(2)?,
			))
		})?;
		let mut out = vec![];
		for row in rows {
			let (username, ip, port) = row?;
			out.push(UserEntry {
				username,
				ip: ip.parse()?,
				port,
			});
		}
		Ok(out)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn open_tmp() -> (mktemp::Temp, DirectoryStore) {
		let dir = mktemp::Temp::new_dir().unwrap();
		let store = DirectoryStore::open(dir.as_path(), "testnode").unwrap();
		(dir, store)
	}

	fn ip(s: &str) -> IpAddr {
		s.parse().unwrap()
	}

	#[test]
	fn register_is_upsert() {
		let (_dir, store) = open_tmp();
		store.upsert_user("ada", ip("10.0.0.1"), 4000).unwrap();
		store.upsert_user("ada", ip("10.0.0.2"), 4001).unwrap();
		assert_eq!(
			store.resolve_user("ada").unwrap(),
			Some((ip("10.0.0.2"), 4001))
		);
		assert_eq!(store.all_users().unwrap().len(), 1);
	}

	#[test]
	fn resolve_unknown_is_none() {
		let (_dir, store) = open_tmp();
		assert_eq!(store.resolve_user("nobody").unwrap(), None);
	}

	#[test]
	fn range_exclusion_query() {
		let (_dir, store) = open_tmp();
		store.upsert_user("low", ip("10.0.0.1"), 1).unwrap();
		store.upsert_user("high", ip("10.0.0.2"), 2).unwrap();
		// Fake hash: "low" -> 5, everything else -> 100
		let aliens = store
			.users_outside(0, 50, |u| if u == "low" { 5 } else { 100 })
			.unwrap();
		assert_eq!(aliens.len(), 1);
		assert_eq!(aliens[0].username, "high");
	}

	#[test]
	fn replica_rows_track_owner() {
		let (_dir, store) = open_tmp();
		let owner_a = ip("10.0.0.8");
		let owner_b = ip("10.0.0.9");
		store
			.upsert_replica(
				&UserEntry {
					username: "ada".into(),
					ip: ip("10.0.1.1"),
					port: 4000,
				},
				owner_a,
			)
			.unwrap();
		store
			.upsert_replica(
				&UserEntry {
					username: "grace".into(),
					ip: ip("10.0.1.2"),
					port: 4001,
				},
				owner_b,
			)
			.unwrap();

		assert_eq!(store.replicas_of(owner_a).unwrap().len(), 1);
		let mut owners = store.replica_owners().unwrap();
		owners.sort();
		assert_eq!(owners, vec![owner_a, owner_b]);

		assert_eq!(store.drop_replicas(owner_a).unwrap(), 1);
		assert!(store.replicas_of(owner_a).unwrap().is_empty());
		assert_eq!(store.replica_owners().unwrap(), vec![owner_b]);
	}

	#[test]
	fn replica_upsert_moves_ownership() {
		let (_dir, store) = open_tmp();
		let entry = UserEntry {
			username: "ada".into(),
			ip: ip("10.0.1.1"),
			port: 4000,
		};
		store.upsert_replica(&entry, ip("10.0.0.8")).unwrap();
		store.upsert_replica(&entry, ip("10.0.0.9")).unwrap();
		assert!(store.replicas_of(ip("10.0.0.8")).unwrap().is_empty());
		assert_eq!(store.replicas_of(ip("10.0.0.9")).unwrap(), vec![entry]);
	}
}
