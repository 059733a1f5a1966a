//! Bookkeeping for container and package state.
//!
//! Tracks which packages were installed explicitly on which container, and keeps
//! that bookkeeping consistent when several containers share a root filesystem
//! (a package installed in one is visible in all of them).
//!
//! The store is a single SQLite database. Every mutating operation, and every
//! read that decides a write, runs in its own EXCLUSIVE transaction so that
//! concurrent invocations from other processes serialize instead of interleaving.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior, params, params_from_iter};
use thiserror::Error;

use crate::config::BoxConfig;

/// How long a transaction waits on a lock held by another process before
/// giving up with [`StateError::Unavailable`].
const LOCK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum StateError {
    #[error("empty package name provided for registration")]
    EmptyPackage,

    #[error("state database is locked by another process")]
    Unavailable(#[source] rusqlite::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl StateError {
    fn from_sqlite(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                StateError::Unavailable(err)
            }
            _ => StateError::Sqlite(err),
        }
    }
}

/// Runtime configuration of a container as recorded at registration time.
#[derive(Debug, Clone)]
pub struct RuntimeConfiguration {
    pub name: String,
    pub distribution: String,
    /// Local shared root directory, empty if the container does not use one.
    pub shared_root: String,
    /// The resolved container configuration in INI format.
    pub config: BoxConfig,
}

/// Handle to the state database. One connection per process lifetime; release
/// it with [`StateStore::close`] or by dropping the value.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open the state database, creating tables and indexes if missing.
    pub fn open(path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(LOCK_TIMEOUT)?;
        Self::register_regexp(&conn)?;
        let mut store = StateStore { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Register a `regexp(pattern, value)` SQL function with substring-search
    /// semantics, used by package name filters in [`StateStore::get_packages`].
    fn register_regexp(conn: &Connection) -> Result<(), StateError> {
        conn.create_scalar_function(
            "regexp",
            2,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            move |ctx| {
                type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
                let pattern: Arc<Regex> = ctx.get_or_create_aux(0, |vr| -> Result<_, BoxError> {
                    Ok(Regex::new(vr.as_str()?)?)
                })?;
                let value = ctx
                    .get_raw(1)
                    .as_str()
                    .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
                Ok(pattern.is_match(value))
            },
        )?;
        Ok(())
    }

    fn init_schema(&mut self) -> Result<(), StateError> {
        let tx = self.exclusive_tx()?;
        tx.execute(
            "CREATE TABLE IF NOT EXISTS containers (name TEXT PRIMARY KEY, \
               distribution TEXT, shared_root TEXT, configuration TEXT)",
            (),
        )?;
        tx.execute(
            "CREATE TABLE IF NOT EXISTS packages (name TEXT, container TEXT, \
               shared_root TEXT, local_copies TEXT, type TEXT, \
               PRIMARY KEY(name, container)) WITHOUT ROWID",
            (),
        )?;
        tx.execute(
            "CREATE INDEX IF NOT EXISTS package_containers ON packages(container)",
            (),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Begin an EXCLUSIVE transaction so a group of reads and writes is atomic
    /// with respect to other processes. Dropping the transaction rolls back.
    fn exclusive_tx(&mut self) -> Result<Transaction<'_>, StateError> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Exclusive)
            .map_err(StateError::from_sqlite)
    }

    /// Record a container with its distribution, shared root and resolved
    /// configuration. Any existing row for the name is fully unregistered first
    /// (the container may have been destroyed outside these tools), so the
    /// latest registration always wins and no duplicate key can occur.
    pub fn register_container(
        &mut self,
        name: &str,
        distribution: &str,
        shared_root: &str,
        config: &BoxConfig,
    ) -> Result<(), StateError> {
        let config_text = config.to_ini_string();
        let tx = self.exclusive_tx()?;
        Self::unregister_container_in_tx(&tx, name)?;
        tx.execute(
            "INSERT INTO containers VALUES (?1, ?2, ?3, ?4)",
            params![name, distribution, shared_root, config_text],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Remove a container, returning whether it was registered. Packages owned
    /// by the container are deleted, except that under a non-empty shared root
    /// a package no other container (with the same root) still owns is kept as
    /// an orphan row with an empty container name, since it stays visible to
    /// peer containers on that root.
    pub fn unregister_container(&mut self, name: &str) -> Result<bool, StateError> {
        let tx = self.exclusive_tx()?;
        let found = Self::unregister_container_in_tx(&tx, name)?;
        tx.commit()?;
        Ok(found)
    }

    fn unregister_container_in_tx(tx: &Transaction<'_>, name: &str) -> Result<bool, StateError> {
        let shared_root: Option<String> = tx
            .query_row(
                "DELETE FROM containers WHERE name = ?1 RETURNING shared_root",
                params![name],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        if let Some(root) = &shared_root
            && !root.is_empty()
        {
            // Find packages only this container references among those sharing
            // the same root (left outer join leaves NULL for missing peers) and
            // blank out their owner. Empty string rather than NULL to avoid SQL
            // NULL comparisons elsewhere.
            tx.execute(
                "UPDATE packages SET container = '' WHERE name IN (
                   SELECT d_pkgs.name FROM packages d_pkgs LEFT OUTER JOIN
                   (SELECT name, shared_root FROM packages WHERE shared_root <> '' AND
                    container <> ?1) pkgs
                   ON (d_pkgs.name = pkgs.name AND d_pkgs.shared_root = pkgs.shared_root)
                   WHERE d_pkgs.container = ?1 AND pkgs.name IS NULL
                 )",
                params![name],
            )?;
        }
        // Remaining packages of the container are deleted outright, shared root
        // or not (those still had a peer owner or no shared root at all).
        tx.execute("DELETE FROM packages WHERE container = ?1", params![name])?;
        Ok(shared_root.is_some())
    }

    /// Look up the recorded configuration of a container.
    pub fn get_container_configuration(
        &self,
        name: &str,
    ) -> Result<Option<RuntimeConfiguration>, StateError> {
        let result = self.conn.query_row(
            "SELECT distribution, shared_root, configuration FROM containers WHERE name = ?1",
            params![name],
            |row| {
                Ok(RuntimeConfiguration {
                    name: name.to_string(),
                    distribution: row.get(0)?,
                    shared_root: row.get(1)?,
                    config: BoxConfig::Raw(row.get(2)?),
                })
            },
        );
        match result {
            Ok(conf) => Ok(Some(conf)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List container names matching the given filters, sorted ascending.
    /// All filters are optional and combined with AND.
    pub fn get_containers(
        &self,
        name: Option<&str>,
        distribution: Option<&str>,
        shared_root: Option<&str>,
    ) -> Result<Vec<String>, StateError> {
        let mut predicate = String::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(name) = name {
            predicate.push_str("name = ? AND ");
            args.push(name.to_string());
        }
        if let Some(distribution) = distribution {
            predicate.push_str("distribution = ? AND ");
            args.push(distribution.to_string());
        }
        if let Some(root) = shared_root {
            predicate.push_str("shared_root = ?");
            args.push(root.to_string());
        } else {
            predicate.push_str("1=1");
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT name FROM containers WHERE {predicate} ORDER BY name ASC"
        ))?;
        let rows = stmt.query_map(params_from_iter(args), |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    /// Record a package as owned by a container. Replaces any stale row for the
    /// same (package, container) key, and under a non-empty shared root removes
    /// a matching orphan row since the package has a live owner again.
    pub fn register_package(
        &mut self,
        container: &str,
        package: &str,
        shared_root: &str,
        local_copies: &[String],
        package_type: &str,
    ) -> Result<(), StateError> {
        if package.is_empty() {
            return Err(StateError::EmptyPackage);
        }
        let copies = local_copies.join(",");
        let tx = self.exclusive_tx()?;
        tx.execute(
            "DELETE FROM packages WHERE name = ?1 AND container = ?2",
            params![package, container],
        )?;
        tx.execute(
            "INSERT INTO packages VALUES (?1, ?2, ?3, ?4, ?5)",
            params![package, container, shared_root, copies, package_type],
        )?;
        if !shared_root.is_empty() {
            tx.execute(
                "DELETE FROM packages WHERE name = ?1 AND container = '' AND shared_root = ?2",
                params![package, shared_root],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Type tag recorded for a package installed as an optional dependency of
    /// `package`.
    pub fn optional_package_type(package: &str) -> String {
        format!("optional({package})")
    }

    /// Remove a package registration and return the wrapper files that were
    /// created for it so the caller can clean them up.
    ///
    /// With a non-empty shared root the package disappears from every container
    /// sharing that root (orphans included) since it is removed from the common
    /// filesystem; otherwise only this container's row goes away.
    pub fn unregister_package(
        &mut self,
        container: &str,
        package: &str,
        shared_root: &str,
    ) -> Result<Vec<String>, StateError> {
        let tx = self.exclusive_tx()?;
        let sql = if shared_root.is_empty() {
            "DELETE FROM packages WHERE name = ?1 AND container = ?2 RETURNING local_copies"
        } else {
            "DELETE FROM packages WHERE name = ?1 AND shared_root = ?2 RETURNING local_copies"
        };
        let scope = if shared_root.is_empty() {
            container
        } else {
            shared_root
        };
        let mut local_copies: Vec<String> = Vec::new();
        {
            let mut stmt = tx.prepare(sql)?;
            let rows = stmt.query_map(params![package, scope], |row| row.get::<_, String>(0))?;
            for row in rows {
                for file in row?.split(',').filter(|f| !f.is_empty()) {
                    if !local_copies.iter().any(|f| f == file) {
                        local_copies.push(file.to_string());
                    }
                }
            }
        }
        tx.commit()?;
        Ok(local_copies)
    }

    /// List distinct registered package names matching the filters, sorted
    /// ascending. `regex` matches names with substring-search semantics and
    /// `type_pattern` is an SQL LIKE pattern against the type tag (`%` = any).
    pub fn get_packages(
        &self,
        container: Option<&str>,
        shared_root: Option<&str>,
        regex: &str,
        type_pattern: &str,
    ) -> Result<Vec<String>, StateError> {
        let mut predicate = String::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(container) = container {
            predicate.push_str("container = ? AND ");
            args.push(container.to_string());
        }
        if let Some(root) = shared_root {
            predicate.push_str("shared_root = ? AND ");
            args.push(root.to_string());
        }
        if regex != ".*" {
            predicate.push_str("name REGEXP ? AND ");
            args.push(regex.to_string());
        }
        if type_pattern == "%" {
            predicate.push_str("1=1");
        } else {
            predicate.push_str("type LIKE ?");
            args.push(type_pattern.to_string());
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT DISTINCT(name) FROM packages WHERE {predicate} ORDER BY name ASC"
        ))?;
        let rows = stmt.query_map(params_from_iter(args), |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    /// Release the database connection. Scoped transactions have already been
    /// committed or rolled back, so this only closes the handle.
    pub fn close(self) -> Result<(), StateError> {
        self.conn.close().map_err(|(_, e)| StateError::Sqlite(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &Path) -> StateStore {
        StateStore::open(&dir.join("state.db")).unwrap()
    }

    fn raw(text: &str) -> BoxConfig {
        BoxConfig::Raw(text.to_string())
    }

    #[test]
    fn test_register_container_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store
            .register_container("arch1", "arch", "", &raw("[base]\nname = first\n"))
            .unwrap();
        store
            .register_container("arch1", "arch", "", &raw("[base]\nname = second\n"))
            .unwrap();

        assert_eq!(store.get_containers(None, None, None).unwrap(), ["arch1"]);
        let conf = store.get_container_configuration("arch1").unwrap().unwrap();
        assert!(conf.config.to_ini_string().contains("second"));
    }

    #[test]
    fn test_container_filters() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store
            .register_container("a1", "arch", "/roots/arch", &raw(""))
            .unwrap();
        store.register_container("a2", "arch", "", &raw("")).unwrap();
        store.register_container("u1", "ubuntu", "", &raw("")).unwrap();

        assert_eq!(
            store.get_containers(None, Some("arch"), None).unwrap(),
            ["a1", "a2"]
        );
        assert_eq!(
            store.get_containers(None, None, Some("/roots/arch")).unwrap(),
            ["a1"]
        );
        assert_eq!(
            store.get_containers(Some("u1"), Some("ubuntu"), None).unwrap(),
            ["u1"]
        );
        assert!(
            store
                .get_containers(Some("missing"), None, None)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_package_round_trip() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store.register_container("deb1", "debian", "", &raw("")).unwrap();
        store.register_package("deb1", "vim", "", &[], "").unwrap();

        assert_eq!(
            store.get_packages(Some("deb1"), None, ".*", "%").unwrap(),
            ["vim"]
        );
        let copies = store.unregister_package("deb1", "vim", "").unwrap();
        assert!(copies.is_empty());
        assert!(
            store
                .get_packages(Some("deb1"), None, ".*", "%")
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_register_package_rejects_empty_name() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let err = store.register_package("c1", "", "", &[], "").unwrap_err();
        assert!(matches!(err, StateError::EmptyPackage));
    }

    #[test]
    fn test_register_package_replaces_stale_row() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store
            .register_package("c1", "emacs", "", &["/old/wrapper".to_string()], "")
            .unwrap();
        store
            .register_package("c1", "emacs", "", &["/new/wrapper".to_string()], "")
            .unwrap();

        let copies = store.unregister_package("c1", "emacs", "").unwrap();
        assert_eq!(copies, ["/new/wrapper"]);
    }

    #[test]
    fn test_unregister_returns_deduplicated_copies() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let root = "/roots/arch";
        let wrapper = "/home/u/.local/share/applications/pkgbox.a.gimp.desktop".to_string();
        store
            .register_package(
                "a",
                "gimp",
                root,
                &[wrapper.clone(), "/home/u/.local/bin/gimp".to_string()],
                "",
            )
            .unwrap();
        store
            .register_package("b", "gimp", root, &[wrapper.clone()], "")
            .unwrap();

        let copies = store.unregister_package("a", "gimp", root).unwrap();
        assert_eq!(copies, [wrapper, "/home/u/.local/bin/gimp".to_string()]);
    }

    #[test]
    fn test_shared_root_removal_breadth() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let root = "/roots/arch";
        store.register_package("a", "mpv", root, &[], "").unwrap();
        store.register_package("b", "mpv", root, &[], "").unwrap();
        store.register_package("c", "mpv", "", &[], "").unwrap();

        store.unregister_package("a", "mpv", root).unwrap();
        // gone from every container sharing the root, untouched elsewhere
        assert!(
            store
                .get_packages(None, Some(root), ".*", "%")
                .unwrap()
                .is_empty()
        );
        assert_eq!(store.get_packages(Some("c"), None, ".*", "%").unwrap(), ["mpv"]);
    }

    #[test]
    fn test_orphan_invariant() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let root = "/roots/arch";
        store.register_container("a", "arch", root, &raw("")).unwrap();
        store.register_container("b", "arch", root, &raw("")).unwrap();
        store.register_package("a", "firefox", root, &[], "").unwrap();
        store.register_package("b", "firefox", root, &[], "").unwrap();

        // peer still owns the package, so no orphan appears
        assert!(store.unregister_container("a").unwrap());
        assert_eq!(
            store.get_packages(Some("b"), None, ".*", "%").unwrap(),
            ["firefox"]
        );
        assert!(
            store
                .get_packages(Some(""), None, ".*", "%")
                .unwrap()
                .is_empty()
        );

        // last owner gone: exactly one orphan row remains
        assert!(store.unregister_container("b").unwrap());
        assert_eq!(
            store.get_packages(Some(""), None, ".*", "%").unwrap(),
            ["firefox"]
        );
        assert_eq!(
            store.get_packages(None, Some(root), ".*", "%").unwrap(),
            ["firefox"]
        );
    }

    #[test]
    fn test_orphan_cleared_on_reregistration() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let root = "/roots/arch";
        store.register_container("a", "arch", root, &raw("")).unwrap();
        store.register_package("a", "inkscape", root, &[], "").unwrap();
        store.unregister_container("a").unwrap();
        assert_eq!(
            store.get_packages(Some(""), None, ".*", "%").unwrap(),
            ["inkscape"]
        );

        // a new container on the same root adopts the package, orphan row goes away
        store.register_container("b", "arch", root, &raw("")).unwrap();
        store.register_package("b", "inkscape", root, &[], "").unwrap();
        assert!(
            store
                .get_packages(Some(""), None, ".*", "%")
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            store.get_packages(Some("b"), None, ".*", "%").unwrap(),
            ["inkscape"]
        );
    }

    #[test]
    fn test_unregister_container_without_shared_root_deletes_packages() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store.register_container("plain", "debian", "", &raw("")).unwrap();
        store.register_package("plain", "htop", "", &[], "").unwrap();

        assert!(store.unregister_container("plain").unwrap());
        assert!(!store.unregister_container("plain").unwrap());
        assert!(store.get_packages(None, None, ".*", "%").unwrap().is_empty());
    }

    #[test]
    fn test_package_regex_and_type_filters() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store.register_package("c1", "vim", "", &[], "").unwrap();
        store.register_package("c1", "vim-airline", "", &[], "").unwrap();
        store
            .register_package(
                "c1",
                "gvim",
                "",
                &[],
                &StateStore::optional_package_type("vim"),
            )
            .unwrap();

        // substring-search semantics, not full match
        assert_eq!(
            store.get_packages(Some("c1"), None, "vim", "%").unwrap(),
            ["gvim", "vim", "vim-airline"]
        );
        assert_eq!(
            store.get_packages(Some("c1"), None, "^vim", "%").unwrap(),
            ["vim", "vim-airline"]
        );
        assert_eq!(
            store.get_packages(Some("c1"), None, ".*", "optional(%").unwrap(),
            ["gvim"]
        );
        assert_eq!(store.get_packages(Some("c1"), None, ".*", "").unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_distinct_keys_both_land() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_path_buf();
        open_store(&path); // create schema first
        let mut handles = Vec::new();
        for (container, package) in [("a", "zsh"), ("b", "fish")] {
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                let mut store = StateStore::open(&path.join("state.db")).unwrap();
                store
                    .register_package(container, package, "", &[], "")
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let store = open_store(&path);
        assert_eq!(
            store.get_packages(None, None, ".*", "%").unwrap(),
            ["fish", "zsh"]
        );
    }

    #[test]
    fn test_concurrent_same_key_serializes() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_path_buf();
        open_store(&path);
        let mut handles = Vec::new();
        for copies in ["/one", "/two"] {
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                let mut store = StateStore::open(&path.join("state.db")).unwrap();
                store
                    .register_package("a", "git", "", &[copies.to_string()], "")
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // exactly one row survives, holding one writer's values intact
        let mut store = open_store(&path);
        assert_eq!(store.get_packages(Some("a"), None, ".*", "%").unwrap(), ["git"]);
        let copies = store.unregister_package("a", "git", "").unwrap();
        assert!(copies == ["/one"] || copies == ["/two"]);
    }
}
