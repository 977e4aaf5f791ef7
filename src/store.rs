//! The persistent track/preference/user store, kept in SQLite.
//!
//! Tracks are keyed by absolute path under a collection root. Preferences
//! are `(track, name, value)` rows; a handful of names are reserved and feed
//! the random chooser and the display-name machinery. Users carry salted
//! password hashes and a rights string.

use std::collections::BTreeSet;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::Result;
use color_eyre::eyre::{Context, eyre};
use itertools::Itertools;
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::config::Config;
use crate::rights::Rights;
use crate::trackname::NameParts;

mod search;

/// Default weight of a track in the random draw.
pub const DEFAULT_WEIGHT: u64 = 90_000;
/// Weights above this are clamped; a single track should not be able to
/// dwarf the whole library.
pub const MAX_WEIGHT: u64 = 0x7fff_ffff;

pub struct Store {
    db: Connection,
    nameparts: NameParts,
    stopwords: BTreeSet<String>,
    alias_pattern: String,
    collections: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    /// Stored as-is: challenge/response auth needs the server to know the
    /// secret itself, so the database file's permissions are the guard.
    pub password: String,
    pub email: Option<String>,
    pub confirmation: Option<String>,
    pub rights: Rights,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tracks (
        path    TEXT PRIMARY KEY,
        added   INTEGER NOT NULL,
        length  INTEGER,
        present INTEGER NOT NULL DEFAULT 1
    );
    CREATE TABLE IF NOT EXISTS prefs (
        track   TEXT NOT NULL,
        name    TEXT NOT NULL,
        value   TEXT NOT NULL,
        PRIMARY KEY (track, name)
    );
    CREATE TABLE IF NOT EXISTS global_prefs (
        name    TEXT PRIMARY KEY,
        value   TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS users (
        name         TEXT PRIMARY KEY,
        password     TEXT NOT NULL,
        email        TEXT,
        confirmation TEXT,
        rights       TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS aliases (
        alias   TEXT PRIMARY KEY,
        track   TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS words (
        word    TEXT NOT NULL,
        track   TEXT NOT NULL,
        PRIMARY KEY (word, track)
    );
";

impl Store {
    pub fn open(path: &Path, config: &Config) -> Result<Store> {
        let db = Connection::open(path)
            .wrap_err_with(|| format!("could not open database {}", path.display()))?;
        Self::with_connection(db, config)
    }

    #[cfg(test)]
    pub fn open_in_memory(config: &Config) -> Result<Store> {
        Self::with_connection(Connection::open_in_memory()?, config)
    }

    fn with_connection(db: Connection, config: &Config) -> Result<Store> {
        db.execute_batch(SCHEMA).wrap_err("could not apply schema")?;
        Ok(Store {
            db,
            nameparts: NameParts::new(&config.namepart)?,
            stopwords: config.stopwords.iter().cloned().collect(),
            alias_pattern: config.alias.clone(),
            collections: config.collections.clone(),
        })
    }

    // Tracks ----------------------------------------------------------------

    pub fn exists(&self, track: &str) -> Result<bool> {
        Ok(self
            .db
            .query_row(
                "SELECT 1 FROM tracks WHERE path = ?1 AND present = 1",
                [track],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    /// Map a name (real path or alias) to the real track path.
    pub fn resolve(&self, name: &str) -> Result<Option<String>> {
        if self.exists(name)? {
            return Ok(Some(name.to_owned()));
        }
        Ok(self
            .db
            .query_row("SELECT track FROM aliases WHERE alias = ?1", [name], |row| {
                row.get(0)
            })
            .optional()?)
    }

    /// Register a track (or mark a known one present again). Returns whether
    /// it was new.
    pub fn notice(&mut self, track: &str, now: i64) -> Result<bool> {
        let updated = self.db.execute(
            "UPDATE tracks SET present = 1 WHERE path = ?1",
            [track],
        )?;
        if updated > 0 {
            return Ok(false);
        }
        self.db.execute(
            "INSERT INTO tracks (path, added, present) VALUES (?1, ?2, 1)",
            params![track, now],
        )?;
        self.reindex(track)?;
        Ok(true)
    }

    /// Mark every track absent; a rescan then notices the ones still there.
    pub fn begin_rescan(&mut self) -> Result<()> {
        self.db.execute("UPDATE tracks SET present = 0", [])?;
        Ok(())
    }

    pub fn track_count(&self) -> Result<u64> {
        Ok(self
            .db
            .query_row("SELECT COUNT(*) FROM tracks WHERE present = 1", [], |row| {
                row.get(0)
            })?)
    }

    /// Candidates for the random chooser: every present track with its added
    /// time and effective weight, minus the opted-out.
    pub fn random_candidates(&self) -> Result<Vec<(Utf8PathBuf, i64, u64)>> {
        let mut stmt = self.db.prepare(
            "SELECT t.path, t.added,
                    (SELECT value FROM prefs p
                      WHERE p.track = t.path AND p.name = 'pick_at_random'),
                    (SELECT value FROM prefs p
                      WHERE p.track = t.path AND p.name = 'weight')
               FROM tracks t WHERE t.present = 1",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (path, added, pick, weight) = row?;
            if pick.as_deref() == Some("0") {
                continue;
            }
            let weight = weight
                .and_then(|w| w.parse::<u64>().ok())
                .unwrap_or(DEFAULT_WEIGHT)
                .clamp(1, MAX_WEIGHT);
            out.push((Utf8PathBuf::from(path), added, weight));
        }
        Ok(out)
    }

    pub fn length(&self, track: &str) -> Result<Option<i64>> {
        Ok(self
            .db
            .query_row(
                "SELECT length FROM tracks WHERE path = ?1",
                [track],
                |row| row.get(0),
            )
            .optional()?
            .flatten())
    }

    pub fn set_length(&mut self, track: &str, length: i64) -> Result<()> {
        self.db.execute(
            "UPDATE tracks SET length = ?2 WHERE path = ?1",
            params![track, length],
        )?;
        Ok(())
    }

    /// Tracks added within the last `max_age` seconds, newest first.
    pub fn new_tracks(&self, now: i64, max_age: i64) -> Result<Vec<String>> {
        let mut stmt = self.db.prepare(
            "SELECT path FROM tracks
              WHERE present = 1 AND added >= ?1 ORDER BY added DESC",
        )?;
        let rows = stmt.query_map([now - max_age], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // Preferences -----------------------------------------------------------

    /// The value the server computes when no row is stored. Storing exactly
    /// this value deletes the row instead.
    fn default_pref(&self, track: &str, name: &str) -> Option<String> {
        match name {
            "weight" => Some(DEFAULT_WEIGHT.to_string()),
            "pick_at_random" => Some("1".to_string()),
            _ => name.strip_prefix("trackname_").and_then(|rest| {
                let (context, part) = rest.split_once('_')?;
                Some(self.nameparts.part(track, context, part))
            }),
        }
    }

    pub fn get_pref(&self, track: &str, name: &str) -> Result<Option<String>> {
        let stored = self
            .db
            .query_row(
                "SELECT value FROM prefs WHERE track = ?1 AND name = ?2",
                [track, name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stored.or_else(|| self.default_pref(track, name)))
    }

    pub fn set_pref(&mut self, track: &str, name: &str, value: &str) -> Result<()> {
        if self.default_pref(track, name).as_deref() == Some(value) {
            self.db.execute(
                "DELETE FROM prefs WHERE track = ?1 AND name = ?2",
                [track, name],
            )?;
        } else {
            self.db.execute(
                "INSERT INTO prefs (track, name, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT (track, name) DO UPDATE SET value = ?3",
                params![track, name, value],
            )?;
        }
        self.reindex(track)?;
        Ok(())
    }

    pub fn unset_pref(&mut self, track: &str, name: &str) -> Result<()> {
        self.db.execute(
            "DELETE FROM prefs WHERE track = ?1 AND name = ?2",
            [track, name],
        )?;
        self.reindex(track)?;
        Ok(())
    }

    pub fn prefs(&self, track: &str) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .db
            .prepare("SELECT name, value FROM prefs WHERE track = ?1 ORDER BY name")?;
        let rows = stmt.query_map([track], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn get_global(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .db
            .query_row(
                "SELECT value FROM global_prefs WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_global(&mut self, name: &str, value: &str) -> Result<()> {
        self.db.execute(
            "INSERT INTO global_prefs (name, value) VALUES (?1, ?2)
             ON CONFLICT (name) DO UPDATE SET value = ?2",
            params![name, value],
        )?;
        Ok(())
    }

    pub fn unset_global(&mut self, name: &str) -> Result<()> {
        self.db
            .execute("DELETE FROM global_prefs WHERE name = ?1", [name])?;
        Ok(())
    }

    // Names, tags, search ---------------------------------------------------

    /// Display or sort string for one part of a track name. A stored
    /// `trackname_CONTEXT_PART` preference overrides the computed value.
    pub fn part(&self, track: &str, context: &str, part: &str) -> Result<String> {
        let pref = format!("trackname_{context}_{part}");
        if let Some(value) = self
            .db
            .query_row(
                "SELECT value FROM prefs WHERE track = ?1 AND name = ?2",
                [track, pref.as_str()],
                |row| row.get(0),
            )
            .optional()?
        {
            return Ok(value);
        }
        Ok(self.nameparts.part(track, context, part))
    }

    pub fn track_tags(&self, track: &str) -> Result<Vec<String>> {
        let raw = self.get_pref(track, "tags")?.unwrap_or_default();
        Ok(split_tags(&raw))
    }

    /// Every tag in use, sorted.
    pub fn tags(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .db
            .prepare("SELECT value FROM prefs WHERE name = 'tags'")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut tags = BTreeSet::new();
        for row in rows {
            tags.extend(split_tags(&row?));
        }
        Ok(tags.into_iter().collect())
    }

    pub fn search(&self, terms: &[String]) -> Result<Vec<String>> {
        search::search(self, terms)
    }

    fn reindex(&mut self, track: &str) -> Result<()> {
        search::reindex(self, track)?;
        self.refresh_alias(track)
    }

    // Directory listings ----------------------------------------------------

    pub fn files(&self, dir: &str, filter: Option<&Regex>) -> Result<Vec<String>> {
        self.list_children(dir, filter, false)
    }

    pub fn dirs(&self, dir: &str, filter: Option<&Regex>) -> Result<Vec<String>> {
        self.list_children(dir, filter, true)
    }

    pub fn allfiles(&self, dir: &str, filter: Option<&Regex>) -> Result<Vec<String>> {
        let mut out = self.list_children(dir, filter, true)?;
        out.extend(self.list_children(dir, filter, false)?);
        out.sort();
        Ok(out)
    }

    fn list_children(&self, dir: &str, filter: Option<&Regex>, want_dirs: bool) -> Result<Vec<String>> {
        let prefix = if dir.is_empty() || dir.ends_with('/') {
            dir.to_owned()
        } else {
            format!("{dir}/")
        };
        let mut stmt = self.db.prepare(
            "SELECT path FROM tracks WHERE present = 1 AND path LIKE ?1 || '%'
             UNION SELECT alias FROM aliases WHERE alias LIKE ?1 || '%'",
        )?;
        let rows = stmt.query_map([&prefix], |row| row.get::<_, String>(0))?;
        let mut out = BTreeSet::new();
        for row in rows {
            let path = row?;
            let rest = &path[prefix.len()..];
            let (child, is_dir) = match rest.split_once('/') {
                Some((first, _)) => (first, true),
                None => (rest, false),
            };
            if child.is_empty() || is_dir != want_dirs {
                continue;
            }
            if let Some(rx) = filter
                && !rx.is_match(child)
            {
                continue;
            }
            out.insert(format!("{prefix}{child}"));
        }
        Ok(out.into_iter().collect())
    }

    // Aliases ---------------------------------------------------------------

    /// Recompute the alias for a track after its prefs changed. An alias only
    /// exists while some trackname_display_* preference is stored.
    fn refresh_alias(&mut self, track: &str) -> Result<()> {
        self.db
            .execute("DELETE FROM aliases WHERE track = ?1", [track])?;
        let overridden: u64 = self.db.query_row(
            "SELECT COUNT(*) FROM prefs
              WHERE track = ?1 AND name LIKE 'trackname_display_%'",
            [track],
            |row| row.get(0),
        )?;
        if overridden == 0 {
            return Ok(());
        }
        let Some(root) = self
            .collections
            .iter()
            .find(|root| Utf8Path::new(track).starts_with(root))
        else {
            debug!("no collection root for {track}, not aliasing");
            return Ok(());
        };
        let mut alias = self.alias_pattern.clone();
        for part in ["artist", "album", "title", "ext"] {
            let value = self.part(track, "display", part)?;
            alias = alias.replace(&format!("{{{part}}}"), &value);
        }
        let alias = root.join(alias);
        self.db.execute(
            "INSERT OR REPLACE INTO aliases (alias, track) VALUES (?1, ?2)",
            params![alias.as_str(), track],
        )?;
        Ok(())
    }

    // Users -----------------------------------------------------------------

    pub fn create_user(
        &mut self,
        name: &str,
        password: &str,
        email: Option<&str>,
        rights: Rights,
        confirmation: Option<&str>,
    ) -> Result<()> {
        if self.get_user(name)?.is_some() {
            return Err(eyre!("user {name:?} already exists"));
        }
        self.db.execute(
            "INSERT INTO users (name, password, email, confirmation, rights)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, password, email, confirmation, rights.to_string()],
        )?;
        info!("created user {name}");
        Ok(())
    }

    pub fn get_user(&self, name: &str) -> Result<Option<User>> {
        Ok(self
            .db
            .query_row(
                "SELECT name, password, email, confirmation, rights
                   FROM users WHERE name = ?1",
                [name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?
            .map(|(name, password, email, confirmation, rights)| {
                Ok::<_, color_eyre::Report>(User {
                    name,
                    password,
                    email,
                    confirmation,
                    rights: rights
                        .parse()
                        .wrap_err("corrupt rights string in users table")?,
                })
            })
            .transpose()?)
    }

    /// Find the unconfirmed user carrying this confirmation string.
    pub fn find_confirmation(&self, nonce: &str) -> Result<Option<String>> {
        Ok(self
            .db
            .query_row(
                "SELECT name FROM users WHERE confirmation = ?1",
                [nonce],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn users(&self) -> Result<Vec<String>> {
        let mut stmt = self.db.prepare("SELECT name FROM users ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn delete_user(&mut self, name: &str) -> Result<bool> {
        Ok(self.db.execute("DELETE FROM users WHERE name = ?1", [name])? > 0)
    }

    pub fn set_user_password(&mut self, name: &str, password: &str) -> Result<()> {
        self.db.execute(
            "UPDATE users SET password = ?2 WHERE name = ?1",
            params![name, password],
        )?;
        Ok(())
    }

    pub fn set_user_email(&mut self, name: &str, email: &str) -> Result<()> {
        self.db.execute(
            "UPDATE users SET email = ?2 WHERE name = ?1",
            params![name, email],
        )?;
        Ok(())
    }

    pub fn set_user_rights(&mut self, name: &str, rights: Rights) -> Result<()> {
        self.db.execute(
            "UPDATE users SET rights = ?2 WHERE name = ?1",
            params![name, rights.to_string()],
        )?;
        Ok(())
    }

    /// Consume a confirmation nonce; returns false if it does not match.
    pub fn confirm_user(&mut self, name: &str, nonce: &str, rights: Rights) -> Result<bool> {
        let changed = self.db.execute(
            "UPDATE users SET confirmation = NULL, rights = ?3
              WHERE name = ?1 AND confirmation = ?2",
            params![name, nonce, rights.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Body of the `stats` command, one counter per line.
    pub fn stats(&self) -> Result<Vec<String>> {
        let count = |sql: &str| -> Result<u64> {
            Ok(self.db.query_row(sql, [], |row| row.get(0))?)
        };
        Ok(vec![
            format!("tracks: {}", self.track_count()?),
            format!("prefs: {}", count("SELECT COUNT(*) FROM prefs")?),
            format!("users: {}", count("SELECT COUNT(*) FROM users")?),
            format!("aliases: {}", count("SELECT COUNT(*) FROM aliases")?),
            format!("search words: {}", count("SELECT COUNT(DISTINCT word) FROM words")?),
        ])
    }

    pub(crate) fn db(&self) -> &Connection {
        &self.db
    }

    pub(crate) fn stopwords(&self) -> &BTreeSet<String> {
        &self.stopwords
    }
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .dedup()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use pretty_assertions::assert_eq;

    fn store() -> Store {
        let config = Config {
            collections: vec!["/m".into()],
            ..Config::default()
        };
        let mut s = Store::open_in_memory(&config).unwrap();
        for track in [
            "/m/Pink Floyd/Meddle/05 Seamus.ogg",
            "/m/Pink Floyd/Meddle/01 One of These Days.ogg",
            "/m/Orbital/Orbital 2/01 Planet of the Shapes.ogg",
        ] {
            s.notice(track, 1000).unwrap();
        }
        s
    }

    #[test]
    fn notice_is_idempotent() {
        let mut s = store();
        assert!(!s.notice("/m/Pink Floyd/Meddle/05 Seamus.ogg", 2000).unwrap());
        assert_eq!(s.track_count().unwrap(), 3);
        assert!(s.exists("/m/Pink Floyd/Meddle/05 Seamus.ogg").unwrap());
        assert!(!s.exists("/m/nope.ogg").unwrap());
    }

    #[test]
    fn prefs_with_computed_defaults() {
        let mut s = store();
        let track = "/m/Pink Floyd/Meddle/05 Seamus.ogg";
        assert_eq!(s.get_pref(track, "weight").unwrap().unwrap(), "90000");
        s.set_pref(track, "weight", "100").unwrap();
        assert_eq!(s.get_pref(track, "weight").unwrap().unwrap(), "100");
        // setting the default back removes the row
        s.set_pref(track, "weight", "90000").unwrap();
        assert_eq!(s.prefs(track).unwrap(), vec![]);
        // computed trackname default
        assert_eq!(
            s.get_pref(track, "trackname_display_title").unwrap().unwrap(),
            "Seamus"
        );
    }

    #[test]
    fn pick_at_random_opts_out() {
        let mut s = store();
        let track = "/m/Orbital/Orbital 2/01 Planet of the Shapes.ogg";
        s.set_pref(track, "pick_at_random", "0").unwrap();
        let candidates = s.random_candidates().unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|(p, _, _)| p != track));
        assert!(candidates.iter().all(|(_, _, w)| *w == DEFAULT_WEIGHT));
    }

    #[test]
    fn tags_accumulate() {
        let mut s = store();
        s.set_pref("/m/Pink Floyd/Meddle/05 Seamus.ogg", "tags", "dogs, rock")
            .unwrap();
        s.set_pref(
            "/m/Orbital/Orbital 2/01 Planet of the Shapes.ogg",
            "tags",
            "electronic,rock",
        )
        .unwrap();
        assert_eq!(s.tags().unwrap(), ["dogs", "electronic", "rock"]);
    }

    #[test]
    fn listing_files_and_dirs() {
        let s = store();
        assert_eq!(
            s.dirs("/m", None).unwrap(),
            ["/m/Orbital", "/m/Pink Floyd"]
        );
        assert_eq!(
            s.files("/m/Pink Floyd/Meddle", None).unwrap(),
            [
                "/m/Pink Floyd/Meddle/01 One of These Days.ogg",
                "/m/Pink Floyd/Meddle/05 Seamus.ogg"
            ]
        );
        let rx = Regex::new("Seamus").unwrap();
        assert_eq!(
            s.files("/m/Pink Floyd/Meddle", Some(&rx)).unwrap(),
            ["/m/Pink Floyd/Meddle/05 Seamus.ogg"]
        );
    }

    #[test]
    fn aliases_follow_display_prefs() {
        let mut s = store();
        let track = "/m/Pink Floyd/Meddle/05 Seamus.ogg";
        s.set_pref(track, "trackname_display_title", "Seamus (The Dog Song)")
            .unwrap();
        let resolved = s
            .resolve("/m/Pink Floyd/Meddle/Seamus (The Dog Song).ogg")
            .unwrap();
        assert_eq!(resolved.as_deref(), Some(track));
        // dropping the pref drops the alias
        s.unset_pref(track, "trackname_display_title").unwrap();
        assert_eq!(
            s.resolve("/m/Pink Floyd/Meddle/Seamus (The Dog Song).ogg")
                .unwrap(),
            None
        );
    }

    #[test]
    fn users_round_trip() {
        let mut s = store();
        s.create_user("alice", "sesame", Some("a@example.com"), Rights::default_user(), None)
            .unwrap();
        assert!(s.get_user("nobody").unwrap().is_none());
        let user = s.get_user("alice").unwrap().unwrap();
        assert_eq!(user.password, "sesame");
        assert_eq!(user.rights, Rights::default_user());
        assert_eq!(user.email.as_deref(), Some("a@example.com"));
        s.set_user_password("alice", "newpw").unwrap();
        assert_eq!(s.get_user("alice").unwrap().unwrap().password, "newpw");

        s.set_user_rights("alice", Rights::all()).unwrap();
        assert_eq!(s.get_user("alice").unwrap().unwrap().rights, Rights::all());
        assert_eq!(s.users().unwrap(), ["alice"]);
        assert!(s.delete_user("alice").unwrap());
        assert!(!s.delete_user("alice").unwrap());
    }

    #[test]
    fn confirmation_consumes_the_nonce() {
        let mut s = store();
        s.create_user("bob", "pw", None, Rights::unconfirmed(), Some("n0nce"))
            .unwrap();
        assert!(!s.confirm_user("bob", "wrong", Rights::default_user()).unwrap());
        assert!(s.confirm_user("bob", "n0nce", Rights::default_user()).unwrap());
        let bob = s.get_user("bob").unwrap().unwrap();
        assert_eq!(bob.confirmation, None);
        assert_eq!(bob.rights, Rights::default_user());
        // a second confirm finds nothing to consume
        assert!(!s.confirm_user("bob", "n0nce", Rights::default_user()).unwrap());
    }
}
