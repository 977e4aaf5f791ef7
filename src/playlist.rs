//! Named playlists, distinct from the queue. A playlist is either shared
//! (`NAME`) or owned (`USER.NAME`); owned ones default to private. Writing
//! requires the advisory per-connection lock, so a web client editing a list
//! does not interleave with somebody else's edit.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use camino::Utf8PathBuf;
use color_eyre::Result;
use color_eyre::eyre::{Context, eyre};
use strum::{Display, EnumString};
use tracing::warn;

use crate::queue::write_atomically;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default)]
#[strum(serialize_all = "lowercase")]
pub enum Share {
    /// Anybody may read, only the owner writes.
    Public,
    /// Owner only.
    #[default]
    Private,
    /// No owner; anybody may read or write.
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Playlist {
    pub tracks: Vec<Utf8PathBuf>,
    pub share: Share,
}

struct Lock {
    conn: u64,
    taken: i64,
}

pub struct Playlists {
    dir: PathBuf,
    lists: HashMap<String, Playlist>,
    locks: HashMap<String, Lock>,
    max_len: usize,
    /// Seconds before an abandoned lock may be stolen.
    lock_timeout: i64,
}

/// The owner baked into a playlist name, if any.
pub fn owner(name: &str) -> Option<&str> {
    name.split_once('.').map(|(owner, _)| owner)
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && !name.starts_with('.')
        && !name.ends_with('.')
        && name.chars().all(|c| !c.is_control())
}

impl Playlists {
    pub fn load(dir: &Path, max_len: usize, lock_timeout: i64) -> Result<Playlists> {
        fs::create_dir_all(dir)
            .wrap_err_with(|| format!("could not create playlist dir {}", dir.display()))?;
        let mut lists = HashMap::new();
        for entry in fs::read_dir(dir).wrap_err("could not read playlist dir")? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match load_file(&entry.path()) {
                Ok(playlist) => {
                    lists.insert(name, playlist);
                }
                Err(e) => warn!("skipping unreadable playlist {name:?}: {e:#}"),
            }
        }
        Ok(Playlists {
            dir: dir.to_owned(),
            lists,
            locks: HashMap::new(),
            max_len,
            lock_timeout,
        })
    }

    /// Playlists `user` may read, sorted.
    pub fn visible(&self, user: &str, is_admin: bool) -> Vec<String> {
        let mut names: Vec<_> = self
            .lists
            .iter()
            .filter(|(name, list)| is_admin || readable(name, list.share, user))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str, user: &str, is_admin: bool) -> Result<&Playlist> {
        let list = self
            .lists
            .get(name)
            .ok_or_else(|| eyre!("no such playlist {name:?}"))?;
        if !is_admin && !readable(name, list.share, user) {
            return Err(eyre!("playlist {name:?} is private"));
        }
        Ok(list)
    }

    /// Replace a playlist's contents. The caller must hold the lock on
    /// `name`; the playlist is created if absent.
    pub fn set(
        &mut self,
        name: &str,
        user: &str,
        conn: u64,
        tracks: Vec<Utf8PathBuf>,
    ) -> Result<()> {
        if !valid_name(name) {
            return Err(eyre!("bad playlist name {name:?}"));
        }
        if !self.holds_lock(name, conn) {
            return Err(eyre!("playlist {name:?} is not locked by this connection"));
        }
        if !writable(name, self.lists.get(name).map(|l| l.share), user) {
            return Err(eyre!("playlist {name:?} belongs to somebody else"));
        }
        if tracks.len() > self.max_len {
            return Err(eyre!(
                "playlist too long ({} > {})",
                tracks.len(),
                self.max_len
            ));
        }
        let share = match self.lists.get(name) {
            Some(existing) => existing.share,
            None if owner(name).is_some() => Share::Private,
            None => Share::Shared,
        };
        let playlist = Playlist { tracks, share };
        save_file(&self.dir.join(name), &playlist)?;
        self.lists.insert(name.to_owned(), playlist);
        Ok(())
    }

    pub fn share_of(&self, name: &str, user: &str, is_admin: bool) -> Result<Share> {
        let list = self
            .lists
            .get(name)
            .ok_or_else(|| eyre!("no such playlist {name:?}"))?;
        if !is_admin && owner(name).is_some_and(|o| o != user) {
            return Err(eyre!("playlist {name:?} belongs to somebody else"));
        }
        Ok(list.share)
    }

    pub fn set_share(&mut self, name: &str, user: &str, is_admin: bool, share: Share) -> Result<()> {
        if !is_admin && owner(name).is_some_and(|o| o != user) {
            return Err(eyre!("playlist {name:?} belongs to somebody else"));
        }
        let list = self
            .lists
            .get_mut(name)
            .ok_or_else(|| eyre!("no such playlist {name:?}"))?;
        list.share = share;
        save_file(&self.dir.join(name), list)?;
        Ok(())
    }

    pub fn delete(&mut self, name: &str, user: &str, is_admin: bool) -> Result<()> {
        if !self.lists.contains_key(name) {
            return Err(eyre!("no such playlist {name:?}"));
        }
        if !is_admin && !writable(name, self.lists.get(name).map(|l| l.share), user) {
            return Err(eyre!("playlist {name:?} belongs to somebody else"));
        }
        self.lists.remove(name);
        self.locks.remove(name);
        match fs::remove_file(self.dir.join(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).wrap_err("could not delete playlist file"),
        }
    }

    // Locks ----------------------------------------------------------------

    /// Take the advisory lock on `name`. Fails if this connection already
    /// holds a lock or the name is locked and the holder's lock has not yet
    /// timed out.
    pub fn lock(&mut self, name: &str, conn: u64, now: i64) -> Result<()> {
        if !valid_name(name) {
            return Err(eyre!("bad playlist name {name:?}"));
        }
        if self.locks.values().any(|l| l.conn == conn) {
            return Err(eyre!("this connection already holds a playlist lock"));
        }
        if let Some(held) = self.locks.get(name)
            && held.conn != conn
            && now - held.taken < self.lock_timeout
        {
            return Err(eyre!("playlist {name:?} is locked"));
        }
        self.locks.insert(name.to_owned(), Lock { conn, taken: now });
        Ok(())
    }

    pub fn unlock(&mut self, conn: u64) -> Result<()> {
        let before = self.locks.len();
        self.locks.retain(|_, l| l.conn != conn);
        if self.locks.len() == before {
            return Err(eyre!("this connection holds no playlist lock"));
        }
        Ok(())
    }

    /// Dropped connections release their lock implicitly.
    pub fn release_conn(&mut self, conn: u64) {
        self.locks.retain(|_, l| l.conn != conn);
    }

    pub fn holds_lock(&self, name: &str, conn: u64) -> bool {
        self.locks.get(name).is_some_and(|l| l.conn == conn)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.lists.contains_key(name)
    }

    /// Whether `user` may replace or delete this playlist.
    pub fn writable_by(&self, name: &str, user: &str) -> bool {
        writable(name, self.lists.get(name).map(|l| l.share), user)
    }
}

fn readable(name: &str, share: Share, user: &str) -> bool {
    match share {
        Share::Shared | Share::Public => true,
        Share::Private => owner(name).is_none_or(|o| o == user),
    }
}

fn writable(name: &str, share: Option<Share>, user: &str) -> bool {
    match owner(name) {
        Some(o) => o == user,
        None => share.is_none_or(|s| s == Share::Shared),
    }
}

fn load_file(path: &Path) -> Result<Playlist> {
    let text = fs::read_to_string(path)
        .wrap_err_with(|| format!("could not read playlist {}", path.display()))?;
    let mut share = Share::default();
    let mut tracks = Vec::new();
    for line in text.lines() {
        if let Some(s) = line.strip_prefix("#share=") {
            share = s.parse().map_err(|_| eyre!("bad share {s:?}"))?;
        } else if !line.is_empty() {
            tracks.push(Utf8PathBuf::from(line));
        }
    }
    Ok(Playlist { tracks, share })
}

fn save_file(path: &Path, playlist: &Playlist) -> Result<()> {
    let header = std::iter::once(format!("#share={}", playlist.share));
    let lines = header.chain(playlist.tracks.iter().map(|t| t.to_string()));
    write_atomically(path, lines)
}
