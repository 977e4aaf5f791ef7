//! The play queue and recently-played history.
//!
//! Entries move `unplayed`/`random` → `started` → a terminal state and are
//! then archived to the bounded history. The queue itself is dumb about
//! rights and events; the system layer checks the former and raises the
//! latter after each mutation has been committed.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::path::Path;

use camino::Utf8PathBuf;
use color_eyre::Result;
use color_eyre::eyre::{Context, eyre};
use rand::RngCore;
use strum::{Display, EnumString};
use tracing::warn;

use crate::protocol::{quote, split};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default)]
#[strum(serialize_all = "snake_case")]
pub enum PlayState {
    /// Waiting in the queue, user-picked.
    #[default]
    Unplayed,
    /// Waiting in the queue, picked by the random chooser.
    Random,
    /// Being played right now.
    Started,
    /// Being played but paused.
    Paused,
    /// Terminated early by a user.
    Scratched,
    /// The decoder exited nonzero.
    Failed,
    /// No player matched the track.
    NoPlayer,
    /// Played to completion.
    Ok,
    /// The server shut down mid-play.
    Quitting,
    /// This entry *is* the scratch sound.
    Isscratch,
}

impl PlayState {
    pub fn terminal(self) -> bool {
        use PlayState::*;
        matches!(self, Scratched | Failed | NoPlayer | Ok)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default)]
#[strum(serialize_all = "lowercase")]
pub enum Origin {
    /// A user chose it.
    #[default]
    Picked,
    /// A scheduled action inserted it.
    Scheduled,
    /// The random chooser filled a gap with it.
    Random,
    /// A random pick a user subsequently claimed.
    Adopted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// Opaque server-assigned id, unique across queue and history.
    pub id: String,
    /// Resolved real track path.
    pub track: Utf8PathBuf,
    /// Who queued it; absent for random picks.
    pub submitter: Option<String>,
    /// When it was queued (unix seconds).
    pub when: Option<i64>,
    /// When play first started.
    pub played: Option<i64>,
    pub state: PlayState,
    /// Who scratched it, if anybody.
    pub scratched: Option<String>,
    /// Decoder exit status, once terminal.
    pub wstat: Option<i32>,
    /// Seconds of audio already delivered.
    pub sofar: Option<i64>,
    /// Projected start time for waiting entries.
    pub expected: Option<i64>,
    pub origin: Origin,
}

impl QueueEntry {
    pub fn new(id: String, track: Utf8PathBuf, origin: Origin) -> Self {
        QueueEntry {
            id,
            track,
            submitter: None,
            when: None,
            played: None,
            state: if origin == Origin::Random {
                PlayState::Random
            } else {
                PlayState::Unplayed
            },
            scratched: None,
            wstat: None,
            sofar: None,
            expected: None,
            origin,
        }
    }

    /// One `key=value` line, values quoted, suitable for the queue file and
    /// for `queue`/`recent_added` events.
    pub fn marshal(&self) -> String {
        let mut pairs: Vec<String> = Vec::new();
        let mut push = |key: &str, value: &str| pairs.push(quote(&format!("{key}={value}")));
        push("track", self.track.as_str());
        push("id", &self.id);
        if let Some(s) = &self.submitter {
            push("submitter", s);
        }
        if let Some(t) = self.when {
            push("when", &t.to_string());
        }
        if let Some(t) = self.played {
            push("played", &t.to_string());
        }
        push("state", &self.state.to_string());
        if let Some(who) = &self.scratched {
            push("scratched", who);
        }
        if let Some(w) = self.wstat {
            push("wstat", &w.to_string());
        }
        if let Some(s) = self.sofar {
            push("sofar", &s.to_string());
        }
        if let Some(e) = self.expected {
            push("expected", &e.to_string());
        }
        push("origin", &self.origin.to_string());
        pairs.join(" ")
    }

    /// Parse one marshalled line. Unknown keys are tolerated so old servers'
    /// state files still load.
    pub fn unmarshal(line: &str) -> Result<QueueEntry> {
        let mut entry = QueueEntry::new(String::new(), Utf8PathBuf::new(), Origin::Picked);
        for token in split(line).wrap_err("malformed queue entry")? {
            let (key, value) = token
                .split_once('=')
                .ok_or_else(|| eyre!("queue entry field without '=': {token:?}"))?;
            match key {
                "track" => entry.track = value.into(),
                "id" => entry.id = value.to_owned(),
                "submitter" => entry.submitter = Some(value.to_owned()),
                "when" => entry.when = Some(value.parse().wrap_err("bad when")?),
                "played" => entry.played = Some(value.parse().wrap_err("bad played")?),
                "state" => entry.state = value.parse().map_err(|_| eyre!("bad state {value:?}"))?,
                "scratched" => entry.scratched = Some(value.to_owned()),
                "wstat" => entry.wstat = Some(value.parse().wrap_err("bad wstat")?),
                "sofar" => entry.sofar = Some(value.parse().wrap_err("bad sofar")?),
                "expected" => entry.expected = Some(value.parse().wrap_err("bad expected")?),
                "origin" => {
                    entry.origin = value.parse().map_err(|_| eyre!("bad origin {value:?}"))?
                }
                other => warn!("ignoring unknown queue entry key {other:?}"),
            }
        }
        if entry.id.is_empty() || entry.track.as_str().is_empty() {
            return Err(eyre!("queue entry missing id or track: {line:?}"));
        }
        Ok(entry)
    }
}

impl fmt::Display for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.marshal())
    }
}

/// Where to insert a new entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Where {
    /// Head of the queue (scratch sounds).
    Start,
    /// Absolute tail (random fill-in).
    End,
    /// Tail, but ahead of the trailing run of random picks, so user choices
    /// play before fill-in.
    BeforeRandom,
}

pub struct Queue {
    /// The at-most-one entry in `started`/`paused`.
    playing: Option<QueueEntry>,
    /// Pending entries, head played next.
    entries: VecDeque<QueueEntry>,
    /// Terminal entries, oldest first.
    recent: VecDeque<QueueEntry>,
    /// History bound; the oldest entry is discarded past it.
    history: usize,
    /// Every id handed out this lifetime; ids are never reused.
    used_ids: HashSet<String>,
}

impl Queue {
    pub fn new(history: usize) -> Queue {
        Queue {
            playing: None,
            entries: VecDeque::new(),
            recent: VecDeque::new(),
            history,
            used_ids: HashSet::new(),
        }
    }

    pub fn fresh_id(&mut self) -> String {
        loop {
            let mut raw = [0u8; 8];
            rand::rng().fill_bytes(&mut raw);
            let id = hex::encode(raw);
            if self.used_ids.insert(id.clone()) {
                return id;
            }
        }
    }

    pub fn playing(&self) -> Option<&QueueEntry> {
        self.playing.as_ref()
    }

    pub fn playing_mut(&mut self) -> Option<&mut QueueEntry> {
        self.playing.as_mut()
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    pub fn recent(&self) -> impl Iterator<Item = &QueueEntry> {
        self.recent.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look an entry up by id, the playing slot included.
    pub fn find(&self, id: &str) -> Option<&QueueEntry> {
        self.playing
            .iter()
            .chain(self.entries.iter())
            .find(|e| e.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut QueueEntry> {
        self.playing
            .iter_mut()
            .chain(self.entries.iter_mut())
            .find(|e| e.id == id)
    }

    pub fn add(&mut self, mut entry: QueueEntry, place: Where, now: i64) -> &QueueEntry {
        entry.when = Some(now);
        self.used_ids.insert(entry.id.clone());
        let at = match place {
            Where::Start => 0,
            Where::End => self.entries.len(),
            Where::BeforeRandom => {
                let mut at = self.entries.len();
                while at > 0 && self.entries[at - 1].state == PlayState::Random {
                    at -= 1;
                }
                at
            }
        };
        self.entries.insert(at, entry);
        &self.entries[at]
    }

    /// Splice after the entry with id `target`, or at the head if `None`.
    pub fn insert_after(&mut self, target: Option<&str>, mut entry: QueueEntry, now: i64) -> Result<String> {
        let at = match target {
            None => 0,
            Some(id) => {
                self.entries
                    .iter()
                    .position(|e| e.id == id)
                    .ok_or_else(|| eyre!("no such queue entry {id:?}"))?
                    + 1
            }
        };
        entry.when = Some(now);
        self.used_ids.insert(entry.id.clone());
        self.entries.insert(at, entry);
        Ok(self.entries[at].id.clone())
    }

    pub fn remove(&mut self, id: &str) -> Option<QueueEntry> {
        let at = self.entries.iter().position(|e| e.id == id)?;
        self.entries.remove(at)
    }

    /// Move an entry `delta` steps (positive = toward the head), clamped at
    /// the ends. Returns the displacement achieved, or the requested delta
    /// when the entry could not move at all.
    pub fn move_delta(&mut self, id: &str, delta: i64) -> Result<i64> {
        let at = self
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| eyre!("no such queue entry {id:?}"))? as i64;
        let to = (at - delta).clamp(0, self.entries.len() as i64 - 1);
        let moved = at - to;
        if moved != 0 {
            let entry = self.entries.remove(at as usize).expect("position just found");
            self.entries.insert(to as usize, entry);
        }
        Ok(if moved != 0 { moved } else { delta })
    }

    /// Reorder `ids` (preserving their relative order) to sit immediately
    /// after `target`, or at the head when `target` is `None`. A target
    /// inside the moving set slides back to the nearest entry outside it.
    pub fn move_after(&mut self, target: Option<&str>, ids: &[String]) -> Result<()> {
        for id in ids {
            if !self.entries.iter().any(|e| e.id == *id) {
                return Err(eyre!("no such queue entry {id:?}"));
            }
        }
        let target = match target {
            None => None,
            Some(t) => {
                if !ids.iter().any(|id| id == t) {
                    let at = self
                        .entries
                        .iter()
                        .position(|e| e.id == t)
                        .ok_or_else(|| eyre!("no such queue entry {t:?}"))?;
                    Some(self.entries[at].id.clone())
                } else {
                    // walk toward the head until we leave the moving set
                    let mut at = self
                        .entries
                        .iter()
                        .position(|e| e.id == t)
                        .ok_or_else(|| eyre!("no such queue entry {t:?}"))?;
                    loop {
                        if at == 0 {
                            break None;
                        }
                        at -= 1;
                        if !ids.iter().any(|id| *id == self.entries[at].id) {
                            break Some(self.entries[at].id.clone());
                        }
                    }
                }
            }
        };
        let mut moving = Vec::with_capacity(ids.len());
        for id in ids {
            let at = self
                .entries
                .iter()
                .position(|e| e.id == *id)
                .expect("validated above");
            moving.push(self.entries.remove(at).expect("position just found"));
        }
        let mut at = match &target {
            None => 0,
            Some(t) => {
                self.entries
                    .iter()
                    .position(|e| e.id == *t)
                    .expect("target is outside the moving set")
                    + 1
            }
        };
        for entry in moving {
            self.entries.insert(at, entry);
            at += 1;
        }
        Ok(())
    }

    /// Promote the queue head into the playing slot. The caller stamps state
    /// and `played`.
    pub fn start_next(&mut self) -> Option<&mut QueueEntry> {
        assert!(self.playing.is_none(), "a track is already playing");
        let entry = self.entries.pop_front()?;
        self.playing = Some(entry);
        self.playing.as_mut()
    }

    /// Archive the playing entry with a terminal (or `quitting`) state.
    /// Returns the ids dropped off the far end of the history.
    pub fn finish_playing(&mut self, state: PlayState, wstat: Option<i32>) -> (QueueEntry, Vec<String>) {
        let mut entry = self.playing.take().expect("nothing playing");
        entry.state = state;
        entry.wstat = wstat;
        entry.expected = None;
        let mut dropped = Vec::new();
        if self.history > 0 {
            while self.recent.len() >= self.history {
                let old = self.recent.pop_front().expect("history is nonempty");
                dropped.push(old.id);
            }
            self.recent.push_back(entry.clone());
        }
        (entry, dropped)
    }

    /// Recompute `expected` for every waiting entry from the playing entry's
    /// remaining time, track lengths and the inter-track gap.
    pub fn refresh_expected(&mut self, now: i64, gap: i64, length: impl Fn(&Utf8PathBuf) -> Option<i64>) {
        let mut at = match &self.playing {
            Some(p) => {
                let len = length(&p.track).unwrap_or(0);
                now + (len - p.sofar.unwrap_or(0)).max(0)
            }
            None => now,
        };
        for entry in &mut self.entries {
            at += gap;
            entry.expected = Some(at);
            at += length(&entry.track).unwrap_or(0);
        }
    }

    // Persistence. Both files are rewritten wholesale on every change; the
    // tmp-and-rename dance means a crash leaves the previous state intact.

    pub fn save_queue(&self, path: &Path) -> Result<()> {
        let lines = self
            .playing
            .iter()
            .chain(self.entries.iter())
            .map(QueueEntry::marshal);
        write_atomically(path, lines)
    }

    pub fn save_recent(&self, path: &Path) -> Result<()> {
        write_atomically(path, self.recent.iter().map(QueueEntry::marshal))
    }

    /// Read both state files back in. Entries that were mid-play at shutdown
    /// come back as `unplayed`.
    pub fn load(&mut self, queue_path: &Path, recent_path: &Path) -> Result<()> {
        for line in read_lines(queue_path)? {
            let mut entry = QueueEntry::unmarshal(&line)
                .wrap_err_with(|| format!("in {}", queue_path.display()))?;
            if !entry.state.terminal() && entry.state != PlayState::Random {
                entry.state = PlayState::Unplayed;
            }
            entry.played = None;
            entry.sofar = None;
            self.used_ids.insert(entry.id.clone());
            self.entries.push_back(entry);
        }
        for line in read_lines(recent_path)? {
            let entry = QueueEntry::unmarshal(&line)
                .wrap_err_with(|| format!("in {}", recent_path.display()))?;
            self.used_ids.insert(entry.id.clone());
            self.recent.push_back(entry);
        }
        while self.recent.len() > self.history {
            self.recent.pop_front();
        }
        Ok(())
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text.lines().map(str::to_owned).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).wrap_err_with(|| format!("reading {}", path.display())),
    }
}

pub(crate) fn write_atomically(path: &Path, lines: impl Iterator<Item = String>) -> Result<()> {
    let tmp = path.with_extension("new");
    let mut text = String::new();
    for line in lines {
        text.push_str(&line);
        text.push('\n');
    }
    fs::write(&tmp, text).wrap_err_with(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).wrap_err_with(|| format!("replacing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn queue_of(ids: &[&str]) -> Queue {
        let mut q = Queue::new(60);
        for id in ids {
            let e = QueueEntry::new(id.to_string(), format!("tracks/{id}.ogg").into(), Origin::Picked);
            q.add(e, Where::End, 1000);
        }
        q
    }

    fn order(q: &Queue) -> Vec<&str> {
        q.entries().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn marshal_round_trips() {
        let mut e = QueueEntry::new("00ff".into(), "music/a b/tr\"ack.ogg".into(), Origin::Random);
        e.submitter = Some("alice".into());
        e.when = Some(1234);
        e.played = Some(1240);
        e.state = PlayState::Started;
        e.sofar = Some(17);
        e.expected = Some(1300);
        assert_eq!(QueueEntry::unmarshal(&e.marshal()).unwrap(), e);

        let mut scratched = e.clone();
        scratched.state = PlayState::Scratched;
        scratched.scratched = Some("bob".into());
        scratched.wstat = Some(9);
        assert_eq!(QueueEntry::unmarshal(&scratched.marshal()).unwrap(), scratched);
    }

    #[test]
    fn unmarshal_wants_id_and_track() {
        assert!(QueueEntry::unmarshal("track=x.ogg state=unplayed").is_err());
        assert!(QueueEntry::unmarshal("id=12 state=unplayed").is_err());
        // unknown keys ride along
        let e = QueueEntry::unmarshal("track=x.ogg id=12 flavour=mint").unwrap();
        assert_eq!(e.id, "12");
    }

    #[test]
    fn user_picks_go_before_random_fill() {
        let mut q = Queue::new(60);
        let mut r = QueueEntry::new("r1".into(), "t/r1.ogg".into(), Origin::Random);
        r.state = PlayState::Random;
        q.add(r, Where::End, 1);
        let picked = QueueEntry::new("p1".into(), "t/p1.ogg".into(), Origin::Picked);
        q.add(picked, Where::BeforeRandom, 2);
        assert_eq!(order(&q), ["p1", "r1"]);
    }

    #[test]
    fn move_to_head_past_the_end() {
        let mut q = queue_of(&["a", "b", "c"]);
        assert_eq!(q.move_delta("c", 10).unwrap(), 2);
        assert_eq!(order(&q), ["c", "a", "b"]);
    }

    #[test]
    fn move_at_boundaries_reports_the_leftover() {
        let mut q = queue_of(&["a", "b", "c"]);
        assert_eq!(q.move_delta("a", 1).unwrap(), 1);
        assert_eq!(order(&q), ["a", "b", "c"]);
        assert_eq!(q.move_delta("c", -1).unwrap(), -1);
        assert_eq!(order(&q), ["a", "b", "c"]);
        assert_eq!(q.move_delta("b", -1).unwrap(), -1);
        assert_eq!(order(&q), ["a", "c", "b"]);
    }

    #[test]
    fn move_after_keeps_relative_order() {
        let mut q = queue_of(&["a", "b", "c", "d", "e"]);
        q.move_after(Some("d"), &["a".into(), "c".into()]).unwrap();
        assert_eq!(order(&q), ["b", "d", "a", "c", "e"]);
        q.move_after(None, &["e".into()]).unwrap();
        assert_eq!(order(&q), ["e", "b", "d", "a", "c"]);
    }

    #[test]
    fn move_after_target_inside_the_moving_set() {
        let mut q = queue_of(&["a", "b", "c", "d"]);
        // target b moves too: the real target becomes the entry before it
        q.move_after(Some("b"), &["b".into(), "d".into()]).unwrap();
        assert_eq!(order(&q), ["a", "b", "d", "c"]);
        let mut q = queue_of(&["a", "b", "c"]);
        q.move_after(Some("a"), &["a".into()]).unwrap();
        assert_eq!(order(&q), ["a", "b", "c"]);
    }

    #[test]
    fn history_is_bounded_and_terminal_entries_archive_once() {
        let mut q = Queue::new(2);
        for id in ["a", "b", "c"] {
            let e = QueueEntry::new(id.into(), format!("t/{id}.ogg").into(), Origin::Picked);
            q.add(e, Where::End, 1);
        }
        for _ in 0..3 {
            q.start_next().unwrap().state = PlayState::Started;
            q.finish_playing(PlayState::Ok, Some(0));
        }
        let recent: Vec<_> = q.recent().map(|e| e.id.as_str()).collect();
        assert_eq!(recent, ["b", "c"]);
        assert!(q.is_empty());
        assert!(q.playing().is_none());
    }

    #[test]
    fn expected_times_accumulate() {
        let mut q = queue_of(&["a", "b", "c"]);
        q.start_next().unwrap();
        let p = q.playing_mut().unwrap();
        p.state = PlayState::Started;
        p.sofar = Some(30);
        q.refresh_expected(1000, 2, |_| Some(100));
        // the playing track has 70s left; then gap, b, gap, c
        let expected: Vec<_> = q.entries().map(|e| e.expected.unwrap()).collect();
        assert_eq!(expected, [1072, 1174]);
    }

    #[test]
    fn state_files_round_trip_and_reset_live_states() {
        let dir = tempfile::tempdir().unwrap();
        let qp = dir.path().join("queue");
        let rp = dir.path().join("recent");
        let mut q = queue_of(&["a", "b"]);
        q.start_next().unwrap();
        let p = q.playing_mut().unwrap();
        p.state = PlayState::Started;
        p.played = Some(5000);
        q.save_queue(&qp).unwrap();
        q.save_recent(&rp).unwrap();

        let mut q2 = Queue::new(60);
        q2.load(&qp, &rp).unwrap();
        // the playing entry came back at the head, demoted to unplayed
        assert_eq!(order(&q2), ["a", "b"]);
        assert_eq!(q2.entries().next().unwrap().state, PlayState::Unplayed);
        assert_eq!(q2.entries().next().unwrap().played, None);
    }
}
