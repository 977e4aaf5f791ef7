//! The server's shared state: store, queue, playlists, schedule, event bus,
//! cookie jar and mixer, all behind one lock. Command handlers and the
//! player task mutate state through here so every externally visible change
//! is committed before its event goes out.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::Utf8PathBuf;
use color_eyre::Result;
use color_eyre::eyre::{Context, eyre};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::auth::CookieJar;
use crate::chooser::{self, PlayedTimes};
use crate::config::Config;
use crate::events::{Event, EventBus, StateChange};
use crate::player::mixer::Mixer;
use crate::playlist::Playlists;
use crate::queue::{Origin, PlayState, Queue, QueueEntry, Where};
use crate::schedule::Schedule;
use crate::store::Store;

/// Everything the player task needs to launch one decoder.
#[derive(Debug, Clone)]
pub struct PlayStart {
    pub id: String,
    pub track: Utf8PathBuf,
    pub program: String,
    pub args: Vec<String>,
    pub pauses: bool,
    /// Bytes delivered so far, shared with status queries.
    pub progress: Arc<AtomicU64>,
}

struct StatePaths {
    queue: PathBuf,
    recent: PathBuf,
}

pub struct System {
    pub config: Arc<Config>,
    pub store: Store,
    pub queue: Queue,
    pub playlists: Playlists,
    pub schedule: Schedule,
    pub bus: EventBus,
    pub cookies: CookieJar,
    pub mixer: Mixer,
    played: PlayedTimes,
    paths: StatePaths,
    /// Byte counter of the current decode, if one is running.
    progress: Option<Arc<AtomicU64>>,
    /// Poked whenever the player task might have something new to do.
    pub player_notify: Arc<Notify>,
    /// Poked whenever the scheduled-actions timer must re-arm.
    pub schedule_notify: Arc<Notify>,
    next_conn: u64,
}

pub fn unix_now() -> i64 {
    jiff::Timestamp::now().as_second()
}

impl System {
    pub fn new(config: Arc<Config>) -> Result<System> {
        let state_dir = config.state_dir()?;
        std::fs::create_dir_all(&state_dir)
            .wrap_err_with(|| format!("could not create state dir {}", state_dir.display()))?;
        let now = unix_now();

        let store = Store::open(&state_dir.join("database.sqlite"), &config)?;
        let paths = StatePaths {
            queue: state_dir.join("queue"),
            recent: state_dir.join("recent"),
        };
        let mut queue = Queue::new(config.history);
        queue.load(&paths.queue, &paths.recent)?;
        let playlists = Playlists::load(
            &state_dir.join("playlists"),
            config.playlist_max,
            config.playlist_lock_timeout as i64,
        )?;
        let schedule = Schedule::load(&state_dir.join("scheduled"), now)?;
        let played = PlayedTimes::load(&state_dir.join("played"))?;

        Ok(System {
            store,
            queue,
            playlists,
            schedule,
            bus: EventBus::new(),
            cookies: CookieJar::new(config.cookie_key_lifetime, now),
            mixer: Mixer::default(),
            played,
            paths,
            progress: None,
            player_notify: Arc::new(Notify::new()),
            schedule_notify: Arc::new(Notify::new()),
            next_conn: 0,
            config,
        })
    }

    pub fn next_conn_id(&mut self) -> u64 {
        self.next_conn += 1;
        self.next_conn
    }

    // Global switches -------------------------------------------------------

    pub fn playing_enabled(&self) -> bool {
        self.store
            .get_global("playing")
            .ok()
            .flatten()
            .as_deref()
            != Some("no")
    }

    pub fn random_enabled(&self) -> bool {
        self.store
            .get_global("random-play")
            .ok()
            .flatten()
            .as_deref()
            != Some("no")
    }

    pub fn set_global(&mut self, key: &str, value: &str) -> Result<()> {
        self.store.set_global(key, value)?;
        match (key, value) {
            ("playing", "yes") => self.raise(Event::State(StateChange::EnablePlay)),
            ("playing", _) => self.raise(Event::State(StateChange::DisablePlay)),
            ("random-play", "yes") => self.raise(Event::State(StateChange::EnableRandom)),
            ("random-play", _) => self.raise(Event::State(StateChange::DisableRandom)),
            _ => {}
        }
        self.player_notify.notify_one();
        Ok(())
    }

    pub fn raise(&mut self, event: Event) {
        self.bus.raise(&event);
    }

    // Track helpers ---------------------------------------------------------

    /// Resolve a client-supplied name to a real track path.
    pub fn resolve_track(&self, name: &str) -> Result<Option<String>> {
        self.store.resolve(name)
    }

    pub fn track_length(&self, track: &str) -> Option<i64> {
        self.store.length(track).ok().flatten()
    }

    // Queue mutations -------------------------------------------------------

    fn persist_queue(&mut self) -> Result<()> {
        self.refresh_expected();
        self.queue.save_queue(&self.paths.queue)
    }

    fn persist_recent(&self) -> Result<()> {
        self.queue.save_recent(&self.paths.recent)
    }

    fn refresh_expected(&mut self) {
        let now = unix_now();
        let gap = self.config.gap;
        let mut by_track = std::collections::HashMap::new();
        for entry in self.queue.playing().into_iter().chain(self.queue.entries()) {
            let length = self.store.length(entry.track.as_str()).ok().flatten();
            by_track.insert(entry.track.clone(), length);
        }
        self.queue
            .refresh_expected(now, gap, |track| by_track.get(track).copied().flatten());
    }

    /// Append a track for `who`, ahead of the random fill-in.
    pub fn play_track(&mut self, track: &str, who: &str) -> Result<String> {
        self.play_track_as(track, who, Origin::Picked)
    }

    pub fn play_track_as(&mut self, track: &str, who: &str, origin: Origin) -> Result<String> {
        let now = unix_now();
        let id = self.queue.fresh_id();
        let mut entry = QueueEntry::new(id.clone(), track.into(), origin);
        entry.state = PlayState::Unplayed;
        entry.submitter = Some(who.to_owned());
        let entry = self.queue.add(entry, Where::BeforeRandom, now).clone();
        self.persist_queue()?;
        self.raise(Event::Queue(entry));
        self.player_notify.notify_one();
        Ok(id)
    }

    /// Splice tracks after `target` (the head when empty) for `who`.
    pub fn play_after(&mut self, target: Option<&str>, tracks: &[String], who: &str) -> Result<Vec<String>> {
        let now = unix_now();
        let mut after = target.map(str::to_owned);
        let mut ids = Vec::new();
        for track in tracks {
            let id = self.queue.fresh_id();
            let mut entry = QueueEntry::new(id.clone(), track.into(), Origin::Picked);
            entry.submitter = Some(who.to_owned());
            self.queue.insert_after(after.as_deref(), entry, now)?;
            after = Some(id.clone());
            ids.push(id);
        }
        self.persist_queue()?;
        for id in &ids {
            let entry = self.queue.find(id).expect("just inserted").clone();
            self.raise(Event::Queue(entry));
        }
        self.player_notify.notify_one();
        Ok(ids)
    }

    pub fn remove_entry(&mut self, id: &str, who: &str) -> Result<()> {
        let entry = self
            .queue
            .remove(id)
            .ok_or_else(|| eyre!("no such queue entry {id:?}"))?;
        info!("user {who} removed {id}");
        self.persist_queue()?;
        self.raise(Event::Removed {
            id: entry.id,
            who: Some(who.to_owned()),
        });
        Ok(())
    }

    pub fn move_entry(&mut self, id: &str, delta: i64, who: &str) -> Result<i64> {
        let moved = self.queue.move_delta(id, delta)?;
        info!("user {who} moved {id}");
        self.persist_queue()?;
        self.raise(Event::Moved {
            who: who.to_owned(),
        });
        Ok(moved)
    }

    pub fn move_after(&mut self, target: Option<&str>, ids: &[String], who: &str) -> Result<()> {
        self.queue.move_after(target, ids)?;
        info!("user {who} moved {} entries", ids.len());
        self.persist_queue()?;
        self.raise(Event::Moved {
            who: who.to_owned(),
        });
        Ok(())
    }

    /// Claim a random pick as one's own.
    pub fn adopt(&mut self, id: &str, who: &str) -> Result<()> {
        let entry = self
            .queue
            .find_mut(id)
            .ok_or_else(|| eyre!("no such queue entry {id:?}"))?;
        if entry.origin != Origin::Random || entry.state != PlayState::Random {
            return Err(eyre!("only random picks can be adopted"));
        }
        entry.origin = Origin::Adopted;
        entry.state = PlayState::Unplayed;
        entry.submitter = Some(who.to_owned());
        let event = entry.clone();
        self.persist_queue()?;
        self.raise(Event::Queue(event));
        Ok(())
    }

    // Playing-slot bookkeeping (player task only) ---------------------------

    /// Seconds of audio delivered for the playing entry.
    pub fn live_sofar(&self) -> Option<i64> {
        let progress = self.progress.as_ref()?;
        let bps = self.config.sample_format.bytes_per_second();
        Some((progress.load(Ordering::Relaxed) / bps.max(1)) as i64)
    }

    /// The playing entry with its `sofar` field brought up to date.
    pub fn playing_snapshot(&self) -> Option<QueueEntry> {
        let mut entry = self.queue.playing()?.clone();
        if entry.state == PlayState::Started {
            entry.sofar = self.live_sofar().or(entry.sofar);
        }
        Some(entry)
    }

    /// Pick and start the next thing to play, filling an empty queue from
    /// the random chooser. Returns what the player task should launch, or
    /// `None` when there is nothing to do.
    pub fn begin_next(&mut self) -> Result<Option<PlayStart>> {
        if self.queue.playing().is_some() || !self.playing_enabled() {
            return Ok(None);
        }
        // bounded so a library full of playerless tracks cannot spin us
        for _ in 0..8 {
            let now = unix_now();
            if self.queue.is_empty() {
                if !self.random_enabled() {
                    return Ok(None);
                }
                let Some(track) = chooser::pick(&self.store, &self.played, &self.config, now)?
                else {
                    return Ok(None);
                };
                let id = self.queue.fresh_id();
                let entry = QueueEntry::new(id, track, Origin::Random);
                let entry = self.queue.add(entry, Where::End, now).clone();
                self.raise(Event::Queue(entry));
            }

            let head_track = self
                .queue
                .entries()
                .next()
                .expect("queue was just filled")
                .track
                .clone();
            let spec = self.config.player_for(head_track.as_str()).cloned();
            let entry = self.queue.start_next().expect("queue is nonempty");
            match spec {
                None => {
                    warn!("no player for {head_track}, giving up on it");
                    self.finish_playing(PlayState::NoPlayer, None, Some("no player".to_string()))?;
                    // and around again for the next entry
                }
                Some(spec) => {
                    entry.state = PlayState::Started;
                    if entry.played.is_none() {
                        entry.played = Some(now);
                    }
                    let id = entry.id.clone();
                    let submitter = entry.submitter.clone();
                    let progress = Arc::new(AtomicU64::new(0));
                    self.progress = Some(Arc::clone(&progress));
                    self.played.record(&head_track, now)?;
                    self.persist_queue()?;
                    self.raise(Event::Playing {
                        track: head_track.to_string(),
                        who: submitter,
                    });
                    self.raise(Event::State(StateChange::Playing));
                    return Ok(Some(PlayStart {
                        id,
                        track: head_track,
                        program: spec.program,
                        args: spec.args,
                        pauses: spec.pauses,
                        progress,
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Archive the playing entry and raise the matching events. Also the
    /// no-player path, which is why `error` is separate from `wstat`.
    pub fn finish_playing(
        &mut self,
        state: PlayState,
        wstat: Option<i32>,
        error: Option<String>,
    ) -> Result<()> {
        if let Some(sofar) = self.live_sofar()
            && let Some(playing) = self.queue.playing_mut()
        {
            playing.sofar = Some(sofar);
        }
        self.progress = None;
        let scratcher = self.queue.playing().and_then(|p| p.scratched.clone());
        let (done, dropped) = self.queue.finish_playing(state, wstat);
        let track = done.track.to_string();

        match state {
            PlayState::Ok => {
                self.raise(Event::Completed { track });
                self.raise(Event::State(StateChange::Completed));
            }
            PlayState::Failed | PlayState::NoPlayer => {
                self.raise(Event::Failed {
                    track,
                    error: error.unwrap_or_else(|| "decoder failed".to_string()),
                });
                self.raise(Event::State(StateChange::Failed));
            }
            PlayState::Scratched => {
                self.raise(Event::Scratched {
                    track,
                    who: scratcher.clone().unwrap_or_default(),
                });
                self.raise(Event::State(StateChange::Scratched));
                self.queue_scratch_sound(scratcher)?;
            }
            other => warn!("finish_playing with odd state {other}"),
        }
        for id in dropped {
            self.raise(Event::RecentRemoved { id });
        }
        self.raise(Event::RecentAdded(done));
        self.persist_queue()?;
        self.persist_recent()?;
        self.player_notify.notify_one();
        Ok(())
    }

    /// Put a scratch sound at the head of the queue, if any are configured.
    fn queue_scratch_sound(&mut self, scratcher: Option<String>) -> Result<()> {
        if self.config.scratch.is_empty() {
            return Ok(());
        }
        use rand::Rng;
        let sound =
            self.config.scratch[rand::rng().random_range(0..self.config.scratch.len())].clone();
        let id = self.queue.fresh_id();
        let mut entry = QueueEntry::new(id, sound, Origin::Picked);
        entry.state = PlayState::Isscratch;
        entry.submitter = scratcher;
        let entry = self.queue.add(entry, Where::Start, unix_now()).clone();
        self.raise(Event::Queue(entry));
        Ok(())
    }

    /// True when the head of the queue is a scratch sound; the player skips
    /// the inter-track gap for those.
    pub fn next_is_scratch_sound(&self) -> bool {
        self.queue
            .entries()
            .next()
            .is_some_and(|e| e.state == PlayState::Isscratch)
    }

    pub fn pause_playing(&mut self) -> Result<()> {
        let sofar = self.live_sofar();
        let playing = self
            .queue
            .playing_mut()
            .ok_or_else(|| eyre!("nothing playing"))?;
        if playing.state != PlayState::Started {
            return Err(eyre!("not playing"));
        }
        playing.state = PlayState::Paused;
        playing.sofar = sofar.or(playing.sofar);
        self.raise(Event::State(StateChange::Pause));
        Ok(())
    }

    pub fn resume_playing(&mut self) -> Result<()> {
        let playing = self
            .queue
            .playing_mut()
            .ok_or_else(|| eyre!("nothing playing"))?;
        if playing.state != PlayState::Paused {
            return Err(eyre!("not paused"));
        }
        playing.state = PlayState::Started;
        self.raise(Event::State(StateChange::Resume));
        Ok(())
    }

    /// Note who scratched the playing entry; the archive happens when the
    /// decoder actually dies.
    pub fn note_scratcher(&mut self, who: &str) {
        if let Some(playing) = self.queue.playing_mut() {
            playing.scratched = Some(who.to_owned());
        }
    }

    /// Shutdown path: the playing entry is written back out as `quitting`
    /// and revives as `unplayed` on the next start.
    pub fn note_quitting(&mut self) -> Result<()> {
        if let Some(playing) = self.queue.playing_mut() {
            playing.state = PlayState::Quitting;
        }
        self.queue.save_queue(&self.paths.queue)?;
        self.persist_recent()
    }

    // Rescanning ------------------------------------------------------------

    /// Fold a finished filesystem walk into the store.
    pub fn apply_rescan(&mut self, found: Vec<(Utf8PathBuf, Option<i64>)>) -> Result<()> {
        let now = unix_now();
        self.store.begin_rescan()?;
        let mut fresh = 0usize;
        for (track, length) in found {
            if self.store.notice(track.as_str(), now)? {
                fresh += 1;
            }
            if let Some(length) = length {
                self.store.set_length(track.as_str(), length)?;
            }
        }
        info!("rescan complete, {fresh} new tracks");
        self.raise(Event::Rescanned);
        Ok(())
    }

    // Users -----------------------------------------------------------------

    pub fn user_exists(&self, name: &str) -> Result<bool> {
        Ok(self.store.get_user(name)?.is_some())
    }

    pub fn stats(&self) -> Result<Vec<String>> {
        let mut lines = self.store.stats()?;
        lines.push(format!("queue length: {}", self.queue.len()));
        lines.push(format!(
            "recent length: {}",
            self.queue.recent().count()
        ));
        lines.push(format!(
            "playing: {}",
            self.queue.playing().map(|p| p.track.as_str()).unwrap_or("none")
        ));
        lines.push(format!("scheduled actions: {}", self.schedule.list().len()));
        Ok(lines)
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// A system on throwaway state, for handler tests.
    pub fn system(config: Config) -> (System, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            state_dir: Some(
                camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
            ),
            ..config
        };
        let system = System::new(Arc::new(config)).unwrap();
        (system, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use pretty_assertions::assert_eq;

    fn fixture() -> (System, tempfile::TempDir) {
        let config = Config {
            collections: vec!["/m".into()],
            players: vec![crate::config::PlayerSpec {
                pattern: "*.ogg".into(),
                program: "true".into(),
                args: vec![],
                pauses: false,
            }],
            ..Config::default()
        };
        let (mut sys, dir) = test_support::system(config);
        for t in ["/m/a/b/one.ogg", "/m/a/b/two.ogg", "/m/a/b/three.ogg"] {
            sys.store.notice(t, 0).unwrap();
        }
        (sys, dir)
    }

    #[test]
    fn play_track_queues_and_raises() {
        let (mut sys, _dir) = fixture();
        let mut rx = sys.bus.subscribe_log();
        let id = sys.play_track("/m/a/b/one.ogg", "alice").unwrap();
        let line = rx.try_recv().unwrap();
        assert!(line.contains(" queue "), "line: {line}");
        assert!(line.contains(&id));
        let entry = sys.queue.find(&id).unwrap();
        assert_eq!(entry.submitter.as_deref(), Some("alice"));
        assert_eq!(entry.state, PlayState::Unplayed);
    }

    #[test]
    fn begin_next_starts_the_head() {
        let (mut sys, _dir) = fixture();
        let id = sys.play_track("/m/a/b/one.ogg", "alice").unwrap();
        let start = sys.begin_next().unwrap().unwrap();
        assert_eq!(start.id, id);
        assert_eq!(start.program, "true");
        let playing = sys.queue.playing().unwrap();
        assert_eq!(playing.state, PlayState::Started);
        assert!(playing.played.is_some());
        // only one playing slot
        assert!(sys.begin_next().unwrap().is_none());
    }

    #[test]
    fn begin_next_respects_the_enable_switch() {
        let (mut sys, _dir) = fixture();
        sys.play_track("/m/a/b/one.ogg", "alice").unwrap();
        sys.set_global("playing", "no").unwrap();
        assert!(sys.begin_next().unwrap().is_none());
        sys.set_global("playing", "yes").unwrap();
        assert!(sys.begin_next().unwrap().is_some());
    }

    #[test]
    fn empty_queue_falls_back_to_random() {
        let (mut sys, _dir) = fixture();
        let start = sys.begin_next().unwrap().unwrap();
        assert!(start.track.as_str().starts_with("/m/a/b/"));
        let playing = sys.queue.playing().unwrap();
        assert_eq!(playing.origin, Origin::Random);
        assert_eq!(playing.submitter, None);
    }

    #[test]
    fn random_disabled_leaves_the_gap() {
        let (mut sys, _dir) = fixture();
        sys.set_global("random-play", "no").unwrap();
        assert!(sys.begin_next().unwrap().is_none());
    }

    #[test]
    fn completed_tracks_archive_with_events() {
        let (mut sys, _dir) = fixture();
        sys.play_track("/m/a/b/one.ogg", "alice").unwrap();
        sys.begin_next().unwrap().unwrap();
        let mut rx = sys.bus.subscribe_log();
        sys.finish_playing(PlayState::Ok, Some(0), None).unwrap();
        let first = rx.try_recv().unwrap();
        assert!(first.contains(" completed "), "line: {first}");
        assert!(sys.queue.playing().is_none());
        assert_eq!(sys.queue.recent().count(), 1);
        assert_eq!(sys.queue.recent().next().unwrap().state, PlayState::Ok);
    }

    #[test]
    fn scratch_queues_the_scratch_sound() {
        let config = Config {
            collections: vec!["/m".into()],
            scratch: vec!["/m/scratch/ouch.ogg".into()],
            players: vec![crate::config::PlayerSpec {
                pattern: "*.ogg".into(),
                program: "true".into(),
                args: vec![],
                pauses: false,
            }],
            ..Config::default()
        };
        let (mut sys, _dir) = test_support::system(config);
        sys.store.notice("/m/a/b/one.ogg", 0).unwrap();
        sys.play_track("/m/a/b/one.ogg", "alice").unwrap();
        sys.begin_next().unwrap().unwrap();
        sys.note_scratcher("bob");
        sys.finish_playing(PlayState::Scratched, None, None).unwrap();
        assert!(sys.next_is_scratch_sound());
        let head = sys.queue.entries().next().unwrap();
        assert_eq!(head.state, PlayState::Isscratch);
        assert_eq!(head.submitter.as_deref(), Some("bob"));
        let archived = sys.queue.recent().next().unwrap();
        assert_eq!(archived.scratched.as_deref(), Some("bob"));
    }

    #[test]
    fn adopt_claims_a_random_pick() {
        let (mut sys, _dir) = fixture();
        // make a random-origin entry by hand
        let id = sys.queue.fresh_id();
        let entry = QueueEntry::new(id.clone(), "/m/a/b/two.ogg".into(), Origin::Random);
        sys.queue.add(entry, Where::End, 1);
        sys.adopt(&id, "carol").unwrap();
        let entry = sys.queue.find(&id).unwrap();
        assert_eq!(entry.origin, Origin::Adopted);
        assert_eq!(entry.submitter.as_deref(), Some("carol"));
        // a picked entry cannot be adopted
        let id2 = sys.play_track("/m/a/b/one.ogg", "alice").unwrap();
        assert!(sys.adopt(&id2, "carol").is_err());
    }

    #[test]
    fn watchers_observe_kinds() {
        let (mut sys, _dir) = fixture();
        use std::sync::atomic::AtomicU32;
        let seen = Arc::new(AtomicU32::new(0));
        let s = Arc::clone(&seen);
        sys.bus.register(
            EventKind::Queue,
            Box::new(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            }),
        );
        sys.play_track("/m/a/b/one.ogg", "alice").unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
