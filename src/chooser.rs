//! Weighted random track selection: every eligible track contributes its
//! weight to one draw, recent plays are excluded outright, and newly added
//! tracks get a hefty thumb on the scale.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use camino::Utf8PathBuf;
use color_eyre::Result;
use color_eyre::eyre::Context;
use rand::Rng;
use tracing::debug;

use crate::config::Config;
use crate::queue::write_atomically;
use crate::store::Store;

/// Last-played times, persisted one `track\ttime` line each so the
/// anti-repeat window survives restarts.
pub struct PlayedTimes {
    times: HashMap<Utf8PathBuf, i64>,
    path: PathBuf,
}

impl PlayedTimes {
    pub fn load(path: &Path) -> Result<PlayedTimes> {
        let times = match fs::read_to_string(path) {
            Ok(text) => text
                .lines()
                .filter_map(|line| {
                    let (track, time) = line.split_once('\t')?;
                    Some((Utf8PathBuf::from(track), time.parse().ok()?))
                })
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e).wrap_err_with(|| format!("reading {}", path.display())),
        };
        Ok(PlayedTimes {
            times,
            path: path.to_owned(),
        })
    }

    pub fn last_played(&self, track: &Utf8PathBuf) -> Option<i64> {
        self.times.get(track).copied()
    }

    pub fn record(&mut self, track: &Utf8PathBuf, when: i64) -> Result<()> {
        self.times.insert(track.clone(), when);
        write_atomically(
            &self.path,
            self.times.iter().map(|(t, w)| format!("{t}\t{w}")),
        )
    }
}

/// Pick a random track, or nothing when the whole library is opted out or
/// inside the anti-repeat window. The scheduler leaves the gap in that case.
pub fn pick(store: &Store, played: &PlayedTimes, config: &Config, now: i64) -> Result<Option<Utf8PathBuf>> {
    pick_with(store, played, config, now, &mut rand::rng())
}

pub fn pick_with(
    store: &Store,
    played: &PlayedTimes,
    config: &Config,
    now: i64,
    rng: &mut impl Rng,
) -> Result<Option<Utf8PathBuf>> {
    let mut candidates: Vec<(Utf8PathBuf, u64)> = store
        .random_candidates()?
        .into_iter()
        .filter(|(track, _, _)| {
            played
                .last_played(track)
                .is_none_or(|t| now - t >= config.replay_min)
        })
        .map(|(track, added, weight)| {
            let weight = if now - added < config.new_bias_age {
                config.new_bias
            } else {
                weight
            };
            (track, weight)
        })
        .collect();

    // the enumeration raced nothing here, but a track can still vanish
    // between draws when a rescan runs concurrently; just redraw
    for _ in 0..3 {
        let Some(track) = draw(&candidates, rng) else {
            debug!("no eligible tracks for random play");
            return Ok(None);
        };
        if store.exists(track.as_str())? {
            return Ok(Some(track.clone()));
        }
        let gone = track.clone();
        candidates.retain(|(t, _)| *t != gone);
    }
    Ok(None)
}

fn draw<'c>(candidates: &'c [(Utf8PathBuf, u64)], rng: &mut impl Rng) -> Option<&'c Utf8PathBuf> {
    let total: u64 = candidates.iter().map(|(_, w)| w).sum();
    if total == 0 {
        return None;
    }
    let mut point = rng.random_range(0..total);
    for (track, weight) in candidates {
        if point < *weight {
            return Some(track);
        }
        point -= weight;
    }
    unreachable!("point was below the total weight")
}
