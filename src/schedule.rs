//! Time-triggered actions: `play` and `set-global` events persisted across
//! restarts. A min-heap keyed on trigger time feeds a single timer; rights
//! are checked when the action fires, not when it was scheduled.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use camino::Utf8PathBuf;
use color_eyre::Result;
use color_eyre::eyre::{Context, eyre};
use strum::{Display, EnumString};
use tracing::{info, warn};

use crate::protocol::{quote, quote_args, split};
use crate::queue::write_atomically;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default)]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    /// Dropped at startup if its moment has passed.
    Junk,
    /// Fired late rather than not at all.
    #[default]
    Normal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Play { track: Utf8PathBuf },
    SetGlobal { key: String, value: String },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Play { .. } => "play",
            Action::SetGlobal { .. } => "set-global",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledAction {
    pub id: String,
    pub when: i64,
    pub priority: Priority,
    /// Executed under this identity; their rights apply at fire time.
    pub who: String,
    pub action: Action,
}

impl ScheduledAction {
    pub fn marshal(&self) -> String {
        let mut pairs = vec![
            quote(&format!("id={}", self.id)),
            quote(&format!("when={}", self.when)),
            quote(&format!("priority={}", self.priority)),
            quote(&format!("who={}", self.who)),
            quote(&format!("action={}", self.action.name())),
        ];
        match &self.action {
            Action::Play { track } => pairs.push(quote(&format!("track={track}"))),
            Action::SetGlobal { key, value } => {
                pairs.push(quote(&format!("key={key}")));
                pairs.push(quote(&format!("value={value}")));
            }
        }
        pairs.join(" ")
    }

    pub fn unmarshal(line: &str) -> Result<ScheduledAction> {
        let mut fields: HashMap<String, String> = HashMap::new();
        for token in split(line).wrap_err("malformed scheduled action")? {
            let (key, value) = token
                .split_once('=')
                .ok_or_else(|| eyre!("scheduled action field without '=': {token:?}"))?;
            fields.insert(key.to_owned(), value.to_owned());
        }
        let take = |fields: &mut HashMap<String, String>, key: &str| {
            fields
                .remove(key)
                .ok_or_else(|| eyre!("scheduled action missing {key:?}"))
        };
        let action = match take(&mut fields, "action")?.as_str() {
            "play" => Action::Play {
                track: take(&mut fields, "track")?.into(),
            },
            "set-global" => Action::SetGlobal {
                key: take(&mut fields, "key")?,
                value: take(&mut fields, "value")?,
            },
            other => return Err(eyre!("unknown scheduled action {other:?}")),
        };
        Ok(ScheduledAction {
            id: take(&mut fields, "id")?,
            when: take(&mut fields, "when")?.parse().wrap_err("bad when")?,
            priority: take(&mut fields, "priority")?
                .parse()
                .map_err(|_| eyre!("bad priority"))?,
            who: take(&mut fields, "who")?,
            action,
        })
    }

    /// `schedule-get` body: one `key value` pair per line, quoted.
    pub fn kv_lines(&self) -> Vec<String> {
        let when = self.when.to_string();
        let priority = self.priority.to_string();
        let mut lines = vec![
            quote_args(&["when", when.as_str()]),
            quote_args(&["priority", priority.as_str()]),
            quote_args(&["who", self.who.as_str()]),
            quote_args(&["action", self.action.name()]),
        ];
        match &self.action {
            Action::Play { track } => lines.push(quote_args(&["track", track.as_str()])),
            Action::SetGlobal { key, value } => {
                lines.push(quote_args(&["key", key.as_str()]));
                lines.push(quote_args(&["value", value.as_str()]));
            }
        }
        lines
    }
}

pub struct Schedule {
    actions: HashMap<String, ScheduledAction>,
    /// Deadlines; entries go stale when an action is deleted and are skipped
    /// on pop.
    heap: BinaryHeap<Reverse<(i64, String)>>,
    path: PathBuf,
}

impl Schedule {
    pub fn load(path: &Path, now: i64) -> Result<Schedule> {
        let mut schedule = Schedule {
            actions: HashMap::new(),
            heap: BinaryHeap::new(),
            path: path.to_owned(),
        };
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).wrap_err_with(|| format!("reading {}", path.display())),
        };
        let mut dropped = 0;
        for line in text.lines() {
            let action = ScheduledAction::unmarshal(line)
                .wrap_err_with(|| format!("in {}", path.display()))?;
            if action.priority == Priority::Junk && action.when <= now {
                dropped += 1;
                continue;
            }
            schedule.insert(action);
        }
        if dropped > 0 {
            info!("dropped {dropped} stale junk-priority scheduled actions");
        }
        schedule.persist()?;
        Ok(schedule)
    }

    fn insert(&mut self, action: ScheduledAction) {
        self.heap.push(Reverse((action.when, action.id.clone())));
        self.actions.insert(action.id.clone(), action);
    }

    pub fn add(&mut self, action: ScheduledAction) -> Result<()> {
        if self.actions.contains_key(&action.id) {
            return Err(eyre!("duplicate scheduled action id {:?}", action.id));
        }
        self.insert(action);
        self.persist()
    }

    pub fn delete(&mut self, id: &str) -> Result<bool> {
        let removed = self.actions.remove(id).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Option<&ScheduledAction> {
        self.actions.get(id)
    }

    /// All pending actions, soonest first.
    pub fn list(&self) -> Vec<&ScheduledAction> {
        let mut actions: Vec<_> = self.actions.values().collect();
        actions.sort_by(|a, b| (a.when, &a.id).cmp(&(b.when, &b.id)));
        actions
    }

    /// The next trigger time, if anything is pending.
    pub fn next_when(&mut self) -> Option<i64> {
        while let Some(Reverse((when, id))) = self.heap.peek().cloned() {
            match self.actions.get(&id) {
                Some(action) if action.when == when => return Some(when),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Pull every action whose time has come. The caller executes them and
    /// they are gone either way; a failed action is logged, not retried.
    pub fn take_due(&mut self, now: i64) -> Result<Vec<ScheduledAction>> {
        let mut due = Vec::new();
        while let Some(Reverse((when, id))) = self.heap.peek().cloned() {
            if when > now {
                break;
            }
            self.heap.pop();
            let current = self.actions.get(&id).is_some_and(|a| a.when == when);
            if current {
                due.push(self.actions.remove(&id).expect("just looked it up"));
            }
        }
        if !due.is_empty() {
            self.persist()?;
        }
        Ok(due)
    }

    fn persist(&self) -> Result<()> {
        let mut lines: Vec<_> = self.actions.values().collect();
        lines.sort_by(|a, b| (a.when, &a.id).cmp(&(b.when, &b.id)));
        write_atomically(&self.path, lines.into_iter().map(ScheduledAction::marshal))
            .wrap_err("could not write scheduled actions")
    }
}

impl Drop for Schedule {
    fn drop(&mut self) {
        if let Err(e) = self.persist() {
            warn!("could not persist schedule on shutdown: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn play(id: &str, when: i64, priority: Priority) -> ScheduledAction {
        ScheduledAction {
            id: id.to_string(),
            when,
            priority,
            who: "alice".to_string(),
            action: Action::Play {
                track: "music/a b.ogg".into(),
            },
        }
    }

    #[test]
    fn marshal_round_trips() {
        let a = play("s1", 1234, Priority::Normal);
        assert_eq!(ScheduledAction::unmarshal(&a.marshal()).unwrap(), a);
        let g = ScheduledAction {
            id: "s2".into(),
            when: 99,
            priority: Priority::Junk,
            who: "bob".into(),
            action: Action::SetGlobal {
                key: "playing".into(),
                value: "no".into(),
            },
        };
        assert_eq!(ScheduledAction::unmarshal(&g.marshal()).unwrap(), g);
    }

    #[test]
    fn due_actions_fire_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Schedule::load(&dir.path().join("scheduled"), 0).unwrap();
        s.add(play("late", 300, Priority::Normal)).unwrap();
        s.add(play("early", 100, Priority::Normal)).unwrap();
        assert_eq!(s.next_when(), Some(100));
        let due = s.take_due(200).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "early");
        assert_eq!(s.next_when(), Some(300));
    }

    #[test]
    fn stale_junk_is_dropped_on_load_but_normal_survives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduled");
        {
            let mut s = Schedule::load(&path, 0).unwrap();
            s.add(play("junky", 50, Priority::Junk)).unwrap();
            s.add(play("keeper", 60, Priority::Normal)).unwrap();
            s.add(play("future", 5000, Priority::Junk)).unwrap();
        }
        let mut s = Schedule::load(&path, 1000).unwrap();
        assert!(s.get("junky").is_none());
        assert!(s.get("keeper").is_some(), "late normal actions still fire");
        assert!(s.get("future").is_some());
        assert_eq!(s.next_when(), Some(60));
    }

    #[test]
    fn delete_forgets_the_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Schedule::load(&dir.path().join("scheduled"), 0).unwrap();
        s.add(play("x", 100, Priority::Normal)).unwrap();
        assert!(s.delete("x").unwrap());
        assert!(!s.delete("x").unwrap());
        assert_eq!(s.next_when(), None);
        assert_eq!(s.take_due(1000).unwrap(), vec![]);
    }
}
