//! In-process publish/subscribe for state changes, and its externalisation
//! as the wire event log.
//!
//! Every mutation raises exactly one event *after* committing. In-process
//! watchers run synchronously in commit order; `log` subscribers get the
//! same events as preformatted lines through an unbounded channel, so a slow
//! client never stalls a command.

use std::collections::HashMap;

use strum::{Display, EnumDiscriminants, EnumString};
use tokio::sync::mpsc;

use crate::protocol::quote_args;
use crate::queue::QueueEntry;

/// Scalar state transitions reported by `state` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum StateChange {
    EnablePlay,
    DisablePlay,
    EnableRandom,
    DisableRandom,
    Pause,
    Resume,
    Playing,
    Completed,
    Scratched,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, EnumDiscriminants)]
#[strum_discriminants(name(EventKind))]
#[strum_discriminants(derive(Display, EnumString, Hash))]
#[strum_discriminants(strum(serialize_all = "snake_case"))]
pub enum Event {
    /// An entry joined the queue.
    Queue(QueueEntry),
    /// An entry was archived to the recently-played list.
    RecentAdded(QueueEntry),
    /// An entry fell off the far end of the recently-played list.
    RecentRemoved { id: String },
    /// An entry left the queue without being played.
    Removed { id: String, who: Option<String> },
    /// Somebody reordered the queue.
    Moved { who: String },
    /// Play started.
    Playing {
        track: String,
        who: Option<String>,
    },
    /// The decoder finished cleanly.
    Completed { track: String },
    /// The decoder failed.
    Failed { track: String, error: String },
    /// A user cut the playing track short.
    Scratched { track: String, who: String },
    State(StateChange),
    Volume { left: u8, right: u8 },
    Rescanned,
    UserAdd { user: String },
    UserDelete { user: String },
    UserConfirm { user: String },
    UserEdit { user: String, property: String },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        EventKind::from(self)
    }

    /// One wire line: hex microsecond timestamp, event name, quoted
    /// arguments. Queue-entry events carry the marshalled entry, which is
    /// already in quoted `key=value` form.
    pub fn format_line(&self, micros: i64) -> String {
        use Event::*;
        let kind = self.kind();
        let args = match self {
            Queue(entry) | RecentAdded(entry) => entry.marshal(),
            RecentRemoved { id } => quote_args(&[id]),
            Removed { id, who } => match who {
                Some(who) => quote_args(&[id, who]),
                None => quote_args(&[id]),
            },
            Moved { who } => quote_args(&[who]),
            Playing { track, who } => match who {
                Some(who) => quote_args(&[track, who]),
                None => quote_args(&[track]),
            },
            Completed { track } => quote_args(&[track]),
            Failed { track, error } => quote_args(&[track, error]),
            Scratched { track, who } => quote_args(&[track, who]),
            State(change) => change.to_string(),
            Volume { left, right } => format!("{left} {right}"),
            Rescanned => String::new(),
            UserAdd { user } | UserDelete { user } | UserConfirm { user } => quote_args(&[user]),
            UserEdit { user, property } => quote_args(&[user, property]),
        };
        if args.is_empty() {
            format!("{micros:x} {kind}")
        } else {
            format!("{micros:x} {kind} {args}")
        }
    }
}

type Watcher = Box<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    watchers: HashMap<EventKind, Vec<Watcher>>,
    log_subs: Vec<mpsc::UnboundedSender<String>>,
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus::default()
    }

    /// Register an in-process handler for one event kind. Handlers run
    /// synchronously when the event is raised.
    pub fn register(&mut self, kind: EventKind, watcher: Watcher) {
        self.watchers.entry(kind).or_default().push(watcher);
    }

    /// Attach a `log` connection. The stream ends when the receiver is
    /// dropped; the bus notices on the next raise.
    pub fn subscribe_log(&mut self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.log_subs.push(tx);
        rx
    }

    pub fn raise(&mut self, event: &Event) {
        self.raise_at(jiff::Timestamp::now().as_microsecond(), event);
    }

    pub fn raise_at(&mut self, micros: i64, event: &Event) {
        if let Some(watchers) = self.watchers.get(&event.kind()) {
            for watcher in watchers {
                watcher(event);
            }
        }
        if !self.log_subs.is_empty() {
            let line = event.format_line(micros);
            self.log_subs.retain(|sub| sub.send(line.clone()).is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Origin, QueueEntry};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn line_format() {
        let e = Event::Playing {
            track: "/m/a track.ogg".into(),
            who: Some("alice".into()),
        };
        assert_eq!(
            e.format_line(0x4c1f3a0),
            "4c1f3a0 playing \"/m/a track.ogg\" alice"
        );
        assert_eq!(
            Event::State(StateChange::EnablePlay).format_line(16),
            "10 state enable_play"
        );
        assert_eq!(Event::Rescanned.format_line(1), "1 rescanned");
        assert_eq!(
            Event::Volume { left: 3, right: 255 }.format_line(1),
            "1 volume 3 255"
        );
    }

    #[test]
    fn queue_events_embed_the_marshalled_entry() {
        let entry = QueueEntry::new("ab12".into(), "x.ogg".into(), Origin::Picked);
        let line = Event::Queue(entry.clone()).format_line(255);
        assert_eq!(line, format!("ff queue {}", entry.marshal()));
    }

    #[test]
    fn watchers_fire_for_their_kind_only() {
        let mut bus = EventBus::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        bus.register(
            EventKind::Rescanned,
            Box::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bus.raise_at(1, &Event::Rescanned);
        bus.raise_at(2, &Event::Moved { who: "alice".into() });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn log_subscribers_see_events_in_order() {
        let mut bus = EventBus::new();
        let mut rx = bus.subscribe_log();
        bus.raise_at(1, &Event::Rescanned);
        bus.raise_at(2, &Event::Moved { who: "bob".into() });
        assert_eq!(rx.try_recv().unwrap(), "1 rescanned");
        assert_eq!(rx.try_recv().unwrap(), "2 moved bob");
        // dropping the receiver detaches the subscription on the next raise
        drop(rx);
        bus.raise_at(3, &Event::Rescanned);
    }
}
