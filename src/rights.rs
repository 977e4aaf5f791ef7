//! Per-user rights: a bitmask over every privileged operation, with the
//! comma-separated text form used in the users table and on the wire.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use color_eyre::eyre::{Report, eyre};

use crate::queue::{Origin, QueueEntry};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rights: u32 {
        const READ           = 1 << 0;
        const PLAY           = 1 << 1;
        const MOVE_OWN       = 1 << 2;
        const MOVE_RANDOM    = 1 << 3;
        const MOVE_ANY       = 1 << 4;
        const REMOVE_OWN     = 1 << 5;
        const REMOVE_RANDOM  = 1 << 6;
        const REMOVE_ANY     = 1 << 7;
        const SCRATCH_OWN    = 1 << 8;
        const SCRATCH_RANDOM = 1 << 9;
        const SCRATCH_ANY    = 1 << 10;
        const VOLUME         = 1 << 11;
        const ADMIN          = 1 << 12;
        const RESCAN         = 1 << 13;
        const REGISTER       = 1 << 14;
        const USERINFO       = 1 << 15;
        const PREFS          = 1 << 16;
        const GLOBAL_PREFS   = 1 << 17;
        const PAUSE          = 1 << 18;
    }
}

const NAMES: &[(&str, Rights)] = &[
    ("read", Rights::READ),
    ("play", Rights::PLAY),
    ("move own", Rights::MOVE_OWN),
    ("move random", Rights::MOVE_RANDOM),
    ("move any", Rights::MOVE_ANY),
    ("remove own", Rights::REMOVE_OWN),
    ("remove random", Rights::REMOVE_RANDOM),
    ("remove any", Rights::REMOVE_ANY),
    ("scratch own", Rights::SCRATCH_OWN),
    ("scratch random", Rights::SCRATCH_RANDOM),
    ("scratch any", Rights::SCRATCH_ANY),
    ("volume", Rights::VOLUME),
    ("admin", Rights::ADMIN),
    ("rescan", Rights::RESCAN),
    ("register", Rights::REGISTER),
    ("user info", Rights::USERINFO),
    ("prefs", Rights::PREFS),
    ("global prefs", Rights::GLOBAL_PREFS),
    ("pause", Rights::PAUSE),
];

impl Rights {
    /// Rights a freshly registered, unconfirmed account gets.
    pub fn unconfirmed() -> Rights {
        Rights::READ | Rights::REGISTER
    }

    /// The stock grant for ordinary confirmed users, used when the
    /// configuration does not name one.
    pub fn default_user() -> Rights {
        Rights::READ
            | Rights::PLAY
            | Rights::MOVE_OWN
            | Rights::MOVE_RANDOM
            | Rights::REMOVE_OWN
            | Rights::REMOVE_RANDOM
            | Rights::SCRATCH_OWN
            | Rights::SCRATCH_RANDOM
            | Rights::VOLUME
            | Rights::PREFS
            | Rights::PAUSE
    }

    /// Which of own/random/any applies when `who` acts on `entry`.
    ///
    /// Random picks count as "random"; anything the actor submitted
    /// themselves (scratches included) counts as "own"; the rest needs the
    /// "any" variant.
    fn scoped(who: &str, entry: &QueueEntry, own: Rights, random: Rights, any: Rights) -> Rights {
        if entry.origin == Origin::Random && entry.submitter.is_none() {
            random | any
        } else if entry.submitter.as_deref() == Some(who) {
            own | any
        } else {
            any
        }
    }

    pub fn may_move(self, who: &str, entry: &QueueEntry) -> bool {
        self.intersects(Self::scoped(
            who,
            entry,
            Rights::MOVE_OWN,
            Rights::MOVE_RANDOM,
            Rights::MOVE_ANY,
        ))
    }

    pub fn may_remove(self, who: &str, entry: &QueueEntry) -> bool {
        self.intersects(Self::scoped(
            who,
            entry,
            Rights::REMOVE_OWN,
            Rights::REMOVE_RANDOM,
            Rights::REMOVE_ANY,
        ))
    }

    pub fn may_scratch(self, who: &str, entry: &QueueEntry) -> bool {
        self.intersects(Self::scoped(
            who,
            entry,
            Rights::SCRATCH_OWN,
            Rights::SCRATCH_RANDOM,
            Rights::SCRATCH_ANY,
        ))
    }
}

impl FromStr for Rights {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rights = Rights::empty();
        for word in s.split(',') {
            let word = word.trim();
            if word.is_empty() {
                continue;
            }
            if word == "all" {
                rights |= Rights::all();
                continue;
            }
            let (_, r) = NAMES
                .iter()
                .find(|(name, _)| *name == word)
                .ok_or_else(|| eyre!("unknown right {word:?}"))?;
            rights |= *r;
        }
        Ok(rights)
    }
}

impl fmt::Display for Rights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, r) in NAMES {
            if self.contains(*r) {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::PlayState;
    use pretty_assertions::assert_eq;

    fn entry(submitter: Option<&str>, origin: Origin) -> QueueEntry {
        let mut e = QueueEntry::new("x".into(), "tracks/a.ogg".into(), origin);
        e.submitter = submitter.map(str::to_owned);
        e.state = PlayState::Unplayed;
        e
    }

    #[test]
    fn parse_and_format_are_symmetric() {
        let r: Rights = "read,play,move any,scratch any".parse().unwrap();
        assert_eq!(
            r,
            Rights::READ | Rights::PLAY | Rights::MOVE_ANY | Rights::SCRATCH_ANY
        );
        assert_eq!(r.to_string(), "read,play,move any,scratch any");
        assert_eq!(r.to_string().parse::<Rights>().unwrap(), r);
        assert_eq!("all".parse::<Rights>().unwrap(), Rights::all());
        assert!("read,flarp".parse::<Rights>().is_err());
    }

    #[test]
    fn scope_resolution() {
        let alice_own = entry(Some("alice"), Origin::Picked);
        let random = entry(None, Origin::Random);
        let bobs = entry(Some("bob"), Origin::Picked);

        let r = Rights::SCRATCH_OWN | Rights::SCRATCH_RANDOM;
        assert!(r.may_scratch("alice", &alice_own));
        assert!(r.may_scratch("alice", &random));
        assert!(!r.may_scratch("alice", &bobs));
        assert!(Rights::SCRATCH_ANY.may_scratch("alice", &bobs));

        // an adopted random pick belongs to its adopter
        let mut adopted = entry(Some("bob"), Origin::Adopted);
        adopted.state = PlayState::Unplayed;
        assert!(!Rights::MOVE_RANDOM.may_move("alice", &adopted));
        assert!(Rights::MOVE_OWN.may_move("bob", &adopted));
    }
}
