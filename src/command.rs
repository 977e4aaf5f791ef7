//! Every command the server understands, with its arity, rights and body
//! metadata. The dispatch loop looks commands up here before a handler ever
//! runs, so arity and rights mistakes never reach handler code.

use strum::{Display, EnumString, VariantNames};

use crate::rights::Rights;

/// Variadic commands put this in `max_args`.
pub const MANY: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, VariantNames)]
#[strum(serialize_all = "kebab-case")]
pub enum Command {
    Adduser,
    Adopt,
    Allfiles,
    Confirm,
    Cookie,
    Deluser,
    Dirs,
    Disable,
    Edituser,
    Enable,
    Enabled,
    Exists,
    Files,
    Get,
    GetGlobal,
    Length,
    Log,
    MakeCookie,
    Move,
    Moveafter,
    New,
    Nop,
    Part,
    Pause,
    Play,
    Playafter,
    Playing,
    PlaylistDelete,
    PlaylistGet,
    PlaylistGetShare,
    PlaylistLock,
    PlaylistSet,
    PlaylistSetShare,
    PlaylistUnlock,
    Playlists,
    Prefs,
    Queue,
    RandomDisable,
    RandomEnable,
    RandomEnabled,
    Recent,
    Register,
    Reminder,
    Remove,
    Rescan,
    Resolve,
    Resume,
    Revoke,
    RtpAddress,
    ScheduleAdd,
    ScheduleDel,
    ScheduleGet,
    ScheduleList,
    Scratch,
    Search,
    Set,
    SetGlobal,
    Stats,
    Tags,
    Unset,
    UnsetGlobal,
    User,
    Userinfo,
    Users,
    Version,
    Volume,
}

#[derive(Debug, Clone, Copy)]
pub struct Spec {
    pub min_args: usize,
    pub max_args: usize,
    /// Rights required up front. Own/random/any variants are resolved by the
    /// handler against the target entry; commands doing that carry empty
    /// rights here.
    pub rights: Rights,
    /// May be issued before authentication.
    pub pre_auth: bool,
    /// A dot-stuffed body follows the command line.
    pub has_body: bool,
}

impl Command {
    pub fn spec(self) -> Spec {
        use Command::*;
        let spec = |min_args, max_args, rights| Spec {
            min_args,
            max_args,
            rights,
            pre_auth: false,
            has_body: false,
        };
        let none = Rights::empty();
        match self {
            Adduser => spec(2, 3, Rights::ADMIN),
            Adopt => spec(1, 1, Rights::PLAY),
            Allfiles => spec(1, 2, Rights::READ),
            Confirm => Spec {
                pre_auth: true,
                ..spec(1, 1, none)
            },
            Cookie => Spec {
                pre_auth: true,
                ..spec(1, 1, none)
            },
            Deluser => spec(1, 1, Rights::ADMIN),
            Dirs => spec(1, 2, Rights::READ),
            Disable => spec(0, 0, Rights::GLOBAL_PREFS),
            Edituser => spec(3, 3, Rights::ADMIN),
            Enable => spec(0, 0, Rights::GLOBAL_PREFS),
            Enabled => spec(0, 0, Rights::READ),
            Exists => spec(1, 1, Rights::READ),
            Files => spec(1, 2, Rights::READ),
            Get => spec(2, 2, Rights::READ),
            GetGlobal => spec(1, 1, Rights::READ),
            Length => spec(1, 1, Rights::READ),
            Log => spec(0, 0, Rights::READ),
            MakeCookie => spec(0, 0, none),
            Move => spec(2, 2, none),
            Moveafter => spec(1, MANY, none),
            New => spec(0, 1, Rights::READ),
            Nop => Spec {
                pre_auth: true,
                ..spec(0, 0, none)
            },
            Part => spec(3, 3, Rights::READ),
            Pause => spec(0, 0, Rights::PAUSE),
            Play => spec(1, 1, Rights::PLAY),
            Playafter => spec(2, MANY, Rights::PLAY),
            Playing => spec(0, 0, Rights::READ),
            PlaylistDelete => spec(1, 1, Rights::PLAY),
            PlaylistGet => spec(1, 1, Rights::READ),
            PlaylistGetShare => spec(1, 1, Rights::READ),
            PlaylistLock => spec(1, 1, Rights::PLAY),
            PlaylistSet => Spec {
                has_body: true,
                ..spec(1, 1, Rights::PLAY)
            },
            PlaylistSetShare => spec(2, 2, Rights::PLAY),
            PlaylistUnlock => spec(0, 0, Rights::PLAY),
            Playlists => spec(0, 0, Rights::READ),
            Prefs => spec(1, 1, Rights::READ),
            Queue => spec(0, 0, Rights::READ),
            RandomDisable => spec(0, 0, Rights::GLOBAL_PREFS),
            RandomEnable => spec(0, 0, Rights::GLOBAL_PREFS),
            RandomEnabled => spec(0, 0, Rights::READ),
            Recent => spec(0, 0, Rights::READ),
            Register => spec(3, 3, Rights::REGISTER),
            Reminder => Spec {
                pre_auth: true,
                ..spec(1, 1, none)
            },
            Remove => spec(1, 1, none),
            Rescan => spec(0, 0, Rights::RESCAN),
            Resolve => spec(1, 1, Rights::READ),
            Resume => spec(0, 0, Rights::PAUSE),
            Revoke => spec(0, 0, none),
            RtpAddress => spec(0, 0, Rights::READ),
            ScheduleAdd => spec(4, 5, none),
            ScheduleDel => spec(1, 1, none),
            ScheduleGet => spec(1, 1, Rights::READ),
            ScheduleList => spec(0, 0, Rights::READ),
            Scratch => spec(0, 1, none),
            Search => spec(1, MANY, Rights::READ),
            Set => spec(3, 3, Rights::PREFS),
            SetGlobal => spec(2, 2, Rights::GLOBAL_PREFS),
            Stats => spec(0, 0, Rights::READ),
            Tags => spec(0, 0, Rights::READ),
            Unset => spec(2, 2, Rights::PREFS),
            UnsetGlobal => spec(1, 1, Rights::GLOBAL_PREFS),
            User => Spec {
                pre_auth: true,
                ..spec(2, 2, none)
            },
            Userinfo => spec(2, 2, Rights::READ),
            Users => spec(0, 0, Rights::READ),
            Version => spec(0, 0, Rights::READ),
            Volume => spec(0, 2, Rights::READ),
        }
    }
}
