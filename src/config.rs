//! The pre-parsed server configuration. The daemon consumes this object;
//! anything fancier than TOML-with-defaults (the original's bespoke config
//! language) stays out of the core.

use camino::Utf8PathBuf;
use color_eyre::Result;
use color_eyre::eyre::Context;
use etcetera::BaseStrategy;
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;

use crate::auth::Algorithm;
use crate::rights::Rights;

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// TCP addresses to listen on, `host:port`.
    pub listen: Vec<String>,
    /// Local socket path; defaults to `socket` under the state directory.
    pub socket: Option<Utf8PathBuf>,
    /// Collection roots tracks live under.
    pub collections: Vec<Utf8PathBuf>,
    /// Where the database and state files go.
    pub state_dir: Option<Utf8PathBuf>,

    /// Decoder programs by shell glob; first match wins. The program gets the
    /// track path as its final argument and writes framed PCM to stdout.
    pub players: Vec<PlayerSpec>,
    /// Track-length programs by shell glob; they print decimal seconds.
    pub tracklength: Vec<PlayerSpec>,
    /// Pool of scratch sounds; one is queued at the head on scratch.
    pub scratch: Vec<Utf8PathBuf>,

    pub sample_format: SampleFormat,
    pub speaker: Speaker,
    /// What a pause does to a decoder without native pause support.
    pub pause_mode: PauseMode,
    /// Seconds of silence between tracks.
    pub gap: i64,

    /// Bound on the recently-played list.
    pub history: usize,
    /// Seconds a track is ineligible for random selection after playing.
    pub replay_min: i64,
    /// Weight given to recently added tracks.
    pub new_bias: u64,
    /// How recently added a track must be to get `new_bias`.
    pub new_bias_age: i64,
    /// Window reported by the `new` command.
    pub new_max: i64,

    /// Display/sort name rewrite rules, applied first match wins.
    pub namepart: Vec<NamepartSpec>,
    /// Words the search index drops.
    pub stopwords: Vec<String>,
    /// Pattern aliases are built from when trackname prefs are set.
    pub alias: String,

    pub playlist_max: usize,
    /// Seconds after which an abandoned playlist lock may be stolen.
    pub playlist_lock_timeout: u64,

    /// Challenge/response digest advertised in the greeting.
    pub algorithm: Algorithm,
    /// Seconds a login cookie lives.
    pub cookie_login_lifetime: i64,
    /// Seconds between signing-key rotations.
    pub cookie_key_lifetime: i64,
    /// Rights granted to confirmed users, as a rights string.
    pub default_rights: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: Vec::new(),
            socket: None,
            collections: Vec::new(),
            state_dir: None,
            players: Vec::new(),
            tracklength: Vec::new(),
            scratch: Vec::new(),
            sample_format: SampleFormat::default(),
            speaker: Speaker::default(),
            pause_mode: PauseMode::default(),
            gap: 0,
            history: 60,
            replay_min: 8 * 3600,
            new_bias: 4_500_000,
            new_bias_age: 7 * 86400,
            new_max: 7 * 86400,
            namepart: NamepartSpec::defaults(),
            stopwords: default_stopwords(),
            alias: "{artist}/{album}/{title}{ext}".to_string(),
            playlist_max: 500,
            playlist_lock_timeout: 10,
            algorithm: Algorithm::Sha256,
            cookie_login_lifetime: 86400,
            cookie_key_lifetime: 7 * 86400,
            default_rights: None,
        }
    }
}

impl Config {
    pub fn load(path: &Utf8PathBuf) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("could not read config {path}"))?;
        let config: Config =
            toml::from_str(&text).wrap_err_with(|| format!("could not parse config {path}"))?;
        // surface bad rights strings at startup, not at first confirm
        config.default_rights()?;
        Ok(config)
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.state_dir {
            return Ok(dir.as_std_path().to_owned());
        }
        let dirs = etcetera::choose_base_strategy()?;
        Ok(dirs.data_dir().join("jukeboxd"))
    }

    pub fn player_for(&self, track: &str) -> Option<&PlayerSpec> {
        self.players.iter().find(|p| p.matches(track))
    }

    pub fn tracklength_for(&self, track: &str) -> Option<&PlayerSpec> {
        self.tracklength.iter().find(|p| p.matches(track))
    }

    pub fn default_rights(&self) -> Result<Rights> {
        match &self.default_rights {
            Some(s) => s
                .parse()
                .wrap_err("bad default_rights in configuration"),
            None => Ok(Rights::default_user()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlayerSpec {
    /// Shell glob over the track path (`*` and `?`).
    pub pattern: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Whether the decoder honours a native pause request.
    #[serde(default)]
    pub pauses: bool,
}

impl PlayerSpec {
    pub fn matches(&self, track: &str) -> bool {
        glob_to_regex(&self.pattern).is_match(track)
    }
}

/// Compile a shell glob down to an anchored regex. Only `*` and `?` are
/// special; everything else matches itself.
pub fn glob_to_regex(glob: &str) -> Regex {
    let mut rx = String::with_capacity(glob.len() + 8);
    rx.push('^');
    for c in glob.chars() {
        match c {
            '*' => rx.push_str(".*"),
            '?' => rx.push('.'),
            c => rx.push_str(&regex::escape(&c.to_string())),
        }
    }
    rx.push('$');
    Regex::new(&rx).expect("escaped glob is a valid regex")
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct SampleFormat {
    pub bits: u32,
    pub rate: u32,
    pub channels: u32,
}

impl Default for SampleFormat {
    fn default() -> Self {
        SampleFormat {
            bits: 16,
            rate: 44100,
            channels: 2,
        }
    }
}

impl SampleFormat {
    pub fn bytes_per_second(&self) -> u64 {
        u64::from(self.rate) * u64::from(self.channels) * u64::from(self.bits / 8)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Speaker {
    /// Pipe PCM into a subprocess's stdin.
    Command { command: String },
    /// Broadcast RTP packets.
    Rtp {
        broadcast: String,
        #[serde(default)]
        from: Option<String>,
        #[serde(default = "default_ttl")]
        multicast_ttl: u32,
        #[serde(default)]
        multicast_loop: bool,
        #[serde(default = "default_payload_type")]
        payload_type: u8,
    },
    /// Discard the audio; useful headless and in tests.
    #[default]
    Null,
}

fn default_ttl() -> u32 {
    1
}

fn default_payload_type() -> u8 {
    96
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PauseMode {
    /// Feed the sink silence while paused.
    #[default]
    Silence,
    /// Feed the sink nothing; some outputs will underrun audibly.
    Suspend,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamepartSpec {
    /// Which part this computes: artist, album, title or ext.
    pub part: String,
    /// Regex over the full track path.
    pub regexp: String,
    /// Replacement, `$1` style.
    pub replacement: String,
    /// Context it applies to: `display`, `sort` or `*`.
    #[serde(default = "default_context")]
    pub context: String,
}

fn default_context() -> String {
    "*".to_string()
}

impl NamepartSpec {
    pub fn defaults() -> Vec<NamepartSpec> {
        let spec = |part: &str, regexp: &str, replacement: &str| NamepartSpec {
            part: part.to_string(),
            regexp: regexp.to_string(),
            replacement: replacement.to_string(),
            context: "*".to_string(),
        };
        vec![
            spec("title", r"/(?:\d+[-:. ] *)?([^/]+)\.[a-zA-Z0-9]+$", "$1"),
            spec("title", r"/([^/]+)$", "$1"),
            spec("album", r"/([^/]+)/[^/]+$", "$1"),
            spec("artist", r"/([^/]+)/[^/]+/[^/]+$", "$1"),
            spec("ext", r"(\.[a-zA-Z0-9]+)$", "$1"),
        ]
    }
}

fn default_stopwords() -> Vec<String> {
    [
        "0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "a", "an", "and", "as", "for", "i",
        "im", "in", "is", "of", "on", "the", "to", "too", "was",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globs() {
        assert!(glob_to_regex("*.ogg").is_match("music/a.ogg"));
        assert!(!glob_to_regex("*.ogg").is_match("music/a.mp3"));
        assert!(glob_to_regex("??.flac").is_match("ab.flac"));
        // regex metacharacters in the glob are literal
        assert!(glob_to_regex("a+b*").is_match("a+b.ogg"));
        assert!(!glob_to_regex("a+b*").is_match("aab.ogg"));
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let c: Config = toml::from_str(
            r#"
            collections = ["/srv/music"]
            listen = ["0.0.0.0:9600"]

            [[players]]
            pattern = "*.ogg"
            program = "jukebox-decode"

            [speaker]
            kind = "command"
            command = "pacat --raw"
            "#,
        )
        .unwrap();
        assert_eq!(c.history, 60);
        assert_eq!(c.replay_min, 28800);
        assert_eq!(c.sample_format, SampleFormat::default());
        assert!(c.player_for("x/y.ogg").is_some());
        assert!(c.player_for("x/y.wav").is_none());
        assert!(matches!(c.speaker, Speaker::Command { .. }));
    }
}
