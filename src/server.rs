//! Listeners, the per-connection request loop and every command handler.
//!
//! A connection reads one line at a time, collects a dot-stuffed body when
//! the command takes one, and is answered fully before the next line is
//! read. The `log` command flips the connection into streaming mode until
//! the client sends another line or goes away.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::{Context as _, eyre};
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{Mutex, mpsc};
use tokio::task;
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};

use crate::auth::{expected_response, new_challenge, new_nonce, valid_username};
use crate::command::Command;
use crate::config::Speaker;
use crate::events::Event;
use crate::player::Control;
use crate::player::mixer::Mixer;
use crate::playlist::Share;
use crate::protocol::{self, LOG_PROD_INTERVAL, Response as R, quote_args, split, unstuff};
use crate::queue::Origin;
use crate::rights::Rights;
use crate::schedule::{Action, Priority, ScheduledAction};
use crate::system::{System, unix_now};

#[derive(Clone)]
pub struct Server {
    pub system: Arc<Mutex<System>>,
    pub player: mpsc::Sender<Control>,
}

#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    pub rights: Rights,
}

/// Per-connection state: who is on the other end and how they got in.
pub struct Connection {
    pub id: u64,
    pub challenge: [u8; 32],
    pub user: Option<Identity>,
    /// The cookie used to authenticate, for `revoke`.
    pub cookie: Option<String>,
    pub auth_failures: u32,
}

impl Connection {
    pub async fn open(server: &Server) -> Connection {
        let id = server.system.lock().await.next_conn_id();
        Connection {
            id,
            challenge: new_challenge(),
            user: None,
            cookie: None,
            auth_failures: 0,
        }
    }
}

/// Bind every configured listener and serve until the process exits.
pub async fn serve(server: Server) -> Result<()> {
    let (listen, socket_path) = {
        let sys = server.system.lock().await;
        let socket = match &sys.config.socket {
            Some(path) => path.as_std_path().to_owned(),
            None => sys.config.state_dir()?.join("socket"),
        };
        (sys.config.listen.clone(), socket)
    };

    for addr in listen {
        let listener = TcpListener::bind(&addr)
            .await
            .wrap_err_with(|| format!("could not listen on {addr}"))?;
        info!("listening on {addr}");
        let server = server.clone();
        task::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("connection from {peer}");
                        let server = server.clone();
                        task::spawn(async move {
                            let (reader, writer) = tokio::io::split(stream);
                            let reader = BufReader::new(reader).lines();
                            if let Err(e) = handle_client(server, reader, writer).await {
                                info!("client error: {e:#}");
                            }
                        });
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
        });
    }

    // a stale socket from a previous run refuses the bind
    match std::fs::remove_file(&socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).wrap_err("could not remove stale socket"),
    }
    let listener = UnixListener::bind(&socket_path)
        .wrap_err_with(|| format!("could not listen on {}", socket_path.display()))?;
    info!("listening on {}", socket_path.display());
    task::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let server = server.clone();
                    task::spawn(async move {
                        let (reader, writer) = tokio::io::split(stream);
                        let reader = BufReader::new(reader).lines();
                        if let Err(e) = handle_client(server, reader, writer).await {
                            info!("client error: {e:#}");
                        }
                    });
                }
                Err(e) => warn!("accept failed: {e}"),
            }
        }
    });
    Ok(())
}

async fn handle_client(
    server: Server,
    mut reader: tokio::io::Lines<impl AsyncBufRead + Unpin>,
    mut writer: impl AsyncWrite + Unpin,
) -> Result<()> {
    let mut conn = Connection::open(&server).await;
    let algorithm = server.system.lock().await.config.algorithm;
    writer
        .write_all(protocol::greeting(&algorithm.to_string(), &conn.challenge).as_bytes())
        .await
        .wrap_err("could not send greeting")?;

    let mut pending: Option<String> = None;
    loop {
        let line = match pending.take() {
            Some(line) => line,
            None => match reader.next_line().await.wrap_err("could not read request")? {
                Some(line) => line,
                None => break,
            },
        };
        let line = line.strip_suffix('\r').unwrap_or(&line).to_owned();

        let response = handle_line(&server, &mut conn, &line, &mut reader).await?;
        debug!("reply: {}", response.render().trim_end());
        writer
            .write_all(response.render().as_bytes())
            .await
            .wrap_err("could not write response")?;

        if response == R::LogFollows {
            match stream_log(&server, &mut reader, &mut writer).await? {
                Some(next) => pending = Some(next),
                None => break,
            }
        }
        if conn.auth_failures >= 3 {
            info!("closing connection after three authentication failures");
            break;
        }
    }
    server.system.lock().await.playlists.release_conn(conn.id);
    Ok(())
}

/// Parse one request line, collect its body if it takes one, and run it.
async fn handle_line(
    server: &Server,
    conn: &mut Connection,
    line: &str,
    reader: &mut tokio::io::Lines<impl AsyncBufRead + Unpin>,
) -> Result<R> {
    let tokens = match split(line) {
        Ok(tokens) => tokens,
        Err(e) => return Ok(R::Syntax(format!("{e}"))),
    };
    let Some((name, args)) = tokens.split_first() else {
        return Ok(R::Syntax("missing command".to_string()));
    };
    let Ok(cmd) = Command::from_str(name) else {
        return Ok(R::Syntax(format!("unknown command {name:?}")));
    };
    let spec = cmd.spec();

    let body = if spec.has_body {
        let mut body = Vec::new();
        loop {
            let Some(line) = reader.next_line().await.wrap_err("could not read body")? else {
                return Err(eyre!("connection closed inside a body"));
            };
            let line = line.strip_suffix('\r').unwrap_or(&line).to_owned();
            if line == "." {
                break;
            }
            body.push(unstuff(&line).to_owned());
        }
        Some(body)
    } else {
        None
    };

    if !spec.pre_auth && conn.user.is_none() {
        return Ok(R::AuthFailed("authentication required".to_string()));
    }
    if args.len() < spec.min_args || args.len() > spec.max_args {
        return Ok(R::Syntax(format!("wrong number of arguments to {name}")));
    }
    if let Some(ident) = &conn.user
        && !ident.rights.contains(spec.rights)
    {
        return Ok(R::Denied("permission denied".to_string()));
    }

    let response = match perform(server, conn, cmd, args, body).await {
        Ok(response) => response,
        Err(e) => {
            warn!("error handling {name}: {e:#}");
            R::NotFound(format!("server error: {e}"))
        }
    };
    match &response {
        R::AuthFailed(_) => conn.auth_failures += 1,
        r if !r.is_error() => conn.auth_failures = 0,
        _ => {}
    }
    Ok(response)
}

/// Stream the event log until the client sends another line (returned for
/// normal processing) or disconnects (`None`). A keepalive byte goes out
/// after every idle interval so dead peers are noticed.
async fn stream_log(
    server: &Server,
    reader: &mut tokio::io::Lines<impl AsyncBufRead + Unpin>,
    writer: &mut (impl AsyncWrite + Unpin),
) -> Result<Option<String>> {
    use futures::FutureExt;
    use futures_concurrency::prelude::*;

    #[derive(Debug)]
    enum Woken {
        Event(Option<String>),
        Keepalive,
        NextLine(std::io::Result<Option<String>>),
    }

    let mut rx = server.system.lock().await.bus.subscribe_log();
    let mut keepalive = interval(Duration::from_secs(LOG_PROD_INTERVAL));
    keepalive.tick().await; // the first tick is immediate
    loop {
        let event = rx.recv().map(Woken::Event);
        let prod = keepalive.tick().map(|_| Woken::Keepalive);
        let line = reader.next_line().map(Woken::NextLine);
        match (event, prod, line).race().await {
            Woken::Event(Some(line)) => {
                writer
                    .write_all(format!("{line}\n").as_bytes())
                    .await
                    .wrap_err("could not write log event")?;
            }
            Woken::Event(None) => return Ok(None),
            Woken::Keepalive => {
                writer.write_all(b"\n").await.wrap_err("could not write keepalive")?;
            }
            Woken::NextLine(line) => {
                let Some(line) = line.wrap_err("could not read during log")? else {
                    return Ok(None);
                };
                // close off the stream before answering the new command
                writer.write_all(b".\r\n").await.wrap_err("could not end log")?;
                return Ok(Some(line));
            }
        }
    }
}

fn ident(conn: &Connection) -> Identity {
    conn.user.clone().expect("authentication was checked at dispatch")
}

fn yes_no(value: bool) -> String {
    if value { "yes" } else { "no" }.to_string()
}

#[instrument(skip(server, conn, args, body), fields(cmd = %cmd))]
async fn perform(
    server: &Server,
    conn: &mut Connection,
    cmd: Command,
    args: &[String],
    body: Option<Vec<String>>,
) -> Result<R> {
    use Command::*;
    let mut sys = server.system.lock().await;
    let now = unix_now();

    Ok(match cmd {
        Nop => R::Ok,
        Version => R::Args(vec![format!("jukeboxd {}", env!("CARGO_PKG_VERSION"))]),

        // Authentication ---------------------------------------------------
        User => {
            if conn.user.is_some() {
                return Ok(R::Syntax("already authenticated".to_string()));
            }
            let (name, response) = (&args[0], &args[1]);
            let algorithm = sys.config.algorithm;
            let user = sys.store.get_user(name)?;
            let genuine = user.as_ref().is_some_and(|u| {
                u.confirmation.is_none()
                    && expected_response(algorithm, &conn.challenge, &u.password)
                        == response.to_lowercase()
            });
            if !genuine {
                info!("failed login for {name:?}");
                return Ok(R::AuthFailed("authentication failed".to_string()));
            }
            let user = user.expect("checked just above");
            conn.user = Some(Identity {
                name: user.name,
                rights: user.rights,
            });
            info!("{name} logged in");
            R::Authenticated
        }
        Cookie => {
            if conn.user.is_some() {
                return Ok(R::Syntax("already authenticated".to_string()));
            }
            let cookie = &args[0];
            let name = match sys.cookies.validate(cookie, now) {
                Ok(name) => name,
                Err(e) => {
                    info!("bad cookie: {e}");
                    return Ok(R::AuthFailed("authentication failed".to_string()));
                }
            };
            let Some(user) = sys.store.get_user(&name)? else {
                return Ok(R::AuthFailed("authentication failed".to_string()));
            };
            conn.user = Some(Identity {
                name: user.name,
                rights: user.rights,
            });
            conn.cookie = Some(cookie.clone());
            info!("{name} logged in with a cookie");
            R::Authenticated
        }
        MakeCookie => {
            let who = ident(conn);
            let lifetime = sys.config.cookie_login_lifetime;
            let cookie = sys.cookies.issue(&who.name, now, lifetime);
            R::Args(vec![cookie])
        }
        Revoke => match conn.cookie.take() {
            Some(cookie) => {
                sys.cookies.revoke(&cookie, now);
                R::Ok
            }
            None => R::Precondition("revoke a cookie this connection did not use".to_string()),
        },

        // Accounts ---------------------------------------------------------
        Register => {
            let (name, password, email) = (&args[0], &args[1], &args[2]);
            if !valid_username(name) {
                return Ok(R::Precondition(format!("register invalid username {name:?}")));
            }
            if !email.contains('@') {
                return Ok(R::Precondition(format!("register invalid email {email:?}")));
            }
            if sys.user_exists(name)? {
                return Ok(R::Precondition(format!("register existing user {name:?}")));
            }
            let nonce = new_nonce();
            sys.store
                .create_user(name, password, Some(email), Rights::unconfirmed(), Some(&nonce))?;
            sys.raise(Event::UserAdd { user: name.clone() });
            R::Args(vec![nonce])
        }
        Confirm => {
            let nonce = &args[0];
            let Some(name) = sys.store.find_confirmation(nonce)? else {
                return Ok(R::NotFound("no such confirmation".to_string()));
            };
            let rights = sys.config.default_rights()?;
            if !sys.store.confirm_user(&name, nonce, rights)? {
                return Ok(R::NotFound("no such confirmation".to_string()));
            }
            sys.raise(Event::UserConfirm { user: name.clone() });
            conn.user = Some(Identity { name, rights });
            R::Authenticated
        }
        Adduser => {
            let (name, password) = (&args[0], &args[1]);
            if !valid_username(name) {
                return Ok(R::Precondition(format!("adduser invalid username {name:?}")));
            }
            if sys.user_exists(name)? {
                return Ok(R::Precondition(format!("adduser existing user {name:?}")));
            }
            let rights = match args.get(2) {
                Some(s) => match s.parse() {
                    Ok(rights) => rights,
                    Err(e) => return Ok(R::Syntax(format!("{e}"))),
                },
                None => sys.config.default_rights()?,
            };
            sys.store.create_user(name, password, None, rights, None)?;
            sys.raise(Event::UserAdd { user: name.clone() });
            R::Ok
        }
        Deluser => {
            let name = &args[0];
            if !sys.store.delete_user(name)? {
                return Ok(R::NotFound(format!("no such user {name:?}")));
            }
            sys.raise(Event::UserDelete { user: name.clone() });
            R::Ok
        }
        Edituser => {
            let (name, property, value) = (&args[0], &args[1], &args[2]);
            if !sys.user_exists(name)? {
                return Ok(R::NotFound(format!("no such user {name:?}")));
            }
            match property.as_str() {
                "email" => {
                    if !value.contains('@') {
                        return Ok(R::Precondition(format!("set invalid email {value:?}")));
                    }
                    sys.store.set_user_email(name, value)?;
                }
                "password" => sys.store.set_user_password(name, value)?,
                "rights" => match value.parse() {
                    Ok(rights) => sys.store.set_user_rights(name, rights)?,
                    Err(e) => return Ok(R::Syntax(format!("{e}"))),
                },
                other => return Ok(R::Syntax(format!("unknown user property {other:?}"))),
            }
            sys.raise(Event::UserEdit {
                user: name.clone(),
                property: property.clone(),
            });
            R::Ok
        }
        Userinfo => {
            let who = ident(conn);
            let (name, property) = (&args[0], &args[1]);
            if *name != who.name && !who.rights.contains(Rights::USERINFO) {
                return Ok(R::Denied("permission denied".to_string()));
            }
            let Some(user) = sys.store.get_user(name)? else {
                return Ok(R::NotFound(format!("no such user {name:?}")));
            };
            match property.as_str() {
                "email" => match user.email {
                    Some(email) => R::Args(vec![email]),
                    None => R::NotFound("no email address".to_string()),
                },
                "rights" => R::Args(vec![user.rights.to_string()]),
                other => R::Syntax(format!("unknown user property {other:?}")),
            }
        }
        Users => R::Body(sys.store.users()?.iter().map(|u| quote_args(&[u])).collect()),
        Reminder => {
            let name = &args[0];
            let Some(user) = sys.store.get_user(name)? else {
                return Ok(R::NotFound(format!("no such user {name:?}")));
            };
            let Some(email) = user.email else {
                return Ok(R::Precondition("remind a user with no email address".to_string()));
            };
            // mail delivery lives outside this daemon
            info!("password reminder for {name} would go to {email}");
            R::Ok
        }

        // Queue ------------------------------------------------------------
        Play => {
            let who = ident(conn);
            let Some(track) = sys.resolve_track(&args[0])? else {
                return Ok(R::NotFound(format!("no such track {:?}", args[0])));
            };
            let id = sys.play_track(&track, &who.name)?;
            R::Playing(id)
        }
        Playafter => {
            let who = ident(conn);
            let (target, tracks) = args.split_first().expect("arity was checked");
            let target = (!target.is_empty()).then_some(target.as_str());
            if let Some(t) = target
                && sys.queue.find(t).is_none()
            {
                return Ok(R::NotFound(format!("no such queue entry {t:?}")));
            }
            let mut resolved = Vec::with_capacity(tracks.len());
            for name in tracks {
                match sys.resolve_track(name)? {
                    Some(track) => resolved.push(track),
                    None => return Ok(R::NotFound(format!("no such track {name:?}"))),
                }
            }
            let ids = sys.play_after(target, &resolved, &who.name)?;
            R::Args(ids)
        }
        Remove => {
            let who = ident(conn);
            let id = &args[0];
            if sys.queue.playing().is_some_and(|p| p.id == *id) {
                return Ok(R::Precondition("remove the playing track".to_string()));
            }
            let Some(entry) = sys.queue.find(id) else {
                return Ok(R::NotFound(format!("no such queue entry {id:?}")));
            };
            if !who.rights.may_remove(&who.name, entry) {
                return Ok(R::Denied("permission denied".to_string()));
            }
            sys.remove_entry(id, &who.name)?;
            R::Ok
        }
        Move => {
            let who = ident(conn);
            let id = &args[0];
            let Ok(delta) = args[1].parse::<i64>() else {
                return Ok(R::Syntax(format!("bad delta {:?}", args[1])));
            };
            if sys.queue.playing().is_some_and(|p| p.id == *id) {
                return Ok(R::Precondition("move the playing track".to_string()));
            }
            let Some(entry) = sys.queue.find(id) else {
                return Ok(R::NotFound(format!("no such queue entry {id:?}")));
            };
            if !who.rights.may_move(&who.name, entry) {
                return Ok(R::Denied("permission denied".to_string()));
            }
            let moved = sys.move_entry(id, delta, &who.name)?;
            R::Raw(moved.to_string())
        }
        Moveafter => {
            let who = ident(conn);
            let (target, ids) = args.split_first().expect("arity was checked");
            let target = (!target.is_empty()).then_some(target.as_str());
            if let Some(t) = target
                && sys.queue.find(t).is_none()
            {
                return Ok(R::NotFound(format!("no such queue entry {t:?}")));
            }
            for id in ids {
                let Some(entry) = sys.queue.find(id) else {
                    return Ok(R::NotFound(format!("no such queue entry {id:?}")));
                };
                if !who.rights.may_move(&who.name, entry) {
                    return Ok(R::Denied("permission denied".to_string()));
                }
            }
            sys.move_after(target, ids, &who.name)?;
            R::Ok
        }
        Adopt => {
            let who = ident(conn);
            let id = &args[0];
            if sys.queue.find(id).is_none() {
                return Ok(R::NotFound(format!("no such queue entry {id:?}")));
            }
            match sys.adopt(id, &who.name) {
                Ok(()) => R::Ok,
                Err(_) => R::Precondition("adopt a track that is not a random pick".to_string()),
            }
        }
        Scratch => {
            let who = ident(conn);
            let Some(playing) = sys.playing_snapshot() else {
                return Ok(R::Precondition("scratch while nothing is playing".to_string()));
            };
            if let Some(id) = args.first()
                && *id != playing.id
            {
                return Ok(if sys.queue.find(id).is_some() {
                    R::Precondition("scratch a track that is not playing".to_string())
                } else {
                    R::NotFound(format!("no such queue entry {id:?}"))
                });
            }
            if !who.rights.may_scratch(&who.name, &playing) {
                return Ok(R::Denied("permission denied".to_string()));
            }
            sys.note_scratcher(&who.name);
            drop(sys);
            server
                .player
                .send(Control::Scratch {
                    id: playing.id,
                    who: who.name,
                })
                .await
                .wrap_err("player task is gone")?;
            R::Ok
        }
        Queue => R::Body(sys.queue.entries().map(|e| e.marshal()).collect()),
        Recent => R::Body(sys.queue.recent().map(|e| e.marshal()).collect()),
        Playing => match sys.playing_snapshot() {
            Some(entry) => R::Playing(entry.marshal()),
            None => R::NothingPlaying,
        },

        // Playback control -------------------------------------------------
        Enable => {
            sys.set_global("playing", "yes")?;
            R::Ok
        }
        Disable => {
            sys.set_global("playing", "no")?;
            R::Ok
        }
        Enabled => R::Args(vec![yes_no(sys.playing_enabled())]),
        RandomEnable => {
            sys.set_global("random-play", "yes")?;
            R::Ok
        }
        RandomDisable => {
            sys.set_global("random-play", "no")?;
            R::Ok
        }
        RandomEnabled => R::Args(vec![yes_no(sys.random_enabled())]),
        Pause => {
            if let Err(e) = sys.pause_playing() {
                return Ok(R::Precondition(format!("pause: {e}")));
            }
            drop(sys);
            server
                .player
                .send(Control::Pause)
                .await
                .wrap_err("player task is gone")?;
            R::Ok
        }
        Resume => {
            if let Err(e) = sys.resume_playing() {
                return Ok(R::Precondition(format!("resume: {e}")));
            }
            drop(sys);
            server
                .player
                .send(Control::Resume)
                .await
                .wrap_err("player task is gone")?;
            R::Ok
        }
        Volume => {
            let (mut left, mut right) = sys.mixer.get();
            if !args.is_empty() {
                let who = ident(conn);
                if !who.rights.contains(Rights::VOLUME) {
                    return Ok(R::Denied("permission denied".to_string()));
                }
                left = match Mixer::adjust(left, &args[0]) {
                    Ok(v) => v,
                    Err(e) => return Ok(R::Syntax(format!("{e}"))),
                };
                right = match args.get(1) {
                    Some(spec) => match Mixer::adjust(right, spec) {
                        Ok(v) => v,
                        Err(e) => return Ok(R::Syntax(format!("{e}"))),
                    },
                    None => left,
                };
                sys.mixer.set(left, right);
                sys.raise(Event::Volume { left, right });
            }
            R::Raw(format!("{left} {right}"))
        }
        RtpAddress => match &sys.config.speaker {
            Speaker::Rtp { broadcast, .. } => R::Args(vec![broadcast.clone()]),
            _ => R::NotFound("no RTP broadcast configured".to_string()),
        },

        // Track database ---------------------------------------------------
        Exists => R::Args(vec![yes_no(sys.resolve_track(&args[0])?.is_some())]),
        Resolve => match sys.resolve_track(&args[0])? {
            Some(track) => R::Args(vec![track]),
            None => R::NotFound(format!("no such track {:?}", args[0])),
        },
        Length => {
            let Some(track) = sys.resolve_track(&args[0])? else {
                return Ok(R::NotFound(format!("no such track {:?}", args[0])));
            };
            R::Raw(sys.track_length(&track).unwrap_or(0).to_string())
        }
        Part => {
            let Some(track) = sys.resolve_track(&args[0])? else {
                return Ok(R::NotFound(format!("no such track {:?}", args[0])));
            };
            R::Args(vec![sys.store.part(&track, &args[1], &args[2])?])
        }
        Get => {
            let Some(track) = sys.resolve_track(&args[0])? else {
                return Ok(R::NotFound(format!("no such track {:?}", args[0])));
            };
            match sys.store.get_pref(&track, &args[1])? {
                Some(value) => R::Args(vec![value]),
                None => R::NotFound(format!("no such preference {:?}", args[1])),
            }
        }
        Set => {
            let Some(track) = sys.resolve_track(&args[0])? else {
                return Ok(R::NotFound(format!("no such track {:?}", args[0])));
            };
            sys.store.set_pref(&track, &args[1], &args[2])?;
            R::Ok
        }
        Unset => {
            let Some(track) = sys.resolve_track(&args[0])? else {
                return Ok(R::NotFound(format!("no such track {:?}", args[0])));
            };
            sys.store.unset_pref(&track, &args[1])?;
            R::Ok
        }
        Prefs => {
            let Some(track) = sys.resolve_track(&args[0])? else {
                return Ok(R::NotFound(format!("no such track {:?}", args[0])));
            };
            R::Body(
                sys.store
                    .prefs(&track)?
                    .iter()
                    .map(|(k, v)| quote_args(&[k, v]))
                    .collect(),
            )
        }
        GetGlobal => match sys.store.get_global(&args[0])? {
            Some(value) => R::Args(vec![value]),
            None => R::NotFound(format!("no such global preference {:?}", args[0])),
        },
        SetGlobal => {
            sys.set_global(&args[0], &args[1])?;
            R::Ok
        }
        UnsetGlobal => {
            sys.store.unset_global(&args[0])?;
            R::Ok
        }
        Search => {
            let terms: Vec<String> = args
                .iter()
                .flat_map(|a| a.split_whitespace())
                .map(str::to_owned)
                .collect();
            R::Body(
                sys.store
                    .search(&terms)?
                    .iter()
                    .map(|t| quote_args(&[t]))
                    .collect(),
            )
        }
        Tags => R::Body(sys.store.tags()?.iter().map(|t| quote_args(&[t])).collect()),
        Files | Dirs | Allfiles => {
            let filter = match args.get(1) {
                Some(rx) => match Regex::new(rx) {
                    Ok(rx) => Some(rx),
                    Err(_) => return Ok(R::Syntax(format!("bad regexp {rx:?}"))),
                },
                None => None,
            };
            let listing = match cmd {
                Files => sys.store.files(&args[0], filter.as_ref())?,
                Dirs => sys.store.dirs(&args[0], filter.as_ref())?,
                _ => sys.store.allfiles(&args[0], filter.as_ref())?,
            };
            R::Body(listing.iter().map(|p| quote_args(&[p])).collect())
        }
        New => {
            let limit = match args.first() {
                Some(n) => match n.parse::<usize>() {
                    Ok(n) => n,
                    Err(_) => return Ok(R::Syntax(format!("bad count {n:?}"))),
                },
                None => usize::MAX,
            };
            let max_age = sys.config.new_max;
            let tracks = sys.store.new_tracks(now, max_age)?;
            R::Body(tracks.iter().take(limit).map(|t| quote_args(&[t])).collect())
        }
        Stats => R::Body(sys.stats()?),
        Rescan => {
            drop(sys);
            let system = Arc::clone(&server.system);
            task::spawn(async move {
                if let Err(e) = run_rescan(system).await {
                    warn!("rescan failed: {e:#}");
                }
            });
            R::Ok
        }
        Log => R::LogFollows,

        // Playlists --------------------------------------------------------
        Playlists => {
            let who = ident(conn);
            let admin = who.rights.contains(Rights::ADMIN);
            R::Body(
                sys.playlists
                    .visible(&who.name, admin)
                    .iter()
                    .map(|n| quote_args(&[n]))
                    .collect(),
            )
        }
        PlaylistGet => {
            let who = ident(conn);
            let admin = who.rights.contains(Rights::ADMIN);
            let name = &args[0];
            if !sys.playlists.exists(name) {
                return Ok(R::NotFound(format!("no such playlist {name:?}")));
            }
            match sys.playlists.get(name, &who.name, admin) {
                Ok(list) => {
                    R::Body(list.tracks.iter().map(|t| quote_args(&[t.as_str()])).collect())
                }
                Err(_) => R::Denied("permission denied".to_string()),
            }
        }
        PlaylistGetShare => {
            let who = ident(conn);
            let admin = who.rights.contains(Rights::ADMIN);
            let name = &args[0];
            if !sys.playlists.exists(name) {
                return Ok(R::NotFound(format!("no such playlist {name:?}")));
            }
            match sys.playlists.share_of(name, &who.name, admin) {
                Ok(share) => R::Args(vec![share.to_string()]),
                Err(_) => R::Denied("permission denied".to_string()),
            }
        }
        PlaylistSetShare => {
            let who = ident(conn);
            let admin = who.rights.contains(Rights::ADMIN);
            let name = &args[0];
            let Ok(share) = args[1].parse::<Share>() else {
                return Ok(R::Syntax(format!("bad share {:?}", args[1])));
            };
            if !sys.playlists.exists(name) {
                return Ok(R::NotFound(format!("no such playlist {name:?}")));
            }
            match sys.playlists.set_share(name, &who.name, admin, share) {
                Ok(()) => R::Ok,
                Err(_) => R::Denied("permission denied".to_string()),
            }
        }
        PlaylistLock => match sys.playlists.lock(&args[0], conn.id, now) {
            Ok(()) => R::Ok,
            Err(e) => R::Precondition(format!("lock playlist: {e}")),
        },
        PlaylistUnlock => match sys.playlists.unlock(conn.id) {
            Ok(()) => R::Ok,
            Err(e) => R::Precondition(format!("unlock playlist: {e}")),
        },
        PlaylistSet => {
            let who = ident(conn);
            let name = &args[0];
            let body = body.expect("command table says a body follows");
            if !sys.playlists.holds_lock(name, conn.id) {
                return Ok(R::Precondition(format!("set playlist {name:?} without the lock")));
            }
            if sys.playlists.exists(name) && !sys.playlists.writable_by(name, &who.name) {
                return Ok(R::Denied("permission denied".to_string()));
            }
            let tracks = body.into_iter().map(Into::into).collect();
            match sys.playlists.set(name, &who.name, conn.id, tracks) {
                Ok(()) => R::Ok,
                Err(e) => R::Precondition(format!("set playlist: {e}")),
            }
        }
        PlaylistDelete => {
            let who = ident(conn);
            let admin = who.rights.contains(Rights::ADMIN);
            let name = &args[0];
            if !sys.playlists.exists(name) {
                return Ok(R::NotFound(format!("no such playlist {name:?}")));
            }
            if !admin && !sys.playlists.writable_by(name, &who.name) {
                return Ok(R::Denied("permission denied".to_string()));
            }
            sys.playlists.delete(name, &who.name, admin)?;
            R::Ok
        }

        // Scheduled actions ------------------------------------------------
        ScheduleAdd => {
            let who = ident(conn);
            let Ok(when) = args[0].parse::<i64>() else {
                return Ok(R::Syntax(format!("bad time {:?}", args[0])));
            };
            if when <= now {
                return Ok(R::Precondition("schedule an event in the past".to_string()));
            }
            let Ok(priority) = args[1].parse::<Priority>() else {
                return Ok(R::Syntax(format!("bad priority {:?}", args[1])));
            };
            let action = match args[2].as_str() {
                "play" => {
                    let Some(name) = args.get(3) else {
                        return Ok(R::Syntax("play needs a track".to_string()));
                    };
                    let Some(track) = sys.resolve_track(name)? else {
                        return Ok(R::NotFound(format!("no such track {name:?}")));
                    };
                    Action::Play { track: track.into() }
                }
                "set-global" => {
                    let (Some(key), Some(value)) = (args.get(3), args.get(4)) else {
                        return Ok(R::Syntax("set-global needs a key and value".to_string()));
                    };
                    Action::SetGlobal {
                        key: key.clone(),
                        value: value.clone(),
                    }
                }
                other => return Ok(R::Syntax(format!("unknown action {other:?}"))),
            };
            let id = sys.queue.fresh_id();
            sys.schedule.add(ScheduledAction {
                id: id.clone(),
                when,
                priority,
                who: who.name,
                action,
            })?;
            sys.schedule_notify.notify_one();
            R::Raw(id)
        }
        ScheduleDel => {
            let who = ident(conn);
            let id = &args[0];
            let Some(action) = sys.schedule.get(id) else {
                return Ok(R::NotFound(format!("no such scheduled action {id:?}")));
            };
            if action.who != who.name && !who.rights.contains(Rights::ADMIN) {
                return Ok(R::Denied("permission denied".to_string()));
            }
            sys.schedule.delete(id)?;
            sys.schedule_notify.notify_one();
            R::Ok
        }
        ScheduleGet => match sys.schedule.get(&args[0]) {
            Some(action) => R::Body(action.kv_lines()),
            None => R::NotFound(format!("no such scheduled action {:?}", args[0])),
        },
        ScheduleList => R::Body(sys.schedule.list().iter().map(|a| a.marshal()).collect()),
    })
}

/// Walk the collection roots and fold the result into the store. Runs off
/// the system lock; only the final application takes it.
pub async fn run_rescan(system: Arc<Mutex<System>>) -> Result<()> {
    let config = Arc::clone(&system.lock().await.config);
    let roots = config.collections.clone();
    let walked = task::spawn_blocking(move || {
        let mut found = Vec::new();
        for root in roots {
            for entry in walkdir::WalkDir::new(root.as_std_path()).follow_links(true) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("rescan: {e}");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(path) = entry.path().to_str() else {
                    debug!("skipping non-UTF-8 path {:?}", entry.path());
                    continue;
                };
                found.push(camino::Utf8PathBuf::from(path));
            }
        }
        found
    })
    .await
    .expect("rescan walk does not panic");

    let mut found = Vec::with_capacity(walked.len());
    for track in walked {
        // only files some player knows how to decode count as tracks
        if !config.players.is_empty() && config.player_for(track.as_str()).is_none() {
            continue;
        }
        let length = track_length(&config, &track).await;
        found.push((track, length));
    }
    system.lock().await.apply_rescan(found)
}

/// Ask the configured tracklength program how long a track is.
async fn track_length(config: &crate::config::Config, track: &camino::Utf8PathBuf) -> Option<i64> {
    let spec = config.tracklength_for(track.as_str())?;
    let output = tokio::time::timeout(
        Duration::from_secs(30),
        tokio::process::Command::new(&spec.program)
            .args(&spec.args)
            .arg(track.as_str())
            .output(),
    )
    .await
    .ok()?
    .ok()?;
    if !output.status.success() {
        warn!("tracklength for {track} failed with {}", output.status);
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let seconds: f64 = text.trim().parse().ok()?;
    Some(seconds.ceil() as i64)
}

/// Fires scheduled actions when their time comes, under the scheduling
/// user's identity.
pub async fn schedule_runner(server: Server) -> Result<()> {
    let notify = Arc::clone(&server.system.lock().await.schedule_notify);
    loop {
        let next = server.system.lock().await.schedule.next_when();
        match next {
            None => notify.notified().await,
            Some(when) => {
                let now = unix_now();
                if when > now {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs((when - now) as u64)) => {}
                        _ = notify.notified() => {}
                    }
                    continue;
                }
                let due = server.system.lock().await.schedule.take_due(now)?;
                for action in due {
                    if let Err(e) = fire_scheduled(&server, &action).await {
                        warn!("scheduled action {} failed: {e:#}", action.id);
                    }
                }
            }
        }
    }
}

async fn fire_scheduled(server: &Server, action: &ScheduledAction) -> Result<()> {
    let mut sys = server.system.lock().await;
    let Some(user) = sys.store.get_user(&action.who)? else {
        return Err(eyre!("scheduling user {:?} is gone", action.who));
    };
    match &action.action {
        Action::Play { track } => {
            if !user.rights.contains(Rights::PLAY) {
                return Err(eyre!("{} may not play", action.who));
            }
            if sys.resolve_track(track.as_str())?.is_none() {
                return Err(eyre!("no such track {track:?}"));
            }
            info!("scheduled play of {track} for {}", action.who);
            sys.play_track_as(track.as_str(), &action.who, Origin::Scheduled)?;
        }
        Action::SetGlobal { key, value } => {
            if !user.rights.contains(Rights::GLOBAL_PREFS) {
                return Err(eyre!("{} may not set globals", action.who));
            }
            info!("scheduled set-global {key}={value} for {}", action.who);
            sys.set_global(key, value)?;
        }
    }
    Ok(())
}
