//! The scheduler: the one task that owns the playing slot. It asks the
//! system what to play, runs the decoder subprocess, pumps PCM into the
//! sink, and reacts to pause/resume/scratch/shutdown control messages.
//!
//! The system lock is only ever taken briefly, for state transitions; all
//! the waiting (decoder reads, sink writes, the inter-track gap) happens
//! outside it.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use color_eyre::Result;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};

use crate::config::{PauseMode, SampleFormat};
use crate::player::pcm::{HEADER_LEN, StreamHeader};
use crate::player::sink::Sink;
use crate::queue::PlayState;
use crate::system::{PlayStart, System};

pub mod mixer;
pub mod pcm;
pub mod sink;

/// Control messages from command handlers to the player task.
#[derive(Debug)]
pub enum Control {
    Pause,
    Resume,
    Scratch { id: String, who: String },
    Shutdown,
}

enum Outcome {
    Completed,
    Failed { wstat: Option<i32>, error: String },
    Scratched,
    Shutdown,
}

#[instrument(skip_all)]
pub async fn run(system: Arc<Mutex<System>>, mut control: mpsc::Receiver<Control>) -> Result<()> {
    let (notify, speaker, format, pause_mode, gap) = {
        let sys = system.lock().await;
        (
            Arc::clone(&sys.player_notify),
            sys.config.speaker.clone(),
            sys.config.sample_format,
            sys.config.pause_mode,
            sys.config.gap,
        )
    };
    let mut sink = Sink::open(&speaker, format).await?;

    loop {
        let start = system.lock().await.begin_next()?;
        let Some(start) = start else {
            // nothing to do until the queue or the switches change
            tokio::select! {
                _ = notify.notified() => {}
                msg = control.recv() => match msg {
                    Some(Control::Shutdown) | None => return Ok(()),
                    Some(other) => debug!("ignoring {other:?} while idle"),
                },
            }
            continue;
        };

        info!("playing {} ({})", start.track, start.id);
        let outcome = play_one(&system, &mut control, &mut sink, &start, format, pause_mode).await?;

        {
            let mut sys = system.lock().await;
            match outcome {
                Outcome::Completed => sys.finish_playing(PlayState::Ok, Some(0), None)?,
                Outcome::Failed { wstat, error } => {
                    warn!("decoder for {} failed: {error}", start.track);
                    sys.finish_playing(PlayState::Failed, wstat, Some(error))?;
                }
                Outcome::Scratched => sys.finish_playing(PlayState::Scratched, None, None)?,
                Outcome::Shutdown => {
                    sys.note_quitting()?;
                    return Ok(());
                }
            }
        }

        // the configured silence between tracks; scratch sounds jump it
        let skip_gap = system.lock().await.next_is_scratch_sound();
        if gap > 0 && !skip_gap {
            let silence = vec![0u8; format.bytes_per_second() as usize / 10];
            for _ in 0..gap * 10 {
                sink.write(&silence).await?;
            }
        }
    }
}

async fn play_one(
    system: &Arc<Mutex<System>>,
    control: &mut mpsc::Receiver<Control>,
    sink: &mut Sink,
    start: &PlayStart,
    format: SampleFormat,
    pause_mode: PauseMode,
) -> Result<Outcome> {
    let mut child = match Command::new(&start.program)
        .args(&start.args)
        .arg(start.track.as_str())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return Ok(Outcome::Failed {
                wstat: None,
                error: format!("could not start {}: {e}", start.program),
            });
        }
    };
    let mut stdout = child.stdout.take().expect("stdout was piped");

    let mut raw_header = [0u8; HEADER_LEN];
    if let Err(e) = stdout.read_exact(&mut raw_header).await {
        child.start_kill().ok();
        let wstat = child.wait().await.ok().and_then(|s| s.code());
        return Ok(Outcome::Failed {
            wstat,
            error: format!("no stream header: {e}"),
        });
    }
    match StreamHeader::parse(&raw_header) {
        Ok(header) if header.matches(format) => {}
        Ok(header) => warn!(
            "decoder for {} produced {header:?}, expected {format:?}; playing anyway",
            start.track
        ),
        Err(e) => {
            child.start_kill().ok();
            child.wait().await.ok();
            return Ok(Outcome::Failed {
                wstat: None,
                error: format!("{e:#}"),
            });
        }
    }

    let mut paused = false;
    let mut buf = vec![0u8; 65536];
    let silence = vec![0u8; format.bytes_per_second() as usize / 10];
    let mut silence_tick = interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            msg = control.recv() => match msg {
                Some(Control::Shutdown) | None => {
                    child.start_kill().ok();
                    child.wait().await.ok();
                    return Ok(Outcome::Shutdown);
                }
                Some(Control::Pause) => paused = true,
                Some(Control::Resume) => paused = false,
                Some(Control::Scratch { id, who }) => {
                    if id == start.id {
                        info!("{who} scratched {id}");
                        child.start_kill().ok();
                        child.wait().await.ok();
                        return Ok(Outcome::Scratched);
                    }
                    debug!("stale scratch for {id}, now playing {}", start.id);
                }
            },
            read = stdout.read(&mut buf), if !paused => match read {
                Ok(0) => {
                    let status = child.wait().await?;
                    return Ok(if status.success() {
                        Outcome::Completed
                    } else {
                        Outcome::Failed {
                            wstat: status.code(),
                            error: format!("decoder exited with {status}"),
                        }
                    });
                }
                Ok(n) => {
                    {
                        let sys = system.lock().await;
                        sys.mixer.apply(&mut buf[..n], format);
                    }
                    start.progress.fetch_add(n as u64, Ordering::Relaxed);
                    sink.write(&buf[..n]).await?;
                }
                Err(e) => {
                    child.start_kill().ok();
                    let wstat = child.wait().await.ok().and_then(|s| s.code());
                    return Ok(Outcome::Failed {
                        wstat,
                        error: format!("error reading decoder: {e}"),
                    });
                }
            },
            // a decoder with native pause support stalls on the full pipe by
            // itself; for the rest the configured mode decides whether the
            // sink keeps getting (silent) audio
            _ = silence_tick.tick(), if paused && !start.pauses && pause_mode == PauseMode::Silence => {
                sink.write(&silence).await?;
            }
        }
    }
}
