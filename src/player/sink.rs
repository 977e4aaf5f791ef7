//! Output sinks the scheduler pumps decoded PCM into. One is chosen at
//! startup from the configuration; native device outputs live outside this
//! daemon, behind the `command` sink.

use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::{Context, eyre};
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{SampleFormat, Speaker};

pub enum Sink {
    Command(CommandSink),
    Rtp(RtpSink),
    /// Swallows the audio. Keeps headless test servers honest.
    Null,
}

impl Sink {
    pub async fn open(speaker: &Speaker, format: SampleFormat) -> Result<Sink> {
        Ok(match speaker {
            Speaker::Command { command } => Sink::Command(CommandSink::spawn(command)?),
            Speaker::Rtp {
                broadcast,
                from,
                multicast_ttl,
                multicast_loop,
                payload_type,
            } => Sink::Rtp(
                RtpSink::open(
                    broadcast,
                    from.as_deref(),
                    *multicast_ttl,
                    *multicast_loop,
                    *payload_type,
                    format,
                )
                .await?,
            ),
            Speaker::Null => Sink::Null,
        })
    }

    pub async fn write(&mut self, pcm: &[u8]) -> Result<()> {
        match self {
            Sink::Command(sink) => sink.write(pcm).await,
            Sink::Rtp(sink) => sink.write(pcm).await,
            Sink::Null => Ok(()),
        }
    }
}

/// Pipes PCM into a speaker subprocess's stdin, respawning it if it dies.
pub struct CommandSink {
    command: String,
    child: Child,
}

impl CommandSink {
    fn spawn(command: &str) -> Result<CommandSink> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .spawn()
            .wrap_err_with(|| format!("could not start speaker command {command:?}"))?;
        info!("speaker command running: {command}");
        Ok(CommandSink {
            command: command.to_owned(),
            child,
        })
    }

    async fn write(&mut self, pcm: &[u8]) -> Result<()> {
        let stdin = self
            .child
            .stdin
            .as_mut()
            .ok_or_else(|| eyre!("speaker stdin was taken"))?;
        if stdin.write_all(pcm).await.is_ok() {
            return Ok(());
        }
        warn!("speaker command died, restarting it");
        *self = CommandSink::spawn(&self.command)?;
        let stdin = self
            .child
            .stdin
            .as_mut()
            .ok_or_else(|| eyre!("speaker stdin was taken"))?;
        stdin
            .write_all(pcm)
            .await
            .wrap_err("speaker command died again")
    }
}

/// RFC 3550 sender: fixed-size packets, monotone sequence numbers, a
/// timestamp counting sample frames, paced at the nominal sample rate.
pub struct RtpSink {
    socket: UdpSocket,
    payload_type: u8,
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
    buffer: Vec<u8>,
    bytes_per_packet: usize,
    bytes_per_frame: usize,
    packet_interval: Duration,
    next_send: Option<Instant>,
}

impl RtpSink {
    async fn open(
        broadcast: &str,
        from: Option<&str>,
        multicast_ttl: u32,
        multicast_loop: bool,
        payload_type: u8,
        format: SampleFormat,
    ) -> Result<RtpSink> {
        let target: SocketAddr = broadcast
            .parse()
            .wrap_err_with(|| format!("bad broadcast address {broadcast:?}"))?;
        let local: SocketAddr = match from {
            Some(addr) => addr
                .parse()
                .wrap_err_with(|| format!("bad broadcast_from address {addr:?}"))?,
            None => match target {
                SocketAddr::V4(_) => "0.0.0.0:0".parse().expect("fixed addr"),
                SocketAddr::V6(_) => "[::]:0".parse().expect("fixed addr"),
            },
        };
        let socket = UdpSocket::bind(local).await.wrap_err("could not bind RTP socket")?;
        if target.ip().is_multicast() {
            if let SocketAddr::V4(_) = target {
                socket.set_multicast_ttl_v4(multicast_ttl)?;
                socket.set_multicast_loop_v4(multicast_loop)?;
            }
            debug!("multicasting to {target} ttl {multicast_ttl}");
        }
        socket.connect(target).await.wrap_err("could not connect RTP socket")?;

        let bytes_per_frame = (format.channels * format.bits / 8) as usize;
        // 20ms of audio per packet, whole frames only
        let bytes_per_packet =
            (format.bytes_per_second() as usize / 50 / bytes_per_frame) * bytes_per_frame;
        Ok(RtpSink {
            socket,
            payload_type,
            sequence: rand::rng().random(),
            timestamp: rand::rng().random(),
            ssrc: rand::rng().random(),
            buffer: Vec::with_capacity(2 * bytes_per_packet),
            bytes_per_packet,
            bytes_per_frame,
            packet_interval: Duration::from_millis(20),
            next_send: None,
        })
    }

    async fn write(&mut self, pcm: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(pcm);
        while self.buffer.len() >= self.bytes_per_packet {
            if let Some(at) = self.next_send {
                tokio::time::sleep_until(at).await;
                self.next_send = Some(at + self.packet_interval);
            } else {
                self.next_send = Some(Instant::now() + self.packet_interval);
            }
            let payload: Vec<u8> = self.buffer.drain(..self.bytes_per_packet).collect();
            let packet = self.packet(&payload);
            self.socket
                .send(&packet)
                .await
                .wrap_err("could not send RTP packet")?;
            self.sequence = self.sequence.wrapping_add(1);
            let frames = (self.bytes_per_packet / self.bytes_per_frame) as u32;
            self.timestamp = self.timestamp.wrapping_add(frames);
        }
        Ok(())
    }

    fn packet(&self, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(12 + payload.len());
        packet.push(0x80); // version 2, no padding, no extensions, no CSRC
        packet.push(self.payload_type & 0x7f);
        packet.extend_from_slice(&self.sequence.to_be_bytes());
        packet.extend_from_slice(&self.timestamp.to_be_bytes());
        packet.extend_from_slice(&self.ssrc.to_be_bytes());
        packet.extend_from_slice(payload);
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rtp_packets_have_monotone_sequence_and_timestamps() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();
        let mut sink = RtpSink::open(
            &target.to_string(),
            None,
            1,
            false,
            96,
            SampleFormat::default(),
        )
        .await
        .unwrap();
        // two packets worth of audio
        let chunk = vec![0u8; sink.bytes_per_packet * 2];
        sink.write(&chunk).await.unwrap();

        let mut buf = [0u8; 4096];
        let n1 = receiver.recv(&mut buf).await.unwrap();
        let first = buf[..n1].to_vec();
        let n2 = receiver.recv(&mut buf).await.unwrap();
        let second = buf[..n2].to_vec();

        assert_eq!(first[0], 0x80);
        assert_eq!(first[1], 96);
        assert_eq!(n1, 12 + sink.bytes_per_packet);
        let seq1 = u16::from_be_bytes([first[2], first[3]]);
        let seq2 = u16::from_be_bytes([second[2], second[3]]);
        assert_eq!(seq2, seq1.wrapping_add(1));
        let ts1 = u32::from_be_bytes(first[4..8].try_into().unwrap());
        let ts2 = u32::from_be_bytes(second[4..8].try_into().unwrap());
        let frames = (sink.bytes_per_packet / sink.bytes_per_frame) as u32;
        assert_eq!(ts2, ts1.wrapping_add(frames));
        // same stream, same source id
        assert_eq!(first[8..12], second[8..12]);
    }

    #[tokio::test]
    async fn null_sink_swallows_everything() {
        let mut sink = Sink::Null;
        sink.write(&[0u8; 65536]).await.unwrap();
    }
}
