//! Listeners and per-connection tasks
//!
//! Each accepted connection gets a reader task (lines in, events out) and a writer
//! task (packets in, lines out). Neither touches master state; everything goes
//! through the reactor channel.

use std::path::PathBuf;

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::{ConnId, ConnIds};
use crate::input::InputRouter;
use crate::ipc::{cleanup_socket, create_listener_at};
use crate::master::{Master, ReactorEvent};
use crate::protocol::{Channel, MAX_PACKET_SIZE, Packet};
use crate::render::create_backend;
use crate::slave::ProcessLauncher;
use crate::store::DirPackageStore;
use crate::timer::Timers;

/// Bound listeners for the four channels
pub struct Listeners {
    bound: Vec<(Channel, UnixListener)>,
    paths: Vec<PathBuf>,
}

impl Listeners {
    /// Bind every channel; failing to bind any of them is fatal
    pub fn bind(config: &Config) -> Result<Self> {
        let sockets = &config.sockets;
        let wanted = [
            (Channel::Slave, sockets.slave_path()),
            (Channel::Client, sockets.client_path()),
            (Channel::Service, sockets.service_path()),
            (Channel::Debug, sockets.debug_path()),
        ];
        let mut bound = Vec::with_capacity(wanted.len());
        let mut paths = Vec::with_capacity(wanted.len());
        for (channel, path) in wanted {
            match create_listener_at(&path) {
                Ok((listener, path)) => {
                    info!(%channel, path = %path.display(), "Listening");
                    bound.push((channel, listener));
                    paths.push(path);
                }
                Err(e) => {
                    for p in &paths {
                        cleanup_socket(p);
                    }
                    return Err(e).context(format!("Cannot listen on the {channel} channel"));
                }
            }
        }
        Ok(Self { bound, paths })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Start accepting on every channel
    pub fn spawn(self, events: mpsc::UnboundedSender<ReactorEvent>) -> Vec<JoinHandle<()>> {
        let ids = ConnIds::new();
        self.bound
            .into_iter()
            .map(|(channel, listener)| tokio::spawn(accept_loop(channel, listener, ids.clone(), events.clone())))
            .collect()
    }
}

async fn accept_loop(channel: Channel, listener: UnixListener, ids: ConnIds, events: mpsc::UnboundedSender<ReactorEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let conn = ids.next();
                tokio::spawn(serve_connection(channel, conn, stream, events.clone()));
            }
            Err(e) => {
                warn!(%channel, error = %e, "Accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Pump one connection until either side closes
pub async fn serve_connection(
    channel: Channel,
    conn: ConnId,
    stream: UnixStream,
    events: mpsc::UnboundedSender<ReactorEvent>,
) {
    let pid = stream
        .peer_cred()
        .ok()
        .and_then(|cred| cred.pid())
        .and_then(|pid| u32::try_from(pid).ok());
    debug!(%channel, conn, ?pid, "serve_connection: accepted");

    let (read, mut write) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Packet>();
    if events
        .send(ReactorEvent::Connected {
            channel,
            conn,
            pid,
            tx: out_tx,
        })
        .is_err()
    {
        return;
    }

    let writer = tokio::spawn(async move {
        while let Some(packet) = out_rx.recv().await {
            let line = match packet.to_line() {
                Ok(line) => line,
                Err(e) => {
                    warn!(conn, cmd = %packet.cmd, error = %e, "Dropping unencodable packet");
                    continue;
                }
            };
            if let Err(e) = write.write_all(line.as_bytes()).await {
                debug!(conn, error = %e, "writer: connection closed");
                break;
            }
        }
    });

    let mut reader = BufReader::new(read);
    loop {
        match read_packet(&mut reader).await {
            Ok(Some(Ok(packet))) => {
                if events.send(ReactorEvent::Packet { conn, packet }).is_err() {
                    break;
                }
            }
            Ok(Some(Err(reason))) => warn!(%channel, conn, %reason, "Dropping malformed packet"),
            Ok(None) => break,
            Err(e) => {
                debug!(conn, error = %e, "serve_connection: read failed");
                break;
            }
        }
    }

    writer.abort();
    let _ = events.send(ReactorEvent::Disconnected { conn });
    debug!(%channel, conn, "serve_connection: closed");
}

/// Read one line. `Ok(None)` at end of stream; `Ok(Some(Err(_)))` for a line that
/// was oversized or unparsable and has been skipped.
async fn read_packet<R>(reader: &mut BufReader<R>) -> std::io::Result<Option<Result<Packet, String>>>
where
    R: AsyncRead + Unpin,
{
    let limit = MAX_PACKET_SIZE as u64 + 1;
    let mut buf = Vec::new();
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') && n as u64 >= limit {
        skip_line(reader).await?;
        return Ok(Some(Err(format!("line exceeds {MAX_PACKET_SIZE} bytes"))));
    }
    let parsed = std::str::from_utf8(&buf)
        .map_err(|e| e.to_string())
        .and_then(|line| Packet::from_line(line).map_err(|e| e.to_string()));
    Ok(Some(parsed))
}

async fn skip_line<R>(reader: &mut BufReader<R>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut scratch = Vec::new();
    loop {
        scratch.clear();
        let n = (&mut *reader)
            .take(MAX_PACKET_SIZE as u64)
            .read_until(b'\n', &mut scratch)
            .await?;
        if n == 0 || scratch.last() == Some(&b'\n') {
            return Ok(());
        }
    }
}

/// Run the master until SIGINT/SIGTERM
pub async fn run_master(config: Config) -> Result<()> {
    let (tx, rx) = mpsc::unbounded_channel();

    let listeners = Listeners::bind(&config).inspect_err(|e| error!(error = %e, "Failed to bind channels"))?;
    let paths = listeners.paths().to_vec();

    let launcher = ProcessLauncher::new(
        config.slave.command.clone(),
        config.slave.args.clone(),
        config.sockets.slave_path(),
        tx.clone(),
    );
    let store = DirPackageStore::new(config.store.dir.clone());
    let backend = create_backend(&config.buffer);
    let timers = Timers::new(tx.clone());

    if let Some(device) = config.input.device.clone() {
        match InputRouter::start(device.clone(), tx.clone()) {
            Ok(_) => {}
            Err(e) => warn!(device = %device.display(), error = %e, "Input device unavailable, raw input disabled"),
        }
    }

    let master = Master::new(config, Box::new(launcher), Box::new(store), backend, timers);
    let reactor = tokio::spawn(master.run(rx));
    let acceptors = listeners.spawn(tx.clone());
    info!("Master running");

    wait_for_signal().await?;
    info!("Master shutting down...");
    let _ = tx.send(ReactorEvent::Shutdown);
    if let Err(e) = reactor.await {
        warn!(error = %e, "Reactor task failed");
    }

    for task in acceptors {
        task.abort();
    }
    for path in &paths {
        cleanup_socket(path);
    }
    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => warn!("SIGINT received"),
        _ = sigterm.recv() => warn!("SIGTERM received"),
    }
    Ok(())
}
