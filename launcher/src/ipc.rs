//! Single-instance detection and the control channel between launcher processes.
//!
//! The first launcher binds a Unix socket at a machine-wide path; later processes
//! connect to it to hand over (`show-main`), to stop it (`stop-app`) or to probe it
//! (`ping`). An advisory lock on `<socket>.lock` makes the bind race free.

use core::time::Duration;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind},
    os::unix::fs::{OpenOptionsExt as _, PermissionsExt as _},
    path::{Path, PathBuf},
};

use launcher_common::{SingletonMessage, SingletonReply};
use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
};
use thiserror::Error as ThisError;
use tokio::{
    io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader},
    net::{
        UnixListener, UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_QUEUE: usize = 16;

#[derive(Debug, ThisError)]
pub enum IpcError {
    #[error("another launcher already listens on {0}")]
    AlreadyBound(PathBuf),
    #[error("singleton socket {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl IpcError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A request the running instance has to act on.
#[derive(Debug)]
pub struct IpcRequest {
    pub message: SingletonMessage,
    pub responder: Responder,
}

/// The requester's end of the connection, kept open until the request is answered.
#[derive(Debug)]
pub struct Responder {
    writer: OwnedWriteHalf,
}

impl Responder {
    /// Tells a `stop-app` requester that the node is stopped. A requester that already
    /// hung up is ignored.
    pub async fn confirm_stopped(mut self) {
        if let Err(e) = self
            .writer
            .write_all(SingletonReply::Stopped.to_line().as_bytes())
            .await
        {
            debug!("Stop requester went away before confirmation: {e}");
        }
        drop(self.writer.shutdown().await);
    }
}

fn lock_path(socket: &Path) -> PathBuf {
    let mut name = socket.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    // world writable so an elevated and an unelevated instance share one lock
    match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o666)
        .open(path)
    {
        Err(e) if e.kind() == ErrorKind::PermissionDenied => File::open(path),
        other => other,
    }
}

/// The bound singleton socket, not yet accepting.
pub struct SingletonListener {
    path: PathBuf,
    listener: UnixListener,
    lock: Flock<File>,
}

impl SingletonListener {
    /// Claims the singleton socket at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::AlreadyBound`] when another launcher holds it, and
    /// [`IpcError::Io`] for any filesystem or socket failure.
    pub async fn bind(path: &Path) -> Result<Self, IpcError> {
        let lock_file = lock_path(path);
        let file = open_lock_file(&lock_file).map_err(|e| IpcError::io(&lock_file, e))?;
        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                return Err(IpcError::AlreadyBound(path.to_path_buf()));
            }
            Err((_, errno)) => return Err(IpcError::io(&lock_file, errno.into())),
        };

        // a launcher that predates the lock file may still be listening
        if connect(path).await.is_ok() {
            return Err(IpcError::AlreadyBound(path.to_path_buf()));
        }
        match fs::remove_file(path) {
            Ok(()) => debug!("Removed stale singleton socket {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(IpcError::io(path, e)),
        }

        let listener = UnixListener::bind(path).map_err(|e| IpcError::io(path, e))?;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o666)) {
            warn!("Cannot open singleton socket to other users: {e}");
        }
        info!("Listening for other launcher instances on {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            listener,
            lock,
        })
    }

    /// Starts accepting connections in the background.
    ///
    /// `ping` is answered directly; `show-main` and `stop-app` are acknowledged and
    /// delivered through the returned receiver.
    #[must_use]
    pub fn listen(self) -> (SingletonHandle, mpsc::Receiver<IpcRequest>) {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        let Self {
            path,
            listener,
            lock,
        } = self;
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_connection(stream, tx.clone()));
                    }
                    Err(e) => {
                        warn!("Failed to accept singleton connection: {e}");
                        time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        (
            SingletonHandle {
                path,
                task,
                _lock: lock,
            },
            rx,
        )
    }
}

/// Keeps the singleton claimed. Dropping it stops accepting and removes the socket.
pub struct SingletonHandle {
    path: PathBuf,
    task: JoinHandle<()>,
    _lock: Flock<File>,
}

impl Drop for SingletonHandle {
    fn drop(&mut self) {
        self.task.abort();
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            warn!("Failed to remove singleton socket {}: {e}", self.path.display());
        }
    }
}

async fn handle_connection(stream: UnixStream, requests: mpsc::Sender<IpcRequest>) {
    let (reader, mut writer) = stream.into_split();
    let Some(line) = read_line(reader, READ_TIMEOUT).await else {
        return;
    };
    let message = match line.parse::<SingletonMessage>() {
        Ok(message) => message,
        Err(e) => {
            debug!("Ignoring singleton request: {e}");
            return;
        }
    };
    debug!(%message, "Singleton request");

    let reply = match message {
        SingletonMessage::Ping => SingletonReply::Pong,
        SingletonMessage::ShowMain | SingletonMessage::StopApp => SingletonReply::Ack,
    };
    if let Err(e) = writer.write_all(reply.to_line().as_bytes()).await {
        debug!("Singleton requester went away: {e}");
        return;
    }
    if message == SingletonMessage::Ping {
        return;
    }
    let request = IpcRequest {
        message,
        responder: Responder { writer },
    };
    if requests.send(request).await.is_err() {
        debug!("Launcher no longer takes singleton requests, dropping {message}");
    }
}

async fn read_line(reader: OwnedReadHalf, limit: Duration) -> Option<String> {
    let mut lines = BufReader::new(reader).lines();
    match time::timeout(limit, lines.next_line()).await {
        Ok(Ok(line)) => line,
        Ok(Err(e)) => {
            debug!("Singleton read failed: {e}");
            None
        }
        Err(_) => None,
    }
}

async fn connect(path: &Path) -> io::Result<UnixStream> {
    time::timeout(CONNECT_TIMEOUT, UnixStream::connect(path))
        .await
        .map_err(|_| io::Error::new(ErrorKind::TimedOut, "connect timed out"))?
}

/// Sends one request and returns both halves of the connection, or `None` when no
/// launcher listens. The write half has to stay alive until all replies are read.
async fn send(path: &Path, message: SingletonMessage) -> Option<(OwnedReadHalf, OwnedWriteHalf)> {
    let stream = match connect(path).await {
        Ok(stream) => stream,
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
            debug!("No launcher listening on {}", path.display());
            return None;
        }
        Err(e) => {
            warn!("Cannot reach launcher on {}: {e}", path.display());
            return None;
        }
    };
    let (reader, mut writer) = stream.into_split();
    if let Err(e) = writer.write_all(message.to_line().as_bytes()).await {
        warn!("Failed to send {message} to running launcher: {e}");
        return None;
    }
    Some((reader, writer))
}

/// Result of [`send_stop_app`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No launcher was listening.
    NotRunning,
    /// The running launcher confirmed the node is stopped.
    Stopped,
    /// The request was delivered but no confirmation arrived in time.
    Unconfirmed,
}

/// Asks the running launcher to stop and waits up to `wait` for its confirmation.
pub async fn send_stop_app(path: &Path, wait: Duration) -> StopOutcome {
    let Some((reader, _writer)) = send(path, SingletonMessage::StopApp).await else {
        return StopOutcome::NotRunning;
    };
    let deadline = Instant::now() + wait;
    let mut lines = BufReader::new(reader).lines();
    loop {
        match time::timeout_at(deadline, lines.next_line()).await {
            Ok(Ok(Some(line))) => match line.parse::<SingletonReply>() {
                Ok(SingletonReply::Stopped) => return StopOutcome::Stopped,
                Ok(SingletonReply::Ack) => debug!("Running launcher accepted stop request"),
                Ok(other) => debug!(%other, "Unexpected reply to stop request"),
                Err(e) => debug!("Ignoring reply to stop request: {e}"),
            },
            Ok(Ok(None)) => {
                debug!("Running launcher closed the connection without confirming");
                return StopOutcome::Unconfirmed;
            }
            Ok(Err(e)) => {
                warn!("Failed to read stop confirmation: {e}");
                return StopOutcome::Unconfirmed;
            }
            Err(_) => return StopOutcome::Unconfirmed,
        }
    }
}

async fn expect_reply(path: &Path, message: SingletonMessage, expected: SingletonReply) -> bool {
    let Some((reader, _writer)) = send(path, message).await else {
        return false;
    };
    match read_line(reader, READ_TIMEOUT).await {
        Some(line) => line.parse::<SingletonReply>() == Ok(expected),
        None => false,
    }
}

/// Asks the running launcher to bring itself to the user's attention. Returns whether
/// it acknowledged.
pub async fn send_show_main(path: &Path) -> bool {
    expect_reply(path, SingletonMessage::ShowMain, SingletonReply::Ack).await
}

/// Whether a launcher answers on `path`.
pub async fn ping(path: &Path) -> bool {
    expect_reply(path, SingletonMessage::Ping, SingletonReply::Pong).await
}
