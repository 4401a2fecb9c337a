//! Zero-downtime listener handover.
//!
//! A retiring facade (the donor) publishes a Unix socket named
//! `rf-handover-<unix-seconds>.sock` in a shared directory. Its successor
//! (the recipient) connects to the lexicographically greatest socket,
//! sends `REQ\n`, and receives `ACK\n` together with a duplicate of the
//! TCP listening socket's file descriptor as SCM_RIGHTS ancillary data.
//! The recipient starts accepting on the shared FD; the donor stops
//! accepting, drains in-flight requests, and exits.
//!
//! Every socket operation is bounded by a timeout. A failed exchange is
//! harmless on both sides: the recipient binds its own listener and the
//! donor keeps serving.

use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags,
};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{FacadeError, Result};

/// Handover socket filename prefix.
const SOCKET_PREFIX: &str = "rf-handover-";

/// Bound on each socket operation in the exchange.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

const GREETING: &[u8] = b"REQ\n";
const REPLY: &[u8] = b"ACK\n";

/// Attempts to take over a listener from a retiring donor.
///
/// Scans `dir` for handover sockets, picks the newest (timestamps order
/// donors, so lexicographically greatest wins), and runs the exchange.
/// Returns `Ok(None)` when there is nothing to take over or the exchange
/// fails - the caller then binds its own listener.
///
/// # Errors
///
/// Only I/O errors reading the directory are surfaced; exchange failures
/// degrade to `Ok(None)`.
pub async fn receive_handover(dir: &Path) -> Result<Option<TcpListener>> {
    let Some(socket) = latest_socket(dir)? else {
        return Ok(None);
    };

    debug!(socket = %socket.display(), "found handover socket, attempting takeover");

    let exchange = tokio::task::spawn_blocking(move || recipient_exchange(&socket));
    let fd = match tokio::time::timeout(EXCHANGE_TIMEOUT, exchange).await {
        Ok(Ok(Ok(fd))) => fd,
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "listener handover failed, binding fresh listener");
            return Ok(None);
        }
        Ok(Err(e)) => {
            warn!(error = %e, "handover task panicked, binding fresh listener");
            return Ok(None);
        }
        Err(_) => {
            warn!("listener handover timed out, binding fresh listener");
            return Ok(None);
        }
    };

    let std_listener = std::net::TcpListener::from(fd);
    std_listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(std_listener)?;
    info!(addr = ?listener.local_addr().ok(), "took over listener from previous process");
    Ok(Some(listener))
}

/// Finds the lexicographically greatest handover socket in `dir`.
fn latest_socket(dir: &Path) -> Result<Option<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut best: Option<String> = None;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(SOCKET_PREFIX) || !name.ends_with(".sock") {
            continue;
        }
        if best.as_ref().is_none_or(|b| &name > b) {
            best = Some(name);
        }
    }
    Ok(best.map(|name| dir.join(name)))
}

/// Client side of the exchange: greet, then receive the listener FD.
fn recipient_exchange(socket: &Path) -> Result<OwnedFd> {
    let mut stream = StdUnixStream::connect(socket)
        .map_err(|e| FacadeError::Internal(format!("connect {}: {e}", socket.display())))?;
    stream.set_read_timeout(Some(EXCHANGE_TIMEOUT))?;
    stream.set_write_timeout(Some(EXCHANGE_TIMEOUT))?;

    stream.write_all(GREETING)?;

    let mut buf = [0u8; REPLY.len()];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_space = [MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(1))];
    let mut cmsg_buffer = RecvAncillaryBuffer::new(&mut cmsg_space);

    let received = rustix::net::recvmsg(
        &stream,
        &mut iov,
        &mut cmsg_buffer,
        RecvFlags::CMSG_CLOEXEC,
    )
    .map_err(|e| FacadeError::Internal(format!("recvmsg: {e}")))?;

    if &buf[..received.bytes] != REPLY {
        return Err(FacadeError::Internal(format!(
            "unexpected handover reply: {:?}",
            &buf[..received.bytes]
        )));
    }

    let mut fds: Vec<OwnedFd> = Vec::new();
    for message in cmsg_buffer.drain() {
        if let RecvAncillaryMessage::ScmRights(received_fds) = message {
            fds.extend(received_fds);
        }
    }
    fds.pop()
        .ok_or_else(|| FacadeError::Internal("handover reply carried no fd".to_string()))
}

/// Server side of the exchange: wait for the greeting, answer with the
/// reply and the listener FD in one message.
fn donor_exchange(mut stream: StdUnixStream, listener: BorrowedFd<'_>) -> Result<()> {
    stream.set_read_timeout(Some(EXCHANGE_TIMEOUT))?;
    stream.set_write_timeout(Some(EXCHANGE_TIMEOUT))?;

    let mut buf = [0u8; GREETING.len()];
    stream.read_exact(&mut buf)?;
    if buf != GREETING {
        return Err(FacadeError::Internal(format!(
            "unexpected handover greeting: {buf:?}"
        )));
    }

    let fds = [listener];
    let mut cmsg_space = [MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(1))];
    let mut cmsg_buffer = SendAncillaryBuffer::new(&mut cmsg_space);
    if !cmsg_buffer.push(SendAncillaryMessage::ScmRights(&fds)) {
        return Err(FacadeError::Internal(
            "cannot attach fd to handover reply".to_string(),
        ));
    }

    rustix::net::sendmsg(
        &stream,
        &[IoSlice::new(REPLY)],
        &mut cmsg_buffer,
        SendFlags::empty(),
    )
    .map_err(|e| FacadeError::Internal(format!("sendmsg: {e}")))?;

    Ok(())
}

/// A standing offer to hand the listener to a successor.
pub struct HandoverOffer {
    /// Flips to `true` the moment the FD has been handed over.
    pub handed_over: watch::Receiver<bool>,
    socket_path: PathBuf,
    task: JoinHandle<()>,
}

impl HandoverOffer {
    /// Removes the offer: no successor can take over anymore. The socket
    /// file is deleted either way.
    pub async fn close(self) {
        self.task.abort();
        let _ = self.task.await;
        let _ = std::fs::remove_file(&self.socket_path);
    }

    /// The published socket path.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

/// Publishes a handover offer for `listener` in `dir`.
///
/// The offer accepts successors one at a time; a failed exchange leaves
/// the offer standing so a retried successor can still take over. Once
/// the FD is handed over the `handed_over` signal flips and the caller
/// must stop accepting.
///
/// # Errors
///
/// Returns an error when the offer socket cannot be bound or the
/// listener FD cannot be duplicated.
pub async fn offer_handover(dir: &Path, listener: &TcpListener) -> Result<HandoverOffer> {
    std::fs::create_dir_all(dir)?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| FacadeError::Internal(format!("clock before epoch: {e}")))?
        .as_secs();

    // A duplicate keeps the kernel socket alive for the successor even
    // after this process closes its copy.
    let listener_fd = listener
        .as_fd()
        .try_clone_to_owned()
        .map_err(|e| FacadeError::Internal(format!("dup listener fd: {e}")))?;

    // Timestamps order donors; probe forward if the predecessor's socket
    // from the same second is still around.
    let (socket_path, unix_listener) = (0..10)
        .find_map(|bump| {
            let candidate = dir.join(format!("{SOCKET_PREFIX}{}.sock", now + bump));
            match UnixListener::bind(&candidate) {
                Ok(listener) => Some((candidate, listener)),
                Err(_) => None,
            }
        })
        .ok_or_else(|| {
            FacadeError::Internal(format!(
                "cannot bind a handover socket under {}",
                dir.display()
            ))
        })?;

    let (tx, rx) = watch::channel(false);
    let offer_path = socket_path.clone();
    let task = tokio::spawn(async move {
        loop {
            let (stream, _) = match unix_listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "handover offer accept failed");
                    continue;
                }
            };
            let std_stream = match stream.into_std().and_then(|s| {
                s.set_nonblocking(false)?;
                Ok(s)
            }) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "handover stream setup failed");
                    continue;
                }
            };

            let fd = match listener_fd.as_fd().try_clone_to_owned() {
                Ok(fd) => fd,
                Err(e) => {
                    warn!(error = %e, "cannot duplicate listener fd");
                    continue;
                }
            };
            let exchange =
                tokio::task::spawn_blocking(move || donor_exchange(std_stream, fd.as_fd())).await;

            match exchange {
                Ok(Ok(())) => {
                    info!("listener handed over to successor");
                    let _ = std::fs::remove_file(&offer_path);
                    let _ = tx.send(true);
                    return;
                }
                Ok(Err(e)) => warn!(error = %e, "handover exchange failed, offer stands"),
                Err(e) => warn!(error = %e, "handover exchange task failed, offer stands"),
            }
        }
    });

    info!(socket = %socket_path.display(), "offering listener handover");
    Ok(HandoverOffer {
        handed_over: rx,
        socket_path,
        task,
    })
}
