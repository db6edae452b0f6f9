//! Monitor process driver.
//!
//! The monitor (`lxcri-start`) is a small native binary that loads the
//! engine config file and starts the engine non-daemonized. It owns the
//! engine container handle for the container's lifetime.

use std::io::IoSlice;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Command, Stdio};

use chrono::Utc;
use nix::pty::openpty;
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};

use crate::container::Container;
use crate::engine::EngineConfig;
use crate::runtime::Runtime;
use crate::utils::Deadline;
use crate::{LxcriError, Result, EXEC_START};

/// Starts the monitor process for the container and waits until init is
/// blocked at the sync fifo. On success the monitor PID is recorded in the
/// container handle and the handle is persisted.
pub(crate) fn start_monitor(
    rt: &Runtime,
    c: &mut Container,
    config: &mut EngineConfig,
    deadline: &Deadline,
) -> Result<()> {
    let rootfs = c
        .spec()
        .root()
        .as_ref()
        .map(|r| r.path().clone())
        .unwrap_or_default();
    let terminal = c
        .spec()
        .process()
        .as_ref()
        .and_then(|p| p.terminal())
        .unwrap_or(false);

    let mut cmd = Command::new(rt.libexec(EXEC_START));
    cmd.arg(c.id())
        .arg(rt.root())
        .arg(c.config_file_path())
        .env_clear()
        .envs(rt.monitor_env().iter().cloned())
        .current_dir(&rootfs);

    if c.config.console_socket.is_none() && !terminal {
        // stdio is inherited from the calling process (conmon).
        // lxc.console.path must be set to 'none' or the engine replaces
        // the init stdio with a pty.
        config.set("lxc.console.path", "none");
    }

    // Any config change must be done before the config file is written.
    config.save(&c.config_file_path())?;

    tracing::debug!("starting monitor process");
    let child = match &c.config.console_socket {
        Some(socket) => start_with_console(cmd, socket, deadline)?,
        None => cmd.spawn()?,
    };

    c.created_at = Some(Utc::now());
    c.monitor_pid = Some(child.id() as i32);
    tracing::info!(pid = child.id(), "monitor process started");

    c.save()?;

    tracing::debug!("waiting for init");
    c.wait_created(deadline)
}

/// Starts the monitor attached to a fresh pty and sends the pty master fd
/// over the console socket with the message body `terminal`.
fn start_with_console(
    mut cmd: Command,
    console_socket: &Path,
    deadline: &Deadline,
) -> Result<std::process::Child> {
    tracing::debug!(socket = ?console_socket, "sending pty master to console socket");
    let stream = UnixStream::connect(console_socket).map_err(|err| {
        LxcriError::Engine(format!(
            "connecting to console socket {} failed: {err}",
            console_socket.display()
        ))
    })?;
    stream.set_write_timeout(Some(deadline.remaining()?))?;

    let pty = openpty(None, None)?;
    let slave: OwnedFd = pty.slave;
    cmd.stdin(Stdio::from(slave.try_clone()?))
        .stdout(Stdio::from(slave.try_clone()?))
        .stderr(Stdio::from(slave));

    let child = cmd.spawn()?;

    // The master fd is transferred to the socket peer (conmon) and closed
    // locally right after, it must not be sent twice.
    send_pty_master(&stream, pty.master)?;
    Ok(child)
}

fn send_pty_master(stream: &UnixStream, master: OwnedFd) -> Result<()> {
    let iov = [IoSlice::new(b"terminal")];
    let fds = [master.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<UnixAddr>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)?;
    drop(master);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixListener;

    // Receiving the pty master requires recvmsg with control message
    // space, plain reads only see the message body.
    #[test]
    fn test_send_pty_master() {
        let tmp = tempfile::tempdir().unwrap();
        let socket_path = tmp.path().join("console.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let sender = std::thread::spawn(move || {
            let stream = UnixStream::connect(&socket_path).unwrap();
            let pty = openpty(None, None).unwrap();
            send_pty_master(&stream, pty.master).unwrap();
        });

        let (mut conn, _) = listener.accept().unwrap();
        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"terminal");
        sender.join().unwrap();
    }

    #[test]
    fn test_console_socket_connect_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let cmd = Command::new("/bin/true");
        let deadline = Deadline::seconds(1, "create");
        let err =
            start_with_console(cmd, &tmp.path().join("missing.sock"), &deadline).unwrap_err();
        assert!(matches!(err, LxcriError::Engine(_)));
    }
}
