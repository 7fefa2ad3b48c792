//! Listener setup and socket tuning. Ports are bound before privileges
//! drop, so everything here works on plain std sockets; the async
//! conversions happen once the runtime is up.

use crate::error::AppResult;
use crate::registry::Registry;
use nix::sys::socket::{
    self, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn, sockopt,
};
use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;
use std::sync::Arc;

/// Bind a wildcard TCP listen socket with the daemon's socket options.
pub fn bind_port(port: u16, backlog: i32) -> AppResult<std::net::TcpListener> {
    let fd = socket::socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )?;
    socket::setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    tune_socket(&fd);

    let addr = SockaddrIn::new(0, 0, 0, 0, port);
    socket::bind(fd.as_raw_fd(), &addr)?;
    socket::listen(&fd, Backlog::new(backlog)?)?;

    let listener = std::net::TcpListener::from(fd);
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Create the backend tunnel listener, replacing any stale socket file.
pub fn bind_tunnel(path: &Path) -> AppResult<std::os::unix::net::UnixListener> {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    let listener = std::os::unix::net::UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Broken pipes surface as write errors on the offending socket; the
/// default signal disposition would kill the whole daemon instead.
pub fn ignore_sigpipe() -> nix::Result<()> {
    use nix::sys::signal::{SigHandler, Signal, signal};
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }.map(|_| ())
}

/// Keepalive on, lingering off, small transmission windows. Best effort:
/// a socket we cannot tune is still a socket.
pub fn tune_socket(fd: &impl AsFd) {
    let _ = socket::setsockopt(fd, sockopt::KeepAlive, &true);
    let linger = nix::libc::linger {
        l_onoff: 0,
        l_linger: 0,
    };
    let _ = socket::setsockopt(fd, sockopt::Linger, &linger);
    let _ = socket::setsockopt(fd, sockopt::RcvBuf, &1024usize);
    let _ = socket::setsockopt(fd, sockopt::SndBuf, &4096usize);
}

/// Accept loop for one listen port; every connection gets its own task.
pub async fn serve(listener: tokio::net::TcpListener, port: u16, registry: Arc<Registry>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let registry = registry.clone();
                tokio::spawn(async move {
                    crate::conn::handle_connection(stream, peer, port, registry).await;
                });
            }
            Err(e) => {
                tracing::error!(error = %e, port, "failed to accept connection");
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
        }
    }
}
