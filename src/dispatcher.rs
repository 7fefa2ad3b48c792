//! The dispatcher task: sole owner of the backend tunnel, the pending-ack
//! queue, the ack-token allocator and the service-retry budget.
//!
//! Connection tasks reach it through a mailbox; the tunnel's reader task
//! and the SIGHUP stream feed the same mailbox, so every mutation of the
//! shared state happens on this one task.

use crate::ackq::AckQueue;
use crate::admission::Admission;
use crate::config::Settings;
use crate::error::{AppResult, GateError};
use crate::registry::GateStats;
use crate::tunnel::{LoginData, Tunnel};
use std::net::TcpStream as StdTcpStream;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub enum DispatchMsg {
    /// A successfully authenticated connection ready for the backend. The
    /// stream arrives already flipped to blocking mode.
    Handoff {
        login: LoginData,
        stream: StdTcpStream,
        reply: oneshot::Sender<HandoffReply>,
    },
    TunnelAck {
        generation: u64,
        token: u64,
    },
    TunnelClosed {
        generation: u64,
    },
}

pub enum HandoffReply {
    /// The backend has (or will) take over; the dispatcher owns the socket.
    Completed,
    /// Handoff failed; the socket comes back so the caller can apologise.
    Failed { stream: StdTcpStream },
}

pub struct Dispatcher {
    settings: Arc<Settings>,
    admission: Arc<Admission>,
    stats: Arc<GateStats>,
    rx: mpsc::Receiver<DispatchMsg>,
    tx: mpsc::Sender<DispatchMsg>,
    tunnel_listener: UnixListener,
    tunnel: Option<Tunnel>,
    generation: u64,
    ackq: AckQueue<StdTcpStream>,
    next_token: u64,
    retry_cmd: Option<String>,
    retry_times: u32,
}

impl Dispatcher {
    pub fn spawn(
        settings: Arc<Settings>,
        admission: Arc<Admission>,
        stats: Arc<GateStats>,
        tunnel_listener: UnixListener,
        retry_cmd: Option<String>,
    ) -> (mpsc::Sender<DispatchMsg>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(256);
        let dispatcher = Self {
            settings,
            admission,
            stats,
            rx,
            tx: tx.clone(),
            tunnel_listener,
            tunnel: None,
            generation: 0,
            ackq: AckQueue::new(),
            next_token: 1,
            retry_cmd,
            retry_times: 0,
        };
        let handle = tokio::spawn(dispatcher.run());
        (tx, handle)
    }

    async fn run(mut self) {
        let mut hup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()).ok();
        if hup.is_none() {
            tracing::warn!("cannot install SIGHUP handler; reload on signal disabled");
        }

        loop {
            let deadline = self.ackq.next_deadline();
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break, // every sender is gone; we are shutting down
                },
                accepted = self.tunnel_listener.accept() => match accepted {
                    Ok((stream, _)) => self.install_tunnel(stream),
                    Err(e) => tracing::warn!(error = %e, "tunnel accept failed"),
                },
                Some(_) = recv_signal(&mut hup) => {
                    tracing::info!(opened_fd = self.stats.opened(), "caught sighup, scheduling data reload");
                    self.admission.request_reload();
                },
                _ = sleep_until_std(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire_acks();
                },
            }
        }
    }

    async fn handle(&mut self, msg: DispatchMsg) {
        match msg {
            DispatchMsg::Handoff {
                login,
                stream,
                reply,
            } => self.on_handoff(login, stream, reply).await,
            DispatchMsg::TunnelAck { generation, token } => self.on_ack(generation, token),
            DispatchMsg::TunnelClosed { generation } => {
                if self.current_generation() == Some(generation) {
                    tracing::warn!("tunnel closed by backend");
                    self.stop_tunnel();
                }
            }
        }
    }

    fn current_generation(&self) -> Option<u64> {
        self.tunnel.as_ref().map(|t| t.generation())
    }

    fn install_tunnel(&mut self, stream: tokio::net::UnixStream) {
        tracing::info!("new tunnel established");
        crate::net::tune_socket(&stream);
        self.stop_tunnel();
        self.generation += 1;
        let ack_tx = self.settings.async_ack.then(|| self.tx.clone());
        self.tunnel = Some(Tunnel::new(stream, self.generation, ack_tx));
    }

    fn stop_tunnel(&mut self) {
        if let Some(tunnel) = self.tunnel.take() {
            tracing::info!(generation = tunnel.generation(), "stopping tunnel");
        }
    }

    async fn on_handoff(
        &mut self,
        mut login: LoginData,
        stream: StdTcpStream,
        reply: oneshot::Sender<HandoffReply>,
    ) {
        if let Err(e) = self.try_handoff(&mut login, &stream).await {
            tracing::warn!(error = %e, userid = %login.userid, "handoff failed");
            self.retry_service().await;
            let _ = reply.send(HandoffReply::Failed { stream });
            return;
        }

        if self.settings.async_ack {
            let deadline = Instant::now() + self.settings.ack_timeout;
            self.ackq.add(login.ack_token, deadline, stream);
            self.stats.set_ackq(self.ackq.size(), self.ackq.reuse());
            let _ = reply.send(HandoffReply::Completed);
            return;
        }

        // Synchronous mode: one blocking read on the tunnel. A mismatched
        // token means the backend lost protocol sync; the tunnel cannot be
        // trusted afterwards.
        match self.sync_ack(login.ack_token).await {
            Ok(()) => {
                drop(stream);
                self.stats.dec_opened();
                let _ = reply.send(HandoffReply::Completed);
            }
            Err(e) => {
                tracing::error!(error = %e, "service ack failed");
                self.stop_tunnel();
                let _ = reply.send(HandoffReply::Failed { stream });
            }
        }
    }

    async fn try_handoff(&mut self, login: &mut LoginData, stream: &StdTcpStream) -> AppResult<()> {
        let Some(tunnel) = &self.tunnel else {
            return Err(GateError::TunnelDown);
        };
        login.ack_token = self.next_token;
        self.next_token += 1;

        tunnel.send_fd(stream.as_raw_fd()).await?;
        tunnel.send_login_data(login).await?;
        tracing::debug!(
            userid = %login.userid,
            host = %login.host_ip,
            token = login.ack_token,
            "session dispatched to backend"
        );
        Ok(())
    }

    async fn sync_ack(&mut self, want: u64) -> AppResult<()> {
        let Some(tunnel) = &self.tunnel else {
            return Err(GateError::TunnelDown);
        };
        let got = tunnel.read_ack().await?;
        if got == 0 {
            return Err(GateError::TunnelProtocol("zero ack token"));
        }
        if got != want {
            return Err(GateError::TunnelProtocol("ack token mismatch"));
        }
        Ok(())
    }

    fn on_ack(&mut self, generation: u64, token: u64) {
        if self.current_generation() != Some(generation) {
            tracing::debug!(token, "ack from a replaced tunnel, ignored");
            return;
        }
        if token == 0 {
            tracing::warn!("zero ack token from backend");
            self.stop_tunnel();
            return;
        }
        match self.ackq.remove(token) {
            Some(entry) => {
                // The backend owns the session now; closing our copy of the
                // descriptor is the whole teardown.
                drop(entry.payload);
                self.stats.dec_opened();
                tracing::debug!(token, "handoff acknowledged");
            }
            None => tracing::warn!(token, "ack for an unknown connection, discarded"),
        }
        self.stats.set_ackq(self.ackq.size(), self.ackq.reuse());
    }

    fn expire_acks(&mut self) {
        for entry in self.ackq.expire_due(Instant::now()) {
            tracing::warn!(token = entry.token, "no ack from backend, dropping session");
            drop(entry.payload);
            self.stats.dec_opened();
        }
        self.stats.set_ackq(self.ackq.size(), self.ackq.reuse());
    }

    /// A live tunnel just broke. Close it and, within budget, launch the
    /// configured retry command to bring the backend up again. Without a
    /// tunnel there is nothing to retry: either the command is already in
    /// flight or the service was never started.
    async fn retry_service(&mut self) {
        if self.tunnel.is_none() {
            return;
        }
        self.stop_tunnel();

        let Some(cmd) = self.retry_cmd.clone() else {
            return;
        };
        if self.retry_times >= self.settings.max_retry_service {
            tracing::error!(
                limit = self.settings.max_retry_service,
                "retried the service too many times, waiting for manual maintenance"
            );
            return;
        }
        self.retry_times += 1;
        self.stats.set_retries(self.retry_times);
        tracing::warn!(attempt = self.retry_times, %cmd, "restarting backend service");
        match tokio::process::Command::new("sh").arg("-c").arg(&cmd).spawn() {
            Ok(mut child) => {
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
            }
            Err(e) => tracing::error!(error = %e, "cannot launch retry command"),
        }
    }
}

async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) -> Option<()> {
    match sig {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_std(deadline: Instant) {
    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
}
