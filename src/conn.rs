//! One task per accepted connection: TELNET filtering, the login dialogue,
//! authentication, and either a backend handoff or a local teardown.
//!
//! Teardown happens in exactly one place. A connection that is handed off
//! surrenders its socket to the dispatcher and simply ends; every other
//! path flows through [`finish`], optionally after a grace delay.

use crate::admission::Gate;
use crate::auth::{ATTEMPT_FAIL, ATTEMPT_OK, Challenge};
use crate::dispatcher::{DispatchMsg, HandoffReply};
use crate::error::AppResult;
use crate::input::{self, Key};
use crate::login::{self, Action, LoginContext, LoginState};
use crate::registry::Registry;
use crate::screen;
use crate::telnet::TelnetFilter;
use crate::tunnel::LoginData;
use bytes::BytesMut;
use chrono::Local;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio::time::timeout;

/// How the dialogue ended.
enum Flow {
    Continue,
    Close(Duration),
    HandedOff,
}

struct ConnIo {
    r: OwnedReadHalf,
    w: OwnedWriteHalf,
}

struct Connection {
    io: Option<ConnIo>,
    out: BytesMut,
    telnet: TelnetFilter,
    ctx: LoginContext,
    idle: Duration,
}

pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    local_port: u16,
    registry: Arc<Registry>,
) {
    registry.stats.inc_opened();
    tracing::debug!(%peer, port = local_port, opened_fd = registry.stats.opened(), "new connection");
    run(stream, peer, local_port, registry).await;
}

async fn run(stream: TcpStream, peer: SocketAddr, local_port: u16, registry: Arc<Registry>) {
    crate::net::tune_socket(&stream);

    // Fast unbuffered banner; real output goes through the write buffer.
    let _ = stream.try_write(registry.inscreen.as_bytes());

    registry.admission.reload();

    let (r, w) = stream.into_split();
    let mut conn = Connection::new(r, w, peer, local_port, &registry);
    conn.telnet.queue_init_commands();
    conn.pump_telnet();

    match registry.admission.gate(peer_v4(peer)) {
        Gate::Banned(scr) => {
            tracing::info!(%peer, "rejecting banned peer");
            screen::text_screen(&mut conn.out, scr.as_deref(), registry.admission.online_users());
            finish(conn, registry.settings.ban_sleep, &registry).await;
            return;
        }
        Gate::Overload(kind) => {
            tracing::info!(%peer, ?kind, "rejecting under overload");
            screen::overload(&mut conn.out, kind);
            finish(conn, registry.settings.overload_sleep, &registry).await;
            return;
        }
        Gate::Welcome(scr) => {
            screen::text_screen(&mut conn.out, scr.as_deref(), registry.admission.online_users());
            screen::userid_prompt(&mut conn.out, &registry.userid_prompt, "", 0);
        }
    }
    if conn.flush().await.is_err() {
        finish(conn, Duration::ZERO, &registry).await;
        return;
    }

    let flow = drive(&mut conn, &registry).await;
    match flow {
        Flow::HandedOff => {
            tracing::info!(userid = %conn.ctx.userid, %peer, "session handed off");
        }
        Flow::Close(grace) => finish(conn, grace, &registry).await,
        Flow::Continue => unreachable!("drive only returns terminal flows"),
    }
}

/// Read loop. The idle timer rearms on every successful read.
async fn drive(conn: &mut Connection, registry: &Arc<Registry>) -> Flow {
    let mut buf = [0u8; 64];
    loop {
        let n = {
            let Some(io) = conn.io.as_mut() else {
                return Flow::HandedOff;
            };
            match timeout(conn.idle, io.r.read(&mut buf)).await {
                Err(_) => {
                    tracing::debug!(host = %conn.ctx.host_ip, "idle timeout");
                    return Flow::Close(Duration::ZERO);
                }
                Ok(Ok(0)) => return Flow::Close(Duration::ZERO),
                Ok(Ok(n)) => n,
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Ok(Err(_)) => return Flow::Close(Duration::ZERO),
            }
        };

        match conn.process_chunk(&buf[..n], registry).await {
            Ok(Flow::Continue) => {}
            Ok(flow) => return flow,
            Err(_) => return Flow::Close(Duration::ZERO),
        }
        if conn.flush().await.is_err() {
            return Flow::Close(Duration::ZERO);
        }
    }
}

impl Connection {
    fn new(
        r: OwnedReadHalf,
        w: OwnedWriteHalf,
        peer: SocketAddr,
        local_port: u16,
        registry: &Registry,
    ) -> Self {
        Self {
            io: Some(ConnIo { r, w }),
            out: BytesMut::with_capacity(4096),
            telnet: TelnetFilter::new(),
            ctx: LoginContext::new(peer_v4(peer).to_string(), local_port.to_string()),
            idle: registry.settings.idle_timeout,
        }
    }

    fn pump_telnet(&mut self) {
        let replies = self.telnet.take_replies();
        if !replies.is_empty() {
            self.out.extend_from_slice(&replies);
        }
    }

    async fn flush(&mut self) -> AppResult<()> {
        if self.out.is_empty() {
            return Ok(());
        }
        let buf = self.out.split();
        let Some(io) = self.io.as_mut() else {
            return Ok(());
        };
        io.w.write_all(&buf).await?;
        Ok(())
    }

    async fn process_chunk(&mut self, chunk: &[u8], registry: &Arc<Registry>) -> AppResult<Flow> {
        let mut clean = Vec::with_capacity(chunk.len());
        self.telnet.feed(chunk, &mut clean);
        self.pump_telnet();

        if let Some((cols, rows)) = self.telnet.take_naws() {
            tracing::trace!(cols, rows, "window size reported");
            self.ctx.term_cols = cols;
            self.ctx.term_rows = rows;
        }
        if self.telnet.take_ayt() {
            let stats = &registry.stats;
            let ackq = registry
                .settings
                .async_ack
                .then(|| (stats.ackq_size(), stats.ackq_reuse()));
            self.out.extend_from_slice(
                screen::ayt_reply(stats.retries(), stats.opened(), ackq).as_bytes(),
            );
        }

        for key in input::keys(&clean) {
            if key == Key::Unknown {
                // anti-idle chatter from decorated clients; beeping at it
                // would only confuse the user
                continue;
            }
            match self.ctx.handle(key) {
                Action::Wait => {}
                Action::Beep => screen::bell(&mut self.out),
                Action::Backspace => screen::backspace(&mut self.out),
                Action::OutChar(c) => self.out.extend_from_slice(&[c]),
                Action::RedrawUserid => screen::userid_prompt(
                    &mut self.out,
                    &registry.userid_prompt,
                    &self.ctx.userid,
                    self.ctx.cursor,
                ),
                Action::PromptPasswd => match self.submit_userid(registry).await? {
                    Flow::Continue => {}
                    flow => return Ok(flow),
                },
                Action::StartAuth => match self.run_auth(registry).await? {
                    Flow::Continue => {}
                    flow => return Ok(flow),
                },
            }
        }
        Ok(Flow::Continue)
    }

    /// The userid was submitted. Free accounts go straight to the
    /// challenge; everyone else gets the password prompt.
    async fn submit_userid(&mut self, registry: &Arc<Registry>) -> AppResult<Flow> {
        screen::userid_prompt_end(&mut self.out);
        // negotiation is settled by now; freeze the client fingerprint
        self.telnet.stop_fingerprint();

        if !self.ctx.userid.is_empty() {
            self.ctx.apply_encoding_suffix();
            if registry.auth.free_userid(&self.ctx.userid).is_none() {
                screen::passwd_prompt(&mut self.out);
                return Ok(Flow::Continue);
            }
        }

        self.ctx.state = LoginState::Auth;
        self.run_auth(registry).await
    }

    async fn run_auth(&mut self, registry: &Arc<Registry>) -> AppResult<Flow> {
        let settings = &registry.settings;
        screen::check_passwd(&mut self.out);

        let mut was_valid_uid = false;
        if login::is_valid_userid(&self.ctx.userid) {
            was_valid_uid = true;
            match registry.auth.challenge(&mut self.ctx).await? {
                Challenge::Fail => {
                    registry
                        .attempts
                        .record(&self.ctx.userid, ATTEMPT_FAIL, Local::now(), &self.ctx.host_ip)
                        .await;
                }
                Challenge::FreeId => {
                    if !registry.admission.check_free_userid(&self.ctx.userid).allowed {
                        tracing::info!(userid = %self.ctx.userid, host = %self.ctx.host_ip, "free account quota hit");
                        screen::reject_free_userid(
                            &mut self.out,
                            &self.ctx.userid,
                            settings.guest_id.as_deref(),
                        );
                        return Ok(Flow::Close(settings.authfail_sleep));
                    }
                    screen::auth_success(&mut self.out, true);
                    return self.start_service(registry).await;
                }
                Challenge::Ok => {
                    registry
                        .attempts
                        .record(&self.ctx.userid, ATTEMPT_OK, Local::now(), &self.ctx.host_ip)
                        .await;
                    screen::auth_success(&mut self.out, false);
                    return self.start_service(registry).await;
                }
            }
        }

        // Failed challenge or an id not worth challenging.
        screen::bell(&mut self.out);
        if self.ctx.fail_retry() >= settings.login_attempts {
            tracing::info!(host = %self.ctx.host_ip, "too many failed logins, goodbye");
            screen::text_screen(
                &mut self.out,
                registry.admission.goodbye().as_deref(),
                registry.admission.online_users(),
            );
            return Ok(Flow::Close(Duration::ZERO));
        }

        if was_valid_uid {
            screen::auth_fail(&mut self.out);
        } else {
            screen::empty_userid_warn(&mut self.out);
        }
        self.ctx.state = LoginState::Userid;
        screen::userid_prompt(&mut self.out, &registry.userid_prompt, "", 0);
        Ok(Flow::Continue)
    }

    /// Hand the socket to the backend through the dispatcher. On failure
    /// the socket comes back and the user sees the service-failure notice.
    async fn start_service(&mut self, registry: &Arc<Registry>) -> AppResult<Flow> {
        // the success message must reach the wire before the fd moves
        self.flush().await?;

        let login = LoginData {
            ack_token: 0, // allocated by the dispatcher
            userid: self.ctx.userid.clone(),
            host_ip: self.ctx.host_ip.clone(),
            port: self.ctx.port.clone(),
            encoding: self.ctx.encoding as i32,
            client_code: self.telnet.client_code(),
            t_lines: i32::from(self.ctx.term_rows).max(24),
            t_cols: i32::from(self.ctx.term_cols).max(80),
        };

        let Some(io) = self.io.take() else {
            return Ok(Flow::Close(Duration::ZERO));
        };
        let stream = match io.r.reunite(io.w) {
            Ok(s) => s,
            Err(_) => return Ok(Flow::Close(Duration::ZERO)),
        };
        let std_stream = stream.into_std()?;
        // the backend drives the session with blocking I/O
        std_stream.set_nonblocking(false)?;

        self.ctx.state = LoginState::WaitAck;
        let (reply_tx, reply_rx) = oneshot::channel();
        let msg = DispatchMsg::Handoff {
            login,
            stream: std_stream,
            reply: reply_tx,
        };
        if registry.dispatch.send(msg).await.is_err() {
            // dispatcher is gone (shutdown); the socket went with the message
            return Ok(Flow::HandedOff);
        }

        match reply_rx.await {
            Ok(HandoffReply::Completed) => Ok(Flow::HandedOff),
            Ok(HandoffReply::Failed { stream }) => {
                self.restore_io(stream)?;
                self.ctx.state = LoginState::Auth;
                screen::service_failure(&mut self.out);
                Ok(Flow::Close(registry.settings.authfail_sleep))
            }
            Err(_) => Ok(Flow::HandedOff),
        }
    }

    fn restore_io(&mut self, stream: std::net::TcpStream) -> AppResult<()> {
        stream.set_nonblocking(true)?;
        let stream = TcpStream::from_std(stream)?;
        let (r, w) = stream.into_split();
        self.io = Some(ConnIo { r, w });
        Ok(())
    }
}

/// Flush what we can, wait out the grace period, close. Connections whose
/// socket moved to the dispatcher are only logged.
async fn finish(mut conn: Connection, grace: Duration, registry: &Registry) {
    let owns_socket = conn.io.is_some();
    let _ = conn.flush().await;
    if owns_socket && grace > Duration::ZERO {
        tracing::debug!(host = %conn.ctx.host_ip, ?grace, "closing after grace");
        tokio::time::sleep(grace).await;
    }
    if owns_socket {
        registry.stats.dec_opened();
        tracing::debug!(
            userid = %conn.ctx.userid,
            host = %conn.ctx.host_ip,
            opened_fd = registry.stats.opened(),
            "connection closed"
        );
    }
}

fn peer_v4(peer: SocketAddr) -> Ipv4Addr {
    match peer.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(ip) => ip.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
    }
}
