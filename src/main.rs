use anyhow::Context;
use bbsgate::admission::{Admission, SortedBanList, StaticStats};
use bbsgate::auth::{Authenticator, FileAttemptLog, FilePasswordStore};
use bbsgate::config::{self, Cli, Settings};
use bbsgate::dispatcher::Dispatcher;
use bbsgate::registry::GateStats;
use bbsgate::{Registry, net};
use clap::Parser;
use std::path::Path;
use std::process::exit;
use std::sync::Arc;

// Exit codes, kept stable for the wrapper scripts that watch them.
const EX_USAGE: i32 = 1;
const EX_TUNNEL: i32 = 2;
const EX_BIND: i32 = 3;
const EX_NO_SERVICE: i32 = 4;

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            exit(EX_USAGE);
        }
    };

    let mut settings = Settings::default();
    settings.async_ack = cli.use_async_ack();
    settings.nonblock = cli.use_nonblock();
    settings.verbose = cli.verbose;
    let settings = Arc::new(settings);

    init_tracing(settings.verbose);

    // A dying backend must never take the dispatcher with it.
    if let Err(e) = net::ignore_sigpipe() {
        tracing::warn!(error = %e, "cannot ignore SIGPIPE");
    }
    raise_fd_limit(settings.max_fds);

    let conf_path = cli
        .config
        .clone()
        .unwrap_or_else(|| settings.default_conf_file());
    let mut conf = match config::load_bind_conf(&conf_path) {
        Ok(conf) => conf,
        Err(e) => {
            tracing::error!(error = %e, "invalid bind configuration");
            exit(EX_USAGE);
        }
    };
    if let Some(port) = cli.port {
        conf.ports.push(port);
    }
    if cli.tunnel.is_some() {
        conf.tunnel_path = cli.tunnel.clone();
    }
    let retry_cmd = cli.retry_cmd.clone().or(conf.retry_cmd.take());

    if conf.ports.is_empty() {
        tracing::error!("no ports to bind, abort");
        exit(EX_NO_SERVICE);
    }
    let Some(tunnel_path) = conf.tunnel_path.clone() else {
        tracing::error!("must assign one tunnel path, abort");
        exit(EX_NO_SERVICE);
    };

    // Bind every port while still privileged.
    let mut listeners = Vec::new();
    for &port in &conf.ports {
        match net::bind_port(port, settings.listen_backlog) {
            Ok(listener) => {
                tracing::info!(port, "listening");
                listeners.push((port, listener));
            }
            Err(e) => {
                tracing::error!(port, error = %e, "cannot bind, abort");
                exit(EX_BIND);
            }
        }
    }

    let tunnel_listener = match net::bind_tunnel(&tunnel_path) {
        Ok(listener) => {
            tracing::info!(path = %tunnel_path.display(), "tunnel created");
            listener
        }
        Err(e) => {
            tracing::error!(path = %tunnel_path.display(), error = %e, "cannot create tunnel, abort");
            exit(EX_TUNNEL);
        }
    };

    // Everything privileged is bound; no way back from here.
    drop_privileges(&settings);

    if cli.daemonize() {
        daemonize(&settings, cli.log_file.as_deref());
    }

    // The runtime comes up only after the fork.
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "cannot start runtime");
            exit(EX_USAGE);
        }
    };
    if let Err(e) = runtime.block_on(run(
        settings,
        listeners,
        tunnel_listener,
        conf.client_cmd,
        retry_cmd,
    )) {
        tracing::error!(error = %e, "fatal");
        exit(EX_USAGE);
    }
}

async fn run(
    settings: Arc<Settings>,
    listeners: Vec<(u16, std::net::TcpListener)>,
    tunnel_listener: std::os::unix::net::UnixListener,
    client_cmd: Option<String>,
    retry_cmd: Option<String>,
) -> anyhow::Result<()> {
    let stats = Arc::new(GateStats::default());
    let admission = Arc::new(Admission::new(
        settings.clone(),
        Arc::new(StaticStats),
        Arc::new(SortedBanList::load(&settings.banip_file())),
    ));
    admission.reload();

    let store = Arc::new(FilePasswordStore::load_or_empty(&settings.passwd_file()));
    let auth = Authenticator::new(store, &settings);
    let attempts = Arc::new(FileAttemptLog::new(settings.attempt_log_file()));

    let tunnel_listener = tokio::net::UnixListener::from_std(tunnel_listener)
        .context("cannot register tunnel listener")?;
    let (dispatch, dispatcher) = Dispatcher::spawn(
        settings.clone(),
        admission.clone(),
        stats.clone(),
        tunnel_listener,
        retry_cmd,
    );

    let registry = Arc::new(Registry::new(
        settings.clone(),
        admission,
        auth,
        attempts,
        dispatch,
        stats,
    ));

    for (port, listener) in listeners {
        let listener = tokio::net::TcpListener::from_std(listener)
            .with_context(|| format!("cannot register listener on port {port}"))?;
        tokio::spawn(net::serve(listener, port, registry.clone()));
    }

    // Spawn the backend once everything is wired up.
    if let Some(cmd) = client_cmd {
        tracing::info!(%cmd, "invoking client");
        match tokio::process::Command::new("sh").arg("-c").arg(&cmd).spawn() {
            Ok(mut child) => {
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
            }
            Err(e) => tracing::error!(error = %e, "cannot launch client command"),
        }
    }

    tracing::info!("start event dispatch");
    let _ = dispatcher.await;
    Ok(())
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::{EnvFilter, prelude::*};

    color_eyre::install().unwrap();

    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(default.parse().unwrap()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::uptime()),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();
}

fn raise_fd_limit(max_fds: u64) {
    use nix::sys::resource::{Resource, setrlimit};
    if let Err(e) = setrlimit(Resource::RLIMIT_NOFILE, max_fds, max_fds) {
        tracing::warn!(error = %e, max_fds, "cannot raise open file limit");
    }
}

/// Assume the configured unprivileged identity. Group first, then user;
/// a configured drop that fails is fatal.
fn drop_privileges(settings: &Settings) {
    use nix::unistd::{Gid, Uid, setgid, setuid};

    if let Some(gid) = settings.run_gid {
        if let Err(e) = setgid(Gid::from_raw(gid)) {
            tracing::error!(gid, error = %e, "cannot drop group privileges, abort");
            exit(EX_USAGE);
        }
    }
    if let Some(uid) = settings.run_uid {
        if let Err(e) = setuid(Uid::from_raw(uid)) {
            tracing::error!(uid, error = %e, "cannot drop user privileges, abort");
            exit(EX_USAGE);
        }
    }
}

/// Classic double-duty daemonization: detach from the terminal, record the
/// pid, and point stdio at the log file (or /dev/null).
fn daemonize(settings: &Settings, log_file: Option<&Path>) {
    use nix::unistd::{ForkResult, fork, setsid};

    tracing::info!("start daemonize");
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => {
            tracing::error!(error = %e, "fork failed, abort");
            exit(EX_USAGE);
        }
    }
    if let Err(e) = setsid() {
        tracing::warn!(error = %e, "setsid failed");
    }

    let pid_file = settings.pid_file();
    if let Some(dir) = pid_file.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    if let Err(e) = std::fs::write(&pid_file, format!("{}\n", std::process::id())) {
        tracing::warn!(error = %e, path = %pid_file.display(), "cannot write pid file");
    }

    redirect_stdio(log_file);
}

fn redirect_stdio(log_file: Option<&Path>) {
    use std::os::fd::AsRawFd;

    if let Ok(null) = std::fs::OpenOptions::new().read(true).open("/dev/null") {
        let _ = nix::unistd::dup2(null.as_raw_fd(), 0);
    }
    let sink = log_file
        .and_then(|p| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .ok()
        })
        .or_else(|| std::fs::OpenOptions::new().write(true).open("/dev/null").ok());
    if let Some(f) = sink {
        let _ = nix::unistd::dup2(f.as_raw_fd(), 1);
        let _ = nix::unistd::dup2(f.as_raw_fd(), 2);
    }
}
