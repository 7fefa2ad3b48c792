use crate::error::ConfigError;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directive prefix recognised in the bind configuration file.
pub const SVC_NAME: &str = "logind";

/// Command line switches. The one-letter pairs (`-d`/`-D`, `-a`/`-A`,
/// `-b`/`-B`) toggle the same knob; the last one given wins.
#[derive(Debug, Parser)]
#[command(name = "bbsgate", about = "High performance login dispatcher for terminal BBS services")]
pub struct Cli {
    /// Read bind configuration from this file
    #[arg(short = 'f', value_name = "conf")]
    pub config: Option<PathBuf>,

    /// Bind (listen) to an extra port
    #[arg(short = 'p', value_name = "port")]
    pub port: Option<u16>,

    /// Create the backend tunnel at this path
    #[arg(short = 't', value_name = "path")]
    pub tunnel: Option<PathBuf>,

    /// Command used to restart the backend after it is lost
    #[arg(short = 'r', value_name = "cmd")]
    pub retry_cmd: Option<String>,

    /// Log file used once daemonized
    #[arg(short = 'l', value_name = "file")]
    pub log_file: Option<PathBuf>,

    /// Enter daemon mode (default)
    #[arg(short = 'd', overrides_with = "foreground")]
    pub daemon: bool,

    /// Stay in the foreground
    #[arg(short = 'D', overrides_with = "daemon")]
    pub foreground: bool,

    /// Use asynchronous service acks (default)
    #[arg(short = 'a', overrides_with = "sync_ack")]
    pub async_ack: bool,

    /// Wait for each service ack synchronously
    #[arg(short = 'A', overrides_with = "async_ack")]
    pub sync_ack: bool,

    /// Drain accepts without blocking (default)
    #[arg(short = 'b', overrides_with = "blocking")]
    pub nonblock: bool,

    /// One accept per wakeup
    #[arg(short = 'B', overrides_with = "nonblock")]
    pub blocking: bool,

    /// Increase verbosity
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn daemonize(&self) -> bool {
        !self.foreground
    }

    pub fn use_async_ack(&self) -> bool {
        !self.sync_ack
    }

    pub fn use_nonblock(&self) -> bool {
        !self.blocking
    }
}

/// Bindings gathered from the configuration file and the command line.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BindConf {
    pub ports: Vec<u16>,
    pub tunnel_path: Option<PathBuf>,
    pub client_cmd: Option<String>,
    pub retry_cmd: Option<String>,
}

/// Parse the line-oriented bind configuration. Recognised directives:
///
/// ```text
/// logind <port>
/// logind tunnel <path>
/// logind client <command line>
/// logind client_retry <command line>
/// ```
///
/// Lines for other services are skipped. For the singleton directives the
/// first occurrence wins; later ones are reported and ignored.
pub fn parse_bind_conf(text: &str) -> Result<BindConf, ConfigError> {
    let mut conf = BindConf::default();

    for line in text.lines() {
        let mut it = line.split_whitespace();
        let (Some(program), Some(what)) = (it.next(), it.next()) else {
            continue;
        };
        if program != SVC_NAME {
            continue;
        }

        match what {
            "client" | "client_retry" => {
                let cmd = rest_of_line(line, program, what);
                if cmd.is_empty() {
                    return Err(ConfigError::Malformed(line.to_string()));
                }
                let slot = if what == "client" {
                    &mut conf.client_cmd
                } else {
                    &mut conf.retry_cmd
                };
                if let Some(prev) = slot {
                    tracing::warn!(directive = what, kept = %prev, "ignoring duplicate directive");
                } else {
                    *slot = Some(cmd.to_string());
                }
            }
            "tunnel" => {
                let Some(path) = it.next() else {
                    return Err(ConfigError::Malformed(line.to_string()));
                };
                if let Some(prev) = &conf.tunnel_path {
                    tracing::warn!(kept = %prev.display(), "ignoring duplicate tunnel directive");
                } else {
                    conf.tunnel_path = Some(PathBuf::from(path));
                }
            }
            port => match port.parse::<u16>() {
                Ok(p) if p > 0 => conf.ports.push(p),
                _ => tracing::warn!(%line, "unknown settings"),
            },
        }
    }

    Ok(conf)
}

/// Everything after the second whitespace-delimited token, verbatim.
fn rest_of_line<'a>(line: &'a str, program: &str, what: &str) -> &'a str {
    let s = line.trim_start();
    let s = s[program.len()..].trim_start();
    s[what.len()..].trim_start()
}

pub fn load_bind_conf(path: &Path) -> Result<BindConf, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_bind_conf(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "no bind configuration file");
            Ok(BindConf::default())
        }
        Err(e) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Process-wide tunables. The defaults mirror the classic daemon; anything
/// the original compiled in per site is a plain field here.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root of the service tree; banner, user and log files live below it.
    pub home: PathBuf,
    pub bbs_name: String,

    pub regular_check_interval: Duration,
    pub idle_timeout: Duration,
    pub ack_timeout: Duration,
    pub authfail_sleep: Duration,
    pub overload_sleep: Duration,
    pub ban_sleep: Duration,

    pub max_fds: u64,
    pub listen_backlog: i32,
    pub max_screen_lines: usize,
    pub max_retry_service: u32,
    pub login_attempts: u32,

    pub max_cpu_load: f64,
    pub max_active: usize,
    /// Upper bound on concurrent guest sessions; `None` lifts the quota.
    pub max_guest: Option<usize>,
    pub guest_id: Option<String>,
    pub regnew_id: Option<String>,
    pub dont_check_free_userid: bool,

    pub async_ack: bool,
    pub nonblock: bool,
    pub verbose: u8,

    /// Unprivileged identity assumed after the listen sockets are bound.
    pub run_uid: Option<u32>,
    pub run_gid: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            home: PathBuf::from("."),
            bbs_name: "bbsgate".to_string(),
            regular_check_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(20 * 60),
            ack_timeout: Duration::from_secs(30),
            authfail_sleep: Duration::from_secs(15),
            overload_sleep: Duration::from_secs(60),
            ban_sleep: Duration::from_secs(60),
            max_fds: 100_000,
            listen_backlog: 100,
            max_screen_lines: 24,
            max_retry_service: 15,
            login_attempts: 3,
            max_cpu_load: 8.0,
            max_active: 2048,
            max_guest: Some(100),
            guest_id: Some("guest".to_string()),
            regnew_id: Some("new".to_string()),
            dont_check_free_userid: false,
            async_ack: true,
            nonblock: true,
            verbose: 0,
            run_uid: None,
            run_gid: None,
        }
    }
}

impl Settings {
    pub fn welcome_file(&self) -> PathBuf {
        self.home.join("etc/welcome")
    }

    pub fn goodbye_file(&self) -> PathBuf {
        self.home.join("etc/goodbye")
    }

    pub fn ban_file(&self) -> PathBuf {
        self.home.join("etc/ban")
    }

    pub fn banip_file(&self) -> PathBuf {
        self.home.join("etc/banip")
    }

    pub fn passwd_file(&self) -> PathBuf {
        self.home.join("etc/userdb")
    }

    pub fn attempt_log_file(&self) -> PathBuf {
        self.home.join("log/logins")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.home.join("run/bbsgate.pid")
    }

    pub fn default_conf_file(&self) -> PathBuf {
        self.home.join("etc/bindports.conf")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ports_and_tunnel() {
        let conf = parse_bind_conf(
            "# comment-ish noise\n\
             telnetd 2323\n\
             logind 3000\n\
             logind 3001\n\
             logind tunnel /tmp/gate.sock\n",
        )
        .unwrap();
        assert_eq!(conf.ports, vec![3000, 3001]);
        assert_eq!(conf.tunnel_path.as_deref(), Some(Path::new("/tmp/gate.sock")));
        assert!(conf.client_cmd.is_none());
    }

    #[test]
    fn client_commands_keep_their_spacing_and_first_wins() {
        let conf = parse_bind_conf(
            "logind client /usr/bin/backend -t /tmp/gate.sock\n\
             logind client /usr/bin/other\n\
             logind client_retry /usr/bin/backend -t /tmp/gate.sock -r\n",
        )
        .unwrap();
        assert_eq!(conf.client_cmd.as_deref(), Some("/usr/bin/backend -t /tmp/gate.sock"));
        assert_eq!(
            conf.retry_cmd.as_deref(),
            Some("/usr/bin/backend -t /tmp/gate.sock -r")
        );
    }

    #[test]
    fn bare_client_directive_is_malformed() {
        assert!(parse_bind_conf("logind client\n").is_err());
        assert!(parse_bind_conf("logind tunnel\n").is_err());
    }

    #[test]
    fn junk_ports_are_skipped() {
        let conf = parse_bind_conf("logind zero\nlogind 0\nlogind 4000\n").unwrap();
        assert_eq!(conf.ports, vec![4000]);
    }
}
