use crate::config::Config;
use clap::{Parser, Subcommand};
use std::os::unix::io::RawFd;
use std::path::PathBuf;

/// Command-line interface for the `cgi-prefork` binary.
///
/// Flags override values from the configuration file, which in turn
/// override the built-in defaults.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "cgi-prefork",
    version,
    about = "Prefork TCP dispatcher that answers each request with the output of a command"
)]
pub struct Cli {
    /// TOML configuration file.
    ///
    /// Environment variable: `CGI_PREFORK_CONFIG`
    #[arg(long, env = "CGI_PREFORK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on, as `host:port`.
    ///
    /// Environment variable: `CGI_PREFORK_SOCKET`
    #[arg(long, env = "CGI_PREFORK_SOCKET")]
    pub socket: Option<String>,

    /// Requests each worker serves before it is replaced.
    ///
    /// Environment variable: `CGI_PREFORK_QUEUE_SIZE`
    #[arg(long, env = "CGI_PREFORK_QUEUE_SIZE")]
    pub queue_size: Option<u64>,

    /// Number of workers in the pool.
    ///
    /// Environment variable: `CGI_PREFORK_COUNT`
    #[arg(long, env = "CGI_PREFORK_COUNT")]
    pub count: Option<usize>,

    /// Detach from the terminal: `Yes` or `No`.
    #[arg(long, env = "CGI_PREFORK_DAEMON", value_parser = parse_yes_no)]
    pub daemon: Option<bool>,

    /// Command line run for every request, e.g. "/usr/lib/cgi-bin/hello --param1 a".
    ///
    /// Environment variable: `CGI_PREFORK_CGI`
    #[arg(long, env = "CGI_PREFORK_CGI")]
    pub cgi: Option<String>,

    /// PID file, locked while the dispatcher runs.
    #[arg(long)]
    pub pid_file: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run as a pool worker, reading the `[cgi]` table from stdin.
    /// Started by the dispatcher, not by hand.
    #[command(hide = true)]
    Worker {
        /// Inherited listening socket
        #[arg(long)]
        listen_fd: RawFd,
        /// Inherited worker end of the signal channel
        #[arg(long)]
        channel_fd: RawFd,
    },
}

impl Cli {
    /// Overlay the flags that were given onto `config`
    pub fn apply(&self, config: &mut Config) {
        if let Some(socket) = &self.socket {
            config.server.listen = socket.clone();
        }
        if let Some(queue_size) = self.queue_size {
            config.pool.max_requests = queue_size;
        }
        if let Some(count) = self.count {
            config.pool.workers = count;
        }
        if let Some(daemon) = self.daemon {
            config.server.daemon = daemon;
        }
        if let Some(cgi) = &self.cgi {
            config.cgi.command = cgi.clone();
        }
        if let Some(pid_file) = &self.pid_file {
            config.server.pid_file = Some(pid_file.clone());
        }
    }
}

fn parse_yes_no(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" => Ok(true),
        "no" | "false" => Ok(false),
        _ => Err(format!("expected Yes or No, got '{}'", value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["cgi-prefork"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_flags_override_config() {
        let cli = parse(&[
            "--socket",
            "127.0.0.1:9999",
            "--queue-size",
            "7",
            "--count",
            "3",
            "--daemon",
            "Yes",
            "--cgi",
            "/usr/lib/cgi-bin/hello --param1 a",
        ]);
        assert!(cli.command.is_none());

        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config.server.listen, "127.0.0.1:9999");
        assert_eq!(config.pool.max_requests, 7);
        assert_eq!(config.pool.workers, 3);
        assert!(config.server.daemon);
        assert_eq!(config.cgi.command, "/usr/lib/cgi-bin/hello --param1 a");
    }

    #[test]
    fn test_absent_flags_leave_config_alone() {
        let cli = Cli {
            config: None,
            socket: None,
            queue_size: None,
            count: None,
            daemon: None,
            cgi: None,
            pid_file: None,
            command: None,
        };
        let mut config = Config::default();
        config.pool.workers = 9;
        cli.apply(&mut config);
        assert_eq!(config.pool.workers, 9);
        assert_eq!(config.server.listen, "localhost:8888");
    }

    #[test]
    fn test_daemon_flag_values() {
        assert_eq!(parse_yes_no("Yes"), Ok(true));
        assert_eq!(parse_yes_no("no"), Ok(false));
        assert_eq!(parse_yes_no("TRUE"), Ok(true));
        assert_eq!(parse_yes_no("false"), Ok(false));
        assert!(parse_yes_no("maybe").is_err());
        assert!(Cli::try_parse_from(["cgi-prefork", "--daemon", "maybe"]).is_err());
    }

    #[test]
    fn test_worker_subcommand() {
        let cli = parse(&[
            "worker",
            "--listen-fd",
            "3",
            "--channel-fd",
            "4",
        ]);
        assert_eq!(
            cli.command,
            Some(Command::Worker {
                listen_fd: 3,
                channel_fd: 4,
            })
        );
    }

    #[test]
    fn test_worker_subcommand_name_matches_spawner() {
        let cli = parse(&[
            crate::lifecycle::WORKER_SUBCOMMAND,
            "--listen-fd",
            "3",
            "--channel-fd",
            "4",
        ]);
        assert!(matches!(cli.command, Some(Command::Worker { .. })));
    }
}
