use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use http::Uri;
use thiserror::Error;

use crate::bandwidth::DEFAULT_BANDWIDTH_URL;
use crate::descriptor::{self, ProxyDescriptor, SpecError};

/// Command line interface
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A SOCKS proxy that aggregates multiple remote SOCKS proxies",
    long_about = "multisocks listens as a SOCKS4/4a/5 server and fans each client \
connection out to one of a pool of remote SOCKS proxies, selected by weighted \
round-robin over the currently healthy set.\n\nProxy specs take the form \
scheme://[user:pass@]host:port[/weight] with scheme one of socks4, socks4a, \
socks5, socks5h."
)]
pub struct Cli {
    /// Log verbosity written to stderr (RUST_LOG overrides)
    #[arg(long, value_enum, global = true, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the SOCKS proxy server
    Start(StartArgs),
}

#[derive(Args, Debug)]
#[command(group(
    ArgGroup::new("proxy_source")
        .required(true)
        .args(["proxies", "proxy_file"])
))]
pub struct StartArgs {
    /// Which IP to accept connections on
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Which port to listen on
    #[arg(short, long, default_value_t = 1080)]
    pub port: u16,

    /// Remote proxies to dispatch to, scheme://[user:pass@]host:port[/weight]
    #[arg(short = 'x', long, num_args = 1.., value_name = "SPEC")]
    pub proxies: Vec<String>,

    /// Path to a text file with one proxy spec per line (# starts a comment)
    #[arg(short = 'f', long, value_name = "PATH")]
    pub proxy_file: Option<PathBuf>,

    /// Size the active proxy window from measured bandwidth
    #[arg(short = 'a', long)]
    pub auto_optimize: bool,

    /// Seconds between full health probe sweeps
    #[arg(long, default_value_t = 60, value_name = "SECS")]
    pub probe_interval: u64,

    /// Seconds between bandwidth retune rounds
    #[arg(long, default_value_t = 600, value_name = "SECS")]
    pub retune_interval: u64,

    /// Plain-HTTP URL fetched to estimate throughput
    #[arg(long, default_value = DEFAULT_BANDWIDTH_URL, value_name = "URL")]
    pub bandwidth_url: String,

    /// Seconds allowed for upstream connect plus handshake
    #[arg(long, default_value_t = 10, value_name = "SECS")]
    pub connect_timeout: u64,

    /// Seconds in-flight sessions may finish after a shutdown signal
    #[arg(long, default_value_t = 10, value_name = "SECS")]
    pub grace_period: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("invalid bandwidth url `{url}`: {reason}")]
    BandwidthUrl { url: String, reason: String },

    #[error("no proxies loaded")]
    EmptyProxySet,
}

impl ConfigError {
    /// Process exit code for this failure: 3 for an empty proxy set,
    /// 1 for every other configuration problem.
    pub fn exit_code(&self) -> u8 {
        match self {
            ConfigError::EmptyProxySet => 3,
            _ => 1,
        }
    }
}

/// Validated runtime configuration derived from the CLI
#[derive(Debug)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub descriptors: Vec<ProxyDescriptor>,
    pub auto_optimize: bool,
    pub probe_interval: Duration,
    pub retune_interval: Duration,
    pub bandwidth_url: Uri,
    pub connect_timeout: Duration,
    pub grace_period: Duration,
}

impl Config {
    pub fn from_start_args(args: StartArgs) -> Result<Self, ConfigError> {
        let specs: Vec<String> = match &args.proxy_file {
            Some(path) => descriptor::read_proxy_file(path)?,
            None => args.proxies.clone(),
        };
        if specs.is_empty() {
            return Err(ConfigError::EmptyProxySet);
        }

        let mut descriptors = Vec::with_capacity(specs.len());
        for (id, spec) in specs.iter().enumerate() {
            let mut descriptor = ProxyDescriptor::parse(spec)?;
            descriptor.id = id;
            descriptors.push(descriptor);
        }

        let bandwidth_url: Uri =
            args.bandwidth_url
                .parse()
                .map_err(|err: http::uri::InvalidUri| ConfigError::BandwidthUrl {
                    url: args.bandwidth_url.clone(),
                    reason: err.to_string(),
                })?;
        if args.auto_optimize && bandwidth_url.scheme_str() != Some("http") {
            return Err(ConfigError::BandwidthUrl {
                url: args.bandwidth_url.clone(),
                reason: "only plain-HTTP probe URLs are supported".to_string(),
            });
        }

        Ok(Config {
            bind_addr: SocketAddr::new(args.host, args.port),
            descriptors,
            auto_optimize: args.auto_optimize,
            probe_interval: Duration::from_secs(args.probe_interval),
            retune_interval: Duration::from_secs(args.retune_interval),
            bandwidth_url,
            connect_timeout: Duration::from_secs(args.connect_timeout),
            grace_period: Duration::from_secs(args.grace_period),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(args)
    }

    fn start_args(args: &[&str]) -> StartArgs {
        match parse(args).unwrap().command {
            Some(Command::Start(start)) => start,
            other => panic!("expected start command, got {other:?}"),
        }
    }

    #[test]
    fn start_requires_a_proxy_source() {
        assert!(parse(&["multisocks", "start"]).is_err());
    }

    #[test]
    fn proxies_and_proxy_file_are_mutually_exclusive() {
        assert!(parse(&[
            "multisocks",
            "start",
            "--proxies",
            "socks5://a:1080",
            "--proxy-file",
            "proxies.txt",
        ])
        .is_err());
    }

    #[test]
    fn defaults_follow_the_documented_values() {
        let args = start_args(&["multisocks", "start", "--proxies", "socks5://a:1080"]);
        assert_eq!(args.host, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(args.port, 1080);
        assert_eq!(args.probe_interval, 60);
        assert_eq!(args.retune_interval, 600);
        assert_eq!(args.connect_timeout, 10);
        assert_eq!(args.grace_period, 10);
        assert!(!args.auto_optimize);

        let config = Config::from_start_args(args).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:1080".parse().unwrap());
        assert_eq!(config.descriptors.len(), 1);
        assert_eq!(config.probe_interval, Duration::from_secs(60));
    }

    #[test]
    fn descriptors_get_stable_ids_in_order() {
        let args = start_args(&[
            "multisocks",
            "start",
            "--proxies",
            "socks5://a:1080",
            "socks4://b:1081/2",
            "socks5h://c:1082",
        ]);
        let config = Config::from_start_args(args).unwrap();
        let ids: Vec<usize> = config.descriptors.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(config.descriptors[1].weight, 2);
    }

    #[test]
    fn bad_spec_is_a_config_error_with_exit_code_1() {
        let args = start_args(&["multisocks", "start", "--proxies", "ftp://a:1080"]);
        let err = Config::from_start_args(args).unwrap_err();
        assert!(matches!(err, ConfigError::Spec(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn empty_proxy_file_exits_with_code_3() {
        let path = std::env::temp_dir().join(format!(
            "multisocks-test-empty-{}.txt",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "# only comments in here\n\n").unwrap();
        drop(file);

        let args = start_args(&[
            "multisocks",
            "start",
            "--proxy-file",
            path.to_str().unwrap(),
        ]);
        let err = Config::from_start_args(args).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyProxySet));
        assert_eq!(err.exit_code(), 3);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn https_probe_url_is_rejected_when_optimizing() {
        let args = start_args(&[
            "multisocks",
            "start",
            "--proxies",
            "socks5://a:1080",
            "--auto-optimize",
            "--bandwidth-url",
            "https://speed.example.com/100mb.bin",
        ]);
        let err = Config::from_start_args(args).unwrap_err();
        assert!(matches!(err, ConfigError::BandwidthUrl { .. }));
    }

    #[test]
    fn https_probe_url_is_tolerated_without_optimizer() {
        let args = start_args(&[
            "multisocks",
            "start",
            "--proxies",
            "socks5://a:1080",
            "--bandwidth-url",
            "https://speed.example.com/100mb.bin",
        ]);
        assert!(Config::from_start_args(args).is_ok());
    }

    #[test]
    fn log_level_filter_strings() {
        assert_eq!(LogLevel::Info.as_filter(), "info");
        assert_eq!(LogLevel::Trace.as_filter(), "trace");
    }
}
