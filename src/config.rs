use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

use crate::crypto::{Cipher, CipherError};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 2048;

/// Must hold the longest handshake header line a browser sends.
pub const MIN_BUFFER_SIZE: usize = 256;

#[derive(Parser, Debug)]
#[command(
    name = "quizcast",
    about = "Realtime relay for classroom quiz sessions over WebSocket",
    version
)]
pub struct Args {
    /// Listening port.
    #[arg(long, env = "QUIZCAST_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Listening address.
    #[arg(long, env = "QUIZCAST_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// PEM certificate chain. Serves wss:// together with --key.
    #[arg(long, env = "QUIZCAST_CERT", value_name = "PATH")]
    pub cert: Option<PathBuf>,

    /// PEM private key.
    #[arg(long, env = "QUIZCAST_KEY", value_name = "PATH")]
    pub key: Option<PathBuf>,

    /// Password shared with the quiz pages for envelope encryption.
    #[arg(long, env = "QUIZCAST_SECRET", hide_env_values = true)]
    pub secret: String,

    /// Append logs to this file instead of stderr.
    #[arg(long = "log-file", env = "QUIZCAST_LOG_FILE", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Write the process id here while running.
    #[arg(long = "pid-file", env = "QUIZCAST_PID_FILE", value_name = "PATH")]
    pub pid_file: Option<PathBuf>,

    #[arg(short, long, env = "QUIZCAST_VERBOSE")]
    pub verbose: bool,

    /// Bytes per socket read, per handshake line and per outbound frame.
    #[arg(
        long = "max-buffer-size",
        env = "QUIZCAST_MAX_BUFFER_SIZE",
        default_value_t = DEFAULT_MAX_BUFFER_SIZE
    )]
    pub max_buffer_size: usize,

    /// Send frames without the server-side mask.
    #[arg(long = "unmasked-output", env = "QUIZCAST_UNMASKED_OUTPUT")]
    pub unmasked_output: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--cert and --key must be given together")]
    PartialTls,
    #[error("invalid secret: {0}")]
    Secret(#[from] CipherError),
    #[error("--max-buffer-size must be at least {min}, got {got}")]
    BufferTooSmall { min: usize, got: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Validated server settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub tls: Option<TlsFiles>,
    pub secret: String,
    pub log_file: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    pub verbose: bool,
    pub max_buffer_size: usize,
    pub mask_outgoing: bool,
}

impl Config {
    /// Defaults for everything but the address and the secret.
    pub fn new(listen: SocketAddr, secret: impl Into<String>) -> Self {
        Self {
            listen,
            tls: None,
            secret: secret.into(),
            log_file: None,
            pid_file: None,
            verbose: false,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            mask_outgoing: true,
        }
    }

    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let tls = match (args.cert, args.key) {
            (Some(cert), Some(key)) => Some(TlsFiles { cert, key }),
            (None, None) => None,
            _ => return Err(ConfigError::PartialTls),
        };
        Cipher::new(&args.secret)?;
        if args.max_buffer_size < MIN_BUFFER_SIZE {
            return Err(ConfigError::BufferTooSmall {
                min: MIN_BUFFER_SIZE,
                got: args.max_buffer_size,
            });
        }

        Ok(Self {
            listen: SocketAddr::new(args.bind, args.port),
            tls,
            secret: args.secret,
            log_file: args.log_file,
            pid_file: args.pid_file,
            verbose: args.verbose,
            max_buffer_size: args.max_buffer_size,
            mask_outgoing: !args.unmasked_output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Result<Config, ConfigError> {
        let mut argv = vec!["quizcast", "--secret", "classroom"];
        argv.extend_from_slice(extra);
        Config::from_args(Args::try_parse_from(argv).unwrap())
    }

    #[test]
    fn defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.listen, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.max_buffer_size, 2048);
        assert!(config.mask_outgoing);
        assert!(config.tls.is_none());
        assert!(!config.verbose);
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "--port",
            "9001",
            "--bind",
            "127.0.0.1",
            "--verbose",
            "--unmasked-output",
            "--max-buffer-size",
            "4096",
            "--cert",
            "c.pem",
            "--key",
            "k.pem",
        ])
        .unwrap();
        assert_eq!(config.listen, "127.0.0.1:9001".parse().unwrap());
        assert!(config.verbose);
        assert!(!config.mask_outgoing);
        assert_eq!(config.max_buffer_size, 4096);
        assert_eq!(
            config.tls,
            Some(TlsFiles {
                cert: "c.pem".into(),
                key: "k.pem".into()
            })
        );
    }

    #[test]
    fn cert_without_key_is_rejected() {
        assert!(matches!(parse(&["--cert", "c.pem"]), Err(ConfigError::PartialTls)));
    }

    #[test]
    fn secret_outside_the_alphabet_is_rejected() {
        let args = Args::try_parse_from(["quizcast", "--secret", "no spaces!"]).unwrap();
        assert!(matches!(Config::from_args(args), Err(ConfigError::Secret(_))));
    }

    #[test]
    fn tiny_buffer_is_rejected() {
        assert!(matches!(
            parse(&["--max-buffer-size", "16"]),
            Err(ConfigError::BufferTooSmall { got: 16, .. })
        ));
    }

    #[test]
    fn secret_is_required() {
        assert!(Args::try_parse_from(["quizcast"]).is_err());
    }
}
