use std::error::Error;
use std::fs::OpenOptions;

use clap::Parser;
use log::{error, info};

use quizcast::config::{Args, Config};
use quizcast::pidfile::PidFile;
use quizcast::Server;

fn main() {
    if let Err(err) = run() {
        error!("{err}");
        eprintln!("quizcast: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    dotenv::dotenv().ok();
    let config = Config::from_args(Args::parse())?;
    init_logging(&config)?;

    info!("quizcast {} starting", env!("CARGO_PKG_VERSION"));
    let _pid_file = config.pid_file.as_deref().map(PidFile::create).transpose()?;

    let mut server = Server::bind(&config)?;
    server.run()?;
    info!("stopped");
    Ok(())
}

/// `info` by default, `debug` with --verbose; RUST_LOG wins over both.
fn init_logging(config: &Config) -> Result<(), Box<dyn Error>> {
    let level = if config.verbose { "debug" } else { "info" };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    if let Some(path) = &config.log_file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}
