/*
 * quorumkv is the replicated key/value server. It takes configuration via a
 * configuration file, command-line parameters, and environment variables,
 * then starts a replica that serves both Raft peers and clients on a single
 * TCP port.
 */

#![warn(clippy::all)]

use quorumkv::error::Result;
use quorumkv::raft;
use serde_derive::Deserialize;

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("config/quorumkv.yaml"),
        )
        .get_matches();
    let cfg = Config::new(args.get_one::<String>("config").unwrap().as_ref())?;

    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("quorumkv");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let members = cfg
        .members
        .iter()
        .map(|member| member.parse())
        .collect::<Result<Vec<raft::Member>>>()?;
    let _server = raft::Server::start(raft::Options {
        local_ip: cfg.local_ip,
        local_port: cfg.local_port,
        members,
        log_path: cfg.log_path.into(),
        data_path: cfg.data_path.into(),
        elect_timeout_ms: cfg.elect_timeout_ms,
        heartbeat_interval_ms: cfg.heartbeat_interval_ms,
    })?;

    // Serve until killed.
    loop {
        std::thread::park();
    }
}

#[derive(Debug, Deserialize)]
struct Config {
    local_ip: String,
    local_port: u16,
    members: Vec<String>,
    log_path: String,
    data_path: String,
    elect_timeout_ms: u64,
    heartbeat_interval_ms: u64,
    log_level: String,
}

impl Config {
    fn new(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("local_ip", "0.0.0.0")?
            .set_default("local_port", "9705")?
            .set_default("log_path", "data/log")?
            .set_default("data_path", "data/state")?
            .set_default("elect_timeout_ms", "1000")?
            .set_default("heartbeat_interval_ms", "100")?
            .set_default("log_level", "info")?
            .add_source(config::File::with_name(file))
            .add_source(config::Environment::with_prefix("QUORUMKV"))
            .build()?
            .try_deserialize()?)
    }
}
