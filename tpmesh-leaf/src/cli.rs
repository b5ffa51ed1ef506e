//! Command-line arguments and logging setup for the Leaf binary.
//!
//! The flag surface mirrors the original Python `node_sim.py` tool 1:1 so
//! operators migrating from the prototype see familiar names and defaults.

use clap::Parser;
use std::fs::{create_dir_all, OpenOptions};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;
use tpmesh_core::addr::{MacAddr, MacParseError, MeshId};
use tracing::Subscriber;
use tracing_subscriber::{fmt, prelude::*, Registry};

#[derive(Parser)]
#[command(about = "TPMesh Leaf node: registers with Top and answers BACnet Who-Is")]
pub struct Args {
    /// Serial port, e.g. COM36 or /dev/ttyUSB0.
    #[arg(long, default_value = "COM36")]
    pub port: String,
    /// Serial baud rate.
    #[arg(long, default_value_t = 460_800)]
    pub baud: u32,
    /// This node's mesh ID (hex).
    #[arg(long, default_value = "0003")]
    pub node_mesh_id: String,
    /// Top mesh ID (hex).
    #[arg(long, default_value = "FFFE")]
    pub top_mesh_id: String,
    /// This node's MAC address.
    #[arg(long, default_value = "00:6B:A0:00:00:10")]
    pub node_mac: String,
    /// This node's IP, embedded in register/heartbeat frames.
    #[arg(long, default_value = "192.168.10.11")]
    pub node_ip: String,
    /// Top IP, for display only.
    #[arg(long, default_value = "192.168.10.10")]
    pub top_ip: String,
    /// Skip the AT/ADDR/CELL/LP/REBOOT init sequence.
    #[arg(long)]
    pub no_init: bool,
    /// Periodic register retry seconds (0 = off).
    #[arg(long, default_value_t = 0.0)]
    pub register_retry: f64,
    /// Heartbeat period seconds.
    #[arg(long, default_value_t = 30.0)]
    pub heartbeat: f64,
    /// I-Am trigger cooldown seconds after a Who-Is.
    #[arg(long, default_value_t = 0.2)]
    pub iam: f64,
    /// I-Am UDP source port.
    #[arg(long, default_value_t = 47808)]
    pub iam_src_port: u16,
    /// I-Am UDP payload in hex.
    #[arg(
        long,
        default_value = "810B00180120FFFF00FF1000C4020200112205C49103217F"
    )]
    pub iam_apdu_hex: String,
    /// Enable logging to a timestamped file under ./logs.
    #[arg(long)]
    pub log: bool,
    /// Enable pretty logging to stdout.
    #[arg(long)]
    pub stdout: bool,
}

#[derive(Debug, ThisError)]
pub enum ArgError {
    #[error("--node-mesh-id: {0}")]
    NodeMeshId(std::num::ParseIntError),
    #[error("--top-mesh-id: {0}")]
    TopMeshId(std::num::ParseIntError),
    #[error("--node-mac: {0}")]
    NodeMac(MacParseError),
    #[error("--node-ip: {0}")]
    NodeIp(std::net::AddrParseError),
    #[error("--top-ip: {0}")]
    TopIp(std::net::AddrParseError),
    #[error("--iam-apdu-hex: odd-length or non-hex payload")]
    IamApduHex,
}

/// Fully parsed and resolved Leaf configuration, derived from [`Args`].
pub struct Config {
    pub port: String,
    pub baud: u32,
    pub node_mesh_id: MeshId,
    pub top_mesh_id: MeshId,
    pub node_mac: MacAddr,
    pub node_ip: Ipv4Addr,
    pub top_ip: Ipv4Addr,
    pub init_module: bool,
    pub register_retry: Option<Duration>,
    pub heartbeat: Duration,
    pub iam_cooldown: Duration,
    pub iam_src_port: u16,
    pub iam_apdu: Vec<u8>,
}

impl Config {
    pub fn resolve(args: &Args) -> Result<Self, ArgError> {
        let node_mesh_id =
            MeshId(u16::from_str_radix(&args.node_mesh_id, 16).map_err(ArgError::NodeMeshId)?);
        let top_mesh_id =
            MeshId(u16::from_str_radix(&args.top_mesh_id, 16).map_err(ArgError::TopMeshId)?);
        let node_mac = args.node_mac.parse().map_err(ArgError::NodeMac)?;
        let node_ip = args.node_ip.parse().map_err(ArgError::NodeIp)?;
        let top_ip = args.top_ip.parse().map_err(ArgError::TopIp)?;
        let iam_apdu = decode_hex(&args.iam_apdu_hex).ok_or(ArgError::IamApduHex)?;

        let register_retry_s = args.register_retry.max(0.0);
        let register_retry = if register_retry_s > 0.0 {
            Some(Duration::from_secs_f64(register_retry_s))
        } else {
            None
        };
        let heartbeat = Duration::from_secs_f64(args.heartbeat.max(0.1));
        let iam_cooldown = Duration::from_secs_f64(args.iam.max(0.1));

        Ok(Self {
            port: args.port.clone(),
            baud: args.baud,
            node_mesh_id,
            top_mesh_id,
            node_mac,
            node_ip,
            top_ip,
            init_module: !args.no_init,
            register_retry,
            heartbeat,
            iam_cooldown,
            iam_src_port: args.iam_src_port,
            iam_apdu,
        })
    }
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

/// Sets the global `tracing` subscriber per `--log`/`--stdout`, matching the
/// reference crate's json-to-file / pretty-to-stdout split.
pub fn initialize_logging(stdout: bool, file: bool) {
    let subscriber: Box<dyn Subscriber + Send + Sync> = match (stdout, file) {
        (true, true) => Box::new(
            Registry::default()
                .with(fmt::Layer::default().json().with_writer(Arc::new(open_log_file())))
                .with(
                    fmt::Layer::default()
                        .pretty()
                        .without_time()
                        .with_file(false)
                        .with_writer(std::io::stdout),
                ),
        ),
        (true, false) => Box::new(Registry::default().with(
            fmt::Layer::default()
                .pretty()
                .without_time()
                .with_file(false)
                .with_writer(std::io::stdout),
        )),
        (false, true) => Box::new(
            Registry::default()
                .with(fmt::Layer::default().json().with_writer(Arc::new(open_log_file()))),
        ),
        (false, false) => Box::new(Registry::default()),
    };
    tracing::subscriber::set_global_default(subscriber).expect("no subscriber set yet");
}

fn open_log_file() -> std::fs::File {
    let main_path = "./logs";
    create_dir_all(main_path).expect("create ./logs directory");
    let file_path = format!(
        "{main_path}/leaf-{}.log",
        chrono::Local::now().format("%y-%m-%d_%H-%M-%S")
    );
    OpenOptions::new()
        .write(true)
        .append(true)
        .create(true)
        .open(file_path)
        .expect("open log file")
}
