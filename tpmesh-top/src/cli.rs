//! Command-line arguments and logging setup for the Top binary.
//!
//! The flag surface mirrors the original Python `topnode_sim.py` tool 1:1 so
//! operators migrating from the prototype see familiar names and defaults.

use clap::Parser;
use std::fs::{create_dir_all, OpenOptions};
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error as ThisError;
use tpmesh_core::addr::{MacAddr, MacParseError, MeshId};
use tracing::Subscriber;
use tracing_subscriber::{fmt, prelude::*, Registry};

#[derive(Parser)]
#[command(about = "TPMesh Top node: bridges the BMS UDP network to the serial mesh")]
pub struct Args {
    /// Serial port, e.g. COM36 or /dev/ttyUSB0.
    #[arg(long, default_value = "COM36")]
    pub port: String,
    /// Serial baud rate.
    #[arg(long, default_value_t = 460_800)]
    pub baud: u32,
    /// Top mesh ID (hex).
    #[arg(long, default_value = "FFFE")]
    pub top_mesh_id: String,
    /// Top MAC address.
    #[arg(long, default_value = "02:00:00:00:FF:FE")]
    pub top_mac: String,
    /// Top IP embedded in register ACKs (default: same as --bms-bind-ip).
    #[arg(long)]
    pub top_ip: Option<String>,
    /// Skip the AT/ADDR/CELL/LP init sequence.
    #[arg(long)]
    pub no_init: bool,
    /// Disable the UDP<->mesh bridge entirely.
    #[arg(long)]
    pub no_udp_bridge: bool,
    /// Local NIC IP to bind the BMS-facing UDP listener.
    #[arg(long, default_value = "192.168.10.3")]
    pub bms_bind_ip: String,
    /// UDP bind port.
    #[arg(long, default_value_t = 47808)]
    pub bms_bind_port: u16,
    /// Comma-separated source IP allowlist for UDP->mesh injection (default: --bms-bind-ip).
    #[arg(long)]
    pub udp_allow_src: Option<String>,
    /// Destination IPv4 used when injecting UDP to mesh.
    #[arg(long, default_value = "192.168.10.255")]
    pub udp_to_mesh_dst_ip: String,
    /// Destination UDP port used when injecting UDP to mesh.
    #[arg(long, default_value_t = 47808)]
    pub udp_to_mesh_dst_port: u16,
    /// Mesh ID used for broadcast injection (hex).
    #[arg(long, default_value = "0000")]
    pub mesh_broadcast_id: String,
    /// Enable logging to a timestamped file under ./logs.
    #[arg(long)]
    pub log: bool,
    /// Enable pretty logging to stdout.
    #[arg(long)]
    pub stdout: bool,
}

#[derive(Debug, ThisError)]
pub enum ArgError {
    #[error("--top-mesh-id: {0}")]
    TopMeshId(std::num::ParseIntError),
    #[error("--top-mac: {0}")]
    TopMac(MacParseError),
    #[error("--top-ip / --bms-bind-ip: {0}")]
    TopIp(std::net::AddrParseError),
    #[error("--bms-bind-ip: {0}")]
    BindIp(std::net::AddrParseError),
    #[error("--udp-allow-src entry {entry:?}: {source}")]
    AllowSrc {
        entry: String,
        source: std::net::AddrParseError,
    },
    #[error("--udp-to-mesh-dst-ip: {0}")]
    DstIp(std::net::AddrParseError),
    #[error("--mesh-broadcast-id: {0}")]
    MeshBroadcastId(std::num::ParseIntError),
}

/// Fully parsed and resolved Top configuration, derived from [`Args`].
pub struct Config {
    pub port: String,
    pub baud: u32,
    pub top_mesh_id: MeshId,
    pub top_mac: MacAddr,
    pub top_ip: Ipv4Addr,
    pub init_module: bool,
    pub udp_bridge: bool,
    pub bms_bind_ip: Ipv4Addr,
    pub bms_bind_port: u16,
    pub udp_allow_src: Vec<Ipv4Addr>,
    pub udp_to_mesh_dst_ip: Ipv4Addr,
    pub udp_to_mesh_dst_port: u16,
    pub mesh_broadcast_id: MeshId,
}

impl Config {
    pub fn resolve(args: &Args) -> Result<Self, ArgError> {
        let top_mesh_id = MeshId(
            u16::from_str_radix(&args.top_mesh_id, 16).map_err(ArgError::TopMeshId)?,
        );
        let top_mac = args.top_mac.parse().map_err(ArgError::TopMac)?;
        let bms_bind_ip: Ipv4Addr = args.bms_bind_ip.parse().map_err(ArgError::BindIp)?;
        let top_ip = match &args.top_ip {
            Some(text) => text.parse().map_err(ArgError::TopIp)?,
            None => bms_bind_ip,
        };
        let udp_allow_src = match &args.udp_allow_src {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse().map_err(|source| ArgError::AllowSrc {
                        entry: s.to_string(),
                        source,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => vec![bms_bind_ip],
        };
        let udp_to_mesh_dst_ip = args
            .udp_to_mesh_dst_ip
            .parse()
            .map_err(ArgError::DstIp)?;
        let mesh_broadcast_id = MeshId(
            u16::from_str_radix(&args.mesh_broadcast_id, 16).map_err(ArgError::MeshBroadcastId)?,
        );

        Ok(Self {
            port: args.port.clone(),
            baud: args.baud,
            top_mesh_id,
            top_mac,
            top_ip,
            init_module: !args.no_init,
            udp_bridge: !args.no_udp_bridge,
            bms_bind_ip,
            bms_bind_port: args.bms_bind_port,
            udp_allow_src,
            udp_to_mesh_dst_ip,
            udp_to_mesh_dst_port: args.udp_to_mesh_dst_port,
            mesh_broadcast_id,
        })
    }
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
        "{main_path}/top-{}.log",
        chrono::Local::now().format("%y-%m-%d_%H-%M-%S")
    );
    OpenOptions::new()
        .write(true)
        .append(true)
        .create(true)
        .open(file_path)
        .expect("open log file")
}
