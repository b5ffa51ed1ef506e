//! Leaf node process entry: registers with Top over the serial mesh, sends
//! periodic heartbeats, and answers BACnet Who-Is with a tunneled I-Am.

mod cli;

use cli::{initialize_logging, ArgError, Args, Config};
use clap::Parser;
use std::io;
use std::net::Ipv4Addr;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval};
use tpmesh_core::addr::MeshId;
use tpmesh_core::bacnet::{self, IAmEmitter};
use tpmesh_core::bridge::IpIdCounter;
use tpmesh_core::fragment;
use tpmesh_core::ipv4::to_lwip_u32;
use tpmesh_core::register::{FrameType, RegisterFrame};
use tpmesh_core::transport::{classify_line, AtTransport, LineKind, NnmiFrame};
use tpmesh_core::tunnel::TunnelHeader;
use tracing::{debug, error, info, warn};

const INIT_CMD_TIMEOUT: Duration = Duration::from_millis(1_500);
const REBOOT_SETTLE: Duration = Duration::from_secs(3);
const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(200);
const BROADCAST_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 10, 255);

#[derive(Debug, ThisError)]
enum LeafError {
    #[error("{0}")]
    Args(#[from] ArgError),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("serial reader thread exited unexpectedly")]
    Reader,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    initialize_logging(args.stdout, args.log);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(LeafError::Args(e)) => {
            eprintln!("arg error: {e}");
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = %e, "leaf node exiting");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> Result<(), LeafError> {
    let config = Config::resolve(&args)?;

    info!(
        mesh_id = %config.node_mesh_id,
        top = %config.top_mesh_id,
        ip = %config.node_ip,
        top_ip = %config.top_ip,
        "NodeSim start"
    );

    let port = serialport::new(config.port.as_str(), config.baud)
        .timeout(SERIAL_READ_TIMEOUT)
        .open()?;
    let mut init_transport = AtTransport::new(port);
    if config.init_module {
        init_as_node(&mut init_transport, config.node_mesh_id).await;
    }

    let (writer, reader_port) = split_writer_and_reader(init_transport);
    let (nnmi_tx, mut nnmi_rx) = mpsc::unbounded_channel::<NnmiFrame>();
    tokio::task::spawn_blocking(move || reader_loop(reader_port, nnmi_tx));

    let mut ip_id = IpIdCounter::new();
    let mut iam_emitter = IAmEmitter::new(config.iam_cooldown);

    writer.send_register_or_heartbeat(&config, FrameType::RegisterRequest).await;

    let mut register_interval = config.register_retry.map(|period| {
        interval_at(Instant::now() + period, period)
    });
    let mut heartbeat_interval = interval_at(Instant::now() + config.heartbeat, config.heartbeat);

    info!("Listening serial +NNMI ... (Ctrl+C to stop)");
    let mut reader_died = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, shutting down");
                break;
            }
            nnmi = nnmi_rx.recv() => {
                match nnmi {
                    Some(nnmi) => handle_nnmi(nnmi, &config, &mut ip_id, &mut iam_emitter, &writer).await,
                    None => {
                        reader_died = true;
                        break;
                    }
                }
            }
            _ = tick(register_interval.as_mut()) => {
                writer.send_register_or_heartbeat(&config, FrameType::RegisterRequest).await;
            }
            _ = heartbeat_interval.tick() => {
                writer.send_register_or_heartbeat(&config, FrameType::Heartbeat).await;
            }
        }
    }

    if reader_died {
        return Err(LeafError::Reader);
    }
    Ok(())
}

/// Awaits the next tick of an optional interval, never resolving when `None`
/// (the register-retry timer is disabled by `--register-retry 0`).
async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn init_as_node<S: io::Read + io::Write>(transport: &mut AtTransport<S>, node_mesh_id: MeshId) {
    let cmds = [
        "AT".to_string(),
        format!("AT+ADDR={node_mesh_id}"),
        "AT+CELL=254".to_string(),
        "AT+LP=3".to_string(),
    ];
    for cmd in cmds {
        let ok = transport
            .send_cmd_wait_ok(&cmd, INIT_CMD_TIMEOUT, |nnmi| {
                debug!(src = %nnmi.src_mesh, "dropped +NNMI seen during init");
            })
            .unwrap_or(false);
        if !ok {
            warn!(%cmd, "init cmd may have failed");
        }
    }

    // REBOOT may reset the UART before a final OK arrives; fire and forget.
    if let Err(e) = transport.write_line("AT+REBOOT") {
        warn!(error = %e, "failed to send AT+REBOOT");
    }
    tokio::time::sleep(REBOOT_SETTLE).await;
}

/// Drains `+NNMI` lines from the serial port forever, forwarding parsed
/// frames to the async side. Runs on the blocking thread pool since
/// `serialport`'s I/O is synchronous; owns the reader half exclusively so
/// writes (on a cloned handle) never contend with it for the read timeout.
fn reader_loop(port: Box<dyn serialport::SerialPort>, nnmi_tx: mpsc::UnboundedSender<NnmiFrame>) {
    let mut transport = AtTransport::new(port);
    loop {
        match transport.read_line() {
            Ok(Some(line)) => match classify_line(&line) {
                LineKind::Nnmi(frame) => {
                    if nnmi_tx.send(frame).is_err() {
                        return;
                    }
                }
                LineKind::Other(text) if !text.is_empty() => debug!(line = %text, "SER/RX other"),
                _ => {}
            },
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "serial read error, reader thread exiting");
                return;
            }
        }
    }
}

/// A handle to the serial writer half, safe to share across the async tasks
/// that need to emit `AT+SEND` commands. Writing is synchronous, so each
/// call is dispatched onto the blocking thread pool.
#[derive(Clone)]
struct SerialWriter(Arc<Mutex<AtTransport<Box<dyn serialport::SerialPort>>>>);

impl SerialWriter {
    async fn write_line(&self, line: String) {
        let transport = self.0.clone();
        let result = tokio::task::spawn_blocking(move || transport.lock().unwrap().write_line(&line))
            .await
            .expect("serial writer task panicked");
        if let Err(e) = result {
            error!(error = %e, "serial write error");
        }
    }

    /// Fragments `tunnel_frame` and emits each piece as its own `AT+SEND`,
    /// contiguous and uninterrupted by any other destination.
    async fn send_tunnel(&self, dest: MeshId, tunnel_frame: &[u8]) {
        let fragments = match fragment::fragment(tunnel_frame) {
            Ok(fragments) => fragments,
            Err(e) => {
                error!(error = %e, %dest, "failed to fragment outbound tunnel frame");
                return;
            }
        };
        for frag in fragments {
            let cmd = tpmesh_core::transport::format_at_send(dest, &frag, 0);
            self.write_line(cmd).await;
        }
    }

    async fn send_register_or_heartbeat(&self, config: &Config, frame_type: FrameType) {
        let body = RegisterFrame {
            frame_type,
            mac: config.node_mac,
            ip_lwip_u32: to_lwip_u32(config.node_ip),
            mesh_id: config.node_mesh_id,
        }
        .encode();
        let mut tunnel_frame = TunnelHeader::register_ack().to_bytes().to_vec();
        tunnel_frame.extend_from_slice(&body);

        info!(
            mesh_id = %config.node_mesh_id,
            top = %config.top_mesh_id,
            kind = ?frame_type,
            "SEND register/heartbeat"
        );
        self.send_tunnel(config.top_mesh_id, &tunnel_frame).await;
    }
}

/// Splits an owned transport into a writer half (kept on the async side,
/// behind a mutex, written to via `spawn_blocking`) and a reader half handed
/// to the dedicated blocking read loop.
fn split_writer_and_reader(
    transport: AtTransport<Box<dyn serialport::SerialPort>>,
) -> (SerialWriter, Box<dyn serialport::SerialPort>) {
    let port = transport.into_inner();
    let reader = port.try_clone().expect("serial port does not support try_clone");
    (SerialWriter(Arc::new(Mutex::new(AtTransport::new(port)))), reader)
}

async fn handle_nnmi(
    nnmi: NnmiFrame,
    config: &Config,
    ip_id: &mut IpIdCounter,
    iam_emitter: &mut IAmEmitter,
    writer: &SerialWriter,
) {
    if !bacnet::detect_who_is(&nnmi.payload) {
        return;
    }
    debug!(src = %nnmi.src_mesh, "WHO-IS trigger");
    if !iam_emitter.try_fire() {
        return;
    }

    let frame = bacnet::build_i_am(
        config.node_mac,
        config.node_ip,
        ip_id.next(),
        config.iam_src_port,
        BROADCAST_IP,
        &config.iam_apdu,
        config.top_mesh_id,
    );
    info!(src = %nnmi.src_mesh, "SEND I-Am");
    writer.send_tunnel(config.top_mesh_id, &frame).await;
}
