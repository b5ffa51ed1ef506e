//! Top node process entry: bridges the BMS UDP network to the TPMesh serial
//! mesh, tracking downstream nodes and routing traffic between the two.

mod cli;

use cli::{initialize_logging, ArgError, Args, Config};
use clap::Parser;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tpmesh_core::addr::MeshId;
use tpmesh_core::bridge::{self, IpIdCounter};
use tpmesh_core::fragment;
use tpmesh_core::fsm::{Outcome, RegistrationFsm};
use tpmesh_core::ipv4::to_lwip_u32;
use tpmesh_core::reassembly::Reassembler;
use tpmesh_core::registry::Registry;
use tpmesh_core::transport::{classify_line, AtTransport, LineKind, NnmiFrame};
use tpmesh_core::tunnel::{RULE_NO_COMPRESS, RULE_REGISTER};
use tracing::{debug, error, info, warn};

const REASSEMBLY_IDLE_TIMEOUT: Duration = Duration::from_secs(5);
const INIT_CMD_TIMEOUT: Duration = Duration::from_millis(2_500);
const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(200);
const UDP_RECV_BUFFER: usize = 2048;

#[derive(Debug, ThisError)]
enum TopError {
    #[error("{0}")]
    Args(#[from] ArgError),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("udp socket error: {0}")]
    Udp(io::Error),
    #[error("serial reader thread exited unexpectedly")]
    Reader,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    initialize_logging(args.stdout, args.log);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(TopError::Args(e)) => {
            eprintln!("arg error: {e}");
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = %e, "top node exiting");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> Result<(), TopError> {
    let config = Config::resolve(&args)?;

    info!(
        port = %config.port,
        baud = config.baud,
        mesh_id = %config.top_mesh_id,
        ip = %config.top_ip,
        "TopNode start"
    );

    let registry = Registry::new();
    let fsm = RegistrationFsm::new(config.top_mac, to_lwip_u32(config.top_ip), config.top_mesh_id);
    let mut reassembler = Reassembler::new(REASSEMBLY_IDLE_TIMEOUT);
    let mut ip_id = IpIdCounter::new();

    let port = serialport::new(config.port.as_str(), config.baud)
        .timeout(SERIAL_READ_TIMEOUT)
        .open()?;
    let mut init_transport = AtTransport::new(port);
    if config.init_module {
        init_as_top(&mut init_transport, config.top_mesh_id);
    }

    let (writer, reader_port) = split_writer_and_reader(init_transport);
    let (nnmi_tx, mut nnmi_rx) = mpsc::unbounded_channel::<NnmiFrame>();
    tokio::task::spawn_blocking(move || reader_loop(reader_port, nnmi_tx));

    let udp_socket = if config.udp_bridge {
        info!(
            bind = %SocketAddrV4::new(config.bms_bind_ip, config.bms_bind_port),
            dst = %SocketAddrV4::new(config.udp_to_mesh_dst_ip, config.udp_to_mesh_dst_port),
            "UDP bridge ON"
        );
        Some(bind_bms_socket(config.bms_bind_ip, config.bms_bind_port).map_err(TopError::Udp)?)
    } else {
        info!("UDP bridge OFF");
        None
    };
    let mut udp_buf = [0u8; UDP_RECV_BUFFER];

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
                    Some(nnmi) => {
                        handle_nnmi(nnmi, &fsm, &registry, &mut reassembler, &writer, udp_socket.as_ref()).await;
                    }
                    None => {
                        reader_died = true;
                        break;
                    }
                }
            }
            res = recv_udp(udp_socket.as_ref(), &mut udp_buf), if udp_socket.is_some() => {
                match res {
                    Ok((n, SocketAddr::V4(src))) => {
                        handle_udp_datagram(&udp_buf[..n], src, &config, &registry, &mut ip_id, &writer).await;
                    }
                    Ok((_, SocketAddr::V6(src))) => {
                        warn!(%src, "UDP->MESH skip IPv6 source");
                    }
                    Err(e) => warn!(error = %e, "UDP recv error"),
                }
            }
        }
    }

    if reader_died {
        return Err(TopError::Reader);
    }
    Ok(())
}

async fn recv_udp(socket: Option<&UdpSocket>, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

fn bind_bms_socket(ip: Ipv4Addr, port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(ip, port).into())?;
    UdpSocket::from_std(socket.into())
}

fn init_as_top<S: io::Read + io::Write>(transport: &mut AtTransport<S>, top_mesh_id: MeshId) {
    let cmds = [
        "AT".to_string(),
        format!("AT+ADDR={top_mesh_id}"),
        "AT+CELL=0".to_string(),
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
    fsm: &RegistrationFsm,
    registry: &Registry,
    reassembler: &mut Reassembler,
    writer: &SerialWriter,
    udp_socket: Option<&UdpSocket>,
) {
    let payload = &nnmi.payload;
    if payload.len() < 3 {
        debug!(src = %nnmi.src_mesh, len = payload.len(), "NNMI short payload");
        return;
    }

    match payload[2] {
        RULE_REGISTER => match fsm.handle(registry, payload) {
            Ok(Outcome::Ack { dest, tunnel_frame }) => {
                writer.send_tunnel(dest, &tunnel_frame).await;
            }
            Ok(Outcome::Ignored) => {
                debug!(src = %nnmi.src_mesh, "register frame ignored (unknown type)");
            }
            Err(e) => warn!(src = %nnmi.src_mesh, error = %e, "register/heartbeat frame rejected"),
        },
        RULE_NO_COMPRESS => {
            if let Some(full) = reassembler.receive(nnmi.src_mesh, payload) {
                forward_mesh_to_udp(&full, nnmi.src_mesh, udp_socket).await;
            }
        }
        other => {
            debug!(src = %nnmi.src_mesh, rule = %format!("{other:#04x}"), "NNMI unsupported rule");
        }
    }
}

async fn forward_mesh_to_udp(tunnel_frame: &[u8], src_mesh: MeshId, udp_socket: Option<&UdpSocket>) {
    let Some(udp_socket) = udp_socket else {
        return;
    };
    match bridge::decode_mesh_to_udp(tunnel_frame) {
        Ok(datagram) => {
            if let Err(e) = udp_socket.send_to(&datagram.payload, datagram.destination).await {
                warn!(error = %e, dst = %datagram.destination, "MESH->UDP send error");
            } else {
                debug!(
                    %src_mesh,
                    dst = %datagram.destination,
                    len = datagram.payload.len(),
                    "MESH->UDP forwarded"
                );
            }
        }
        Err(e) => debug!(%src_mesh, error = %e, "MESH->UDP decode failed"),
    }
}

async fn handle_udp_datagram(
    data: &[u8],
    src: SocketAddrV4,
    config: &Config,
    registry: &Registry,
    ip_id: &mut IpIdCounter,
    writer: &SerialWriter,
) {
    if !bridge::is_source_allowed(&config.udp_allow_src, *src.ip()) {
        debug!(%src, "UDP->MESH skip foreign source");
        return;
    }

    let destination = SocketAddrV4::new(config.udp_to_mesh_dst_ip, config.udp_to_mesh_dst_port);
    let dst_ip_lwip = to_lwip_u32(config.udp_to_mesh_dst_ip);
    let routing = bridge::route(registry, dst_ip_lwip, config.mesh_broadcast_id);

    let tunnel_frame = bridge::build_udp_to_mesh(
        config.top_mac,
        ip_id.next(),
        src,
        destination,
        data,
        routing,
    );

    debug!(
        %src,
        %destination,
        len = data.len(),
        dest_mesh = %routing.mesh_id(),
        broadcast = routing.is_broadcast(),
        "UDP->MESH"
    );
    writer.send_tunnel(routing.mesh_id(), &tunnel_frame).await;
}
