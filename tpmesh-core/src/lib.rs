//! Wire codec, tunneling, and bridge logic for the TPMesh serial-to-UDP
//! gateway shared by the Top and Leaf binaries.

pub mod addr;
pub mod bacnet;
pub mod bridge;
pub mod checksum;
pub mod crc;
pub mod ethernet;
pub mod fragment;
pub mod fsm;
pub mod ipv4;
pub mod reassembly;
pub mod register;
pub mod registry;
pub mod transport;
pub mod tunnel;
pub mod udp;
