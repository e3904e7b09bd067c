#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

use usbip_protocol as proto;
use usbipd::{DeviceRegistry, ExportedDevice, Metrics, SessionError};
use usbipd_monitor::sim::SimChannel;

pub const BUSID: &str = "1-2";

/// Configuration 1:
/// - interface 0 alt 0: bulk in 0x81, bulk out 0x02, interrupt in 0x83
/// - interface 0 alt 1: iso in 0x81
/// - interface 1 alt 0: iso out 0x03, iso in 0x84
pub fn config_descriptor() -> Vec<u8> {
    let mut raw = vec![
        9, 2, 0, 0, 2, 1, 0, 0xE0, 50, // configuration 1
        9, 4, 0, 0, 3, 0xFF, 0, 0, 0, // interface 0 alt 0
        7, 5, 0x81, 2, 0, 2, 0, // bulk in
        7, 5, 0x02, 2, 0, 2, 0, // bulk out
        7, 5, 0x83, 3, 8, 0, 10, // interrupt in
        9, 4, 0, 1, 1, 0xFF, 0, 0, 0, // interface 0 alt 1
        7, 5, 0x81, 1, 0, 4, 1, // iso in
        9, 4, 1, 0, 2, 0xFF, 0, 0, 0, // interface 1 alt 0
        7, 5, 0x03, 1, 0, 4, 1, // iso out
        7, 5, 0x84, 1, 0, 4, 1, // iso in
    ];
    let total = raw.len() as u16;
    raw[2..4].copy_from_slice(&total.to_le_bytes());
    raw
}

pub fn device_summary(configuration_value: u8) -> proto::DeviceSummary {
    proto::DeviceSummary {
        path: "/dev/usbmon/1-2".to_string(),
        busid: BUSID.to_string(),
        busnum: 1,
        devnum: 2,
        speed: 3,
        id_vendor: 0x1234,
        id_product: 0x5678,
        bcd_device: 0x0100,
        device_class: 0,
        device_subclass: 0,
        device_protocol: 0,
        configuration_value,
        num_configurations: 1,
        interfaces: vec![proto::InterfaceSummary {
            class: 0xFF,
            subclass: 0,
            protocol: 0,
        }],
    }
}

pub fn registry_with_device(
    configuration_value: u8,
) -> (DeviceRegistry, Arc<SimChannel>) {
    let registry = DeviceRegistry::new();
    let channel = Arc::new(SimChannel::new());
    registry
        .insert(ExportedDevice {
            summary: device_summary(configuration_value),
            configurations: vec![config_descriptor()],
            channel: channel.clone(),
        })
        .unwrap();
    (registry, channel)
}

pub struct TestSession {
    pub client: DuplexStream,
    pub channel: Arc<SimChannel>,
    pub metrics: Metrics,
    task: JoinHandle<Result<(), SessionError>>,
}

impl TestSession {
    /// Drops the client side and returns how the session ended.
    pub async fn finish(self) -> Result<(), SessionError> {
        drop(self.client);
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("session did not end")
            .expect("session task panicked")
    }

    /// Waits for the session to end while the client stays open (protocol
    /// violations end the session server-side).
    pub async fn outcome(self) -> Result<(), SessionError> {
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("session did not end")
            .expect("session task panicked")
    }
}

fn spawn_with_configuration(configuration_value: u8) -> TestSession {
    let (registry, channel) = registry_with_device(configuration_value);
    let device = registry.claim(BUSID).expect("claim test device");
    let metrics = Metrics::new();
    let (client, server) = tokio::io::duplex(1 << 20);
    let task = tokio::spawn(usbipd::run_session(server, device, metrics.clone()));
    TestSession {
        client,
        channel,
        metrics,
        task,
    }
}

/// Session against a device already in configuration 1.
pub fn spawn_session() -> TestSession {
    spawn_with_configuration(1)
}

/// Session against an unconfigured device (data endpoints appear only after
/// a trapped SET_CONFIGURATION).
pub fn spawn_session_unconfigured() -> TestSession {
    spawn_with_configuration(0)
}

pub async fn send_submit(
    client: &mut DuplexStream,
    seqnum: u32,
    ep: u32,
    direction: u32,
    transfer_flags: u32,
    length: u32,
    setup: [u8; 8],
    payload: &[u8],
) {
    let header = proto::HeaderBasic {
        command: proto::CMD_SUBMIT,
        seqnum,
        devid: 0x0001_0002,
        direction,
        ep,
    };
    let submit = proto::CmdSubmit {
        transfer_flags,
        transfer_buffer_length: length,
        start_frame: 0,
        number_of_packets: 0,
        interval: 0,
        setup,
    };
    client
        .write_all(&proto::encode_cmd_submit(&header, &submit))
        .await
        .unwrap();
    client.write_all(payload).await.unwrap();
}

pub async fn send_iso_submit(
    client: &mut DuplexStream,
    seqnum: u32,
    ep: u32,
    direction: u32,
    start_frame: u32,
    payload: &[u8],
    lengths: &[u32],
) {
    let length: u32 = lengths.iter().sum();
    let header = proto::HeaderBasic {
        command: proto::CMD_SUBMIT,
        seqnum,
        devid: 0x0001_0002,
        direction,
        ep,
    };
    let submit = proto::CmdSubmit {
        transfer_flags: 0,
        transfer_buffer_length: length,
        start_frame,
        number_of_packets: lengths.len() as u32,
        interval: 1,
        setup: [0; 8],
    };
    client
        .write_all(&proto::encode_cmd_submit(&header, &submit))
        .await
        .unwrap();
    client.write_all(payload).await.unwrap();

    let mut offset = 0;
    let packets: Vec<_> = lengths
        .iter()
        .map(|&len| {
            let packet = proto::IsoPacket {
                offset,
                length: len,
                actual_length: 0,
                status: 0,
            };
            offset += len;
            packet
        })
        .collect();
    client
        .write_all(&proto::encode_iso_packets(&packets))
        .await
        .unwrap();
}

pub async fn send_unlink(client: &mut DuplexStream, seqnum: u32, unlink_seqnum: u32) {
    let header = proto::HeaderBasic {
        command: proto::CMD_UNLINK,
        seqnum,
        devid: 0x0001_0002,
        direction: proto::DIR_OUT,
        ep: 0,
    };
    client
        .write_all(&proto::encode_cmd_unlink(&header, unlink_seqnum))
        .await
        .unwrap();
}

/// A parsed 48-byte reply header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reply {
    pub command: u32,
    pub seqnum: u32,
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub error_count: u32,
}

pub async fn read_reply(client: &mut DuplexStream) -> Reply {
    let raw = read_exact(client, proto::HEADER_LEN).await;
    let be32 = |at: usize| u32::from_be_bytes(raw[at..at + 4].try_into().unwrap());
    Reply {
        command: be32(0),
        seqnum: be32(4),
        status: be32(20) as i32,
        actual_length: be32(24),
        start_frame: be32(28),
        number_of_packets: be32(32),
        error_count: be32(36),
    }
}

pub async fn read_exact(client: &mut DuplexStream, n: usize) -> Vec<u8> {
    let mut raw = vec![0u8; n];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut raw))
        .await
        .expect("timed out waiting for reply bytes")
        .expect("stream closed while reading reply");
    raw
}

pub async fn read_iso_descriptors(client: &mut DuplexStream, count: usize) -> Vec<proto::IsoPacket> {
    let raw = read_exact(client, count * proto::ISO_PACKET_LEN).await;
    let mut reader = raw.as_slice();
    proto::read_iso_packets(&mut reader, count).await.unwrap()
}

/// Polls until `predicate` holds; panics after a few seconds.
pub async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Setup packet for SET_CONFIGURATION(value).
pub fn set_configuration_setup(value: u8) -> [u8; 8] {
    [0x00, 0x09, value, 0x00, 0x00, 0x00, 0x00, 0x00]
}

/// Setup packet for SET_INTERFACE(interface, alt).
pub fn set_interface_setup(interface: u8, alt: u8) -> [u8; 8] {
    [0x01, 0x0B, alt, 0x00, interface, 0x00, 0x00, 0x00]
}

/// Setup packet for CLEAR_FEATURE(ENDPOINT_HALT) on `endpoint`.
pub fn clear_halt_setup(endpoint: u8) -> [u8; 8] {
    [0x02, 0x01, 0x00, 0x00, endpoint, 0x00, 0x00, 0x00]
}
