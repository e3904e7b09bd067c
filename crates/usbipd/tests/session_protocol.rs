//! Session-fatal conditions: protocol violations, stream EOF, driver hard
//! failure.

mod common;

use common::*;
use tokio::io::AsyncWriteExt;
use usbip_protocol as proto;
use usbipd::SessionError;
use usbipd_monitor::sim::UrbScript;

#[tokio::test]
async fn client_close_between_commands_is_a_clean_detach() {
    let session = spawn_session();
    assert!(session.finish().await.is_ok());
}

#[tokio::test]
async fn unknown_command_kills_the_session() {
    let mut session = spawn_session();

    let mut raw = [0u8; proto::HEADER_LEN];
    raw[..4].copy_from_slice(&0x9999u32.to_be_bytes());
    session.client.write_all(&raw).await.unwrap();

    let err = session.outcome().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Protocol(proto::ProtocolError::UnknownCommand(0x9999))
    ));
}

#[tokio::test]
async fn duplicate_seqnum_kills_the_session() {
    let mut session = spawn_session();

    // Keep the first submit pending so its seqnum stays in the table.
    let (gated, _release) = UrbScript::ok().gated();
    session.channel.script(gated);
    send_submit(&mut session.client, 9, 1, proto::DIR_IN, 0, 8, [0; 8], &[]).await;
    wait_until(|| !session.channel.urbs().is_empty()).await;

    send_submit(&mut session.client, 9, 2, proto::DIR_OUT, 0, 0, [0; 8], &[]).await;

    let err = session.outcome().await.unwrap_err();
    assert!(matches!(err, SessionError::DuplicateSeqnum(9)));
}

#[tokio::test]
async fn submit_to_unknown_endpoint_kills_the_session() {
    let mut session = spawn_session();

    // Endpoint 5 exists in no alternate setting of configuration 1.
    send_submit(&mut session.client, 2, 5, proto::DIR_IN, 0, 8, [0; 8], &[]).await;

    let err = session.outcome().await.unwrap_err();
    assert!(matches!(err, SessionError::UnknownEndpoint(0x85)));
}

#[tokio::test]
async fn iso_length_sum_mismatch_kills_the_session() {
    let mut session = spawn_session();

    // Descriptors claim 100 + 100 bytes but the submit advertises 150.
    let header = proto::HeaderBasic {
        command: proto::CMD_SUBMIT,
        seqnum: 3,
        devid: 0x0001_0002,
        direction: proto::DIR_IN,
        ep: 4,
    };
    let submit = proto::CmdSubmit {
        transfer_flags: 0,
        transfer_buffer_length: 150,
        start_frame: 0,
        number_of_packets: 2,
        interval: 1,
        setup: [0; 8],
    };
    session
        .client
        .write_all(&proto::encode_cmd_submit(&header, &submit))
        .await
        .unwrap();
    let packets = [
        proto::IsoPacket {
            offset: 0,
            length: 100,
            actual_length: 0,
            status: 0,
        },
        proto::IsoPacket {
            offset: 100,
            length: 100,
            actual_length: 0,
            status: 0,
        },
    ];
    session
        .client
        .write_all(&proto::encode_iso_packets(&packets))
        .await
        .unwrap();

    let err = session.outcome().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::IsoLengthMismatch {
            sum: 200,
            expected: 150
        }
    ));
}

#[tokio::test]
async fn oversized_iso_packet_kills_the_session() {
    let mut session = spawn_session();

    let header = proto::HeaderBasic {
        command: proto::CMD_SUBMIT,
        seqnum: 4,
        devid: 0x0001_0002,
        direction: proto::DIR_IN,
        ep: 4,
    };
    let submit = proto::CmdSubmit {
        transfer_flags: 0,
        transfer_buffer_length: 70000,
        start_frame: 0,
        number_of_packets: 1,
        interval: 1,
        setup: [0; 8],
    };
    session
        .client
        .write_all(&proto::encode_cmd_submit(&header, &submit))
        .await
        .unwrap();
    let packets = [proto::IsoPacket {
        offset: 0,
        length: 70000,
        actual_length: 0,
        status: 0,
    }];
    session
        .client
        .write_all(&proto::encode_iso_packets(&packets))
        .await
        .unwrap();

    let err = session.outcome().await.unwrap_err();
    assert!(matches!(err, SessionError::IsoPacketTooLarge(70000)));
}

#[tokio::test]
async fn driver_hard_failure_kills_the_session() {
    let mut session = spawn_session();

    session
        .channel
        .inject_failure(std::io::Error::from_raw_os_error(31));
    send_submit(&mut session.client, 5, 1, proto::DIR_IN, 0, 8, [0; 8], &[]).await;

    let err = session.outcome().await.unwrap_err();
    assert!(matches!(err, SessionError::Channel(_)));
}

#[tokio::test]
async fn truncated_payload_is_a_stream_failure() {
    let mut session = spawn_session();

    // Advertise 16 payload bytes but deliver only 4, then close.
    send_submit(&mut session.client, 6, 2, proto::DIR_OUT, 0, 16, [0; 8], &[1, 2, 3, 4]).await;

    let err = session.finish().await.unwrap_err();
    assert!(matches!(err, SessionError::Io(_)));
}
