//! CMD_UNLINK, including both outcomes of the unlink/completion race.

mod common;

use common::*;
use usbip_protocol as proto;
use usbipd_monitor::ioctl;
use usbipd_monitor::sim::UrbScript;

#[tokio::test]
async fn unlink_wins_race_aborts_pipe_and_owns_the_reply() {
    let mut session = spawn_session();

    let (gated, release) = UrbScript::ok().with_data(vec![7; 16]).gated();
    session.channel.script(gated);
    send_submit(&mut session.client, 3, 1, proto::DIR_IN, 0, 16, [0; 8], &[]).await;
    wait_until(|| !session.channel.urbs().is_empty()).await;

    send_unlink(&mut session.client, 40, 3).await;
    let reply = read_reply(&mut session.client).await;
    assert_eq!(reply.command, proto::RET_UNLINK);
    assert_eq!(reply.seqnum, 40);
    assert_eq!(reply.status, -(proto::errno::ECONNRESET));

    // The pipe was aborted with the raw endpoint byte (IN bit set).
    let abort_calls: Vec<_> = session
        .channel
        .calls()
        .into_iter()
        .filter(|call| call.code == ioctl::USB_ABORT_ENDPOINT)
        .collect();
    assert_eq!(abort_calls.len(), 1);
    assert_eq!(abort_calls[0].input, [0x81, 0, 0, 0]);

    // Let the driver completion land after the unlink: it finds no pending
    // entry and must emit nothing.
    release.send(()).unwrap();
    let metrics = session.metrics.clone();
    wait_until(|| metrics.replies_dropped_total() == 1).await;

    // The next reply on the wire belongs to the next command, proving the
    // suppressed RET_SUBMIT never hit the stream.
    send_submit(
        &mut session.client,
        41,
        0,
        proto::DIR_OUT,
        0,
        0,
        set_configuration_setup(1),
        &[],
    )
    .await;
    let reply = read_reply(&mut session.client).await;
    assert_eq!(reply.command, proto::RET_SUBMIT);
    assert_eq!(reply.seqnum, 41);

    assert!(session.finish().await.is_ok());
}

#[tokio::test]
async fn submit_wins_race_and_later_unlink_reports_nothing_to_cancel() {
    let mut session = spawn_session();

    session.channel.script(UrbScript::ok().with_data(vec![7; 16]));
    send_submit(&mut session.client, 3, 1, proto::DIR_IN, 0, 16, [0; 8], &[]).await;
    let reply = read_reply(&mut session.client).await;
    assert_eq!(reply.command, proto::RET_SUBMIT);
    assert_eq!(reply.seqnum, 3);
    read_exact(&mut session.client, 16).await;

    send_unlink(&mut session.client, 50, 3).await;
    let reply = read_reply(&mut session.client).await;
    assert_eq!(reply.command, proto::RET_UNLINK);
    assert_eq!(reply.seqnum, 50);
    assert_eq!(reply.status, 0);

    // No pipe abort happened: the submit had already completed.
    assert!(session
        .channel
        .calls()
        .iter()
        .all(|call| call.code != ioctl::USB_ABORT_ENDPOINT));

    assert!(session.finish().await.is_ok());
}

#[tokio::test]
async fn unlink_of_unknown_seqnum_reports_success() {
    let mut session = spawn_session();

    send_unlink(&mut session.client, 60, 999).await;
    let reply = read_reply(&mut session.client).await;
    assert_eq!(reply.command, proto::RET_UNLINK);
    assert_eq!(reply.seqnum, 60);
    assert_eq!(reply.status, 0);
    assert!(session.channel.calls().is_empty());

    assert!(session.finish().await.is_ok());
}
