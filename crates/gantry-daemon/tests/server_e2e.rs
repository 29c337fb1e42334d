//! End-to-end tests over real sockets: command replies, instant
//! framing, EOT-terminated filesystem bodies, admission control, and
//! the inactivity timeout.

mod common;

use std::time::{Duration, Instant};

use common::{connect, expect_eof, expect_silence, read_line, read_until, send, TestServer};

#[tokio::test]
async fn version_reply_arrives_no_sooner_than_the_delay_floor() {
    let server = TestServer::spawn().await;
    let mut client = connect(server.addr).await;

    let started = Instant::now();
    send(&mut client, b"version\n").await;
    let line = read_line(&mut client).await;
    let elapsed = started.elapsed();

    assert_eq!(line, "version = 1.0.3c1.0.6");
    assert!(
        elapsed >= Duration::from_millis(100),
        "reply arrived after {elapsed:?}"
    );

    server.stop().await;
}

#[tokio::test]
async fn status_query_dispatches_without_a_newline() {
    let server = TestServer::spawn().await;
    let mut client = connect(server.addr).await;

    send(&mut client, b"?").await;
    let line = read_line(&mut client).await;
    assert!(
        line.starts_with("<Idle|MPos:-1.0000,-1.0000,-1.0000"),
        "unexpected status line: {line}"
    );
    assert!(line.ends_with('>'));

    server.stop().await;
}

#[tokio::test]
async fn instant_prefix_produces_no_output_until_completed() {
    let server = TestServer::spawn().await;
    let mut client = connect(server.addr).await;

    // `$` is a strict prefix of the instant `$I`; nothing may come back.
    send(&mut client, b"$").await;
    expect_silence(&mut client, Duration::from_millis(400)).await;

    send(&mut client, b"I").await;
    let line = read_line(&mut client).await;
    assert!(line.starts_with("[G0 G54"), "unexpected state line: {line}");

    server.stop().await;
}

#[tokio::test]
async fn ls_body_is_newline_then_eot_terminated() {
    let server = TestServer::spawn().await;
    let mut client = connect(server.addr).await;

    send(&mut client, b"ls /sd\n").await;
    let raw = read_until(&mut client, 0x04).await;

    let body = String::from_utf8_lossy(&raw);
    assert!(body.contains("config.txt"), "body: {body}");
    assert!(body.contains("gcodes/"), "body: {body}");
    assert_eq!(&raw[raw.len() - 2..], b"\n\x04");

    server.stop().await;
}

#[tokio::test]
async fn mkdir_acknowledges_and_is_visible_in_the_next_ls() {
    let server = TestServer::spawn().await;
    let mut client = connect(server.addr).await;

    send(&mut client, b"mkdir /sd/new\n").await;
    let raw = read_until(&mut client, 0x04).await;
    assert_eq!(raw, b"ok\n\x04");

    send(&mut client, b"ls /sd\n").await;
    let raw = read_until(&mut client, 0x04).await;
    assert!(
        String::from_utf8_lossy(&raw).contains("new/"),
        "fresh directory missing from listing"
    );

    server.stop().await;
}

#[tokio::test]
async fn unknown_commands_do_not_poison_the_connection() {
    let server = TestServer::spawn().await;
    let mut client = connect(server.addr).await;

    send(&mut client, b"frobnicate\n").await;
    assert_eq!(read_line(&mut client).await, "error:unsupported command");

    send(&mut client, b"version\n").await;
    assert_eq!(read_line(&mut client).await, "version = 1.0.3c1.0.6");

    server.stop().await;
}

#[tokio::test]
async fn replies_preserve_command_order_within_a_connection() {
    let server = TestServer::spawn().await;
    let mut client = connect(server.addr).await;

    send(&mut client, b"version\npwd\nmodel\n").await;
    assert_eq!(read_line(&mut client).await, "version = 1.0.3c1.0.6");
    assert_eq!(read_line(&mut client).await, "/");
    assert_eq!(read_line(&mut client).await, "model = Carvera");

    server.stop().await;
}

#[tokio::test]
async fn the_third_connection_is_denied_and_the_first_two_survive() {
    let server = TestServer::spawn().await;
    let mut first = connect(server.addr).await;
    let mut second = connect(server.addr).await;

    // Prove both seats are live before the denial.
    send(&mut first, b"version\n").await;
    assert_eq!(read_line(&mut first).await, "version = 1.0.3c1.0.6");
    send(&mut second, b"pwd\n").await;
    assert_eq!(read_line(&mut second).await, "/");

    let mut third = connect(server.addr).await;
    assert_eq!(read_line(&mut third).await, "error:too many connections");
    expect_eof(&mut third).await;

    send(&mut first, b"version\n").await;
    assert_eq!(read_line(&mut first).await, "version = 1.0.3c1.0.6");
    send(&mut second, b"version\n").await;
    assert_eq!(read_line(&mut second).await, "version = 1.0.3c1.0.6");

    // Releasing a seat readmits new clients.
    drop(first);
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut fourth = connect(server.addr).await;
    send(&mut fourth, b"version\n").await;
    assert_eq!(read_line(&mut fourth).await, "version = 1.0.3c1.0.6");

    server.stop().await;
}

#[tokio::test]
async fn cwd_is_per_connection_state() {
    let server = TestServer::spawn().await;
    let mut roamer = connect(server.addr).await;
    let mut homebody = connect(server.addr).await;

    send(&mut roamer, b"cd /sd/gcodes\n").await;
    // cd replies nothing on success; pwd proves it took effect.
    send(&mut roamer, b"pwd\n").await;
    assert_eq!(read_line(&mut roamer).await, "/sd/gcodes");

    send(&mut homebody, b"pwd\n").await;
    assert_eq!(read_line(&mut homebody).await, "/");

    server.stop().await;
}

#[tokio::test]
async fn vfs_mutations_are_visible_across_connections() {
    let server = TestServer::spawn().await;
    let mut writer = connect(server.addr).await;
    let mut reader = connect(server.addr).await;

    send(&mut writer, b"mkdir /sd/shared\n").await;
    assert_eq!(read_until(&mut writer, 0x04).await, b"ok\n\x04");

    send(&mut reader, b"ls /sd\n").await;
    let raw = read_until(&mut reader, 0x04).await;
    assert!(String::from_utf8_lossy(&raw).contains("shared/"));

    server.stop().await;
}

#[tokio::test]
async fn a_silent_connection_is_closed_after_the_idle_timeout() {
    let server = TestServer::spawn().await;
    let mut client = connect(server.addr).await;

    // Stay alive first to prove the timer resets on received bytes.
    tokio::time::sleep(Duration::from_secs(6)).await;
    send(&mut client, b"version\n").await;
    assert_eq!(read_line(&mut client).await, "version = 1.0.3c1.0.6");

    // Then go silent past the timeout.
    expect_eof(&mut client).await;

    server.stop().await;
}
