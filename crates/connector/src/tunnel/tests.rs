use std::time::Duration;

use serial_test::serial;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use shared::{consts::TICKET_LENGTH, log, ticket::Ticket, types::ForwardState};
use testing::{
    certs,
    gateway::{GatewayMode, MockGateway},
};

use super::*;

fn test_ticket() -> Ticket {
    Ticket::from([b'T'; TICKET_LENGTH])
}

async fn start_forward(
    gateway_host: &str,
    gateway_port: u16,
    timeout: i64,
    check_certificate: bool,
    keep_listening: bool,
) -> ForwardServer {
    log::setup_logging("debug", log::LogType::Test);
    forward(
        (gateway_host.to_string(), gateway_port),
        test_ticket(),
        timeout,
        0,
        check_certificate,
        keep_listening,
        false,
        false,
    )
    .await
    .unwrap()
}

async fn wait_until(deadline_ms: u64, cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(deadline_ms);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cond()
}

#[test]
fn test_normalize_timeout() {
    // Zero means the default grace period
    assert_eq!(normalize_timeout(0, false), (60, false));
    assert_eq!(normalize_timeout(30, true), (30, true));
    // Negative means keep listening, with the absolute value as grace
    assert_eq!(normalize_timeout(-5, false), (5, true));
}

#[tokio::test]
#[serial]
async fn test_check_ok() {
    let gateway = MockGateway::start(GatewayMode::TestOnly).await.unwrap();
    let fs = start_forward("127.0.0.1", gateway.port, 10, false, false).await;

    assert!(fs.check().await.unwrap());
    // A test tunnel is not a client connection
    assert_eq!(fs.state(), ForwardState::Listening);
    assert_eq!(fs.current_connections(), 0);
    assert_eq!(fs.remote(), ("127.0.0.1".to_string(), gateway.port));
    assert_eq!(fs.ticket(), test_ticket());
    assert!(!fs.check_certificate());
    assert!(!fs.keep_listening());
    assert!(!fs.stoppable());

    fs.stop();
    fs.wait_finished().await;
    gateway.stop();
}

#[tokio::test]
#[serial]
async fn test_check_untrusted_certificate_is_hard_failure() {
    unsafe { std::env::remove_var("CERTIFICATE_BUNDLE_PATH") };
    let gateway = MockGateway::start(GatewayMode::TestOnly).await.unwrap();
    // Verification on, but the gateway certificate is self signed
    let fs = start_forward("localhost", gateway.port, 10, true, false).await;

    assert!(fs.check().await.is_err());

    fs.stop();
    fs.wait_finished().await;
    gateway.stop();
}

#[tokio::test]
#[serial]
async fn test_check_with_trusted_bundle() {
    let gateway = MockGateway::start(GatewayMode::TestOnly).await.unwrap();
    let bundle = std::env::temp_dir().join(format!("uds-tunnel-ca-{}.pem", std::process::id()));
    std::fs::write(&bundle, &gateway.ca_pem).unwrap();
    unsafe { std::env::set_var("CERTIFICATE_BUNDLE_PATH", &bundle) };

    let fs = start_forward("localhost", gateway.port, 10, true, false).await;
    let available = fs.check().await;

    unsafe { std::env::remove_var("CERTIFICATE_BUNDLE_PATH") };
    std::fs::remove_file(&bundle).ok();

    assert!(available.unwrap());
    fs.stop();
    fs.wait_finished().await;
    gateway.stop();
}

#[tokio::test]
#[serial]
async fn test_open_and_echo() {
    let gateway = MockGateway::start(GatewayMode::OpenEcho).await.unwrap();
    let fs = start_forward("127.0.0.1", gateway.port, 10, false, false).await;

    let mut client = TcpStream::connect(("127.0.0.1", fs.local_port()))
        .await
        .unwrap();
    client.write_all(b"hello").await.unwrap();
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"hello");

    assert_eq!(fs.state(), ForwardState::Processing);
    assert_eq!(fs.current_connections(), 1);
    assert_eq!(gateway.received_tickets()[0], test_ticket().as_bytes());

    drop(client);
    // Connection bookkeeping settles within a couple of seconds of close
    assert!(wait_until(2000, || fs.current_connections() == 0).await);

    fs.stop();
    fs.wait_finished().await;
    gateway.stop();
}

#[tokio::test]
#[serial]
async fn test_gateway_error_moves_to_error() {
    let gateway = MockGateway::start(GatewayMode::OpenError("no such ticket".to_string()))
        .await
        .unwrap();
    let fs = start_forward("127.0.0.1", gateway.port, 10, false, false).await;

    let _client = TcpStream::connect(("127.0.0.1", fs.local_port()))
        .await
        .unwrap();

    assert!(wait_until(2000, || fs.state() == ForwardState::Error).await);
    fs.wait_finished().await;
    gateway.stop();
}

#[tokio::test]
#[serial]
async fn test_rejects_new_connections_once_stoppable() {
    let gateway = MockGateway::start(GatewayMode::OpenEcho).await.unwrap();
    let fs = start_forward("127.0.0.1", gateway.port, 1, false, false).await;

    // Keep one connection alive across the grace period
    let mut first = TcpStream::connect(("127.0.0.1", fs.local_port()))
        .await
        .unwrap();
    first.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    first.read_exact(&mut reply).await.unwrap();

    assert!(wait_until(2000, || fs.stoppable()).await);

    // Late arrivals are rejected and the forwarder errors out
    let mut second = TcpStream::connect(("127.0.0.1", fs.local_port()))
        .await
        .unwrap();
    let mut buffer = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buffer)).await;
    match read {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        other => panic!("expected rejected connection, got {:?}", other),
    }
    assert!(wait_until(2000, || fs.state() == ForwardState::Error).await);

    fs.wait_finished().await;
    gateway.stop();
}

#[tokio::test]
#[serial]
async fn test_negative_timeout_keeps_listening() {
    let gateway = MockGateway::start(GatewayMode::OpenEcho).await.unwrap();
    let fs = start_forward("127.0.0.1", gateway.port, -1, false, false).await;

    assert!(wait_until(2000, || fs.stoppable()).await);
    assert!(fs.keep_listening());

    // Stoppable, but new connections still go through
    let mut client = TcpStream::connect(("127.0.0.1", fs.local_port()))
        .await
        .unwrap();
    client.write_all(b"late").await.unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"late");
    assert_ne!(fs.state(), ForwardState::Error);

    // Once the last connection ends, the listener stops by itself
    drop(client);
    tokio::time::timeout(Duration::from_secs(3), fs.wait_finished())
        .await
        .expect("listener should stop after the last connection");
    gateway.stop();
}

#[tokio::test]
#[serial]
async fn test_stop_is_idempotent_and_releases_port() {
    let gateway = MockGateway::start(GatewayMode::TestOnly).await.unwrap();
    let fs = start_forward("127.0.0.1", gateway.port, 10, false, false).await;
    let port = fs.local_port();

    fs.stop();
    fs.stop();
    fs.stop();
    tokio::time::timeout(Duration::from_secs(2), fs.wait_finished())
        .await
        .expect("listener should stop promptly");

    // The port can be bound again right away
    let rebound = tokio::net::TcpListener::bind(("127.0.0.1", port)).await;
    assert!(rebound.is_ok());
    gateway.stop();
}

#[tokio::test]
#[serial]
async fn test_ephemeral_port_is_assigned() {
    let gateway = MockGateway::start(GatewayMode::TestOnly).await.unwrap();
    let fs = start_forward("127.0.0.1", gateway.port, 10, false, false).await;
    assert_ne!(fs.local_port(), 0);
    fs.stop();
    fs.wait_finished().await;
    gateway.stop();
}

#[tokio::test]
#[serial]
async fn test_certs_helper_produces_bundle() {
    // Exercises the shared test material the other tests rely on
    let cert = certs::self_signed().unwrap();
    assert!(cert.ca_pem.contains("BEGIN CERTIFICATE"));
    let path = certs::write_ca_bundle(&cert, "probe").unwrap();
    assert!(path.exists());
    std::fs::remove_file(path).ok();
}
