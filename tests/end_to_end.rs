//! End-to-end tests against the compiled binary using process workers

use std::net::SocketAddr;
use std::time::Duration;

use cgi_prefork::config::{CgiConfig, Config, WorkerMode};
use cgi_prefork::Server;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const EXPECTED_HELLO: &str = "HTTP/1.1 200 OK\r\n\
                              Server: localhost\r\n\
                              Connection: close\r\n\
                              Content-Type: text/plain\r\n\
                              Content-Length: 6\r\n\
                              \r\n\
                              hello\n";

fn process_config(workers: usize, max_requests: u64, command: &str) -> Config {
    let mut config = Config::default();
    config.server.listen = "127.0.0.1:0".to_string();
    config.pool.workers = workers;
    config.pool.max_requests = max_requests;
    config.pool.shutdown_grace_period_secs = 2;
    config.pool.mode = WorkerMode::Process;
    config.cgi = CgiConfig::shell(command);
    config
}

async fn request(addr: SocketAddr) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_string(&mut response))
        .await
        .expect("no response from worker")
        .unwrap();
    response
}

type Running = JoinHandle<anyhow::Result<()>>;

async fn start(config: Config) -> (SocketAddr, watch::Sender<bool>, Running) {
    let server = Server::bind(config)
        .await
        .unwrap()
        .with_worker_program(env!("CARGO_BIN_EXE_cgi-prefork"));
    let addr = server.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(server.run(shutdown_rx));
    (addr, shutdown_tx, running)
}

async fn stop(shutdown_tx: watch::Sender<bool>, running: Running) {
    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(15), running)
        .await
        .expect("server did not shut down")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_echo_hello_through_process_workers() {
    let (addr, shutdown_tx, running) = start(process_config(2, 100, "echo hello")).await;

    for _ in 0..3 {
        assert_eq!(request(addr).await, EXPECTED_HELLO);
    }

    stop(shutdown_tx, running).await;
}

#[tokio::test]
async fn test_process_workers_are_recycled() {
    // Every worker retires after a single request
    let (addr, shutdown_tx, running) = start(process_config(1, 1, "echo hello")).await;

    for _ in 0..4 {
        assert_eq!(request(addr).await, EXPECTED_HELLO);
    }

    stop(shutdown_tx, running).await;
}

#[tokio::test]
async fn test_concurrent_clients_share_the_pool() {
    let (addr, shutdown_tx, running) =
        start(process_config(2, 100, "sleep 0.1; echo hello")).await;

    let clients: Vec<_> = (0..6).map(|_| tokio::spawn(request(addr))).collect();
    for client in clients {
        assert_eq!(client.await.unwrap(), EXPECTED_HELLO);
    }

    stop(shutdown_tx, running).await;
}

#[tokio::test]
async fn test_failing_command_still_answers_200() {
    let (addr, shutdown_tx, running) =
        start(process_config(1, 100, "echo partial; echo oops >&2; exit 3")).await;

    let response = request(addr).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Length: 8\r\n"));
    assert!(response.ends_with("\r\n\r\npartial\n"));

    stop(shutdown_tx, running).await;
}

#[test]
fn test_binary_rejects_missing_command() {
    let output = std::process::Command::new(env!("CARGO_BIN_EXE_cgi-prefork"))
        .args(["--socket", "127.0.0.1:0"])
        .env_remove("CGI_PREFORK_CGI")
        .env_remove("CGI_PREFORK_CONFIG")
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cgi.command is required"));
}
