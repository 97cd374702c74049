use chain_dispatch::api::{self, ApiState};
use chain_dispatch::config::ServerConfig;
use chain_dispatch::http::Status;
use chain_dispatch::pool::WorkerPool;
use chain_dispatch::router::{Handler, Router};
use chain_dispatch::server::Server;
use chain_dispatch::store::MemoryStore;
use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

struct TestServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.task.await;
    }
}

fn test_config() -> ServerConfig {
    ServerConfig::new()
        .with_address("127.0.0.1", 0)
        .with_request_timeout(Duration::from_millis(300))
        .with_max_request_size(4096)
}

async fn start(config: ServerConfig, router: Router) -> TestServer {
    let server = Server::new(config, router.into_dispatcher());
    let listener = server.bind().unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        server
            .run(listener, async move {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });

    TestServer {
        addr,
        shutdown: Some(tx),
        task,
    }
}

fn api_router() -> Router {
    let mut router = Router::new();
    api::mount(
        &mut router,
        ApiState {
            store: Arc::new(MemoryStore::new()),
            pool: Arc::new(WorkerPool::new(4).unwrap()),
            admin: None,
            cors_origins: Vec::new(),
        },
    );
    router
}

async fn send_raw(addr: SocketAddr, raw: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

/// A chain whose first handler never advances, leaving the exchange open
fn hang() -> Vec<Handler> {
    vec![
        Handler::normal(|_, _, _next| Ok(())),
        Handler::terminal(|_, res| res.send_text(Status::Ok, "unreachable")),
    ]
}

fn post_json(path: &str, body: &str) -> Vec<u8> {
    format!(
        "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        path,
        body.len(),
        body
    )
    .into_bytes()
}

#[tokio::test]
async fn test_serves_a_response() {
    let mut router = Router::new();
    router.get(
        "/hello",
        vec![Handler::terminal(|_, res| res.send_text(Status::Ok, "Hello, World!"))],
    );
    let server = start(test_config(), router).await;

    let response = send_raw(server.addr, b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("\r\n\r\nHello, World!"));

    server.stop().await;
}

#[tokio::test]
async fn test_signup_over_tcp() {
    let server = start(test_config(), api_router()).await;

    let body = r#"{"name":"Ada","email":"ada@example.com","password":"pw12345","skills":["math"]}"#;
    let response = send_raw(server.addr, &post_json("/signup", body)).await;
    assert!(response.starts_with("HTTP/1.1 201 Created\r\n"));
    assert!(response.contains("\"success\":true"));
    assert!(!response.contains("pw12345"));

    let response = send_raw(server.addr, b"GET /nowhere HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(response.ends_with("Cannot GET /nowhere"));

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_request_gets_400() {
    let server = start(test_config(), Router::new()).await;

    let response = send_raw(server.addr, b"NOT-HTTP\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));

    server.stop().await;
}

#[tokio::test]
async fn test_oversized_request_gets_413() {
    let server = start(test_config(), api_router()).await;

    // Rejected from the declared length alone, before any body is read
    let response = send_raw(
        server.addr,
        b"POST /signup HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 10000\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));

    server.stop().await;
}

#[tokio::test]
async fn test_open_exchange_is_closed_after_timeout() {
    let mut router = Router::new();
    router.get("/hang", hang());
    let server = start(test_config(), router).await;

    let started = Instant::now();
    let response = send_raw(server.addr, b"GET /hang HTTP/1.1\r\n\r\n").await;
    assert!(response.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(300));

    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_clients_share_the_pool() {
    let server = start(test_config(), api_router()).await;

    let requests = (0..6).map(|_| {
        let addr = server.addr;
        async move { send_raw(addr, &post_json("/work/primes", r#"{"limit":100000}"#)).await }
    });
    let responses = join_all(requests).await;

    assert_eq!(responses.len(), 6);
    for response in responses {
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with(r#"{"limit":100000,"primes":9592}"#));
    }

    server.stop().await;
}

#[tokio::test]
async fn test_hung_exchange_does_not_block_others() {
    let mut router = Router::new();
    router
        .get("/hang", hang())
        .get(
            "/ok",
            vec![Handler::terminal(|_, res| res.send_text(Status::Ok, "ok"))],
        );
    let server = start(test_config(), router).await;

    let hung = tokio::spawn(send_raw(server.addr, b"GET /hang HTTP/1.1\r\n\r\n"));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    let response = send_raw(server.addr, b"GET /ok HTTP/1.1\r\n\r\n").await;
    assert!(response.ends_with("ok"));
    assert!(started.elapsed() < Duration::from_millis(300));

    assert!(hung.await.unwrap().is_empty());
    server.stop().await;
}
