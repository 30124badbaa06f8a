// End-to-end tests: a packrat server on a real socket, a scripted upstream,
// and raw TCP clients speaking HTTP/1.1.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use packrat::config::{CACHE_NAMESPACE, CacheConfig};
use packrat::gateway::Gateway;
use packrat::server::Server;
use packrat::upstream::RetryPolicy;

fn config_at(root: &Path) -> CacheConfig {
    CacheConfig {
        port: 0,
        cache_root: root.to_path_buf(),
        ttl_seconds: 3600,
        compress: false,
    }
}

fn no_backoff() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_backoff_ms: 0,
        max_backoff_ms: 0,
    }
}

/// Starts a packrat instance on an ephemeral port and returns its address.
async fn start_proxy(config: &CacheConfig, policy: RetryPolicy) -> SocketAddr {
    let gateway = Gateway::with_retry_policy(config, policy).await.unwrap();
    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(async move {
        let _ = server
            .run(move |request| {
                let gateway = gateway.clone();
                async move { gateway.handle(request).await }
            })
            .await;
    });
    addr
}

/// Answers every connection with a 200 and `body` after `delay`, counting
/// accepted connections.
async fn fake_upstream(body: &'static str, delay: Duration) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let _ = stream.read(&mut buf).await;
                tokio::time::sleep(delay).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    (addr, hits)
}

/// Reads one HTTP response, returning the status code and body bytes.
async fn read_response(stream: &mut TcpStream) -> (u16, Vec<u8>) {
    let mut buf = Vec::new();
    let header_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before response headers");
        buf.extend_from_slice(&chunk[..n]);
    };

    let header_text = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let status: u16 = header_text
        .split_whitespace()
        .nth(1)
        .unwrap()
        .parse()
        .unwrap();
    let content_length: usize = header_text
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before response body");
        buf.extend_from_slice(&chunk[..n]);
    }
    (status, buf[header_end..header_end + content_length].to_vec())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn backdate(path: &Path, seconds: u64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(seconds))
        .unwrap();
}

#[tokio::test]
async fn serves_misses_then_replays_from_cache() {
    let root = tempfile::tempdir().unwrap();
    let (upstream, hits) = fake_upstream("integration payload", Duration::ZERO).await;
    let proxy = start_proxy(&config_at(root.path()), RetryPolicy::default()).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("GET /{upstream}/data HTTP/1.1\r\nHost: proxy\r\n\r\n");

    stream.write_all(request.as_bytes()).await.unwrap();
    let (status, body) = read_response(&mut stream).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"integration payload");

    // Second request on the same connection is served from disk.
    stream.write_all(request.as_bytes()).await.unwrap();
    let (status, body) = read_response(&mut stream).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"integration payload");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let entry = root
        .path()
        .join(CACHE_NAMESPACE)
        .join(format!("{upstream}/data"))
        .join("GET:index.html");
    assert!(entry.is_file());
}

#[tokio::test]
async fn concurrent_clients_share_one_upstream_fetch() {
    let root = tempfile::tempdir().unwrap();
    let (upstream, hits) = fake_upstream("popular", Duration::from_millis(100)).await;
    let proxy = start_proxy(&config_at(root.path()), RetryPolicy::default()).await;

    let mut clients = Vec::new();
    for _ in 0..8 {
        let request = format!("GET /{upstream}/hot HTTP/1.1\r\nHost: proxy\r\n\r\n");
        clients.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(proxy).await.unwrap();
            stream.write_all(request.as_bytes()).await.unwrap();
            read_response(&mut stream).await
        }));
    }

    for client in clients {
        let (status, body) = client.await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, b"popular");
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn post_forms_are_forwarded_and_cached() {
    let root = tempfile::tempdir().unwrap();
    let (upstream, hits) = fake_upstream("search results", Duration::ZERO).await;
    let proxy = start_proxy(&config_at(root.path()), RetryPolicy::default()).await;

    let body = "q=rust&page=2";
    let request = format!(
        "POST /{upstream}/search HTTP/1.1\r\nHost: proxy\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let (status, payload) = read_response(&mut stream).await;
    assert_eq!(status, 200);
    assert_eq!(payload, b"search results");

    let entry = root
        .path()
        .join(CACHE_NAMESPACE)
        .join(format!("{upstream}/search"))
        .join("POST:index.html?page=2&q=rust");
    assert!(entry.is_file());

    // A fresh connection replays the same form from the cache.
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let (status, payload) = read_response(&mut stream).await;
    assert_eq!(status, 200);
    assert_eq!(payload, b"search results");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreachable_upstream_surfaces_as_bad_gateway() {
    let root = tempfile::tempdir().unwrap();
    let proxy = start_proxy(&config_at(root.path()), no_backoff()).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(b"GET /127.0.0.1:1/offline HTTP/1.1\r\nHost: proxy\r\n\r\n")
        .await
        .unwrap();
    let (status, _) = read_response(&mut stream).await;
    assert_eq!(status, 502);

    let namespace = root.path().join(CACHE_NAMESPACE);
    let leftover: Vec<_> = std::fs::read_dir(&namespace).unwrap().collect();
    assert!(leftover.is_empty(), "a failed fetch must not be cached");
}

#[tokio::test]
async fn compressed_cache_replays_identical_payload() {
    let root = tempfile::tempdir().unwrap();
    let (upstream, hits) = fake_upstream("squeeze me please, repeatedly", Duration::ZERO).await;
    let config = CacheConfig {
        compress: true,
        ..config_at(root.path())
    };
    let proxy = start_proxy(&config, RetryPolicy::default()).await;

    let request = format!("GET /{upstream}/page.html HTTP/1.1\r\nHost: proxy\r\n\r\n");

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let (status, body) = read_response(&mut stream).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"squeeze me please, repeatedly");

    let entry = root
        .path()
        .join(CACHE_NAMESPACE)
        .join(upstream.to_string())
        .join("GET:page.html");
    let on_disk = std::fs::read(&entry).unwrap();
    assert_eq!(&on_disk[..2], &[0x1f, 0x8b], "entry should be gzip on disk");

    stream.write_all(request.as_bytes()).await.unwrap();
    let (status, body) = read_response(&mut stream).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"squeeze me please, repeatedly");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expired_entries_are_refetched() {
    let root = tempfile::tempdir().unwrap();
    let (upstream, hits) = fake_upstream("current", Duration::ZERO).await;
    let config = CacheConfig {
        ttl_seconds: 60,
        ..config_at(root.path())
    };
    let proxy = start_proxy(&config, RetryPolicy::default()).await;

    let request = format!("GET /{upstream}/feed HTTP/1.1\r\nHost: proxy\r\n\r\n");

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let (status, _) = read_response(&mut stream).await;
    assert_eq!(status, 200);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let entry = root
        .path()
        .join(CACHE_NAMESPACE)
        .join(format!("{upstream}/feed"))
        .join("GET:index.html");
    backdate(&entry, 120);

    stream.write_all(request.as_bytes()).await.unwrap();
    let (status, _) = read_response(&mut stream).await;
    assert_eq!(status, 200);
    assert_eq!(hits.load(Ordering::SeqCst), 2, "expired entry should refetch");
}

#[tokio::test]
async fn pipelined_requests_are_both_served() {
    let root = tempfile::tempdir().unwrap();
    let (upstream, hits) = fake_upstream("pipelined", Duration::ZERO).await;
    let proxy = start_proxy(&config_at(root.path()), RetryPolicy::default()).await;

    let batch = format!(
        "GET /{upstream}/a HTTP/1.1\r\nHost: proxy\r\n\r\nGET /{upstream}/b HTTP/1.1\r\nHost: proxy\r\n\r\n"
    );

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(batch.as_bytes()).await.unwrap();

    let (first, body_a) = read_response(&mut stream).await;
    let (second, body_b) = read_response(&mut stream).await;
    assert_eq!((first, second), (200, 200));
    assert_eq!(body_a, b"pipelined");
    assert_eq!(body_b, b"pipelined");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unknown_methods_get_405() {
    let root = tempfile::tempdir().unwrap();
    let proxy = start_proxy(&config_at(root.path()), RetryPolicy::default()).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(b"DELETE /example.com/thing HTTP/1.1\r\nHost: proxy\r\n\r\n")
        .await
        .unwrap();
    let (status, _) = read_response(&mut stream).await;
    assert_eq!(status, 405);
}

#[tokio::test]
async fn missing_target_gets_400() {
    let root = tempfile::tempdir().unwrap();
    let proxy = start_proxy(&config_at(root.path()), RetryPolicy::default()).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: proxy\r\n\r\n")
        .await
        .unwrap();
    let (status, _) = read_response(&mut stream).await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn absurd_content_length_gets_400() {
    let root = tempfile::tempdir().unwrap();
    let proxy = start_proxy(&config_at(root.path()), RetryPolicy::default()).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "POST /example.com/f HTTP/1.1\r\nHost: proxy\r\nContent-Length: {}\r\n\r\n",
        u64::MAX
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let (status, _) = read_response(&mut stream).await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn oversized_requests_are_rejected() {
    let root = tempfile::tempdir().unwrap();
    let proxy = start_proxy(&config_at(root.path()), RetryPolicy::default()).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let header = "POST /example.com/upload HTTP/1.1\r\nHost: proxy\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 9437184\r\n\r\n";
    stream.write_all(header.as_bytes()).await.unwrap();

    // More body than the server will buffer, less than the declared length,
    // so the request never completes and the cap has to fire.
    let body = vec![b'x'; 8 * 1024 * 1024 + 256 * 1024];
    stream.write_all(&body).await.unwrap();

    let (status, _) = read_response(&mut stream).await;
    assert_eq!(status, 413);
}
