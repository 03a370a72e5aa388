#![cfg(feature = "hyper-transport")]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use http::StatusCode;
use kym_dispatch::prelude::{DispatchError, Dispatcher, Payload, RetryPolicy};

#[derive(Clone)]
struct ScriptedReply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl ScriptedReply {
    fn new(status: u16, headers: Vec<(&str, &str)>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.to_owned(), value.to_owned()))
                .collect(),
            body: body.into(),
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_content_length(raw_headers: &[u8]) -> usize {
    let text = String::from_utf8_lossy(raw_headers);
    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("content-length")
            && let Ok(parsed) = value.trim().parse::<usize>()
        {
            return parsed;
        }
    }
    0
}

fn read_http_message(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;

    let mut raw = Vec::new();
    loop {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);

        if let Some(header_end) = find_header_end(&raw) {
            let content_length = parse_content_length(&raw[..header_end]);
            if raw.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }
    Ok(raw)
}

fn write_http_response(stream: &mut TcpStream, response: &ScriptedReply) -> std::io::Result<()> {
    let mut raw = format!(
        "HTTP/1.1 {} Scripted\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        response.body.len()
    )
    .into_bytes();
    for (name, value) in &response.headers {
        raw.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    raw.extend_from_slice(b"\r\n");
    raw.extend_from_slice(&response.body);

    stream.write_all(&raw)?;
    stream.flush()
}

/// Serves `responses` in order, one connection each, then stops.
struct ScriptedServer {
    authority: String,
    served: Arc<AtomicUsize>,
    request_lines: Arc<Mutex<Vec<String>>>,
    join: Option<JoinHandle<()>>,
}

impl ScriptedServer {
    fn start(responses: Vec<ScriptedReply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind scripted server");
        let authority = listener
            .local_addr()
            .expect("read local address")
            .to_string();
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let served = Arc::new(AtomicUsize::new(0));
        let request_lines = Arc::new(Mutex::new(Vec::new()));
        let served_clone = Arc::clone(&served);
        let request_lines_clone = Arc::clone(&request_lines);

        let join = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut remaining = responses.into_iter();
            let mut next = remaining.next();

            while let Some(response) = next.as_ref() {
                if Instant::now() >= deadline {
                    break;
                }
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        if let Ok(raw) = read_http_message(&mut stream) {
                            let text = String::from_utf8_lossy(&raw);
                            let line = text.lines().next().unwrap_or_default().to_owned();
                            lock_unpoisoned(&request_lines_clone).push(line);
                        }
                        let _ = write_http_response(&mut stream, response);
                        served_clone.fetch_add(1, Ordering::SeqCst);
                        next = remaining.next();
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            authority,
            served,
            request_lines,
            join: Some(join),
        }
    }

    fn base_url(&self) -> String {
        format!("http://{}/", self.authority)
    }

    fn served_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    fn request_lines(&self) -> Vec<String> {
        lock_unpoisoned(&self.request_lines).clone()
    }
}

impl Drop for ScriptedServer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy::standard()
        .max_retries(2)
        .backoff_base(Duration::from_millis(5))
        .backoff_cap(Duration::from_millis(20))
}

#[tokio::test]
async fn hyper_transport_retries_503_then_decodes_json() {
    let server = ScriptedServer::start(vec![
        ScriptedReply::new(503, vec![("Retry-After", "0")], "busy"),
        ScriptedReply::new(
            200,
            vec![("Content-Type", "application/json")],
            r#"{"mints":[{"url":"https://mint.example"}]}"#,
        ),
    ]);
    let dispatcher = Dispatcher::builder()
        .base_url(server.base_url())
        .client_name("kym-test")
        .retry_policy(fast_retries())
        .default_timeout(Duration::from_secs(3))
        .try_build()
        .expect("build dispatcher");

    let payload = dispatcher
        .get("mints?limit=1")
        .send_decoded()
        .await
        .expect("decoded payload");

    assert_eq!(
        payload,
        Payload::Json(serde_json::json!({ "mints": [{ "url": "https://mint.example" }] }))
    );
    assert_eq!(server.served_count(), 2);
    assert_eq!(
        server.request_lines(),
        vec![
            "GET /mints?limit=1 HTTP/1.1".to_owned(),
            "GET /mints?limit=1 HTTP/1.1".to_owned()
        ]
    );
    let snapshot = dispatcher.metrics_snapshot();
    assert_eq!(snapshot.retries, 1);
    assert_eq!(snapshot.status_counts.get(&200), Some(&1));
}

#[tokio::test]
async fn hyper_transport_passes_not_found_through_raw_entry_point() {
    let server = ScriptedServer::start(vec![ScriptedReply::new(404, Vec::new(), "no such mint")]);
    let dispatcher = Dispatcher::builder()
        .base_url(server.base_url())
        .retry_policy(fast_retries())
        .try_build()
        .expect("build dispatcher");

    let response = dispatcher.get("mints/9").send().await.expect("raw response");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.text_lossy(), "no such mint");
    assert_eq!(server.served_count(), 1);
}

#[tokio::test]
async fn hyper_transport_rejects_oversized_body() {
    let server = ScriptedServer::start(vec![ScriptedReply::new(200, Vec::new(), vec![b'x'; 64])]);
    let dispatcher = Dispatcher::builder()
        .base_url(server.base_url())
        .retry_policy(RetryPolicy::disabled())
        .max_response_body_bytes(16)
        .try_build()
        .expect("build dispatcher");

    let error = dispatcher
        .get("big")
        .send()
        .await
        .expect_err("body over limit");

    assert!(matches!(error, DispatchError::Transport { .. }));
}
