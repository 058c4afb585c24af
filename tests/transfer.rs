use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;

use framepull::config::{Config, ConfigLoader};
use framepull::domain::{ResultLocator, TransportKind};
use framepull::error::PullError;
use framepull::progress::{CancelToken, ProgressFn, no_progress};
use framepull::transfer::{TransferClient, TransferHttpClient};

/// Serves one canned response per connection and hands back each raw request.
struct CannedServer {
    base_url: String,
    requests: Receiver<Vec<u8>>,
}

impl CannedServer {
    fn start(responses: Vec<Vec<u8>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for response in responses {
                let Ok((stream, _)) = listener.accept() else {
                    return;
                };
                let request = serve(stream, &response);
                let _ = tx.send(request);
            }
        });
        Self {
            base_url,
            requests: rx,
        }
    }

    fn client(&self) -> TransferHttpClient {
        let config = ConfigLoader::resolve_config(Config {
            base_url: Some(self.base_url.clone()),
            connect_timeout_secs: Some(5),
            download_timeout_secs: Some(10),
            upload_timeout_secs: Some(10),
            ..Config::default()
        })
        .unwrap();
        TransferHttpClient::new(&config).unwrap()
    }
}

fn serve(stream: TcpStream, response: &[u8]) -> Vec<u8> {
    let mut reader = BufReader::new(stream);
    let mut request = Vec::new();
    let mut content_length = 0usize;
    let mut chunked = false;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap() == 0 {
            break;
        }
        request.extend_from_slice(line.as_bytes());
        let lower = line.to_ascii_lowercase();
        if let Some(value) = lower.strip_prefix("content-length:") {
            content_length = value.trim().parse().unwrap();
        }
        if lower.starts_with("transfer-encoding:") && lower.contains("chunked") {
            chunked = true;
        }
        if line == "\r\n" {
            break;
        }
    }
    if chunked {
        loop {
            let mut size_line = String::new();
            reader.read_line(&mut size_line).unwrap();
            let size = usize::from_str_radix(size_line.trim(), 16).unwrap();
            let mut chunk = vec![0u8; size + 2];
            reader.read_exact(&mut chunk).unwrap();
            request.extend_from_slice(&chunk[..size]);
            if size == 0 {
                break;
            }
        }
    } else {
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).unwrap();
        request.extend_from_slice(&body);
    }
    let mut stream = reader.into_inner();
    stream.write_all(response).unwrap();
    stream.flush().unwrap();
    request
}

/// Accepts one connection, reads the request head, writes `prefix` and then
/// keeps the connection open without sending anything more.
fn stalled_server(prefix: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    thread::spawn(move || {
        let Ok((stream, _)) = listener.accept() else {
            return;
        };
        let mut reader = BufReader::new(stream);
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) if line == "\r\n" => break,
                Ok(_) => {}
            }
        }
        let mut stream = reader.into_inner();
        let _ = stream.write_all(&prefix);
        let _ = stream.flush();
        thread::sleep(Duration::from_secs(30));
    });
    base_url
}

fn slow_client(base_url: String) -> TransferHttpClient {
    let config = ConfigLoader::resolve_config(Config {
        base_url: Some(base_url),
        connect_timeout_secs: Some(5),
        download_timeout_secs: Some(20),
        upload_timeout_secs: Some(20),
        ..Config::default()
    })
    .unwrap();
    TransferHttpClient::new(&config).unwrap()
}

fn cancel_after(delay: Duration) -> CancelToken {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    thread::spawn(move || {
        thread::sleep(delay);
        token.cancel();
    });
    cancel
}

fn http_response(status: &str, body: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

fn recording_progress() -> (ProgressFn, Arc<Mutex<Vec<f64>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let progress: ProgressFn = Arc::new(move |fraction: f64| sink.lock().unwrap().push(fraction));
    (progress, seen)
}

#[test]
fn download_writes_archive_and_reports_progress() {
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let server = CannedServer::start(vec![http_response("200 OK", &payload)]);
    let temp = tempfile::tempdir().unwrap();
    let destination = temp.path().join("result.zip");
    let (progress, seen) = recording_progress();

    let locator: ResultLocator = "/download/abc".parse().unwrap();
    let archive = server
        .client()
        .download(&locator, &destination, progress, &CancelToken::new())
        .unwrap();

    assert_eq!(archive.bytes, payload.len() as u64);
    assert_eq!(std::fs::read(&destination).unwrap(), payload);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.last(), Some(&1.0));
    for pair in seen.windows(2) {
        assert!(pair[0] < pair[1]);
    }

    let request = String::from_utf8_lossy(&server.requests.recv().unwrap()).to_ascii_lowercase();
    assert!(request.starts_with("get /download/abc http/1.1"));
    assert!(request.contains("ngrok-skip-browser-warning: true"));
}

#[test]
fn missing_result_is_server_rejected() {
    let server = CannedServer::start(vec![http_response("404 Not Found", b"no such job")]);
    let temp = tempfile::tempdir().unwrap();

    let err = server
        .client()
        .download(
            &"/download/missing".parse().unwrap(),
            &temp.path().join("result.zip"),
            no_progress(),
            &CancelToken::new(),
        )
        .unwrap_err();
    assert!(!err.is_transient());
    assert_matches!(err, PullError::ServerRejected { status: 404, message } if message == "no such job");
}

#[test]
fn empty_body_is_empty_file() {
    let server = CannedServer::start(vec![http_response("200 OK", b"")]);
    let temp = tempfile::tempdir().unwrap();

    let err = server
        .client()
        .download(
            &"/download/empty".parse().unwrap(),
            &temp.path().join("result.zip"),
            no_progress(),
            &CancelToken::new(),
        )
        .unwrap_err();
    assert_matches!(err, PullError::EmptyFile);
}

#[test]
fn upload_sends_video_part_and_decodes_locator() {
    let body = br#"{"download_url":"/download/job-7","message":"done","processing_time":"2.1s"}"#;
    let server = CannedServer::start(vec![http_response("200 OK", body)]);
    let temp = tempfile::tempdir().unwrap();
    let video = temp.path().join("clip.mp4");
    std::fs::write(&video, vec![42u8; 50_000]).unwrap();
    let (progress, seen) = recording_progress();

    let response = server
        .client()
        .upload(&video, progress, &CancelToken::new())
        .unwrap();

    assert_eq!(response.locator().unwrap().as_str(), "/download/job-7");
    assert_eq!(response.processing_time, "2.1s");
    assert_eq!(seen.lock().unwrap().last(), Some(&1.0));

    let request = String::from_utf8_lossy(&server.requests.recv().unwrap()).to_ascii_lowercase();
    assert!(request.starts_with("post /upload http/1.1"));
    assert!(request.contains("ngrok-skip-browser-warning: true"));
    assert!(request.contains("multipart/form-data"));
    assert!(request.contains("name=\"video\""));
    assert!(request.contains("filename=\"clip.mp4\""));
    assert!(request.contains("content-type: video/mp4"));
}

#[test]
fn upload_with_html_reply_is_decode_failure() {
    let server = CannedServer::start(vec![http_response("200 OK", b"<html>warning</html>")]);
    let temp = tempfile::tempdir().unwrap();
    let video = temp.path().join("clip.mp4");
    std::fs::write(&video, b"video").unwrap();

    let err = server
        .client()
        .upload(&video, no_progress(), &CancelToken::new())
        .unwrap_err();
    assert_matches!(err, PullError::DecodeFailed { .. });
}

#[test]
fn status_reads_server_state() {
    let server = CannedServer::start(vec![http_response("200 OK", br#"{"status":"ok"}"#)]);
    assert_eq!(server.client().status().unwrap(), "ok");
}

#[test]
fn refused_connection_is_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    let config = ConfigLoader::resolve_config(Config {
        base_url: Some(base_url),
        connect_timeout_secs: Some(2),
        ..Config::default()
    })
    .unwrap();
    let temp = tempfile::tempdir().unwrap();

    let err = TransferHttpClient::new(&config)
        .unwrap()
        .download(
            &"/download/x".parse().unwrap(),
            &temp.path().join("result.zip"),
            no_progress(),
            &CancelToken::new(),
        )
        .unwrap_err();
    assert!(err.is_transient());
    assert_matches!(
        err,
        PullError::Transport {
            kind: TransportKind::NotConnected | TransportKind::ConnectionLost,
            ..
        }
    );
}

#[test]
fn cancelled_download_reports_cancelled() {
    let server = CannedServer::start(vec![http_response("200 OK", b"zipdata")]);
    let temp = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = server
        .client()
        .download(
            &"/download/abc".parse().unwrap(),
            &temp.path().join("result.zip"),
            no_progress(),
            &cancel,
        )
        .unwrap_err();
    assert_matches!(err, PullError::Cancelled);
}

#[test]
fn locators_resolve_against_base() {
    let base = reqwest::Url::parse("http://example.test/api").unwrap();
    let relative: ResultLocator = "results/a.zip".parse().unwrap();
    assert_eq!(
        relative.resolve(&base).unwrap().as_str(),
        "http://example.test/api/results/a.zip"
    );
    let rooted: ResultLocator = "/download/a.zip".parse().unwrap();
    assert_eq!(
        rooted.resolve(&base).unwrap().as_str(),
        "http://example.test/download/a.zip"
    );
    let absolute: ResultLocator = "https://cdn.test/a.zip".parse().unwrap();
    assert_eq!(
        absolute.resolve(&base).unwrap().as_str(),
        "https://cdn.test/a.zip"
    );
    let other: ResultLocator = "ftp://cdn.test/a.zip".parse().unwrap();
    assert_matches!(other.resolve(&base), Err(PullError::InvalidEndpoint(_)));
}

#[test]
fn cancel_interrupts_download_waiting_for_headers() {
    let client = slow_client(stalled_server(Vec::new()));
    let temp = tempfile::tempdir().unwrap();
    let cancel = cancel_after(Duration::from_millis(200));
    let started = Instant::now();

    let err = client
        .download(
            &"/download/slow".parse().unwrap(),
            &temp.path().join("result.zip"),
            no_progress(),
            &cancel,
        )
        .unwrap_err();
    assert_matches!(err, PullError::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
}

#[test]
fn cancel_interrupts_stalled_download_body() {
    let head = b"HTTP/1.1 200 OK\r\nContent-Length: 100000\r\nConnection: close\r\n\r\nPK\x03\x04".to_vec();
    let client = slow_client(stalled_server(head));
    let temp = tempfile::tempdir().unwrap();
    let (progress, seen) = recording_progress();
    let cancel = cancel_after(Duration::from_millis(300));
    let started = Instant::now();

    let err = client
        .download(
            &"/download/slow".parse().unwrap(),
            &temp.path().join("result.zip"),
            progress,
            &cancel,
        )
        .unwrap_err();
    assert_matches!(err, PullError::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
    assert!(seen.lock().unwrap().iter().all(|fraction| *fraction < 1.0));
}

#[test]
fn cancel_interrupts_upload_waiting_for_reply() {
    let client = slow_client(stalled_server(Vec::new()));
    let temp = tempfile::tempdir().unwrap();
    let video = temp.path().join("clip.mp4");
    std::fs::write(&video, vec![7u8; 4_096]).unwrap();
    let cancel = cancel_after(Duration::from_millis(200));
    let started = Instant::now();

    let err = client.upload(&video, no_progress(), &cancel).unwrap_err();
    assert_matches!(err, PullError::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
}
