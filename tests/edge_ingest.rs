use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

use engagement_monitor::classify::SharedClassifier;
use engagement_monitor::collector::{CollectorServer, MetadataStore};
use engagement_monitor::config::{CollectorConfig, EdgeConfig};
use engagement_monitor::edge::{EdgeHandle, EdgeServer};
use engagement_monitor::session::SessionLayout;
use engagement_monitor::{
    start_session, CaptureSource, ForwardConfig, Forwarder, SessionOptions, StubClassifier,
};

struct TestEdge {
    dir: tempfile::TempDir,
    handle: Option<EdgeHandle>,
}

impl TestEdge {
    fn new(forwarder: Forwarder) -> Result<Self> {
        let dir = tempdir()?;
        let classifier: SharedClassifier = Arc::new(Mutex::new(StubClassifier::new()));
        let cfg = EdgeConfig {
            addr: "127.0.0.1:0".to_string(),
            output_root: dir.path().join("sessions"),
            video: false,
        };
        let handle = EdgeServer::new(cfg, classifier, forwarder).spawn()?;
        Ok(Self {
            dir,
            handle: Some(handle),
        })
    }

    fn addr(&self) -> SocketAddr {
        self.handle
            .as_ref()
            .expect("test edge handle should be initialized")
            .addr
    }

    fn layout(&self, respondent: &str, session: &str) -> SessionLayout {
        SessionLayout::new(&self.dir.path().join("sessions"), respondent, session)
    }

    fn stop(&mut self) -> Result<engagement_monitor::edge::EdgeReport> {
        self.handle
            .take()
            .expect("test edge already stopped")
            .stop()
    }
}

impl Drop for TestEdge {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop().expect("failed to stop edge server");
        }
    }
}

fn jpegs(count: usize) -> Result<Vec<Vec<u8>>> {
    let mut source = CaptureSource::from_uri(&format!("stub://cam?frames={count}"))?;
    source.connect()?;
    let mut frames = Vec::new();
    while let Some(frame) = source.next_frame()? {
        frames.push(frame);
    }
    Ok(frames)
}

fn request(
    edge: &TestEdge,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Result<(String, String)> {
    let mut stream = TcpStream::connect(edge.addr())?;
    let mut head = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n",
        body.len()
    );
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes())?;
    stream.write_all(body)?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

fn get(edge: &TestEdge, path: &str) -> Result<(String, String)> {
    request(edge, "GET", path, &[], b"")
}

fn push(edge: &TestEdge, jpeg: &[u8], headers: &[(&str, &str)]) -> Result<(String, String)> {
    request(edge, "POST", "/upload_frame", headers, jpeg)
}

#[test]
fn pushed_frames_start_a_session_from_headers() -> Result<()> {
    let edge = TestEdge::new(Forwarder::disabled())?;
    let headers = [
        ("X-Responden", "r1"),
        ("X-Sesi", "s1"),
        ("X-Filename", "cam_0001.jpg"),
    ];
    for jpeg in jpegs(3)? {
        let (status, body) = push(&edge, &jpeg, &headers)?;
        assert!(status.contains("200 OK"));
        let value: Value = serde_json::from_str(&body)?;
        assert_eq!(value["status"], "ok");
        assert!(value["frame"].as_str().unwrap_or("").starts_with("frame_"));
    }

    let (_, health) = get(&edge, "/health")?;
    assert!(health.contains(r#""active_session":"r1/s1""#));

    let (status, body) = request(&edge, "POST", "/stop_session", &[], b"")?;
    assert!(status.contains("200 OK"));
    let summary: Value = serde_json::from_str(&body)?;
    assert_eq!(summary["total_frames"], 3);
    assert_eq!(summary["respondent"], "r1");

    let log = std::fs::read_to_string(edge.layout("r1", "s1").results_log())?;
    assert_eq!(log.lines().count(), 4);
    assert!(!edge.layout("r1", "s1").lock().exists());
    Ok(())
}

#[test]
fn headerless_pushes_fall_back_to_default_identifiers() -> Result<()> {
    let edge = TestEdge::new(Forwarder::disabled())?;
    let (status, _) = request(&edge, "POST", "/upload", &[], &jpegs(1)?[0])?;
    assert!(status.contains("200 OK"));
    assert!(edge.layout("unknown", "default").results_log().is_file());
    Ok(())
}

#[test]
fn explicit_start_resets_and_overrides_headers() -> Result<()> {
    let edge = TestEdge::new(Forwarder::disabled())?;
    let frames = jpegs(2)?;

    let (status, _) = get(&edge, "/start_new_session?responden=r2&sesi=s1")?;
    assert!(status.contains("200 OK"));
    push(&edge, &frames[0], &[("X-Responden", "other"), ("X-Sesi", "x")])?;
    assert!(!edge.layout("other", "x").dir().exists());

    // Restarting the same session truncates its log.
    get(&edge, "/start_new_session?responden=r2&sesi=s1")?;
    push(&edge, &frames[1], &[])?;
    let (_, body) = request(&edge, "POST", "/stop_session", &[], b"")?;
    let summary: Value = serde_json::from_str(&body)?;
    assert_eq!(summary["total_frames"], 1);
    Ok(())
}

#[test]
fn route_errors() -> Result<()> {
    let edge = TestEdge::new(Forwarder::disabled())?;

    let (status, body) = get(&edge, "/start_new_session?responden=r3")?;
    assert!(status.contains("400 Bad Request"));
    assert!(body.contains("missing"));

    let (status, body) = get(&edge, "/start_new_session?responden=..&sesi=s1")?;
    assert!(status.contains("400 Bad Request"));
    assert!(body.contains("invalid_identifier"));

    let (status, _) = push(&edge, b"jpeg", &[("X-Responden", "a/b")])?;
    assert!(status.contains("400 Bad Request"));

    let (status, body) = request(&edge, "POST", "/stop_session", &[], b"")?;
    assert!(status.contains("400 Bad Request"));
    assert!(body.contains("no active session"));

    let (status, _) = get(&edge, "/upload_frame")?;
    assert!(status.contains("405 Method Not Allowed"));
    let (status, _) = get(&edge, "/nowhere")?;
    assert!(status.contains("404 Not Found"));
    Ok(())
}

#[test]
fn locked_session_is_a_conflict() -> Result<()> {
    let edge = TestEdge::new(Forwarder::disabled())?;
    let mut held = start_session(
        "r4",
        "s1",
        edge.dir.path().join("sessions"),
        SessionOptions::default(),
    )?;

    let (status, body) = get(&edge, "/start_new_session?responden=r4&sesi=s1")?;
    assert!(status.contains("409 Conflict"));
    assert!(body.contains("session_locked"));

    held.stop_session()?;
    let (status, _) = get(&edge, "/start_new_session?responden=r4&sesi=s1")?;
    assert!(status.contains("200 OK"));
    Ok(())
}

#[test]
fn undecodable_push_is_recorded_as_no_detection() -> Result<()> {
    let edge = TestEdge::new(Forwarder::disabled())?;
    let (status, body) = push(&edge, b"not a jpeg", &[("X-Responden", "r5"), ("X-Sesi", "s1")])?;
    assert!(status.contains("200 OK"));
    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["engagement_level"], -1);
    Ok(())
}

#[test]
fn shutdown_closes_the_active_session_and_drains_forwarding() -> Result<()> {
    let collector_dir = tempdir()?;
    let collector = CollectorServer::new(CollectorConfig {
        addr: "127.0.0.1:0".to_string(),
        ws_addr: None,
        root: collector_dir.path().to_path_buf(),
        global_log: false,
    })
    .spawn()?;
    let forwarder = Forwarder::start(&ForwardConfig {
        url: Some(format!("http://{}/upload_result", collector.addr)),
        queue_capacity: 16,
        timeout: Duration::from_secs(5),
    })?;

    let mut edge = TestEdge::new(forwarder)?;
    for jpeg in jpegs(4)? {
        push(&edge, &jpeg, &[("X-Responden", "r6"), ("X-Sesi", "s1")])?;
    }
    let report = edge.stop()?;
    assert_eq!(report.frames_recorded, 4);
    assert_eq!(report.sessions_closed, 1);
    assert_eq!(report.forward.delivered, 4);
    let summary = report
        .last_summary
        .expect("active session should be closed on shutdown");
    assert_eq!(summary.total_frames, 4);
    assert!(!edge.layout("r6", "s1").lock().exists());

    let stored = MetadataStore::new(collector_dir.path().to_path_buf())
        .report("r6", "s1")?
        .expect("collector should hold the forwarded results");
    assert_eq!(
        stored.total_frames + stored.no_detection_frames,
        summary.total_frames
    );
    collector.stop()?;
    Ok(())
}
