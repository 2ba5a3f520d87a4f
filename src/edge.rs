//! Edge ingest server for cameras that push frames.
//!
//! Wi-Fi ESP32-CAM firmware POSTs each JPEG to the edge instead of serving a
//! stream. The edge owns at most one active session at a time:
//!
//! - `GET /start_new_session?responden=..&sesi=..`: stop the active session
//!   (if any) and start a fresh one
//! - `POST /upload_frame` (or `/upload`): body is one JPEG. `X-Responden` and
//!   `X-Sesi` name the session to auto-start when none is active;
//!   `X-Filename` is logged as the camera's name for the frame
//! - `POST /stop_session`: close the active session and reply with its summary
//! - `GET /health`
//!
//! Every upload is classified, recorded and forwarded exactly like a frame
//! read by the capture loop. Requests are served one at a time on the accept
//! thread, so the session has a single writer.

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::classify::{classify_payload, SharedClassifier};
use crate::collector::http::{self, read_request, write_json_response, HttpRequest};
use crate::config::EdgeConfig;
use crate::error::EngagementError;
use crate::forward::{ForwardStats, Forwarder, ResultPayload};
use crate::framing::MAX_FRAME_BYTES;
use crate::session::{start_session, SessionHandle, SessionOptions, SessionSummary};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const DEFAULT_RESPONDENT: &str = "unknown";
const DEFAULT_SESSION: &str = "default";

/// What the edge did between `spawn` and `stop`.
#[derive(Clone, Debug, Default)]
pub struct EdgeReport {
    pub sessions_closed: u64,
    pub frames_recorded: u64,
    /// Summary of the most recently closed session.
    pub last_summary: Option<SessionSummary>,
    pub forward: ForwardStats,
}

#[derive(Debug)]
pub struct EdgeHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<EdgeReport>,
}

impl EdgeHandle {
    /// Stop serving, close the active session and drain the forwarder.
    pub fn stop(self) -> Result<EdgeReport> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.join
            .join()
            .map_err(|_| anyhow!("edge server thread panicked"))
    }
}

pub struct EdgeServer {
    cfg: EdgeConfig,
    classifier: SharedClassifier,
    forwarder: Forwarder,
}

impl EdgeServer {
    pub fn new(cfg: EdgeConfig, classifier: SharedClassifier, forwarder: Forwarder) -> Self {
        Self {
            cfg,
            classifier,
            forwarder,
        }
    }

    /// Bind the listener and serve on a background thread.
    pub fn spawn(self) -> Result<EdgeHandle> {
        self.cfg.validate()?;
        std::fs::create_dir_all(&self.cfg.output_root).with_context(|| {
            format!("create output root {}", self.cfg.output_root.display())
        })?;
        let listener = TcpListener::bind(&self.cfg.addr)
            .with_context(|| format!("bind edge server on {}", self.cfg.addr))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = shutdown.clone();
        let mut edge = EdgeState {
            cfg: self.cfg,
            classifier: self.classifier,
            forwarder: Some(self.forwarder),
            session: None,
            report: EdgeReport::default(),
        };
        let join = std::thread::Builder::new()
            .name("edge-server".to_string())
            .spawn(move || {
                if let Err(err) = edge.serve(listener, &thread_shutdown) {
                    log::error!("edge server stopped: {}", err);
                }
                edge.finish()
            })
            .map_err(|err| anyhow!("spawn edge server thread: {}", err))?;
        log::info!("edge ingest listening on {}", addr);

        Ok(EdgeHandle {
            addr,
            shutdown,
            join,
        })
    }
}

struct EdgeState {
    cfg: EdgeConfig,
    classifier: SharedClassifier,
    forwarder: Option<Forwarder>,
    session: Option<SessionHandle>,
    report: EdgeReport,
}

impl EdgeState {
    fn serve(&mut self, listener: TcpListener, shutdown: &AtomicBool) -> Result<()> {
        while !shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = self.handle_connection(stream) {
                        log::warn!("edge request from {} rejected: {}", peer, err);
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn finish(mut self) -> EdgeReport {
        if let Err(err) = self.close_session() {
            log::error!("failed to close session on shutdown: {}", err);
        }
        if let Some(forwarder) = self.forwarder.take() {
            self.report.forward = forwarder.shutdown();
        }
        self.report
    }

    fn handle_connection(&mut self, mut stream: TcpStream) -> Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(http::READ_TIMEOUT))?;
        let request = match read_request(&mut stream, MAX_FRAME_BYTES as usize) {
            Ok(request) => request,
            Err(err) => {
                write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#)?;
                return Err(err);
            }
        };

        match (request.method.as_str(), request.path.as_str()) {
            ("GET", "/health") => {
                let body = json!({
                    "status": "ok",
                    "active_session": self.session.as_ref().map(|s| {
                        format!("{}/{}", s.respondent(), s.session_label())
                    }),
                });
                write_json_response(&mut stream, 200, &body.to_string())
            }
            ("GET", "/start_new_session") => self.start_route(&mut stream, &request),
            ("POST", "/upload_frame" | "/upload") => self.upload_route(&mut stream, &request),
            ("POST", "/stop_session") => self.stop_route(&mut stream),
            (
                _,
                "/health" | "/start_new_session" | "/upload_frame" | "/upload" | "/stop_session",
            ) => write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#),
            _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
        }
    }

    fn start_route(&mut self, stream: &mut TcpStream, request: &HttpRequest) -> Result<()> {
        let (Some(respondent), Some(label)) =
            (request.query_param("responden"), request.query_param("sesi"))
        else {
            return write_json_response(
                stream,
                400,
                r#"{"error":"missing 'responden' or 'sesi' parameters"}"#,
            );
        };
        self.close_session()?;
        match self.open_session(respondent, label) {
            Ok(()) => {
                let body = json!({ "status": "started", "responden": respondent, "sesi": label });
                write_json_response(stream, 200, &body.to_string())
            }
            Err(err) => reject_start(stream, err),
        }
    }

    fn upload_route(&mut self, stream: &mut TcpStream, request: &HttpRequest) -> Result<()> {
        if self.session.is_none() {
            let respondent = request.header("x-responden").unwrap_or(DEFAULT_RESPONDENT);
            let label = request.header("x-sesi").unwrap_or(DEFAULT_SESSION);
            if let Err(err) = self.open_session(respondent, label) {
                return reject_start(stream, err);
            }
        }
        let Some(session) = self.session.as_mut() else {
            return write_json_response(stream, 500, r#"{"error":"no active session"}"#);
        };

        let started = Instant::now();
        let outcome = classify_payload(&self.classifier, &request.body);
        let response_time = started.elapsed().as_secs_f64();
        let classification = outcome.classification;
        let record = match session.record_frame(
            &request.body,
            classification.level,
            classification.confidence,
            response_time,
        ) {
            Ok(record) => record,
            Err(err) => {
                write_json_response(stream, 500, r#"{"error":"record_failed"}"#)?;
                return Err(err).context("record pushed frame");
            }
        };
        if let Some(camera_name) = request.header("x-filename") {
            log::debug!("camera frame {} recorded as {}", camera_name, record.frame_name);
        }
        self.report.frames_recorded += 1;
        if let Some(forwarder) = &self.forwarder {
            forwarder.submit(ResultPayload::from_record(
                session.respondent(),
                session.session_label(),
                &record,
            ));
        }

        let body = json!({
            "status": "ok",
            "frame": record.frame_name,
            "engagement_level": record.level,
        });
        write_json_response(stream, 200, &body.to_string())
    }

    fn stop_route(&mut self, stream: &mut TcpStream) -> Result<()> {
        if self.session.is_none() {
            return write_json_response(stream, 400, r#"{"error":"no active session"}"#);
        }
        match self.close_session() {
            Ok(Some(summary)) => {
                let body = serde_json::to_vec(&summary)?;
                http::write_response(stream, 200, "application/json", &body)
            }
            Ok(None) => write_json_response(stream, 400, r#"{"error":"no active session"}"#),
            Err(err) => {
                write_json_response(stream, 500, r#"{"error":"stop_failed"}"#)?;
                Err(err)
            }
        }
    }

    fn open_session(&mut self, respondent: &str, label: &str) -> Result<(), EngagementError> {
        let session = start_session(
            respondent,
            label,
            &self.cfg.output_root,
            SessionOptions {
                video: self.cfg.video,
                force_unlock: false,
            },
        )?;
        log::info!("edge session {}/{} started", respondent, label);
        self.session = Some(session);
        Ok(())
    }

    fn close_session(&mut self) -> Result<Option<SessionSummary>> {
        let Some(mut session) = self.session.take() else {
            return Ok(None);
        };
        let summary = session
            .stop_session()
            .with_context(|| format!("stop {}/{}", session.respondent(), session.session_label()))?;
        self.report.sessions_closed += 1;
        self.report.last_summary = Some(summary.clone());
        Ok(Some(summary))
    }
}

fn reject_start(stream: &mut TcpStream, err: EngagementError) -> Result<()> {
    let (status, body) = match &err {
        EngagementError::InvalidIdentifier { .. } => (400, r#"{"error":"invalid_identifier"}"#),
        EngagementError::DirectoryConflict(_) => (409, r#"{"error":"session_locked"}"#),
        _ => (500, r#"{"error":"start_failed"}"#),
    };
    write_json_response(stream, status, body)?;
    Err(err.into())
}
