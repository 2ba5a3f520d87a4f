//! Collector service.
//!
//! Accepts forwarded results from any number of monitors and appends them to
//! per-session metadata CSVs:
//!
//! - `POST /upload_result`: body is a [`ResultPayload`]; replies `{"status":"ok"}`
//! - `GET /check_results?responden=..&sesi=..`: per-level counts and percentages
//! - `GET /health`
//!
//! With `global_log` set, every accepted row is also appended to
//! `<root>/logs/engagement_log.csv`.
//!
//! When a WebSocket address is configured, a second listener accepts one JSON
//! text frame per result and acknowledges each with `{"status":"ok"}`.
//!
//! Requests are served one at a time on the accept thread, so appends to a
//! session CSV never interleave.

pub(crate) mod http;
mod store;
mod ws;

use anyhow::{anyhow, Context, Result};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::CollectorConfig;
use crate::forward::ResultPayload;

use http::{read_request, write_json_response, write_response, HttpRequest};

pub use store::{MetadataStore, ResultsReport, GLOBAL_LOG_FILE, METADATA_FILE, METADATA_HEADER};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct CollectorHandle {
    pub addr: SocketAddr,
    pub ws_addr: Option<SocketAddr>,
    shutdown: Arc<AtomicBool>,
    joins: Vec<JoinHandle<()>>,
}

impl CollectorHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut panicked = false;
        for join in self.joins.drain(..) {
            panicked |= join.join().is_err();
        }
        if panicked {
            return Err(anyhow!("collector thread panicked"));
        }
        Ok(())
    }
}

pub struct CollectorServer {
    cfg: CollectorConfig,
}

impl CollectorServer {
    pub fn new(cfg: CollectorConfig) -> Self {
        Self { cfg }
    }

    /// Bind the listeners and serve on background threads.
    pub fn spawn(self) -> Result<CollectorHandle> {
        self.cfg.validate()?;
        std::fs::create_dir_all(&self.cfg.root)
            .with_context(|| format!("create collector root {}", self.cfg.root.display()))?;
        let store = MetadataStore::new(self.cfg.root.clone()).with_global_log(self.cfg.global_log);
        let shutdown = Arc::new(AtomicBool::new(false));

        let listener = bind(&self.cfg.addr)?;
        let addr = listener.local_addr()?;
        let mut joins = Vec::new();

        let ws_addr = match &self.cfg.ws_addr {
            Some(ws_addr) => {
                let ws_listener = bind(ws_addr)?;
                let bound = ws_listener.local_addr()?;
                let ws_store = store.clone();
                let ws_shutdown = shutdown.clone();
                joins.push(std::thread::spawn(move || {
                    if let Err(err) = ws::run_ws(ws_listener, ws_store, ws_shutdown) {
                        log::error!("collector websocket listener stopped: {}", err);
                    }
                }));
                log::info!("collector websocket listening on {}", bound);
                Some(bound)
            }
            None => None,
        };

        let http_shutdown = shutdown.clone();
        joins.push(std::thread::spawn(move || {
            if let Err(err) = run_http(listener, store, http_shutdown) {
                log::error!("collector stopped: {}", err);
            }
        }));
        log::info!(
            "collector listening on {} (root {})",
            addr,
            self.cfg.root.display()
        );

        Ok(CollectorHandle {
            addr,
            ws_addr,
            shutdown,
            joins,
        })
    }
}

fn bind(addr: &str) -> Result<TcpListener> {
    let configured: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid listen address '{}'", addr))?;
    let listener =
        TcpListener::bind(configured).with_context(|| format!("bind collector on {}", addr))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn run_http(listener: TcpListener, store: MetadataStore, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = handle_connection(stream, &store) {
                    log::warn!("collector request from {} rejected: {}", peer, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, store: &MetadataStore) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(http::READ_TIMEOUT))?;
    let request = match read_request(&mut stream, http::MAX_BODY_BYTES) {
        Ok(request) => request,
        Err(err) => {
            write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#)?;
            return Err(err);
        }
    };

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        ("POST", "/upload_result") => upload_result(&mut stream, store, &request),
        ("GET", "/check_results") => check_results(&mut stream, store, &request),
        (_, "/health" | "/upload_result" | "/check_results") => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn upload_result(stream: &mut TcpStream, store: &MetadataStore, request: &HttpRequest) -> Result<()> {
    let payload: ResultPayload = match serde_json::from_slice(&request.body) {
        Ok(payload) => payload,
        Err(err) => {
            write_json_response(stream, 400, r#"{"error":"invalid_payload"}"#)?;
            return Err(anyhow!("invalid result payload: {}", err));
        }
    };
    match store.append(&payload) {
        Ok(_) => write_json_response(stream, 200, r#"{"status":"ok"}"#),
        Err(err) => {
            write_json_response(stream, 400, r#"{"error":"rejected"}"#)?;
            Err(err)
        }
    }
}

fn check_results(stream: &mut TcpStream, store: &MetadataStore, request: &HttpRequest) -> Result<()> {
    let (Some(respondent), Some(session)) =
        (request.query_param("responden"), request.query_param("sesi"))
    else {
        return write_json_response(
            stream,
            400,
            r#"{"error":"missing 'responden' or 'sesi' parameters"}"#,
        );
    };
    if let Err(err) = store.session_csv(respondent, session) {
        write_json_response(stream, 400, r#"{"error":"invalid_identifier"}"#)?;
        return Err(err);
    }
    match store.report(respondent, session) {
        Ok(Some(report)) => {
            let body = serde_json::to_vec(&report)?;
            write_response(stream, 200, "application/json", &body)
        }
        Ok(None) => write_json_response(stream, 404, r#"{"error":"file not found"}"#),
        Err(err) => {
            write_json_response(stream, 500, r#"{"error":"internal"}"#)?;
            Err(err)
        }
    }
}
