//! WebSocket ingest for streaming clients.

use anyhow::Result;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tungstenite::{accept, Message};

use super::{MetadataStore, ACCEPT_POLL};
use crate::forward::ResultPayload;

/// Idle read timeout; lets client threads notice shutdown.
const CLIENT_POLL: Duration = Duration::from_millis(250);

pub(super) fn run_ws(
    listener: TcpListener,
    store: MetadataStore,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut clients = Vec::new();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let store = store.clone();
                let shutdown = shutdown.clone();
                clients.push(std::thread::spawn(move || {
                    log::info!("websocket client {} connected", peer);
                    match serve_client(stream, &store, &shutdown) {
                        Ok(()) => log::info!("websocket client {} disconnected", peer),
                        Err(err) => log::warn!("websocket client {} dropped: {}", peer, err),
                    }
                }));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
        clients.retain(|client: &std::thread::JoinHandle<()>| !client.is_finished());
    }
    for client in clients {
        if client.join().is_err() {
            log::warn!("websocket client thread panicked");
        }
    }
    Ok(())
}

fn serve_client(stream: TcpStream, store: &MetadataStore, shutdown: &AtomicBool) -> Result<()> {
    stream.set_nonblocking(false)?;
    let mut socket = accept(stream).map_err(|err| anyhow::anyhow!("handshake failed: {}", err))?;
    socket.get_ref().set_read_timeout(Some(CLIENT_POLL))?;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            if let Err(err) = socket.close(None) {
                log::debug!("websocket close on shutdown failed: {}", err);
            }
            return Ok(());
        }
        let message = match socket.read() {
            Ok(message) => message,
            Err(tungstenite::Error::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue
            }
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                return Ok(())
            }
            Err(err) => return Err(err.into()),
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Message::Close(_) => return Ok(()),
            _ => continue,
        };
        let reply = match serde_json::from_str::<ResultPayload>(&text) {
            Ok(payload) => match store.append(&payload) {
                Ok(_) => r#"{"status":"ok"}"#.to_string(),
                Err(err) => {
                    log::warn!("websocket result rejected: {}", err);
                    r#"{"status":"error","message":"rejected"}"#.to_string()
                }
            },
            Err(err) => {
                log::warn!("websocket payload invalid: {}", err);
                r#"{"status":"error","message":"invalid_payload"}"#.to_string()
            }
        };
        socket.send(Message::Text(reply))?;
    }
}
