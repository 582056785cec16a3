use crate::backend::{self, Backend};
use crate::config::Config;
use crate::error::Result;
use crate::protocol::{Frame, OP_SEND, decode_json_object, decode_send, encode_reply, read_frame};
use crate::reply::Reply;
use crate::router::Persistor;
use crate::stream::{Outcome, StreamSession};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

static REQ_ID: AtomicI32 = AtomicI32::new(1);

fn next_request_id() -> i32 {
    loop {
        let id = REQ_ID.fetch_add(1, Ordering::Relaxed);
        if id > 0 {
            return id;
        }
        // Wrapped; skip 0 and negatives, which mean "not a reply".
        let _ = REQ_ID.compare_exchange(id.wrapping_add(1), 1, Ordering::Relaxed, Ordering::Relaxed);
    }
}

/// A streaming session waiting for its continuation.
struct Parked {
    session: StreamSession,
    deadline: Instant,
}

/// Connect the configured backend and serve until Ctrl-C.
pub async fn run(cfg: Config) -> Result<()> {
    let backend = backend::connect(&cfg.backend).await?;
    let listener = TcpListener::bind(&cfg.listen_addr).await?;
    let persistor = Arc::new(Persistor::from_config(&cfg, backend));
    tracing::info!(listen_addr = %cfg.listen_addr, address = %cfg.address, "docbus listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; shutting down");
            let _ = shutdown_tx.send(true);
        }
    });
    serve(listener, persistor, cfg.max_message_bytes, shutdown_rx).await
}

/// Spawn the server on the configured listen address and run until `shutdown` is signaled.
/// Returns the shared `Persistor`, the bound local address, a shutdown sender, and the task handle.
pub async fn spawn_with_shutdown(
    cfg: Config,
) -> Result<(Arc<Persistor>, SocketAddr, watch::Sender<bool>, JoinHandle<Result<()>>)> {
    let backend = backend::connect(&cfg.backend).await?;
    spawn_with_backend(cfg, backend).await
}

/// Like [`spawn_with_shutdown`], over an already built backend.
pub async fn spawn_with_backend(
    cfg: Config,
    backend: Arc<dyn Backend>,
) -> Result<(Arc<Persistor>, SocketAddr, watch::Sender<bool>, JoinHandle<Result<()>>)> {
    // Allow ephemeral port usage in tests (e.g., 127.0.0.1:0)
    let listener = TcpListener::bind(&cfg.listen_addr).await?;
    let local_addr = listener.local_addr()?;
    let persistor = Arc::new(Persistor::from_config(&cfg, backend));
    tracing::info!(listen_addr = %local_addr, address = %cfg.address, "docbus listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(serve(listener, persistor.clone(), cfg.max_message_bytes, shutdown_rx));
    Ok((persistor, local_addr, shutdown_tx, handle))
}

async fn serve(
    listener: TcpListener,
    persistor: Arc<Persistor>,
    max_message_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut connections = JoinSet::new();
    let result = loop {
        tokio::select! {
            res = listener.accept() => {
                let (socket, addr) = match res {
                    Ok(v) => v,
                    Err(e) => break Err(e.into()),
                };
                tracing::debug!(%addr, "accepted connection");
                let persistor = persistor.clone();
                let shutdown = shutdown.clone();
                connections.spawn(async move {
                    if let Err(e) = serve_connection(persistor, socket, max_message_bytes, shutdown).await {
                        tracing::debug!(error = %format!("{e:?}"), "connection closed with error");
                    }
                });
            }
            Some(res) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = res {
                    tracing::error!(error = %e, "connection task failed");
                }
            }
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break Ok(());
                }
            }
        }
    };

    // Connections observe the same signal and reclaim their sessions.
    while let Some(res) = connections.join_next().await {
        if let Err(e) = res {
            tracing::error!(error = %e, "connection task failed");
        }
    }
    persistor.shutdown().await;
    result
}

/// Serve one bus connection until it closes or `shutdown` is signaled.
/// Sessions parked on the connection are abandoned on the way out.
pub async fn serve_connection<S>(
    persistor: Arc<Persistor>,
    stream: S,
    max_message_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut rd, mut wr) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<Result<Frame>>(16);
    let reader = tokio::spawn(async move {
        loop {
            match read_frame(&mut rd, max_message_bytes).await {
                Ok(Some(frame)) => {
                    if tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });

    let mut sessions: HashMap<i32, Parked> = HashMap::new();
    let result = if *shutdown.borrow() {
        Ok(())
    } else {
        loop {
            let next_deadline = sessions.values().map(|p| p.deadline).min();
            let wake_at = next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                frame = rx.recv() => match frame {
                    None => break Ok(()),
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "closing connection after bad frame");
                        break Err(e);
                    }
                    Some(Ok(frame)) => {
                        if let Err(e) = handle_frame(&persistor, &mut wr, &mut sessions, frame).await {
                            break Err(e);
                        }
                    }
                },
                _ = tokio::time::sleep_until(wake_at), if next_deadline.is_some() => {
                    expire_sessions(&persistor, &mut sessions).await;
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
            }
        }
    };

    reader.abort();
    for (_, parked) in sessions.drain() {
        persistor.abandon(parked.session).await;
    }
    result
}

async fn expire_sessions(persistor: &Persistor, sessions: &mut HashMap<i32, Parked>) {
    let now = Instant::now();
    let expired: Vec<i32> = sessions.iter().filter(|(_, p)| p.deadline <= now).map(|(id, _)| *id).collect();
    for id in expired {
        if let Some(parked) = sessions.remove(&id) {
            tracing::warn!(reply_id = id, collection = %parked.session.collection(), "closing cursor on timeout");
            persistor.abandon(parked.session).await;
        }
    }
}

async fn handle_frame<W: AsyncWrite + Unpin>(
    persistor: &Persistor,
    wr: &mut W,
    sessions: &mut HashMap<i32, Parked>,
    frame: Frame,
) -> Result<()> {
    let hdr = frame.header;
    if hdr.op_code != OP_SEND {
        tracing::warn!(op_code = hdr.op_code, "unsupported op code");
        return Ok(());
    }

    // A deadline that passed while this frame waited in the queue wins over the frame.
    expire_sessions(persistor, sessions).await;

    if hdr.response_to != 0 {
        return match sessions.remove(&hdr.response_to) {
            Some(parked) => {
                let outcome = until_done(persistor, sessions, persistor.resume(parked.session)).await;
                respond(persistor, wr, sessions, outcome, hdr.request_id).await
            }
            None => {
                tracing::debug!(response_to = hdr.response_to, "continuation for no live session; ignoring");
                Ok(())
            }
        };
    }

    let Some((address, json)) = decode_send(&frame.body) else {
        tracing::warn!("malformed OP_SEND body");
        let outcome = Outcome::Done(Reply::error("Malformed request body"));
        return respond(persistor, wr, sessions, outcome, hdr.request_id).await;
    };
    if address != persistor.address() {
        let outcome = Outcome::Done(Reply::error(format!("No handler for address {}", address)));
        return respond(persistor, wr, sessions, outcome, hdr.request_id).await;
    }
    let outcome = match decode_json_object(json) {
        Some(envelope) => until_done(persistor, sessions, persistor.handle(&envelope)).await,
        None => Outcome::Done(Reply::error("Malformed request body")),
    };
    respond(persistor, wr, sessions, outcome, hdr.request_id).await
}

/// Drive `work` to completion while still reclaiming parked sessions whose
/// deadline passes meanwhile. A handler may be waiting on a resource one of
/// those sessions holds.
async fn until_done<F>(persistor: &Persistor, sessions: &mut HashMap<i32, Parked>, work: F) -> Outcome
where
    F: Future<Output = Outcome>,
{
    tokio::pin!(work);
    loop {
        let next_deadline = sessions.values().map(|p| p.deadline).min();
        let wake_at = next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            outcome = &mut work => return outcome,
            _ = tokio::time::sleep_until(wake_at), if next_deadline.is_some() => {
                expire_sessions(persistor, sessions).await;
            }
        }
    }
}

/// Write the reply; a continuing session is parked under the reply's id.
async fn respond<W: AsyncWrite + Unpin>(
    persistor: &Persistor,
    wr: &mut W,
    sessions: &mut HashMap<i32, Parked>,
    outcome: Outcome,
    response_to: i32,
) -> Result<()> {
    let reply_id = next_request_id();
    let (reply, session) = match outcome {
        Outcome::Done(r) => (r, None),
        Outcome::MoreExist(r, s) => (r, Some(s)),
    };
    let written = match encode_reply(&reply.into_value(), response_to, reply_id) {
        Ok(bytes) => wr.write_all(&bytes).await.map_err(Into::into),
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        if let Some(s) = session {
            persistor.abandon(s).await;
        }
        return Err(e);
    }
    if let Some(s) = session {
        let deadline = Instant::now() + s.timeout();
        sessions.insert(reply_id, Parked { session: s, deadline });
    }
    Ok(())
}
