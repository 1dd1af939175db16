//! Dispatcher: the accept-and-pair loop (§4.5).
//!
//! Accepts on the listening socket until global stop, pairs each accepted
//! peer into a [`Game`] (first-fit), spawns its [`crate::session`] worker,
//! and runs the reaper between accept attempts. Reaping is Dispatcher-only
//! by construction: nothing else holds a `&Registry`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::constants::{MAX_CLIENTS, MAX_GAMES};
use crate::frame::{Frame, SegmentType};
use crate::registry::Registry;

/// Runs the accept loop until `global_stop` is signaled, then drains: stops
/// accepting, waits for every peer to disconnect, reaps one final time, and
/// returns.
pub async fn run(listener: TcpListener, registry: Arc<Registry>, mut global_stop: watch::Receiver<bool>) -> Result<()> {
    loop {
        tokio::select! {
            changed = global_stop.changed() => {
                if changed.is_err() || *global_stop.borrow() {
                    log::info!("dispatcher: shutdown signaled, draining");
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        handle_accept(stream, addr, &registry, global_stop.clone()).await;
                    }
                    Err(e) => {
                        // EAGAIN is the expected case between clients on a
                        // non-blocking listener; EMFILE and friends are
                        // logged and retried after a short sleep (§4.5).
                        log::warn!("dispatcher: accept failed: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }

        registry.reap().await;
    }

    drain(&registry).await;
    registry.reap().await;
    Ok(())
}

async fn handle_accept(stream: TcpStream, addr: std::net::SocketAddr, registry: &Arc<Registry>, global_stop: watch::Receiver<bool>) {
    if registry.peer_count() >= MAX_CLIENTS * MAX_GAMES {
        log::warn!("dispatcher: capacity exceeded, rejecting {addr}");
        reject_over_capacity(stream).await;
        return;
    }

    let Some(game) = registry.find_or_create_game().await else {
        log::warn!("dispatcher: no free game slot, rejecting {addr}");
        reject_over_capacity(stream).await;
        return;
    };

    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let slot = game.attach(addr, frame_tx).await;
    registry.increment_peer_count();
    log::info!("dispatcher: {addr} attached to game {} slot {slot}", game.id);

    let registry = Arc::clone(registry);
    tokio::spawn(crate::session::run(stream, addr, game, slot, frame_rx, registry, global_stop));
}

async fn reject_over_capacity(stream: TcpStream) {
    use tokio::io::AsyncWriteExt;
    let frame = Frame::single(SegmentType::Err, "game limit reached");
    let mut stream = stream;
    let _ = stream.write_all(&frame.encode()).await;
    let _ = stream.shutdown().await;
}

/// Spin until every peer has disconnected (workers observe `global_stop` and
/// exit on their next multiplex tick).
async fn drain(registry: &Arc<Registry>) {
    while registry.peer_count() > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}

/// Bind a non-blocking TCP listener on `0.0.0.0:<port>`, per §6's broker CLI
/// contract.
pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = format!("0.0.0.0:{port}");
    TcpListener::bind(&addr).await.with_context(|| format!("failed to bind {addr}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn spawn_dispatcher() -> (Arc<Registry>, watch::Sender<bool>, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(Registry::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        let registry_clone = Arc::clone(&registry);
        tokio::spawn(async move {
            let _ = run(listener, registry_clone, stop_rx).await;
        });
        (registry, stop_tx, addr)
    }

    #[tokio::test]
    async fn two_peers_are_paired_into_one_game() {
        let (registry, _stop_tx, addr) = spawn_dispatcher().await;

        let mut c1 = TcpStream::connect(addr).await.unwrap();
        let mut c2 = TcpStream::connect(addr).await.unwrap();

        // Both should receive FLG_DIR once paired.
        let mut buf = [0u8; 256];
        let n1 = c1.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n1]).contains("FLG_DIR"));
        let n2 = c2.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n2]).contains("FLG_DIR"));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(registry.peer_count(), 2);
    }

    #[tokio::test]
    async fn premature_cmd_before_pairing_gets_wait_error() {
        let (_registry, _stop_tx, addr) = spawn_dispatcher().await;
        let mut c1 = TcpStream::connect(addr).await.unwrap();

        let cmd = Frame::single(SegmentType::Cmd, "ls").encode();
        c1.write_all(&cmd).await.unwrap();

        let mut buf = [0u8; 256];
        let n = c1.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).contains("Wait for second client"));
    }
}
