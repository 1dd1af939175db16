//! Session worker: the per-peer read/dispatch loop (§4.4).
//!
//! Each accepted socket gets one Session worker. It owns the read half,
//! decodes frames via [`FrameDecoder`], drives the attached [`Game`]'s state
//! machine, and relies on a sibling write task (fed by an unbounded channel)
//! for outbound traffic — mirroring the teacher's `read_loop`/`write_loop`
//! split in `socket/client_conn.rs`, adapted from Unix-domain to TCP.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;

use crate::constants::{FRAME_BUFFER, TIMEOUT_SEC};
use crate::error::ErrorKind;
use crate::frame::{FrameDecoder, SegmentType};
use crate::game::{FlgOutcome, Game, SlotIndex};
use crate::registry::Registry;

/// Drive one peer's connection until it disconnects or shutdown is signaled.
///
/// `frame_rx` is the receiving end of the channel `frame_tx` handed to
/// [`Game::attach`] for this slot; this function spawns the write task that
/// drains it.
pub async fn run(
    stream: TcpStream,
    addr: SocketAddr,
    game: Arc<Game>,
    slot: SlotIndex,
    frame_rx: UnboundedReceiver<Vec<u8>>,
    registry: Arc<Registry>,
    global_stop: watch::Receiver<bool>,
) {
    let (mut read_half, write_half) = stream.into_split();
    let write_handle = tokio::spawn(write_loop(addr, write_half, frame_rx));

    let mut stop_rx = game.subscribe_stop();
    let mut global_stop = global_stop;
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; FRAME_BUFFER];

    // Only a peer-initiated close (EOF or a read error) warrants this
    // worker notifying the opponent via `Game::disconnect`. A win, a
    // setup-abuse drop, and global shutdown each already drive their own
    // teardown/notification (or deliberately send none); falling through
    // to an unconditional `disconnect()` after any of those would emit a
    // second, spec-unspecified notification.
    let mut peer_initiated_close = false;

    'session: loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    log::debug!("session {addr}: per-game stop observed");
                    break 'session;
                }
            }
            changed = global_stop.changed() => {
                if changed.is_err() || *global_stop.borrow() {
                    log::debug!("session {addr}: global stop observed");
                    break 'session;
                }
            }
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        log::info!("session {addr}: peer closed");
                        peer_initiated_close = true;
                        break 'session;
                    }
                    Ok(n) => {
                        match decoder.feed(&buf[..n]) {
                            Ok(frames) => {
                                let mut abused = false;
                                for frame in frames {
                                    log::info!("session {addr}: accepted frame with {} segment(s)", frame.segments.len());
                                    if dispatch_frame(&game, slot, frame).await == Disposition::Abuse {
                                        abused = true;
                                        break;
                                    }
                                }
                                if abused {
                                    log::warn!("session {addr}: setup abuse ({:?}), dropping peer", ErrorKind::SetupAbuse);
                                    game.drop_peer_for_setup_abuse(slot).await;
                                    break 'session;
                                }
                            }
                            Err(e) => {
                                let kind = ErrorKind::from_frame_error(&e);
                                log::warn!("session {addr}: malformed frame ({e}, {kind:?}), resynchronizing");
                                decoder.recover();
                            }
                        }
                    }
                    Err(e) => {
                        let kind = ErrorKind::from_io(&e);
                        log::warn!("session {addr}: read error ({e}, {kind:?})");
                        peer_initiated_close = true;
                        break 'session;
                    }
                }
            }
            () = tokio::time::sleep(TIMEOUT_SEC) => {
                // Bound shutdown latency: re-check both stop signals above
                // on the next loop iteration instead of blocking forever on
                // a quiet socket.
            }
        }
    }

    if peer_initiated_close {
        game.disconnect(slot).await;
    } else {
        // A win, the opponent's disconnect, the opponent's setup-abuse
        // drop, or global shutdown already decided the Game's fate (and
        // sent whatever notification that fate calls for); this worker
        // just finishes clearing its own slot so the Game becomes
        // reapable.
        game.clear_slot(slot).await;
    }
    registry.decrement_peer_count();
    write_handle.abort();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Continue,
    Abuse,
}

async fn dispatch_frame(game: &Arc<Game>, slot: SlotIndex, frame: crate::frame::Frame) -> Disposition {
    for segment in frame.segments {
        match segment.ty {
            SegmentType::Flg => {
                if game.handle_flg(slot, &segment.data).await == FlgOutcome::SetupAbuse {
                    return Disposition::Abuse;
                }
            }
            SegmentType::Cmd => {
                let command = String::from_utf8_lossy(&segment.data);
                game.handle_cmd(slot, &command).await;
            }
            SegmentType::Key => {
                game.handle_key(slot, &segment.data).await;
            }
            // OUT/CWD/ERR arrive only broker-to-peer in this protocol;
            // a peer sending one back is silently ignored (§4.4 point 4).
            SegmentType::Out | SegmentType::Cwd | SegmentType::Err => {}
        }
    }
    Disposition::Continue
}

async fn write_loop(
    addr: SocketAddr,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut frame_rx: UnboundedReceiver<Vec<u8>>,
) {
    while let Some(bytes) = frame_rx.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            log::warn!("session {addr}: write error: {e}");
            break;
        }
    }
}
