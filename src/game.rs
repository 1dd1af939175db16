//! Per-session state machine: `WAIT_PEER` → `SETUP` → `PLAY` → `TERMINAL`.
//!
//! A `Game` pairs at most two peers. The slot array, peer count, terminal
//! flag, and per-peer setup state all live behind one [`tokio::sync::Mutex`]
//! so every mutation is a single critical section — no dual-mutex
//! double-unlock hazard. Reaping (freeing the slot) is owned exclusively by
//! the Dispatcher; a `Game` only ever transitions itself to `Terminal`.

use std::fmt;
use std::net::SocketAddr;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{watch, Mutex};

use crate::constants::{MAX_CLIENTS, MAX_FLAG_TRIES};
use crate::frame::{Frame, SegmentType};
use crate::policy;

/// A peer's index within a [`Game`]'s fixed two-slot array.
pub type SlotIndex = usize;

/// The Game's coarse lifecycle phase (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Fewer than two peers attached.
    WaitPeer,
    /// Both peers attached; running the flag-handshake.
    Setup,
    /// Both peers' setup is complete; command/flag traffic is live.
    Play,
    /// The game is over; awaiting reap.
    Terminal,
}

/// One connected peer's record within a Game.
pub struct PeerSlot {
    pub addr: SocketAddr,
    /// Pre-encoded frame bytes queued for this peer's write task.
    frame_tx: UnboundedSender<Vec<u8>>,
    /// The 31-char secret token assigned to *this* peer (the opponent must
    /// discover and submit it to win).
    pub token: String,
    pub dir_ack: bool,
    pub token_ack: bool,
    pub flag_tries: u32,
}

impl fmt::Debug for PeerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSlot")
            .field("addr", &self.addr)
            .field("dir_ack", &self.dir_ack)
            .field("token_ack", &self.token_ack)
            .field("flag_tries", &self.flag_tries)
            .finish_non_exhaustive()
    }
}

/// The outcome of feeding a `FLG` segment to the setup/win state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlgOutcome {
    /// Setup is still in progress; nothing further to do.
    Continue,
    /// The sender just won the game (opponent's token matched).
    Won,
    /// `MAX_FLAG_TRIES` consecutive setup errors; the sender's slot should
    /// be torn down.
    SetupAbuse,
}

struct Inner {
    peers: [Option<PeerSlot>; MAX_CLIENTS],
    count: usize,
    phase: Phase,
}

/// A two-player session, shared between its Session workers.
pub struct Game {
    pub id: usize,
    inner: Mutex<Inner>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl fmt::Debug for Game {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Game").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Game {
    /// Create an empty game (`WAIT_PEER`, no peers attached).
    pub fn new(id: usize) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            id,
            inner: Mutex::new(Inner { peers: std::array::from_fn(|_| None), count: 0, phase: Phase::WaitPeer }),
            stop_tx,
            stop_rx,
        }
    }

    /// A receiver that resolves once this Game's stop signal has been sent.
    /// Session workers hold their own clone and multiplex it alongside the
    /// socket read and the 1-second timer.
    pub fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop_rx.clone()
    }

    /// Signal this Game's one-shot stop channel. Idempotent: sending it a
    /// second time has the same effect as sending it once.
    fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Current peer count (0, 1, or 2).
    pub async fn count(&self) -> usize {
        self.inner.lock().await.count
    }

    /// True once this Game has transitioned to `Terminal` and every peer
    /// has detached (the Dispatcher's reap precondition).
    pub async fn is_reapable(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.phase == Phase::Terminal && inner.count == 0
    }

    /// True if this Game has a free slot and is not terminal — the
    /// Dispatcher's first-fit pairing test.
    pub async fn accepts_new_peer(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.phase != Phase::Terminal && inner.count < MAX_CLIENTS
    }

    /// Attach a new peer to the first empty slot. Returns the slot index.
    ///
    /// Transitions `WAIT_PEER` → `SETUP` and sends the `FLG:FLG_DIR` prompt
    /// to both peers the moment the second one attaches.
    pub async fn attach(&self, addr: SocketAddr, frame_tx: UnboundedSender<Vec<u8>>) -> SlotIndex {
        let mut inner = self.inner.lock().await;
        let slot = inner.peers.iter().position(Option::is_none).expect("attach called on a full game");
        inner.peers[slot] = Some(PeerSlot {
            addr,
            frame_tx,
            token: String::new(),
            dir_ack: false,
            token_ack: false,
            flag_tries: 0,
        });
        inner.count += 1;

        if inner.count == MAX_CLIENTS {
            inner.phase = Phase::Setup;
            for slot in inner.peers.iter().flatten() {
                send_frame(slot, Frame::single(SegmentType::Flg, "FLG_DIR"));
            }
        }
        slot
    }

    /// Handle a `CMD` segment from `from`. Forwards to the opponent if
    /// allowed by Policy and both peers have completed setup; otherwise
    /// replies `ERR` to the sender only.
    pub async fn handle_cmd(&self, from: SlotIndex, command: &str) {
        let mut inner = self.inner.lock().await;
        if inner.phase != Phase::Play {
            if let Some(sender) = inner.peers[from].as_ref() {
                send_frame(
                    sender,
                    Frame::single(SegmentType::Err, "Wait for second client to connect"),
                );
            }
            return;
        }

        if policy::check_command(command) {
            let opponent = opponent_index(from);
            if let Some(opponent) = inner.peers[opponent].as_ref() {
                send_frame(opponent, Frame::single(SegmentType::Cmd, command));
            }
        } else if let Some(sender) = inner.peers[from].as_ref() {
            send_frame(sender, Frame::single(SegmentType::Err, "command not allowed"));
        }
    }

    /// Forward a `KEY` segment verbatim to the opponent, in any phase. The
    /// broker never interprets the payload of the transport-encryption
    /// handshake.
    pub async fn handle_key(&self, from: SlotIndex, data: &[u8]) {
        let inner = self.inner.lock().await;
        let opponent = opponent_index(from);
        if let Some(opponent) = inner.peers[opponent].as_ref() {
            send_frame(
                opponent,
                Frame { segments: vec![crate::frame::Segment { ty: SegmentType::Key, data: data.to_vec() }] },
            );
        }
    }

    /// Feed a `FLG` segment from `from` into the setup sub-FSM, or — once
    /// in `PLAY` — check it against the opponent's stored token for a win.
    pub async fn handle_flg(&self, from: SlotIndex, data: &[u8]) -> FlgOutcome {
        let mut inner = self.inner.lock().await;

        if inner.phase == Phase::Play {
            let opponent = opponent_index(from);
            let won = inner.peers[opponent].as_ref().is_some_and(|o| o.token.as_bytes() == data);
            if won {
                if let Some(winner) = inner.peers[from].as_ref() {
                    send_frame(winner, Frame::single(SegmentType::Out, "\nyou won!\n"));
                }
                if let Some(loser) = inner.peers[opponent].as_ref() {
                    send_frame(loser, Frame::single(SegmentType::Out, "\nyou lost ):\n"));
                }
                // The Win row sends only the two OUT frames above — no
                // disconnect notification — but the Game still needs to
                // become reapable without waiting on either peer's own
                // socket to close.
                inner.peers = std::array::from_fn(|_| None);
                inner.count = 0;
                inner.phase = Phase::Terminal;
                drop(inner);
                self.signal_stop();
                return FlgOutcome::Won;
            }
            return FlgOutcome::Continue;
        }

        if inner.phase != Phase::Setup {
            return FlgOutcome::Continue;
        }

        let body = String::from_utf8_lossy(data).into_owned();
        let Some(peer) = inner.peers[from].as_mut() else { return FlgOutcome::Continue };

        if !peer.dir_ack {
            // First reply to FLG_DIR: a reported directory path.
            if policy::check_path_segment(&body) {
                let token = policy::new_secret_token();
                let command = format!("echo '{token}' > {body}/flag.txt");
                peer.token = token;
                peer.dir_ack = true;
                send_frame(peer, Frame::single(SegmentType::Flg, command));
            } else {
                peer.flag_tries += 1;
                if peer.flag_tries > MAX_FLAG_TRIES {
                    return FlgOutcome::SetupAbuse;
                }
                send_frame(peer, Frame::single(SegmentType::Flg, "FLG_DIR"));
            }
            return FlgOutcome::Continue;
        }

        match body.as_str() {
            "okay" => {
                peer.token_ack = true;
                let both_ready = inner.peers.iter().flatten().all(|p| p.token_ack);
                if both_ready {
                    inner.phase = Phase::Play;
                }
                FlgOutcome::Continue
            }
            _ => {
                // Any FLG:error (or unrecognized reply) resets both acks
                // and re-prompts, preserving the source's defensive
                // (not buggy) progress-losing reset.
                peer.dir_ack = false;
                peer.token_ack = false;
                peer.flag_tries += 1;
                if peer.flag_tries > MAX_FLAG_TRIES {
                    return FlgOutcome::SetupAbuse;
                }
                send_frame(peer, Frame::single(SegmentType::Flg, "FLG_DIR"));
                FlgOutcome::Continue
            }
        }
    }

    /// A peer's socket closed on its own (EOF or a read error). Notify the
    /// survivor, drop the slot, and transition to `Terminal`.
    ///
    /// Guarded against an already-`Terminal` Game: a win, a setup-abuse
    /// drop, or a global-shutdown teardown may have already finished this
    /// Game by the time the peer's own socket close is observed, and none
    /// of those three rows in the transition table call for a further
    /// disconnect notification.
    pub async fn disconnect(&self, slot: SlotIndex) {
        let mut inner = self.inner.lock().await;
        if inner.phase == Phase::Terminal {
            return;
        }
        let opponent = opponent_index(slot);
        if let Some(survivor) = inner.peers[opponent].as_ref() {
            send_frame(survivor, Frame::single(SegmentType::Err, "\nSecond client disconnected ):\n"));
        }
        inner.peers[slot] = None;
        inner.count = inner.count.saturating_sub(1);
        inner.phase = Phase::Terminal;
        drop(inner);
        self.signal_stop();
    }

    /// Drop a specific peer for setup abuse (>5 `FLG` errors).
    ///
    /// Unlike [`Self::disconnect`], this sends no notification to the
    /// opponent — the setup-abuse row in the transition table calls for
    /// "drop that peer" only, with no notify action.
    pub async fn drop_peer_for_setup_abuse(&self, slot: SlotIndex) {
        let mut inner = self.inner.lock().await;
        if inner.phase == Phase::Terminal {
            return;
        }
        inner.peers[slot] = None;
        inner.count = inner.count.saturating_sub(1);
        inner.phase = Phase::Terminal;
        drop(inner);
        self.signal_stop();
    }

    /// Remove this slot's own bookkeeping after its Session worker observed
    /// the stop signal for a reason it didn't itself cause — the opponent's
    /// disconnect, the opponent's setup-abuse drop, a win, or a global
    /// shutdown already decided the Game's fate and sent whatever
    /// notification that fate calls for (if any). This only finishes the
    /// accounting so the Game becomes reapable once every worker has
    /// called in; it never sends a frame or changes `phase` itself.
    pub async fn clear_slot(&self, slot: SlotIndex) {
        let mut inner = self.inner.lock().await;
        if inner.peers[slot].is_some() {
            inner.peers[slot] = None;
            inner.count = inner.count.saturating_sub(1);
        }
    }

    /// The final worker to observe `count == 0` after global shutdown
    /// finishes tearing the game down. Dispatcher calls this once the
    /// drain completes so the Game is eligible for reaping even if no
    /// peer ever disconnected "naturally".
    pub async fn force_terminal(&self) {
        let mut inner = self.inner.lock().await;
        inner.phase = Phase::Terminal;
        inner.count = 0;
        inner.peers = std::array::from_fn(|_| None);
        drop(inner);
        self.signal_stop();
    }

}

fn opponent_index(slot: SlotIndex) -> SlotIndex {
    (slot + 1) % MAX_CLIENTS
}

fn send_frame(peer: &PeerSlot, frame: Frame) {
    // An unbounded channel send only fails if the peer's write task has
    // already exited (socket closed); the Session worker will observe the
    // same closure on its next read and tear the slot down.
    let _ = peer.frame_tx.send(frame.encode());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn attach_transitions_to_setup_and_prompts_both_peers() {
        let game = Game::new(0);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        let slot1 = game.attach(addr(1), tx1).await;
        assert_eq!(game.count().await, 1);
        assert!(rx1.try_recv().is_err());

        let slot2 = game.attach(addr(2), tx2).await;
        assert_ne!(slot1, slot2);
        assert_eq!(game.count().await, 2);

        let msg1 = rx1.try_recv().unwrap();
        let msg2 = rx2.try_recv().unwrap();
        assert!(String::from_utf8_lossy(&msg1).contains("FLG_DIR"));
        assert!(String::from_utf8_lossy(&msg2).contains("FLG_DIR"));
    }

    #[tokio::test]
    async fn cmd_before_second_peer_is_rejected() {
        let game = Game::new(0);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let slot1 = game.attach(addr(1), tx1).await;
        let _ = rx1.try_recv(); // FLG_DIR not sent yet (only one peer)

        game.handle_cmd(slot1, "ls").await;
        let msg = rx1.try_recv().unwrap();
        assert!(String::from_utf8_lossy(&msg).contains("Wait for second client"));
    }

    #[tokio::test]
    async fn setup_handshake_then_play_then_win() {
        let game = Game::new(0);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let slot1 = game.attach(addr(1), tx1).await;
        let slot2 = game.attach(addr(2), tx2).await;
        let _ = rx1.try_recv();
        let _ = rx2.try_recv();

        // Peer 1 reports a directory.
        let outcome = game.handle_flg(slot1, b"/tmp/abc").await;
        assert_eq!(outcome, FlgOutcome::Continue);
        let flag_cmd_1 = rx1.try_recv().unwrap();
        assert!(String::from_utf8_lossy(&flag_cmd_1).contains("/tmp/abc/flag.txt"));

        let outcome = game.handle_flg(slot2, b"/tmp/def").await;
        assert_eq!(outcome, FlgOutcome::Continue);
        let flag_cmd_2 = rx2.try_recv().unwrap();
        assert!(String::from_utf8_lossy(&flag_cmd_2).contains("/tmp/def/flag.txt"));

        game.handle_flg(slot1, b"okay").await;
        game.handle_flg(slot2, b"okay").await;

        // Now in PLAY: CMD should forward.
        game.handle_cmd(slot1, "ls /tmp/def").await;
        let forwarded = rx2.try_recv().unwrap();
        assert!(String::from_utf8_lossy(&forwarded).contains("ls /tmp/def"));

        // Extract peer 2's token from its flag-write command to submit it.
        let flag_cmd_2_str = String::from_utf8_lossy(&flag_cmd_2).to_string();
        let token_start = flag_cmd_2_str.find("echo '").unwrap() + "echo '".len();
        let token_end = flag_cmd_2_str[token_start..].find('\'').unwrap() + token_start;
        let token = &flag_cmd_2_str[token_start..token_end];

        let outcome = game.handle_flg(slot1, token.as_bytes()).await;
        assert_eq!(outcome, FlgOutcome::Won);

        let win_msg = rx1.try_recv().unwrap();
        assert!(String::from_utf8_lossy(&win_msg).contains("you won"));
        let lose_msg = rx2.try_recv().unwrap();
        assert!(String::from_utf8_lossy(&lose_msg).contains("you lost"));
    }

    #[tokio::test]
    async fn setup_abuse_after_six_errors() {
        let game = Game::new(0);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let slot1 = game.attach(addr(1), tx1).await;
        game.attach(addr(2), tx2).await;
        let _ = rx1.try_recv();

        let mut outcome = FlgOutcome::Continue;
        for _ in 0..6 {
            outcome = game.handle_flg(slot1, b"error").await;
            if outcome == FlgOutcome::SetupAbuse {
                break;
            }
        }
        assert_eq!(outcome, FlgOutcome::SetupAbuse);
    }

    #[tokio::test]
    async fn disconnect_notifies_survivor_and_marks_terminal() {
        let game = Game::new(0);
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let slot1 = game.attach(addr(1), tx1).await;
        game.attach(addr(2), tx2).await;
        let _ = rx2.try_recv();

        game.disconnect(slot1).await;
        let msg = rx2.try_recv().unwrap();
        assert!(String::from_utf8_lossy(&msg).contains("disconnected"));
        // Terminal immediately, but not reapable until the survivor's own
        // worker clears its slot too (the Session worker's job, not
        // `disconnect`'s).
        assert_eq!(game.count().await, 1);
        assert!(!game.is_reapable().await);

        game.clear_slot(1).await;
        assert!(game.is_reapable().await);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_does_not_double_notify() {
        let game = Game::new(0);
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let slot1 = game.attach(addr(1), tx1).await;
        game.attach(addr(2), tx2).await;
        let _ = rx2.try_recv();

        game.disconnect(slot1).await;
        let _ = rx2.try_recv().unwrap();

        game.disconnect(slot1).await;
        assert!(rx2.try_recv().is_err(), "a second disconnect() call must not notify again");
    }

    #[tokio::test]
    async fn setup_abuse_drop_sends_no_disconnect_notification() {
        let game = Game::new(0);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let slot1 = game.attach(addr(1), tx1).await;
        game.attach(addr(2), tx2).await;
        let _ = rx1.try_recv();
        let _ = rx2.try_recv();

        game.drop_peer_for_setup_abuse(slot1).await;

        assert!(rx2.try_recv().is_err(), "setup-abuse drop must not notify the opponent");
        assert_eq!(game.count().await, 1);
        assert!(!game.is_reapable().await, "not reapable until the opponent's worker clears its own slot too");

        game.clear_slot(1).await;
        assert!(game.is_reapable().await);
    }

    #[tokio::test]
    async fn win_does_not_trigger_a_disconnect_notification() {
        let game = Game::new(0);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let slot1 = game.attach(addr(1), tx1).await;
        let slot2 = game.attach(addr(2), tx2).await;
        let _ = rx1.try_recv();
        let _ = rx2.try_recv();

        game.handle_flg(slot1, b"/tmp/abc").await;
        let flag_cmd_1 = rx1.try_recv().unwrap();
        game.handle_flg(slot2, b"/tmp/def").await;
        let _ = rx2.try_recv();
        game.handle_flg(slot1, b"okay").await;
        game.handle_flg(slot2, b"okay").await;

        let flag_cmd_1_str = String::from_utf8_lossy(&flag_cmd_1).to_string();
        let token_start = flag_cmd_1_str.find("echo '").unwrap() + "echo '".len();
        let token_end = flag_cmd_1_str[token_start..].find('\'').unwrap() + token_start;
        let token_1 = flag_cmd_1_str[token_start..token_end].as_bytes().to_vec();

        let outcome = game.handle_flg(slot2, &token_1).await;
        assert_eq!(outcome, FlgOutcome::Won);

        let win_msg = rx2.try_recv().unwrap();
        assert!(String::from_utf8_lossy(&win_msg).contains("you won"));
        let lose_msg = rx1.try_recv().unwrap();
        assert!(String::from_utf8_lossy(&lose_msg).contains("you lost"));

        // The per-Game stop signal fired, but `Game::disconnect` itself was
        // never called for this Win — no further "disconnected" frame
        // should be queued for either peer.
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
        assert!(game.is_reapable().await);
    }

    #[tokio::test]
    async fn stop_signal_is_idempotent() {
        let game = Game::new(0);
        game.signal_stop();
        game.signal_stop();
        let mut rx = game.subscribe_stop();
        assert!(*rx.borrow_and_update());
    }

    #[tokio::test]
    async fn token_equality_with_trailing_whitespace_does_not_win() {
        let game = Game::new(0);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let slot1 = game.attach(addr(1), tx1).await;
        let slot2 = game.attach(addr(2), tx2).await;
        let _ = rx1.try_recv();
        let _ = rx2.try_recv();

        game.handle_flg(slot1, b"/tmp/abc").await;
        let flag_cmd_1 = rx1.try_recv().unwrap();
        game.handle_flg(slot2, b"/tmp/def").await;
        let _ = rx2.try_recv();
        game.handle_flg(slot1, b"okay").await;
        game.handle_flg(slot2, b"okay").await;

        let flag_cmd_1_str = String::from_utf8_lossy(&flag_cmd_1).to_string();
        let token_start = flag_cmd_1_str.find("echo '").unwrap() + "echo '".len();
        let token_end = flag_cmd_1_str[token_start..].find('\'').unwrap() + token_start;
        let token = &flag_cmd_1_str[token_start..token_end];
        let mut with_newline = token.as_bytes().to_vec();
        with_newline.push(b'\n');

        let outcome = game.handle_flg(slot2, &with_newline).await;
        assert_eq!(outcome, FlgOutcome::Continue, "trailing newline must not match");
    }
}
