//! The global game registry: a fixed-size collection of [`Game`] slots
//! owned exclusively by the Dispatcher.
//!
//! Grounded on the original source's `acceptedSockets`/`acceptedSocketsCount`
//! global-array-plus-mutex pattern (`server.c::startAcceptingIncomingConnections`),
//! generalized from a flat peer array to an array of game slots, and on the
//! `SharedHubState = Arc<RwLock<HubState>>` ownership shape used for shared
//! mutable state elsewhere in the teacher crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::constants::MAX_GAMES;
use crate::game::Game;

/// Registry of in-flight games, capacity-bounded at [`MAX_GAMES`].
///
/// The registry lock protects the slot array only. Per-Game state lives
/// behind each Game's own lock — lock order is always registry-before-Game,
/// and the Dispatcher only ever holds both at once while reaping.
pub struct Registry {
    slots: Mutex<Vec<Option<Arc<Game>>>>,
    peer_count: AtomicUsize,
    next_id: AtomicUsize,
}

impl Registry {
    /// Build an empty registry with `MAX_GAMES` null slots.
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_GAMES);
        slots.resize_with(MAX_GAMES, || None);
        Self { slots: Mutex::new(slots), peer_count: AtomicUsize::new(0), next_id: AtomicUsize::new(0) }
    }

    /// Total peers currently attached across every game (global invariant:
    /// at most `2 * MAX_GAMES`).
    pub fn peer_count(&self) -> usize {
        self.peer_count.load(Ordering::SeqCst)
    }

    pub fn increment_peer_count(&self) {
        self.peer_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_peer_count(&self) {
        self.peer_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// First-fit: find a game in `WAIT_PEER` (one free slot, not terminal),
    /// or allocate a new one in the first null array slot. Returns `None`
    /// only if the registry is completely full of non-terminal games.
    pub async fn find_or_create_game(&self) -> Option<Arc<Game>> {
        let mut slots = self.slots.lock().await;

        for slot in slots.iter().flatten() {
            if slot.accepts_new_peer().await && slot.count().await == 1 {
                return Some(Arc::clone(slot));
            }
        }

        let free_index = slots.iter().position(Option::is_none)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let game = Arc::new(Game::new(id));
        slots[free_index] = Some(Arc::clone(&game));
        Some(game)
    }

    /// Reap every slot whose game is terminal and empty. Dispatcher-only;
    /// never called from a Session worker (avoids the self-freeing-while-
    /// held hazard named in the design notes). Returns the count reaped.
    pub async fn reap(&self) -> usize {
        let mut slots = self.slots.lock().await;
        let mut reaped = 0;
        for slot in slots.iter_mut() {
            let should_reap = match slot {
                Some(game) => game.is_reapable().await,
                None => false,
            };
            if should_reap {
                *slot = None;
                reaped += 1;
            }
        }
        reaped
    }

    /// Snapshot of every live (non-null) game, for global-shutdown drain
    /// and for signaling every game's stop channel at once.
    pub async fn live_games(&self) -> Vec<Arc<Game>> {
        self.slots.lock().await.iter().flatten().cloned().collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
