//! Process-wide configuration constants for the CTF broker.
//!
//! This module centralizes the fixed parameters named in the external
//! interface contract so they have a single definition site. Constants are
//! grouped by domain with documentation explaining their purpose.
//!
//! # Categories
//!
//! - **Capacity**: game/peer slot limits
//! - **Wire**: frame sizing limits
//! - **Setup**: flag-handshake retry budget and token shape
//! - **Timing**: worker multiplex timer

use std::time::Duration;

// ============================================================================
// Capacity
// ============================================================================

/// Upper bound on concurrent games held by the registry.
pub const MAX_GAMES: usize = 10;

/// Peers per game. Fixed: the protocol does not generalize past two.
pub const MAX_CLIENTS: usize = 2;

// ============================================================================
// Wire
// ============================================================================

/// Maximum single-read size. Frames must not exceed this many bytes.
pub const FRAME_BUFFER: usize = 4096;

// ============================================================================
// Setup
// ============================================================================

/// Per-peer setup retry budget. The 6th `FLG:error` in a row terminates
/// the peer's game.
pub const MAX_FLAG_TRIES: u32 = 5;

/// ASCII character count of the secret token generated for each peer.
pub const TOKEN_LEN: usize = 31;

// ============================================================================
// Timing
// ============================================================================

/// Worker multiplex timer. No worker may sleep longer than this without
/// re-checking the stop signal.
pub const TIMEOUT_SEC: Duration = Duration::from_secs(1);
