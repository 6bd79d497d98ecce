use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;

/// Maximum number of entries kept in the recent-mints list.
pub const RECENT_MINTS_LIMIT: usize = 5;

/// One successful mint observed on chain.
///
/// `observed_at` is the client-side observation time, not the block time;
/// `signature` + `log_index` identify the event across the backfill/live
/// boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintEvent {
    pub recipient: Pubkey,
    pub token_id: u64,
    pub signature: String,
    pub log_index: usize,
    pub observed_at: DateTime<Utc>,
}

impl MintEvent {
    pub fn event_id(&self) -> String {
        format!("{}:{}", self.signature, self.log_index)
    }
}

/// One recorded mint attempt, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptEvent {
    pub attempter: Pubkey,
    pub success: bool,
    pub message: String,
    pub signature: String,
    pub log_index: usize,
    pub observed_at: DateTime<Utc>,
}

impl AttemptEvent {
    pub fn event_id(&self) -> String {
        format!("{}:{}", self.signature, self.log_index)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentMint {
    pub account: Pubkey,
    pub observed_at: DateTime<Utc>,
}

/// Aggregates derived from the event streams.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub total_mints: u64,
    /// Percentage in [0, 100]; 0 when no attempts have been observed.
    pub success_rate: f64,
    /// Newest first, at most [`RECENT_MINTS_LIMIT`] entries.
    pub recent_mints: Vec<RecentMint>,
}

/// Lifecycle of a single mint action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MintPhase {
    Idle,
    Submitting,
    Confirmed,
    Rejected,
}

impl Default for MintPhase {
    fn default() -> Self {
        MintPhase::Idle
    }
}

/// Snapshot handed to the presentation layer via the watch channel.
///
/// The chain-derived flag and the optimistic session flag stay separate
/// fields; [`MintView::claimed`] is the OR the "already claimed" UI branch
/// switches on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MintView {
    /// Chain-derived: has the current account minted.
    pub mint_status: bool,
    /// A mint completed during this session.
    pub just_minted: bool,
    pub is_minting: bool,
    pub metrics: Metrics,
}

impl MintView {
    pub fn claimed(&self) -> bool {
        self.mint_status || self.just_minted
    }
}

/// Toasts surfaced to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Celebratory toast, fired exactly once per successful mint.
    MintSucceeded,
    MintFailed(String),
    WalletRequired,
}

/// Workshop metadata parsed from the program config account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkshopDetails {
    pub name: String,
    pub start_date: i64, // unix timestamp
    pub end_date: i64,
}
