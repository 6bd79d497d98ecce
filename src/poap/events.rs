use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use sha2::{Digest, Sha256};
use solana_sdk::pubkey::Pubkey;

use crate::model::{AttemptEvent, MintEvent};

/// Anchor-style events arrive base64-encoded behind this log prefix.
const EVENT_LOG_PREFIX: &str = "Program data: ";

#[derive(Debug, Clone)]
pub enum PoapEvent {
    Minted(MintEvent),
    Attempted(AttemptEvent),
}

/// First 8 bytes of sha256("event:<Name>"), per the Anchor event convention.
pub fn event_discriminator(name: &str) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update(format!("event:{name}").as_bytes());
    let digest = hasher.finalize();
    let mut disc = [0u8; 8];
    disc.copy_from_slice(&digest[..8]);
    disc
}

/// Decode every POAP event found in one transaction's log messages.
///
/// Unknown discriminators and non-event log lines are skipped; a payload that
/// matches a known discriminator but fails to decode is reported and skipped
/// rather than aborting the batch. `log_index` is the position of the log
/// line within the transaction, which together with the signature identifies
/// the event across the backfill/live boundary.
pub fn parse_event_logs(signature: &str, logs: &[String]) -> Vec<PoapEvent> {
    let minted_disc = event_discriminator("PoapMinted");
    let attempted_disc = event_discriminator("MintAttempted");

    let mut events = Vec::new();
    for (log_index, line) in logs.iter().enumerate() {
        let Some(encoded) = line.strip_prefix(EVENT_LOG_PREFIX) else {
            continue;
        };
        let Ok(data) = BASE64.decode(encoded) else {
            continue;
        };
        if data.len() < 8 {
            continue;
        }

        let (disc, payload) = data.split_at(8);
        let decoded = if disc == minted_disc {
            decode_minted(payload, signature, log_index).map(PoapEvent::Minted)
        } else if disc == attempted_disc {
            decode_attempted(payload, signature, log_index).map(PoapEvent::Attempted)
        } else {
            continue;
        };

        match decoded {
            Some(event) => events.push(event),
            None => eprintln!(
                "⚠️  Undecodable event payload in {} (disc {})",
                signature,
                hex::encode(disc)
            ),
        }
    }
    events
}

// Layout: to (32) + token_id (u64 LE)
fn decode_minted(payload: &[u8], signature: &str, log_index: usize) -> Option<MintEvent> {
    let mut cursor = Cursor::new(payload);
    let recipient = cursor.pubkey()?;
    let token_id = cursor.u64_le()?;
    Some(MintEvent {
        recipient,
        token_id,
        signature: signature.to_string(),
        log_index,
        observed_at: Utc::now(),
    })
}

// Layout: attempter (32) + success (1) + message (u32 LE length + bytes)
fn decode_attempted(payload: &[u8], signature: &str, log_index: usize) -> Option<AttemptEvent> {
    let mut cursor = Cursor::new(payload);
    let attempter = cursor.pubkey()?;
    let success = cursor.bool_byte()?;
    let message = cursor.string()?;
    Some(AttemptEvent {
        attempter,
        success,
        message,
        signature: signature.to_string(),
        log_index,
        observed_at: Utc::now(),
    })
}

/// Minimal reader over the borsh-layout byte encodings the program uses for
/// both event payloads and account data.
pub(crate) struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub(crate) fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() < n {
            return None;
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Some(head)
    }

    pub(crate) fn pubkey(&mut self) -> Option<Pubkey> {
        let bytes: [u8; 32] = self.take(32)?.try_into().ok()?;
        Some(Pubkey::new_from_array(bytes))
    }

    pub(crate) fn u64_le(&mut self) -> Option<u64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }

    pub(crate) fn i64_le(&mut self) -> Option<i64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().ok()?;
        Some(i64::from_le_bytes(bytes))
    }

    pub(crate) fn u32_le(&mut self) -> Option<u32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    pub(crate) fn bool_byte(&mut self) -> Option<bool> {
        Some(self.take(1)?[0] != 0)
    }

    pub(crate) fn string(&mut self) -> Option<String> {
        let len = self.u32_le()? as usize;
        String::from_utf8(self.take(len)?.to_vec()).ok()
    }
}
