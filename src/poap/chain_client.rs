use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::rpc_client::{GetConfirmedSignaturesForAddress2Config, RpcClient};
use solana_client::rpc_config::{CommitmentConfig, RpcTransactionConfig};
use solana_client::rpc_request::{RpcError, RpcResponseErrorData};
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
    signature::{read_keypair_file, Keypair, Signature, Signer},
    transaction::Transaction,
};
use solana_transaction_status::option_serializer::OptionSerializer;
use solana_transaction_status::UiTransactionEncoding;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::model::{AttemptEvent, MintEvent, WorkshopDetails};
use crate::poap::events::{parse_event_logs, Cursor, PoapEvent};
use crate::poap::reconciler::ChainUpdate;
use crate::poap::{MintError, MintResult};

// System program ID
const SYSTEM_PROGRAM_ID: &str = "11111111111111111111111111111111";

const MINT_RECORD_SEED: &[u8] = b"mint-record";
const WORKSHOP_SEED: &[u8] = b"workshop";

/// Read/write/backfill access to the POAP program, as the reconciler sees it.
pub trait ChainClient {
    /// Has `account` already minted. Fails only on RPC/transport errors.
    async fn read_mint_status(&self, account: &Pubkey) -> Result<bool>;

    /// Submit the single no-argument mint transaction for `account` and wait
    /// for submission acceptance.
    async fn submit_mint(&self, account: &Pubkey) -> MintResult<Signature>;

    /// Historical mint events from `from_slot` through latest, oldest first.
    async fn mint_events(&self, from_slot: u64) -> Result<Vec<MintEvent>>;

    /// Historical attempt events from `from_slot` through latest, oldest first.
    async fn attempt_events(&self, from_slot: u64) -> Result<Vec<AttemptEvent>>;
}

/// One page of decoded program activity.
pub struct EventPage {
    pub mints: Vec<MintEvent>,
    pub attempts: Vec<AttemptEvent>,
    /// Newest signature seen, used as the `until` bound of the next poll.
    pub newest_signature: Option<Signature>,
}

pub struct SolanaChainClient {
    rpc_client: RpcClient,
    payer: Keypair,
    program_id: Pubkey,
}

impl SolanaChainClient {
    /// Initialize the client with an RPC URL, payer keypair path, and the
    /// deployed POAP program id.
    pub fn new(rpc_url: &str, keypair_path: &str, program_id: &str) -> Result<Self> {
        let rpc_client =
            RpcClient::new_with_commitment(rpc_url.to_string(), CommitmentConfig::confirmed());

        let payer = read_keypair_file(keypair_path)
            .map_err(|e| anyhow::anyhow!("Failed to read payer keypair: {}", e))?;

        let program_id = Pubkey::from_str(program_id).context("Invalid POAP program id")?;

        Ok(Self {
            rpc_client,
            payer,
            program_id,
        })
    }

    pub fn payer_pubkey(&self) -> Pubkey {
        self.payer.pubkey()
    }

    /// Derive the per-account mint record PDA (must match the program).
    fn mint_record_pda(&self, account: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[MINT_RECORD_SEED, account.as_ref()], &self.program_id)
    }

    /// Derive the workshop config PDA.
    fn workshop_pda(&self) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[WORKSHOP_SEED], &self.program_id)
    }

    /// Read workshop metadata from the config account.
    ///
    /// Layout: 8-byte discriminator + authority(32) + name(borsh string)
    /// + start_date(i64) + end_date(i64).
    pub async fn workshop_details(&self) -> Result<WorkshopDetails> {
        let (workshop_pda, _bump) = self.workshop_pda();
        let account_data = self
            .rpc_client
            .get_account_data(&workshop_pda)
            .context("Failed to fetch workshop account. Has the program been initialized?")?;

        if account_data.len() < 8 + 32 {
            return Err(anyhow::anyhow!("Invalid workshop account data length"));
        }

        let mut cursor = Cursor::new(&account_data[8 + 32..]);
        let details = (|| {
            Some(WorkshopDetails {
                name: cursor.string()?,
                start_date: cursor.i64_le()?,
                end_date: cursor.i64_le()?,
            })
        })();
        details.ok_or_else(|| anyhow::anyhow!("Malformed workshop account data"))
    }

    /// Fetch and decode all program events newer than `until`, oldest first.
    pub async fn fetch_events(
        &self,
        from_slot: u64,
        until: Option<Signature>,
    ) -> Result<EventPage> {
        let config = GetConfirmedSignaturesForAddress2Config {
            before: None,
            until,
            limit: None,
            commitment: Some(CommitmentConfig::confirmed()),
        };
        let statuses = self
            .rpc_client
            .get_signatures_for_address_with_config(&self.program_id, config)
            .context("Failed to list program signatures")?;

        // Newest first from the RPC; remember the head as the next poll bound.
        let newest_signature = statuses
            .first()
            .map(|s| Signature::from_str(&s.signature))
            .transpose()
            .context("Unparseable signature in RPC response")?;

        let mut mints = Vec::new();
        let mut attempts = Vec::new();
        for status in statuses.iter().rev() {
            if status.slot < from_slot || status.err.is_some() {
                continue;
            }
            let signature = Signature::from_str(&status.signature)
                .context("Unparseable signature in RPC response")?;
            for event in self.transaction_events(&signature)? {
                match event {
                    PoapEvent::Minted(ev) => mints.push(ev),
                    PoapEvent::Attempted(ev) => attempts.push(ev),
                }
            }
        }

        Ok(EventPage {
            mints,
            attempts,
            newest_signature,
        })
    }

    fn transaction_events(&self, signature: &Signature) -> Result<Vec<PoapEvent>> {
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Json),
            commitment: Some(CommitmentConfig::confirmed()),
            max_supported_transaction_version: Some(0),
        };
        let tx = self
            .rpc_client
            .get_transaction_with_config(signature, config)
            .with_context(|| format!("Failed to fetch transaction {signature}"))?;

        let Some(meta) = tx.transaction.meta else {
            return Ok(Vec::new());
        };
        let OptionSerializer::Some(logs) = meta.log_messages else {
            return Ok(Vec::new());
        };
        Ok(parse_event_logs(&signature.to_string(), &logs))
    }

    /// Sign with the payer and send, waiting for confirmation.
    fn send_transaction(&self, instructions: &[Instruction]) -> Result<Signature, ClientError> {
        let recent_blockhash = self.rpc_client.get_latest_blockhash()?;
        let transaction = Transaction::new_signed_with_payer(
            instructions,
            Some(&self.payer.pubkey()),
            &[&self.payer],
            recent_blockhash,
        );

        self.rpc_client.send_and_confirm_transaction(&transaction)
    }
}

impl ChainClient for SolanaChainClient {
    /// A missing mint record means the account has not minted.
    ///
    /// Record layout: 8-byte discriminator + owner(32) + minted(1) + token_id(8).
    async fn read_mint_status(&self, account: &Pubkey) -> Result<bool> {
        let (record_pda, _bump) = self.mint_record_pda(account);
        let response = self
            .rpc_client
            .get_account_with_commitment(&record_pda, CommitmentConfig::confirmed())
            .context("Failed to fetch mint record account")?;

        let Some(record) = response.value else {
            return Ok(false);
        };
        if record.data.len() < 8 + 32 + 1 {
            return Err(anyhow::anyhow!("Invalid mint record data length"));
        }
        Ok(record.data[40] != 0)
    }

    async fn submit_mint(&self, account: &Pubkey) -> MintResult<Signature> {
        let (record_pda, _bump) = self.mint_record_pda(account);

        // Instruction data is the bare discriminator; mint takes no arguments.
        let instruction = Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new(record_pda, false),
                AccountMeta::new(self.payer.pubkey(), true),
                AccountMeta::new_readonly(
                    Pubkey::from_str(SYSTEM_PROGRAM_ID)
                        .map_err(|e| MintError::Adapter(e.into()))?,
                    false,
                ),
            ],
            data: instruction_discriminator("mint").to_vec(),
        };

        self.send_transaction(&[instruction])
            .map_err(classify_submit_error)
    }

    async fn mint_events(&self, from_slot: u64) -> Result<Vec<MintEvent>> {
        Ok(self.fetch_events(from_slot, None).await?.mints)
    }

    async fn attempt_events(&self, from_slot: u64) -> Result<Vec<AttemptEvent>> {
        Ok(self.fetch_events(from_slot, None).await?.attempts)
    }
}

/// First 8 bytes of sha256("global:<name>"), per the Anchor instruction
/// convention.
fn instruction_discriminator(name: &str) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update(format!("global:{name}").as_bytes());
    let digest = hasher.finalize();
    let mut disc = [0u8; 8];
    disc.copy_from_slice(&digest[..8]);
    disc
}

fn classify_submit_error(err: ClientError) -> MintError {
    match &*err.kind {
        ClientErrorKind::RpcError(RpcError::RpcResponseError {
            data: RpcResponseErrorData::SendTransactionPreflightFailure(sim),
            message,
            ..
        }) => {
            let reason = sim
                .err
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| message.clone());
            MintError::SimulationReverted(reason)
        }
        ClientErrorKind::TransactionError(tx_err) => {
            MintError::SimulationReverted(tx_err.to_string())
        }
        _ => MintError::Adapter(err.into()),
    }
}

/// Spawn the live subscription worker: poll for program transactions newer
/// than the last seen signature and push decoded batches to the reconciler.
///
/// The first tick re-covers the backfill window; the reconciler's per-event
/// dedup resolves the overlap. The task exits when the receiving side of
/// `updates` is dropped.
pub fn spawn_event_worker(
    client: Arc<SolanaChainClient>,
    from_slot: u64,
    poll_interval: Duration,
    updates: mpsc::UnboundedSender<ChainUpdate>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_seen: Option<Signature> = None;
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            ticker.tick().await;
            let page = match client.fetch_events(from_slot, last_seen).await {
                Ok(page) => page,
                Err(e) => {
                    eprintln!("⚠️  Event poll failed: {e:#}");
                    continue;
                }
            };
            if page.newest_signature.is_some() {
                last_seen = page.newest_signature;
            }
            if !page.mints.is_empty() && updates.send(ChainUpdate::MintEvents(page.mints)).is_err()
            {
                return;
            }
            if !page.attempts.is_empty()
                && updates
                    .send(ChainUpdate::AttemptEvents(page.attempts))
                    .is_err()
            {
                return;
            }
        }
    })
}
