use std::collections::HashSet;
use std::sync::Arc;

use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use tokio::sync::{mpsc, watch};

use crate::model::{
    AttemptEvent, Metrics, MintEvent, MintPhase, MintView, Notification, RecentMint,
    RECENT_MINTS_LIMIT,
};
use crate::poap::chain_client::ChainClient;
use crate::poap::{MintError, MintResult};

/// Messages pushed at the reconciler by the chain side: live event batches
/// from the poll worker and resolved mint-status reads.
#[derive(Debug)]
pub enum ChainUpdate {
    MintStatus { seq: u64, minted: bool },
    MintEvents(Vec<MintEvent>),
    AttemptEvents(Vec<AttemptEvent>),
}

/// Owned derived state, mutated only by its owning [`MintReconciler`].
///
/// All folds are additive and deduplicate by event identity, so historical
/// and live batches can interleave in any order without losing or double
/// counting events.
#[derive(Default)]
struct ReconcilerState {
    mint_status: bool,
    just_minted: bool,
    phase: MintPhase,
    metrics: Metrics,
    attempts: u64,
    successes: u64,
    seen_mints: HashSet<String>,
    seen_attempts: HashSet<String>,
    issued_read_seq: u64,
}

impl ReconcilerState {
    /// Issue a new mint-status read sequence number, invalidating any read
    /// still in flight for a previous account (last-request-wins).
    fn next_read_seq(&mut self) -> u64 {
        self.issued_read_seq += 1;
        self.issued_read_seq
    }

    /// Returns false when the read result is stale and was discarded.
    fn apply_mint_status(&mut self, seq: u64, minted: bool) -> bool {
        if seq != self.issued_read_seq {
            return false;
        }
        self.mint_status = minted;
        true
    }

    fn begin_mint(&mut self, account: Option<&Pubkey>) -> MintResult<Pubkey> {
        let Some(account) = account else {
            return Err(MintError::WalletNotConnected);
        };
        if self.phase == MintPhase::Submitting {
            return Err(MintError::MintInFlight);
        }
        self.phase = MintPhase::Submitting;
        Ok(*account)
    }

    fn finish_mint_success(&mut self) {
        self.phase = MintPhase::Confirmed;
        // Optimistic: the corroborating chain read and event follow later.
        self.just_minted = true;
        self.mint_status = true;
    }

    fn finish_mint_failure(&mut self) {
        self.phase = MintPhase::Rejected;
    }

    /// Fold a batch of mint events, newest landing at the front of the
    /// recent list. Returns the number of previously-unseen events.
    fn record_mint_events(&mut self, batch: &[MintEvent]) -> usize {
        let mut added = 0;
        for event in batch {
            if !self.seen_mints.insert(event.event_id()) {
                continue;
            }
            self.metrics.recent_mints.insert(
                0,
                RecentMint {
                    account: event.recipient,
                    observed_at: event.observed_at,
                },
            );
            self.metrics.recent_mints.truncate(RECENT_MINTS_LIMIT);
            self.metrics.total_mints += 1;
            added += 1;
        }
        added
    }

    fn record_attempt_events(&mut self, batch: &[AttemptEvent]) {
        for event in batch {
            if !self.seen_attempts.insert(event.event_id()) {
                continue;
            }
            self.attempts += 1;
            if event.success {
                self.successes += 1;
            }
        }
        // Strictly cumulative ratio; 0 when nothing has been attempted.
        self.metrics.success_rate = if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64 * 100.0
        };
    }

    fn view(&self) -> MintView {
        MintView {
            mint_status: self.mint_status,
            just_minted: self.just_minted,
            is_minting: self.phase == MintPhase::Submitting,
            metrics: self.metrics.clone(),
        }
    }
}

/// Keeps on-chain truth, optimistic session state, and event-derived metrics
/// consistent. Single writer: every mutation goes through a method on this
/// type, and the chain side reaches it only via [`ChainUpdate`] messages.
pub struct MintReconciler<C> {
    client: Arc<C>,
    account: Option<Pubkey>,
    deployment_slot: u64,
    state: ReconcilerState,
    view_tx: watch::Sender<MintView>,
    notify_tx: mpsc::UnboundedSender<Notification>,
}

impl<C: ChainClient> MintReconciler<C> {
    pub fn new(
        client: Arc<C>,
        deployment_slot: u64,
    ) -> (
        Self,
        watch::Receiver<MintView>,
        mpsc::UnboundedReceiver<Notification>,
    ) {
        let (view_tx, view_rx) = watch::channel(MintView::default());
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let reconciler = Self {
            client,
            account: None,
            deployment_slot,
            state: ReconcilerState::default(),
            view_tx,
            notify_tx,
        };
        (reconciler, view_rx, notify_rx)
    }

    /// One mint-status read for the connected account (skipped when absent)
    /// plus one historical fetch per event stream. Adapter failures are
    /// logged and leave the current state in place.
    pub async fn initialize(&mut self, account: Option<Pubkey>) {
        self.account = account;
        self.refresh_mint_status().await;

        match self.client.mint_events(self.deployment_slot).await {
            Ok(events) => {
                self.state.record_mint_events(&events);
            }
            Err(e) => eprintln!("⚠️  Mint event backfill failed: {e:#}"),
        }
        match self.client.attempt_events(self.deployment_slot).await {
            Ok(events) => self.state.record_attempt_events(&events),
            Err(e) => eprintln!("⚠️  Attempt event backfill failed: {e:#}"),
        }
        self.publish();
    }

    /// Account switched (or disconnected). Session flag and metrics are
    /// account-independent and stay untouched.
    pub async fn set_account(&mut self, account: Option<Pubkey>) {
        self.account = account;
        // Invalidate any read still in flight for the previous account.
        self.state.next_read_seq();
        self.state.mint_status = false;
        self.refresh_mint_status().await;
        self.publish();
    }

    async fn refresh_mint_status(&mut self) {
        let Some(account) = self.account else {
            return;
        };
        let seq = self.state.next_read_seq();
        match self.client.read_mint_status(&account).await {
            Ok(minted) => {
                self.apply_update(ChainUpdate::MintStatus { seq, minted });
            }
            Err(e) => eprintln!("⚠️  Mint status read failed: {e:#}"),
        }
    }

    /// Submit the mint transaction for the connected account.
    ///
    /// Submission acceptance counts as success: the session flag and the
    /// minted flag flip optimistically before the corroborating event
    /// arrives. Exactly one notification fires per outcome, and the
    /// in-flight phase is cleared on every exit path. Never retries.
    pub async fn request_mint(&mut self) -> MintResult<Signature> {
        let account = match self.state.begin_mint(self.account.as_ref()) {
            Ok(account) => account,
            Err(err) => {
                if matches!(err, MintError::WalletNotConnected) {
                    let _ = self.notify_tx.send(Notification::WalletRequired);
                }
                return Err(err);
            }
        };
        self.publish();

        match self.client.submit_mint(&account).await {
            Ok(signature) => {
                self.state.finish_mint_success();
                let _ = self.notify_tx.send(Notification::MintSucceeded);
                self.publish();
                Ok(signature)
            }
            Err(err) => {
                self.state.finish_mint_failure();
                let _ = self.notify_tx.send(Notification::MintFailed(
                    "Failed to mint POAP. Please try again.".to_string(),
                ));
                self.publish();
                Err(err)
            }
        }
    }

    /// Fold one chain-side message.
    pub fn apply_update(&mut self, update: ChainUpdate) {
        match update {
            ChainUpdate::MintStatus { seq, minted } => {
                self.state.apply_mint_status(seq, minted);
            }
            ChainUpdate::MintEvents(batch) => {
                self.state.record_mint_events(&batch);
            }
            ChainUpdate::AttemptEvents(batch) => self.state.record_attempt_events(&batch),
        }
        self.publish();
    }

    /// Drive the update loop until the chain side hangs up.
    pub async fn run(&mut self, updates: &mut mpsc::UnboundedReceiver<ChainUpdate>) {
        while let Some(update) = updates.recv().await {
            self.apply_update(update);
        }
    }

    pub fn view(&self) -> MintView {
        self.state.view()
    }

    fn publish(&self) {
        let _ = self.view_tx.send(self.state.view());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mint_ev(signature: &str, log_index: usize) -> MintEvent {
        MintEvent {
            recipient: Pubkey::new_unique(),
            token_id: log_index as u64,
            signature: signature.to_string(),
            log_index,
            observed_at: Utc::now(),
        }
    }

    fn attempt_ev(signature: &str, log_index: usize, success: bool) -> AttemptEvent {
        AttemptEvent {
            attempter: Pubkey::new_unique(),
            success,
            message: String::new(),
            signature: signature.to_string(),
            log_index,
            observed_at: Utc::now(),
        }
    }

    mod state_folds {
        use super::*;

        #[test]
        fn backfill_counts_and_success_rate() {
            let mut state = ReconcilerState::default();
            let mints: Vec<_> = (0..10).map(|i| mint_ev("hist", i)).collect();
            let attempts: Vec<_> = (0..12).map(|i| attempt_ev("hist", i, i < 9)).collect();

            state.record_mint_events(&mints);
            state.record_attempt_events(&attempts);

            assert_eq!(state.metrics.total_mints, 10);
            assert_eq!(state.metrics.success_rate, 75.0);
        }

        #[test]
        fn live_batch_after_backfill_adds_without_double_count() {
            let mut state = ReconcilerState::default();
            let backfill: Vec<_> = (0..10).map(|i| mint_ev("hist", i)).collect();
            state.record_mint_events(&backfill);

            let live = vec![mint_ev("live", 0), mint_ev("live", 1)];
            state.record_mint_events(&live);

            assert_eq!(state.metrics.total_mints, 12);
            // The two new entries land at the front, newest first.
            assert_eq!(state.metrics.recent_mints[0].account, live[1].recipient);
            assert_eq!(state.metrics.recent_mints[1].account, live[0].recipient);
        }

        #[test]
        fn boundary_duplicates_are_ignored() {
            let mut state = ReconcilerState::default();
            let batch: Vec<_> = (0..4).map(|i| mint_ev("sig", i)).collect();

            assert_eq!(state.record_mint_events(&batch), 4);
            // Worker re-delivers the boundary transactions on its first tick.
            assert_eq!(state.record_mint_events(&batch), 0);
            assert_eq!(state.metrics.total_mints, 4);

            let attempts: Vec<_> = (0..4).map(|i| attempt_ev("sig", i, true)).collect();
            state.record_attempt_events(&attempts);
            state.record_attempt_events(&attempts);
            assert_eq!(state.attempts, 4);
            assert_eq!(state.metrics.success_rate, 100.0);
        }

        #[test]
        fn recent_mints_bounded_and_newest_first() {
            let mut state = ReconcilerState::default();
            let batch: Vec<_> = (0..8).map(|i| mint_ev("sig", i)).collect();
            state.record_mint_events(&batch);

            assert_eq!(state.metrics.recent_mints.len(), RECENT_MINTS_LIMIT);
            assert_eq!(state.metrics.total_mints, 8);
            // Last delivered is newest and sits at the front.
            assert_eq!(state.metrics.recent_mints[0].account, batch[7].recipient);
            assert_eq!(state.metrics.recent_mints[4].account, batch[3].recipient);
        }

        #[test]
        fn success_rate_zero_without_attempts_and_always_in_range() {
            let mut state = ReconcilerState::default();
            assert_eq!(state.metrics.success_rate, 0.0);

            state.record_attempt_events(&[attempt_ev("a", 0, false)]);
            assert_eq!(state.metrics.success_rate, 0.0);

            state.record_attempt_events(&[
                attempt_ev("b", 0, true),
                attempt_ev("b", 1, true),
                attempt_ev("b", 2, true),
            ]);
            // 3 of 4.
            assert_eq!(state.metrics.success_rate, 75.0);

            for i in 0..50 {
                state.record_attempt_events(&[attempt_ev("c", i, i % 3 == 0)]);
                assert!((0.0..=100.0).contains(&state.metrics.success_rate));
            }
        }

        #[test]
        fn session_flag_survives_a_disagreeing_chain_read() {
            let mut state = ReconcilerState::default();
            state.begin_mint(Some(&Pubkey::new_unique())).unwrap();
            state.finish_mint_success();
            assert!(state.just_minted && state.mint_status);

            // A later read for a fresh account may say "not minted"; the
            // session flag must not downgrade with it.
            let seq = state.next_read_seq();
            assert!(state.apply_mint_status(seq, false));
            assert!(!state.mint_status);
            assert!(state.just_minted);
        }

        #[test]
        fn stale_mint_status_read_is_discarded() {
            let mut state = ReconcilerState::default();
            let old_read = state.next_read_seq();
            let new_read = state.next_read_seq();

            // The old account's read resolves after the switch: dropped.
            assert!(!state.apply_mint_status(old_read, true));
            assert!(!state.mint_status);

            assert!(state.apply_mint_status(new_read, true));
            assert!(state.mint_status);
        }

        #[test]
        fn mint_phase_guards_and_reentry() {
            let mut state = ReconcilerState::default();
            let account = Pubkey::new_unique();

            assert!(matches!(
                state.begin_mint(None),
                Err(MintError::WalletNotConnected)
            ));

            state.begin_mint(Some(&account)).unwrap();
            assert!(matches!(
                state.begin_mint(Some(&account)),
                Err(MintError::MintInFlight)
            ));

            state.finish_mint_failure();
            assert_eq!(state.phase, MintPhase::Rejected);
            // Idle is reentrant after either terminal state.
            state.begin_mint(Some(&account)).unwrap();
            state.finish_mint_success();
            state.begin_mint(Some(&account)).unwrap();
        }
    }

    #[derive(Default)]
    struct MockChainClient {
        minted: bool,
        submit_ok: bool,
        fail_history: bool,
        historical_mints: Vec<MintEvent>,
        historical_attempts: Vec<AttemptEvent>,
        reads: AtomicUsize,
        submits: AtomicUsize,
    }

    impl ChainClient for MockChainClient {
        async fn read_mint_status(&self, _account: &Pubkey) -> anyhow::Result<bool> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.minted)
        }

        async fn submit_mint(&self, _account: &Pubkey) -> MintResult<Signature> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            if self.submit_ok {
                Ok(Signature::default())
            } else {
                Err(MintError::UserRejected)
            }
        }

        async fn mint_events(&self, _from_slot: u64) -> anyhow::Result<Vec<MintEvent>> {
            if self.fail_history {
                return Err(anyhow!("rpc unreachable"));
            }
            Ok(self.historical_mints.clone())
        }

        async fn attempt_events(&self, _from_slot: u64) -> anyhow::Result<Vec<AttemptEvent>> {
            if self.fail_history {
                return Err(anyhow!("rpc unreachable"));
            }
            Ok(self.historical_attempts.clone())
        }
    }

    #[tokio::test]
    async fn initialize_populates_status_and_metrics() {
        let client = Arc::new(MockChainClient {
            minted: true,
            historical_mints: (0..3).map(|i| mint_ev("hist", i)).collect(),
            historical_attempts: (0..4).map(|i| attempt_ev("hist", i, i < 3)).collect(),
            ..Default::default()
        });
        let (mut reconciler, view_rx, _notify_rx) = MintReconciler::new(Arc::clone(&client), 0);

        reconciler.initialize(Some(Pubkey::new_unique())).await;

        let view = view_rx.borrow();
        assert!(view.mint_status);
        assert!(!view.just_minted);
        assert_eq!(view.metrics.total_mints, 3);
        assert_eq!(view.metrics.success_rate, 75.0);
        assert_eq!(client.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn request_mint_without_account_makes_no_chain_call() {
        let client = Arc::new(MockChainClient::default());
        let (mut reconciler, _view_rx, mut notify_rx) = MintReconciler::new(Arc::clone(&client), 0);
        reconciler.initialize(None).await;

        let result = reconciler.request_mint().await;

        assert!(matches!(result, Err(MintError::WalletNotConnected)));
        assert_eq!(client.submits.load(Ordering::SeqCst), 0);
        assert_eq!(client.reads.load(Ordering::SeqCst), 0);
        assert_eq!(notify_rx.try_recv().unwrap(), Notification::WalletRequired);
        assert!(notify_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn successful_mint_flips_flags_and_celebrates_once() {
        let client = Arc::new(MockChainClient {
            submit_ok: true,
            ..Default::default()
        });
        let (mut reconciler, view_rx, mut notify_rx) = MintReconciler::new(Arc::clone(&client), 0);
        reconciler.initialize(Some(Pubkey::new_unique())).await;
        assert!(!view_rx.borrow().mint_status);

        reconciler.request_mint().await.unwrap();

        let view = view_rx.borrow();
        assert!(view.mint_status);
        assert!(view.just_minted);
        assert!(!view.is_minting);
        assert_eq!(client.submits.load(Ordering::SeqCst), 1);
        assert_eq!(notify_rx.try_recv().unwrap(), Notification::MintSucceeded);
        assert!(notify_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_mint_leaves_flags_and_allows_retry() {
        let client = Arc::new(MockChainClient::default());
        let (mut reconciler, view_rx, mut notify_rx) = MintReconciler::new(Arc::clone(&client), 0);
        reconciler.initialize(Some(Pubkey::new_unique())).await;

        let result = reconciler.request_mint().await;
        assert!(matches!(result, Err(MintError::UserRejected)));

        {
            let view = view_rx.borrow();
            assert!(!view.mint_status);
            assert!(!view.just_minted);
            assert!(!view.is_minting);
        }
        assert!(matches!(
            notify_rx.try_recv().unwrap(),
            Notification::MintFailed(_)
        ));

        // No automatic retry, but the user may try again.
        let _ = reconciler.request_mint().await;
        assert_eq!(client.submits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_request_while_in_flight_submits_nothing() {
        let client = Arc::new(MockChainClient::default());
        let (mut reconciler, _view_rx, mut notify_rx) = MintReconciler::new(Arc::clone(&client), 0);
        reconciler.initialize(Some(Pubkey::new_unique())).await;

        // First submission still awaiting acknowledgment.
        reconciler.state.phase = MintPhase::Submitting;

        let result = reconciler.request_mint().await;
        assert!(matches!(result, Err(MintError::MintInFlight)));
        assert_eq!(client.submits.load(Ordering::SeqCst), 0);
        // Rejected silently, not toasted.
        assert!(notify_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn backfill_failure_is_non_fatal_and_live_events_still_fold() {
        let client = Arc::new(MockChainClient {
            fail_history: true,
            ..Default::default()
        });
        let (mut reconciler, view_rx, _notify_rx) = MintReconciler::new(client, 0);
        reconciler.initialize(Some(Pubkey::new_unique())).await;
        assert_eq!(view_rx.borrow().metrics.total_mints, 0);

        reconciler.apply_update(ChainUpdate::MintEvents(vec![
            mint_ev("live", 0),
            mint_ev("live", 1),
        ]));
        assert_eq!(view_rx.borrow().metrics.total_mints, 2);
    }

    #[tokio::test]
    async fn account_switch_rereads_status_but_keeps_metrics() {
        let client = Arc::new(MockChainClient {
            minted: true,
            historical_mints: vec![mint_ev("hist", 0)],
            ..Default::default()
        });
        let (mut reconciler, view_rx, _notify_rx) = MintReconciler::new(Arc::clone(&client), 0);
        reconciler.initialize(Some(Pubkey::new_unique())).await;
        assert!(view_rx.borrow().mint_status);

        reconciler.set_account(Some(Pubkey::new_unique())).await;
        assert_eq!(client.reads.load(Ordering::SeqCst), 2);
        assert_eq!(view_rx.borrow().metrics.total_mints, 1);

        // Disconnecting clears the chain-derived flag, nothing else.
        reconciler.set_account(None).await;
        assert!(!view_rx.borrow().mint_status);
        assert_eq!(view_rx.borrow().metrics.total_mints, 1);
    }

    #[tokio::test]
    async fn update_loop_drains_channel_until_close() {
        let client = Arc::new(MockChainClient::default());
        let (mut reconciler, view_rx, _notify_rx) = MintReconciler::new(client, 0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(ChainUpdate::MintEvents(vec![mint_ev("a", 0)]))
            .unwrap();
        tx.send(ChainUpdate::AttemptEvents(vec![attempt_ev("a", 1, true)]))
            .unwrap();
        drop(tx);

        reconciler.run(&mut rx).await;

        let view = view_rx.borrow();
        assert_eq!(view.metrics.total_mints, 1);
        assert_eq!(view.metrics.success_rate, 100.0);
    }
}
