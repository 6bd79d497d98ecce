use anyhow::{Context, Result};
use chrono::DateTime;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

mod model;
mod poap;

use model::{MintView, Notification};
use poap::chain_client::{spawn_event_worker, SolanaChainClient};
use poap::reconciler::MintReconciler;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().context("Failed to load .env file")?;

    let rpc_url =
        env::var("SOLANA_RPC_URL").unwrap_or_else(|_| "http://localhost:8899".to_string());
    let keypair_path =
        env::var("SOLANA_KEYPAIR_PATH").unwrap_or_else(|_| "./attendee-wallet.json".to_string());
    let program_id =
        env::var("POAP_PROGRAM_ID").context("POAP_PROGRAM_ID must be set in environment or .env file")?;
    let deployment_slot: u64 = env::var("POAP_DEPLOYMENT_SLOT")
        .unwrap_or_else(|_| "0".to_string())
        .parse()
        .context("POAP_DEPLOYMENT_SLOT must be a slot number")?;
    let poll_secs: u64 = env::var("POAP_POLL_SECS")
        .unwrap_or_else(|_| "15".to_string())
        .parse()
        .context("POAP_POLL_SECS must be a number of seconds")?;
    let auto_mint = env::var("POAP_AUTO_MINT").map(|v| v == "1").unwrap_or(false);

    let client = Arc::new(SolanaChainClient::new(&rpc_url, &keypair_path, &program_id)?);
    println!("✅ Connected to Solana RPC: {}", rpc_url);
    let account = client.payer_pubkey();
    println!("   Attendee wallet: {}", account);

    println!("\n🎓 Workshop Details:");
    match client.workshop_details().await {
        Ok(details) => {
            println!("   Event: {}", details.name);
            println!("   Start Date: {}", format_date(details.start_date));
            println!("   End Date:   {}", format_date(details.end_date));
        }
        Err(e) => eprintln!("   ⚠️  {e:#}"),
    }

    let (mut reconciler, view_rx, mut notify_rx) =
        MintReconciler::new(Arc::clone(&client), deployment_slot);

    println!("\n🔍 Reconciling mint state...");
    reconciler.initialize(Some(account)).await;
    print_view(&reconciler.view());

    // Toast printer, standing in for the UI's notification channel.
    tokio::spawn(async move {
        while let Some(notification) = notify_rx.recv().await {
            match notification {
                Notification::MintSucceeded => println!("🎉 POAP Minted Successfully!"),
                Notification::MintFailed(message) => println!("❌ {message}"),
                Notification::WalletRequired => println!("⚠️  Please connect your wallet first."),
            }
        }
    });

    if auto_mint && !reconciler.view().claimed() {
        println!("\n📤 Claiming your POAP...");
        match reconciler.request_mint().await {
            Ok(signature) => println!("✅ Mint submitted! Signature: {}", signature),
            Err(e) => eprintln!("❌ Mint failed: {}", e),
        }
    }

    // Reactive view consumer, standing in for the UI's data binding.
    let mut view_watch = view_rx.clone();
    tokio::spawn(async move {
        while view_watch.changed().await.is_ok() {
            let view = view_watch.borrow_and_update().clone();
            print_view(&view);
        }
    });

    let (update_tx, mut update_rx) = mpsc::unbounded_channel();
    let worker = spawn_event_worker(
        Arc::clone(&client),
        deployment_slot,
        Duration::from_secs(poll_secs),
        update_tx,
    );

    println!("\n📡 Watching for new mints (Ctrl-C to stop)...");
    tokio::select! {
        _ = reconciler.run(&mut update_rx) => {}
        _ = tokio::signal::ctrl_c() => println!("\n👋 Stopping."),
    }
    worker.abort();

    Ok(())
}

fn print_view(view: &MintView) {
    println!("\n📊 Mint Metrics:");
    println!("   Total mints: {}", view.metrics.total_mints);
    println!("   Success rate: {:.1}%", view.metrics.success_rate);
    let status = if view.just_minted {
        "🎉 POAP minted this session"
    } else if view.claimed() {
        "You already claimed your POAP"
    } else if view.is_minting {
        "Minting..."
    } else {
        "Not claimed yet"
    };
    println!("   Status: {}", status);
    if !view.metrics.recent_mints.is_empty() {
        println!("   Recent mints:");
        for entry in &view.metrics.recent_mints {
            println!(
                "   • {} at {}",
                entry.account,
                entry.observed_at.format("%H:%M:%S")
            );
        }
    }
}

fn format_date(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|d| d.format("%B %e, %Y").to_string())
        .unwrap_or_else(|| ts.to_string())
}
