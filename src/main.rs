use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rtc_call_core::{
    format_duration, CallConfig, CallNotice, CallSession, LoopbackNetwork, MemoryRelay,
    SessionPhase, SyntheticDevices,
};
use tokio::sync::mpsc;

fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("rtc_call_core=info".parse()?))
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let video = args.contains(&"--video".to_string());
    let seconds: u64 = args
        .iter()
        .position(|a| a == "--seconds")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(3);

    let config = CallConfig::from_env();
    config.validate().map_err(anyhow::Error::msg)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?
        .block_on(run_demo(config, video, seconds))
}

/// Two parties on one in-process relay: alice calls bob, bob answers,
/// they talk for a while and alice hangs up.
async fn run_demo(config: CallConfig, video: bool, seconds: u64) -> anyhow::Result<()> {
    let relay = Arc::new(MemoryRelay::new());
    let network = Arc::new(LoopbackNetwork::new());

    let (alice, mut alice_notices) = CallSession::new(
        "alice",
        config.clone(),
        relay.clone(),
        Arc::new(SyntheticDevices::new("alice")),
        network.clone(),
    )?;
    let (bob, bob_notices) = CallSession::new(
        "bob",
        config,
        relay,
        Arc::new(SyntheticDevices::new("bob")),
        network,
    )?;

    tokio::spawn(answer_incoming(bob.clone(), bob_notices));

    let call_id = alice.start_call("bob", video).await?;
    tracing::info!("Placed call {}", call_id);

    while let Some(notice) = alice_notices.recv().await {
        match notice {
            CallNotice::Connected { .. } => break,
            CallNotice::CallEnded(reason) => {
                anyhow::bail!("call ended before connecting: {}", reason.user_message())
            }
            other => tracing::info!("alice: {:?}", other),
        }
    }

    let snapshot = alice.snapshot();
    let remote_tracks = snapshot
        .remote_stream
        .as_ref()
        .map(|s| s.tracks().len())
        .unwrap_or(0);
    tracing::info!("Connected with {} remote track(s)", remote_tracks);

    for _ in 0..seconds {
        tokio::time::sleep(Duration::from_secs(1)).await;
        tracing::info!("alice {}", format_duration(alice.snapshot().call_duration));
    }

    alice.end_call().await;
    let ended = bob.wait_for(|s| s.phase == SessionPhase::Ended).await?;
    tracing::info!(
        "bob: {}",
        ended
            .last_end
            .as_ref()
            .map(|r| r.user_message())
            .unwrap_or("Call ended")
    );

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}

async fn answer_incoming(session: CallSession, mut notices: mpsc::UnboundedReceiver<CallNotice>) {
    while let Some(notice) = notices.recv().await {
        match notice {
            CallNotice::IncomingCall(record) => {
                tracing::info!("bob: incoming {:?} call from {}", record.call_type, record.caller_id);
                if let Err(e) = session.answer_call(&record).await {
                    tracing::error!("bob: failed to answer: {}", e);
                }
            }
            other => tracing::debug!("bob: {:?}", other),
        }
    }
}
