use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::commands::console::{print_events, read_commands};
use crate::commands::HELP;
use crate::config::ClientConfig;
use crate::controller::{self, Inputs};
use crate::directory::HttpDirectory;
use crate::events::EventSink;
use crate::machine::NegotiationMachine;
use crate::media::{LocalMediaSource, SampleCaptureDevice};
use crate::peer::{EngineConfig, RtcPeerSessionFactory};
use crate::signaling::SignalingClient;

/// Wires the collaborators together and runs the console session.
pub async fn serve(config: ClientConfig) -> anyhow::Result<()> {
    info!(
        identity = %config.identity,
        api = %config.api_base,
        signaling = %config.signaling_url,
        "starting peercall"
    );

    let directory = HttpDirectory::new(
        config.api_base.clone(),
        config.auth_token.clone(),
        config.candidate_path.clone(),
    )
    .context("building directory client")?;
    let media = LocalMediaSource::new(Arc::new(SampleCaptureDevice), config.media_constraints());
    let (sink, call_events) = EventSink::channel();

    let (machine, engine_events) = NegotiationMachine::new(
        config.identity.clone(),
        EngineConfig {
            ice_servers: config.ice_servers.clone(),
        },
        Arc::new(directory),
        media,
        Arc::new(RtcPeerSessionFactory),
        sink.clone(),
    );

    let (signaling, signals) = SignalingClient::start(&config.signaling_url, &config.identity);
    let (cmd_tx, commands) = mpsc::channel(16);
    let (shutdown_tx, shutdown) = watch::channel(false);

    tokio::spawn(print_events(call_events));
    tokio::spawn(read_commands(cmd_tx));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    println!("{HELP}");
    controller::run(
        machine,
        Inputs {
            commands,
            signals,
            engine: engine_events,
            shutdown,
        },
        sink,
    )
    .await;

    signaling.stop();
    Ok(())
}
