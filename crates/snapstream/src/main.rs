//! Snapstream — a clock-synchronized network audio player.
//!
//! Connects to a stream server, keeps the local clock in sync with the
//! server's, and renders the audio stream on the local output device at its
//! server-assigned deadlines. State transitions and periodic diagnostics are
//! printed as they arrive.

mod cli;

use anyhow::{Result, bail};
use clap::Parser;
use crossbeam_channel::{bounded, select};
use snapstream_engine::{Engine, EngineConfig, EngineState};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if args.list_devices {
        for name in snapstream_engine::sink::list_output_devices()? {
            println!("{name}");
        }
        return Ok(());
    }

    let config = EngineConfig {
        client_name: args.name.clone(),
        device: args.device.clone(),
        auto_reconnect: !args.no_reconnect,
        ..EngineConfig::default()
    };
    let mut engine = Engine::new(config);

    if args.latency != 0 {
        engine
            .set_user_latency(args.latency)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }

    let (host, port) = match (&args.host, engine.last_endpoint()) {
        (Some(host), _) => (host.clone(), args.port),
        (None, Some(last)) => {
            tracing::info!(host = %last.host, port = last.port, "using last server");
            (last.host, last.port)
        }
        (None, None) => bail!("no server given and no last server remembered"),
    };

    let states = engine.subscribe_state();
    let diagnostics = engine.subscribe_diagnostics();

    let (sig_tx, sig_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = sig_tx.try_send(());
    })?;

    engine
        .connect(&host, port)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    tracing::info!(host = %host, port, "connecting");

    loop {
        select! {
            recv(sig_rx) -> _ => {
                tracing::info!("shutting down");
                break;
            }
            recv(states) -> state => {
                match state {
                    Ok(EngineState::Failed) => {
                        tracing::error!("engine failed; exiting");
                        break;
                    }
                    Ok(state) => tracing::info!(state = %state, "state"),
                    Err(_) => break,
                }
            }
            recv(diagnostics) -> snap => {
                if let Ok(snap) = snap {
                    tracing::debug!(
                        state = %snap.state,
                        buffered_ms = snap.buffered_ms,
                        offset_us = snap.clock_offset_us,
                        drift_ppm = snap.drift_ppm,
                        underrun_ms = snap.underrun_ms,
                        late_drops = snap.late_drops,
                        orphans = snap.orphan_count,
                        "diagnostics"
                    );
                }
            }
        }
    }

    engine.shutdown();
    Ok(())
}
