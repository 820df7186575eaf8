use anyhow::Context;
use meshcall::{CallEvent, CallSession, Config};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const HELP: &str = "commands: /mic on|off, /cam on|off, /screen, /camera, /flip, /notes, /peers, /leave; anything else is chat";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Install rustls CryptoProvider (DTLS needs it) ───────────────────
    let _ = rustls::crypto::ring::default_provider().install_default();

    // Load .env before anything else so MESHCALL_LOG_LEVEL is available.
    let _ = dotenvy::dotenv();
    let log_level = std::env::var("MESHCALL_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    let cfg = Config::from_env();
    let room = std::env::args().nth(1).unwrap_or_else(|| cfg.default_room.clone());

    let session = CallSession::from_config(cfg)
        .await
        .context("could not set up the call session")?;
    tokio::spawn(log_events(session.events()));

    let me = session
        .join_room(&room)
        .await
        .with_context(|| format!("could not join room {room}"))?;
    info!(room = %room, peer = %me, "{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !run_command(&session, line.trim()).await {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("stdin read failed: {e}");
                        break;
                    }
                }
            }
        }
    }

    session.leave_room().await;
    Ok(())
}

/// Returns `false` when the user asked to leave.
async fn run_command(session: &CallSession, line: &str) -> bool {
    let result = match line {
        "" => return true,
        "/leave" => return false,
        "/mic on" => session.set_mic_enabled(true).await.map(|_| "mic on".to_string()),
        "/mic off" => session.set_mic_enabled(false).await.map(|_| "mic off".to_string()),
        "/cam on" => session.set_camera_enabled(true).await.map(|_| "camera on".to_string()),
        "/cam off" => session.set_camera_enabled(false).await.map(|_| "camera off".to_string()),
        "/screen" => session
            .switch_to_screen_share()
            .await
            .map(|changed| format!("screen share (changed: {changed})")),
        "/camera" => session
            .switch_to_camera()
            .await
            .map(|changed| format!("camera (changed: {changed})")),
        "/flip" => session
            .flip_camera_facing()
            .await
            .map(|changed| format!("camera flipped (renegotiated: {changed})")),
        "/notes" => session.request_notes_digest().await.map(|digest| {
            let mut out = format!("summary: {}", digest.summary);
            for point in &digest.key_points {
                out.push_str(&format!("\n  - {point}"));
            }
            for item in &digest.action_items {
                out.push_str(&format!("\n  [ ] {item}"));
            }
            out
        }),
        "/peers" => {
            let view = session.view().borrow().clone();
            let mut out = format!("{} peer(s)", view.peers.len());
            for (peer, status) in &view.peers {
                let (tracks, packets) = view.remote_streams.get(peer).map_or((0, 0), |s| {
                    (s.tracks().count(), s.tracks().map(|t| t.packets()).sum::<u64>())
                });
                out.push_str(&format!(
                    "\n  {} {} {}{} tracks={tracks} packets={packets}",
                    peer.short(),
                    status.role,
                    status.state,
                    if status.stalled { " (stalled)" } else { "" },
                ));
            }
            Ok(out)
        }
        cmd if cmd.starts_with('/') => Ok(HELP.to_string()),
        text => session
            .send_chat_message(text)
            .await
            .map(|_| String::new()),
    };

    match result {
        Ok(out) if out.is_empty() => {}
        Ok(out) => println!("{out}"),
        Err(e) => error!(code = e.code(), "{e}"),
    }
    true
}

async fn log_events(mut events: broadcast::Receiver<CallEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event.data) {
                Ok(data) => info!(event = event.event_type.as_str(), "{data}"),
                Err(e) => warn!("event serialization failed: {e}"),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("event log lagged, skipped {n}"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
