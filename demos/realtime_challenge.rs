use std::error::Error;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::Map;
use sunuid_sdk::config::{ChallengeType, ChannelConfig, SdkConfig};
use sunuid_sdk::realtime::EventKind;
use sunuid_sdk::service::ChallengeService;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sunuid_sdk=info")),
        )
        .init();

    let config = SdkConfig::new(
        "REPLACE_WITH_CLIENT_ID",
        SecretString::new("REPLACE_WITH_SECRET_ID".to_string()),
    )
    .with_challenge_type(ChallengeType::Authentication)
    .with_client_label("demo-kiosk")
    .with_realtime(ChannelConfig::default().with_reconnect(Duration::from_secs(3), 5));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut service = ChallengeService::new(config)?;
        let partner = service.init().await?;
        println!("partner={}", partner.partner_name);

        if !service.connect_realtime().await {
            println!(
                "realtime unavailable: {}",
                service.realtime_last_error().unwrap_or_default()
            );
        }

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        for kind in [EventKind::AuthSuccess, EventKind::AuthFailure, EventKind::SessionExpired] {
            let done_tx = done_tx.clone();
            service.on_realtime_event(kind, move |payload| {
                let _ = done_tx.send((kind, payload.clone()));
            });
        }

        let challenge = service.try_generate_qr(None, Map::new()).await?;
        println!(
            "session_id={} qr_code={} content={}",
            challenge.session_id, challenge.qr_code, challenge.content
        );

        match tokio::time::timeout(Duration::from_secs(120), done_rx.recv()).await {
            Ok(Some((kind, payload))) => println!("{kind}: {payload}"),
            _ => {
                let status = service.check_qr_status(&challenge.session_id).await;
                println!("status: {}", serde_json::to_string(&status)?);
            }
        }

        service.disconnect_realtime();
        Ok::<(), Box<dyn Error>>(())
    })
}
