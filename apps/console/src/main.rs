use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use booking_flow_cell::BookingSession;
use shared_config::AppConfig;
use shared_models::{DateWindow, Scope, ScopeKind};

const USAGE: &str = "usage: slotsync <specialty|professional> <uuid> [days]";

#[tokio::main]
async fn main() -> Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting slotsync console");

    // Load configuration
    let config = AppConfig::from_env();
    if !config.is_configured() {
        bail!("SCHEDULING_API_URL and SCHEDULING_PUSH_URL must be set");
    }

    let mut args = std::env::args().skip(1);
    let kind = match args.next().as_deref() {
        Some("specialty") => ScopeKind::Specialty,
        Some("professional") => ScopeKind::Professional,
        _ => bail!(USAGE),
    };
    let id: Uuid = args
        .next()
        .context(USAGE)?
        .parse()
        .context("scope id must be a UUID")?;
    let days: i64 = args
        .next()
        .map(|raw| raw.parse())
        .transpose()
        .context("days must be a number")?
        .unwrap_or(7);

    let today = Utc::now().date_naive();
    let scope = Scope {
        kind,
        id,
        window: DateWindow {
            from: today,
            to: today + Duration::days(days - 1),
        },
    };

    let session = BookingSession::new(&config);
    session.connect().await?;
    session.select_scope(scope).await?;

    for day in session.days().borrow().iter() {
        println!(
            "{}  {:>2} slot(s)  {}",
            day.date,
            day.slot_count,
            if day.available { "available" } else { "-" }
        );
    }

    session.close().await;
    Ok(())
}
