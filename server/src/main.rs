use std::sync::Arc;

use cloud_server::config::{generate_config_template, Config};
use cloud_server::content::sweep::spawn_content_sweep;
use cloud_server::session::IdleService;
use cloud_server::state::ServerState;
use cloud_server::{db, server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cloud_server=info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cloud_server=info")),
            )
            .init();
    }

    tracing::info!("Cloud server v{} starting", env!("CARGO_PKG_VERSION"));

    let addr = config.listen_addr()?;
    let db = db::init_db(&config.data_dir)?;

    let seeds = config.seed_users()?;
    if !seeds.is_empty() {
        let added = db::users::seed_users(&db, &seeds)?;
        tracing::info!("Seeded {} of {} configured users", added, seeds.len());
    }

    let state = ServerState::from_config(&config, db)?;
    tracing::info!(
        "Security level {:?}: {}-byte session tokens, sent unencrypted as the first message",
        state.security_level,
        state.security_level.token_len()
    );

    let content_config = config.content.clone().unwrap_or_default();
    spawn_content_sweep(state.store.clone(), content_config);

    let service = Arc::new(IdleService::new(state.tick));
    server::run(addr, state, service).await?;

    Ok(())
}
