use std::sync::Arc;

use anyhow::Context;
use services::services::task_board::{
    TaskBoard, client::HttpTaskService, config::BoardConfig, identity::Identity, invalidation,
    model::Priority,
};
use utils::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = BoardConfig::from_env().context("loading board configuration")?;
    let identity = Identity::from_env().context("loading board identity")?;
    tracing::info!(
        api = %config.api_base,
        user = %identity.name,
        admin = identity.is_admin(),
        "starting task board sync"
    );

    let service = Arc::new(HttpTaskService::new(config.clone()));
    let board = TaskBoard::new(service, identity, config.settings.clone());

    let (ws_client, events) = invalidation::connect(&config)
        .await
        .context("starting realtime channel")?;
    let listener = board.attach_invalidation(events);

    if let Err(err) = board.refresh().await {
        tracing::warn!(error = %err, "initial load failed; waiting for change notices");
    }

    let mut snapshots = board.subscribe();
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                let visible = |p| snapshot.tier(p).map_or(0, |t| t.rows.len());
                tracing::info!(
                    total = snapshot.total,
                    high = visible(Priority::High),
                    medium = visible(Priority::Medium),
                    low = visible(Priority::Low),
                    loading = snapshot.loading,
                    progress = %snapshot.progress,
                    error = ?snapshot.error,
                    "board updated"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    if let Err(err) = ws_client.shutdown() {
        tracing::debug!(?err, "realtime channel already closed");
    }
    listener.abort();
    Ok(())
}
