//! Background maintenance for the content store.
//!
//! Blobs are reclaimed as soon as their last reference goes, so the periodic
//! sweep only cleans up after crashes and abandoned uploads: references no
//! entry ever consumed, zero-reference rows, and files that no row points at.

use std::time::Duration;

use crate::config::ContentConfig;
use crate::content::store::ContentStore;

/// Spawn a background task that runs `ContentStore::sweep` every
/// `sweep_interval_secs`.
pub fn spawn_content_sweep(store: ContentStore, config: ContentConfig) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_secs(config.sweep_interval_secs.max(1));
    let grace = Duration::from_secs(config.reservation_grace_secs);

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            let store = store.clone();
            match tokio::task::spawn_blocking(move || store.sweep(grace)).await {
                Ok(Ok(report)) => {
                    if report != Default::default() {
                        tracing::info!(
                            "Content sweep: dropped {} stale reservations, removed {} unreferenced rows, {} orphan files",
                            report.stale_reservations,
                            report.zero_ref_rows,
                            report.orphan_files
                        );
                    } else {
                        tracing::debug!("Content sweep: nothing to reclaim");
                    }
                }
                Ok(Err(e)) => {
                    tracing::error!("Content sweep error: {}", e);
                }
                Err(e) => {
                    tracing::error!("Content sweep task join error: {}", e);
                }
            }
        }
    })
}
