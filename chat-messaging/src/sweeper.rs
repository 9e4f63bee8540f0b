use anyhow::Result;
use std::time::Duration;

use crate::service::MessagingService;

/// Periodically recomputes conversation previews and unread counters from the message log.
pub async fn run(service: MessagingService) -> Result<()> {
    let interval = service.config().reconcile_interval();
    tracing::info!("Starting reconcile sweeper (every {:?})", interval);

    loop {
        tokio::time::sleep(interval).await;

        let pruned = service.prune_typing();
        if pruned > 0 {
            tracing::debug!("Pruned {} idle typing slots", pruned);
        }

        match service.reconcile_all().await {
            Ok(0) => tracing::debug!("Reconcile sweep found nothing to repair"),
            Ok(repaired) => tracing::info!("Reconcile sweep repaired {} conversations", repaired),
            Err(e) => {
                tracing::error!("Error in reconcile sweep: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
