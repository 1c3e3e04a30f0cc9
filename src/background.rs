//! 后台任务：定期清理被中断上传留下的暂存目录。

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::INCOMING_SWEEP_INTERVAL_SECS;
use crate::storage::ReportStore;

pub fn spawn_background_tasks(store: Arc<ReportStore>, incoming_ttl: Duration) {
    if incoming_ttl.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(INCOMING_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(err) = store.sweep_incoming(incoming_ttl).await {
                warn!(error = %err, "incoming sweep failed");
            }
        }
    });
}
