use std::{collections::BTreeMap, time::Duration};

use crate::{
    block::{self, Meta},
    bucket::Bucket,
    clock::{unix_millis, Clock},
    error::{CompactError, ResultExt},
    id::BlockId,
    metrics::CompactorMetrics,
    observability::{log_debug, log_info},
    option::RetentionPolicy,
};

/// Mark every unmarked block whose `max_time` lies before `now - retention`
/// of its resolution. A zero retention never marks. Returns the ids marked.
///
/// Marking failures are retry-class.
pub async fn apply_retention_policy(
    bkt: &dyn Bucket,
    metas: &BTreeMap<BlockId, Meta>,
    policy: &RetentionPolicy,
    clock: &dyn Clock,
    metrics: &CompactorMetrics,
) -> Result<Vec<BlockId>, CompactError> {
    let mut marked = Vec::new();
    for meta in metas.values() {
        if meta.is_marked() {
            continue;
        }
        let Some(resolution) = meta.resolution_level() else {
            continue;
        };
        let retention = policy.for_resolution(resolution);
        if retention == Duration::ZERO {
            continue;
        }
        let now = clock.now();
        let cutoff = unix_millis(now).saturating_sub(retention.as_millis() as i64);
        if meta.max_time >= cutoff {
            continue;
        }
        log_info!(
            component = "retention",
            event = "block_expired",
            block = %meta.ulid,
            max_time = meta.max_time,
            cutoff,
        );
        if block::mark_for_deletion(bkt, &meta.ulid, now)
            .await
            .retry()
            .with_context(|| format!("mark expired block {}", meta.ulid))?
        {
            metrics.record_marked_for_deletion();
        }
        marked.push(meta.ulid);
    }
    log_debug!(
        component = "retention",
        event = "retention_applied",
        marked = marked.len(),
    );
    Ok(marked)
}
