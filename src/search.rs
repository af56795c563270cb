/// Contract for the external full-text search sink.
///
/// The block processor pushes claim deletions and projections after every
/// committed block and trending datapoints per activation change. The
/// default implementation only logs; a real deployment plugs in an
/// Elasticsearch-style backend.

use std::collections::BTreeMap;
use std::future::Future;

use tracing::debug;

use crate::db::ClaimProjection;
use crate::error::Result;
use crate::staging::TrendingNotification;
use crate::types::ClaimHash;

#[derive(Debug, Clone)]
pub enum ClaimIndexOp {
    /// Payload is the claim id in hex.
    Delete(String),
    Update(ClaimProjection),
}

pub trait SearchIndex: Send + Sync + 'static {
    fn start(&self) -> impl Future<Output = Result<()>> + Send;
    fn claim_consumer(&self, ops: Vec<ClaimIndexOp>) -> impl Future<Output = Result<()>> + Send;
    fn apply_filters(
        &self,
        blocked_streams: &[ClaimHash],
        blocked_channels: &[ClaimHash],
        filtered_streams: &[ClaimHash],
        filtered_channels: &[ClaimHash],
    ) -> impl Future<Output = Result<()>> + Send;
    fn update_trending_score(
        &self,
        notifications: &BTreeMap<String, Vec<TrendingNotification>>,
    ) -> impl Future<Output = Result<()>> + Send;
    fn clear_caches(&self);
}

/// No-op sink that traces what would be sent.
#[derive(Default)]
pub struct NullSearchIndex;

impl SearchIndex for NullSearchIndex {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn claim_consumer(&self, ops: Vec<ClaimIndexOp>) -> Result<()> {
        for op in &ops {
            match op {
                ClaimIndexOp::Delete(claim_id) => debug!(%claim_id, "search delete"),
                ClaimIndexOp::Update(projection) => {
                    debug!(claim_id = %projection.claim_id, name = %projection.name, "search update")
                }
            }
        }
        Ok(())
    }

    async fn apply_filters(
        &self,
        _blocked_streams: &[ClaimHash],
        _blocked_channels: &[ClaimHash],
        _filtered_streams: &[ClaimHash],
        _filtered_channels: &[ClaimHash],
    ) -> Result<()> {
        Ok(())
    }

    async fn update_trending_score(
        &self,
        notifications: &BTreeMap<String, Vec<TrendingNotification>>,
    ) -> Result<()> {
        if !notifications.is_empty() {
            debug!(claims = notifications.len(), "trending update");
        }
        Ok(())
    }

    fn clear_caches(&self) {}
}
