//! Background repair of catalog/blob mismatches.
//!
//! Sweeps three leftovers of interrupted uploads and deletes:
//! - pending rows older than the grace period, with any blob under their id.
//!   Uploads only hold a pending row between staging and commit, so an old
//!   one belongs to a request that died in that window.
//! - blobs with no catalog row at all, older than the grace period
//! - temporary files of abandoned blob writes

use crate::services::{
    blob_store::{BlobError, BlobStore},
    catalog::{Catalog, FileFilter},
};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What one sweep removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub pending_removed: usize,
    pub orphans_removed: usize,
    pub partials_removed: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone)]
pub struct Reconciler {
    catalog: Catalog,
    blobs: Arc<dyn BlobStore>,
    grace: Duration,
}

impl Reconciler {
    /// Anything younger than `grace` is assumed to belong to an upload that
    /// is still in flight and is left alone.
    pub fn new(catalog: Catalog, blobs: Arc<dyn BlobStore>, grace: Duration) -> Self {
        Self {
            catalog,
            blobs,
            grace,
        }
    }

    pub async fn run_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let grace = chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(grace)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        match self.catalog.list_stale_pending(cutoff).await {
            Ok(stale) => {
                for record in stale {
                    // Claim the row first. An upload that commits in between
                    // keeps its row and its blob.
                    match self.catalog.discard_pending(&record.id).await {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!("pending upload {} settled meanwhile", record.id);
                            continue;
                        }
                        Err(err) => {
                            error!("could not discard pending upload {}: {}", record.id, err);
                            continue;
                        }
                    }
                    warn!(
                        "removed stale pending upload {} ({}) by {}",
                        record.id, record.name, record.creator
                    );
                    report.pending_removed += 1;

                    match self.blobs.delete(&record.id).await {
                        Ok(()) | Err(BlobError::NotFound(_)) => {}
                        Err(err) => error!(
                            "orphan blob {} of stale upload left behind: {}",
                            record.id, err
                        ),
                    }
                }
            }
            Err(err) => error!("listing stale pending uploads failed: {}", err),
        }

        match self.blobs.list().await {
            Ok(entries) => {
                for entry in entries.into_iter().filter(|e| e.modified < cutoff) {
                    match self.catalog.count_files(FileFilter::Id(&entry.id)).await {
                        Ok(0) => {}
                        Ok(_) => continue,
                        Err(err) => {
                            error!("checking blob {} against the catalog failed: {}", entry.id, err);
                            continue;
                        }
                    }
                    match self.blobs.delete(&entry.id).await {
                        Ok(()) => {
                            warn!("removed orphan blob {}", entry.id);
                            report.orphans_removed += 1;
                        }
                        Err(BlobError::NotFound(_)) => {}
                        Err(err) => error!("could not remove orphan blob {}: {}", entry.id, err),
                    }
                }
            }
            Err(err) => error!("listing blobs failed: {}", err),
        }

        match self.blobs.purge_partial(self.grace).await {
            Ok(removed) => report.partials_removed = removed,
            Err(err) => error!("purging partial uploads failed: {}", err),
        }

        if report.is_clean() {
            debug!("reconciliation found nothing to repair");
        } else {
            info!("reconciliation finished: {:?}", report);
        }
        report
    }

    /// Run a sweep every `every` until the returned task is aborted.
    pub fn spawn(self, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; startup already ran a sweep.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}
