//! Progress-delta aggregation (§4.C12 "Progress aggregation"). A single
//! task owns the `CampaignProgress` record; every worker only ever sends
//! deltas through an unbounded channel — the same single-writer-owns-state
//! shape as the teacher's `ServerState`, generalized from "mutated directly
//! by request handlers" to "mutated only by applying queued deltas".

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::domain::campaign::{CampaignProgress, CampaignStatus};
use crate::store::Store;

#[derive(Debug, Clone)]
pub enum ProgressDelta {
    Processed {
        prospects_found: u64,
        emails_generated: u64,
        emails_sent: u64,
        successful: bool,
    },
    Error,
    CurrentCompany(String),
    ClearCurrentCompany,
    CurrentStep(String),
    Status(CampaignStatus),
}

pub struct ProgressAggregator;

impl ProgressAggregator {
    /// Spawns the aggregator task. Applies deltas as they arrive; flushes
    /// the accumulated state to Store every `flush_interval` (only if
    /// something changed) and once more on channel close.
    pub fn spawn(
        progress: Arc<Mutex<CampaignProgress>>,
        mut rx: mpsc::UnboundedReceiver<ProgressDelta>,
        store: Arc<dyn Store>,
        flush_interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            let mut dirty = false;
            loop {
                tokio::select! {
                    delta = rx.recv() => {
                        match delta {
                            Some(delta) => {
                                apply(&progress, delta).await;
                                dirty = true;
                            }
                            None => {
                                flush(&progress, &store).await;
                                return;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        if dirty {
                            flush(&progress, &store).await;
                            dirty = false;
                        }
                    }
                }
            }
        })
    }
}

async fn apply(progress: &Arc<Mutex<CampaignProgress>>, delta: ProgressDelta) {
    let mut p = progress.lock().await;
    match delta {
        ProgressDelta::Processed {
            prospects_found,
            emails_generated,
            emails_sent,
            successful,
        } => {
            p.processed_count += 1;
            p.prospects_found += prospects_found;
            p.emails_generated += emails_generated;
            p.emails_sent += emails_sent;
            if successful {
                p.successful_companies += 1;
            }
            p.recompute_success_rate();
        }
        ProgressDelta::Error => p.error_count += 1,
        ProgressDelta::CurrentCompany(name) => p.current_company = Some(name),
        ProgressDelta::ClearCurrentCompany => p.current_company = None,
        ProgressDelta::CurrentStep(step) => p.current_step = step,
        ProgressDelta::Status(status) => {
            p.transition(status);
        }
    }
}

async fn flush(progress: &Arc<Mutex<CampaignProgress>>, store: &Arc<dyn Store>) {
    let snapshot = progress.lock().await.clone();
    if let Err(e) = store.upsert_campaign(&snapshot).await {
        tracing::warn!(campaign = %snapshot.id, error = %e, "progress flush failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FakeStore {
        writes: std::sync::Mutex<Vec<CampaignProgress>>,
    }

    #[async_trait::async_trait]
    impl Store for FakeStore {
        async fn upsert_prospect(&self, _: &crate::domain::Prospect) -> Result<String, crate::error::AppError> {
            unimplemented!()
        }
        async fn update_prospect_fields(&self, _: &str, _: &crate::store::ProspectPatch) -> Result<(), crate::error::AppError> {
            unimplemented!()
        }
        async fn get_processed_companies(&self) -> Result<HashSet<crate::domain::CompanyKey>, crate::error::AppError> {
            Ok(HashSet::new())
        }
        async fn find_prospects(&self, _: &crate::store::ProspectFilter) -> Result<Vec<crate::domain::Prospect>, crate::error::AppError> {
            Ok(vec![])
        }
        async fn append_log(&self, _: &crate::domain::ProcessingLogEntry) -> Result<(), crate::error::AppError> {
            Ok(())
        }
        async fn upsert_system_status(&self, _: &crate::domain::SystemStatus) -> Result<(), crate::error::AppError> {
            Ok(())
        }
        async fn upsert_campaign(&self, progress: &CampaignProgress) -> Result<(), crate::error::AppError> {
            self.writes.lock().unwrap().push(progress.clone());
            Ok(())
        }
        async fn get_campaign(&self, _: &str) -> Result<Option<CampaignProgress>, crate::error::AppError> {
            Ok(None)
        }
        async fn read_control_commands(
            &self,
            _: &str,
            _: chrono::DateTime<chrono::Utc>,
        ) -> Result<Vec<crate::domain::ControlCommand>, crate::error::AppError> {
            Ok(vec![])
        }
        async fn post_control_command(
            &self,
            _: &str,
            _: &crate::domain::ControlCommand,
        ) -> Result<(), crate::error::AppError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn deltas_accumulate_and_flush_on_channel_close() {
        let progress = Arc::new(Mutex::new(CampaignProgress::new("c1".into(), "test".into(), 5)));
        let (tx, rx) = mpsc::unbounded_channel();
        let store = Arc::new(FakeStore { writes: std::sync::Mutex::new(Vec::new()) });
        let handle = ProgressAggregator::spawn(Arc::clone(&progress), rx, store.clone(), Duration::from_secs(3600));

        tx.send(ProgressDelta::Processed {
            prospects_found: 2,
            emails_generated: 1,
            emails_sent: 0,
            successful: true,
        })
        .unwrap();
        tx.send(ProgressDelta::Error).unwrap();
        drop(tx);

        handle.await.unwrap();

        let final_state = progress.lock().await;
        assert_eq!(final_state.prospects_found, 2);
        assert_eq!(final_state.error_count, 1);
        assert_eq!(final_state.processed_count, 1);
        assert_eq!(store.writes.lock().unwrap().len(), 1);
    }
}
