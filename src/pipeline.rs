use std::sync::Arc;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{info, warn};

use crate::config::Config;
use crate::dataset::Dataset;
use crate::db::{self, WorkItem};
use crate::error::PipelineError;
use crate::fetch::Fetcher;
use crate::publish::Publisher;
use crate::thumbnail::Extractor;
use crate::types::{deep_link, PublishedRecord, RecordStatus, TemplateDescriptor};

/// Counts reported after a run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub processed: usize,
    pub done: usize,
    pub partial: usize,
    /// Failures that exhausted their attempt budget and were written to the
    /// dataset this run.
    pub failed: usize,
    /// Failures that still have retry budget for a later run.
    pub retrying: usize,
    /// Descriptors left pending because cancellation arrived before they
    /// reached a terminal state.
    pub skipped: usize,
    pub failed_ids: Vec<String>,
}

/// What a worker chain sends back to the single writer loop.
enum Outcome {
    Published {
        prior_attempts: u32,
        record: PublishedRecord,
    },
    Failed {
        descriptor: TemplateDescriptor,
        prior_attempts: u32,
        error: String,
    },
    /// Cancellation arrived before the chain reached a terminal state.
    Skipped,
}

/// Owns the end-to-end flow: dedup against the ledger, a bounded worker pool
/// driving fetch -> extract -> publish per descriptor, and the single
/// serialized ledger/dataset write path.
pub struct PipelineCoordinator {
    cfg: Config,
    fetcher: Arc<dyn Fetcher>,
    extractor: Arc<dyn Extractor>,
    publisher: Arc<dyn Publisher>,
}

impl PipelineCoordinator {
    pub fn new(
        cfg: Config,
        fetcher: Arc<dyn Fetcher>,
        extractor: Arc<dyn Extractor>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            cfg,
            fetcher,
            extractor,
            publisher,
        }
    }

    /// Process everything the ledger considers due, up to `limit`.
    ///
    /// Flipping `cancel` to true stops dispatch of new descriptors; chains
    /// already in flight finish or fail their current stage, and the ledger
    /// is checkpointed for every outcome that made it to a terminal state.
    pub async fn run(
        &self,
        conn: &Connection,
        limit: Option<usize>,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunSummary> {
        // Dataset rows are authoritative for "already published": fold them
        // into the ledger before deciding what is due.
        let existing = Dataset::existing(&self.cfg.dataset_path)?;
        let reconciled = db::reconcile_dataset(conn, &existing)?;
        if reconciled > 0 {
            info!("Reconciled {} ledger row(s) from the dataset", reconciled);
        }

        let work = db::fetch_processable(conn, self.cfg.max_descriptor_attempts, limit)?;
        let mut summary = RunSummary::default();
        if work.is_empty() {
            return Ok(summary);
        }

        let total = work.len();
        let mut dataset = Dataset::open(&self.cfg.dataset_path)?;
        let semaphore = Arc::new(Semaphore::new(self.cfg.concurrency));

        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
                .progress_chars("=> "),
        );

        // Workers send outcomes, this loop owns the only writer path.
        let (tx, mut rx) = mpsc::channel::<Outcome>(self.cfg.concurrency * 2);

        let mut dispatched = 0usize;
        for item in work {
            if *cancel.borrow() {
                break;
            }
            dispatched += 1;

            let WorkItem {
                descriptor,
                attempts,
            } = item;
            let sem = Arc::clone(&semaphore);
            let tx = tx.clone();
            let cancel = cancel.clone();
            let cfg = self.cfg.clone();
            let fetcher = Arc::clone(&self.fetcher);
            let extractor = Arc::clone(&self.extractor);
            let publisher = Arc::clone(&self.publisher);

            tokio::spawn(async move {
                let _permit = sem.acquire().await.unwrap();
                let outcome = run_chain(
                    &cfg,
                    &*fetcher,
                    &*extractor,
                    &*publisher,
                    descriptor,
                    attempts,
                    cancel,
                )
                .await;
                let _ = tx.send(outcome).await;
            });
        }
        summary.skipped = total - dispatched;

        // Drop our copy of tx so rx closes when all spawned chains finish.
        drop(tx);

        while let Some(outcome) = rx.recv().await {
            self.checkpoint(conn, &mut dataset, &existing, outcome, &mut summary)?;
            pb.inc(1);
        }
        pb.finish_and_clear();

        summary.failed_ids = db::failed_ids(conn)?;
        info!(
            "Run complete: {} done, {} partial, {} failed, {} retrying, {} skipped",
            summary.done, summary.partial, summary.failed, summary.retrying, summary.skipped
        );
        Ok(summary)
    }

    /// Apply one outcome: for terminal transitions, dataset append first
    /// (flushed), then the ledger update. Both happen on this single task, so
    /// rows never interleave and the ledger is current after every outcome.
    /// Skipped chains touch neither and stay `pending`.
    fn checkpoint(
        &self,
        conn: &Connection,
        dataset: &mut Dataset,
        existing: &std::collections::HashMap<String, RecordStatus>,
        outcome: Outcome,
        summary: &mut RunSummary,
    ) -> Result<()> {
        match outcome {
            Outcome::Skipped => {
                summary.skipped += 1;
            }
            Outcome::Published {
                prior_attempts,
                record,
            } => {
                summary.processed += 1;
                let status = match record.status {
                    RecordStatus::Ok => "done",
                    RecordStatus::Partial => "partial",
                    RecordStatus::Failed => "failed",
                };
                if !existing.contains_key(&record.id) {
                    dataset.append(&record)?;
                }
                db::record_outcome(conn, &record.id, status, prior_attempts + 1, None, true)?;
                match record.status {
                    RecordStatus::Ok => summary.done += 1,
                    RecordStatus::Partial => summary.partial += 1,
                    RecordStatus::Failed => summary.failed += 1,
                }
            }
            Outcome::Failed {
                descriptor,
                prior_attempts,
                error,
            } => {
                summary.processed += 1;
                let attempts = prior_attempts + 1;
                let terminal = attempts >= self.cfg.max_descriptor_attempts;
                if terminal {
                    let record = PublishedRecord {
                        id: descriptor.id.clone(),
                        title: descriptor.title.clone(),
                        video_url: String::new(),
                        thumbnail_url: String::new(),
                        deep_link: deep_link(&descriptor.id),
                        status: RecordStatus::Failed,
                    };
                    if !existing.contains_key(&record.id) {
                        dataset.append(&record)?;
                    }
                    summary.failed += 1;
                } else {
                    summary.retrying += 1;
                }
                db::record_outcome(
                    conn,
                    &descriptor.id,
                    "failed",
                    attempts,
                    Some(&error),
                    terminal,
                )?;
            }
        }
        Ok(())
    }
}

/// One descriptor's strict fetch -> extract -> publish chain.
///
/// Yields `Outcome::Skipped` when cancellation arrived before the chain could
/// start or between stages: nothing terminal happened, the ledger keeps the
/// descriptor `pending`, and scratch space is reclaimed either way.
async fn run_chain(
    cfg: &Config,
    fetcher: &dyn Fetcher,
    extractor: &dyn Extractor,
    publisher: &dyn Publisher,
    descriptor: TemplateDescriptor,
    prior_attempts: u32,
    cancel: watch::Receiver<bool>,
) -> Outcome {
    let outcome = drive_stages(fetcher, extractor, publisher, &descriptor, &cancel).await;

    // Scratch artifacts are transient whatever happened to the chain.
    let _ = tokio::fs::remove_dir_all(cfg.scratch_for(&descriptor.id)).await;

    match outcome {
        Some(Ok(record)) => Outcome::Published {
            prior_attempts,
            record,
        },
        Some(Err(e)) => {
            warn!("Chain failed for {}: {}", descriptor.id, e);
            Outcome::Failed {
                prior_attempts,
                error: e.to_string(),
                descriptor,
            }
        }
        None => {
            info!("Cancelled before {} reached a terminal state", descriptor.id);
            Outcome::Skipped
        }
    }
}

async fn drive_stages(
    fetcher: &dyn Fetcher,
    extractor: &dyn Extractor,
    publisher: &dyn Publisher,
    descriptor: &TemplateDescriptor,
    cancel: &watch::Receiver<bool>,
) -> Option<Result<PublishedRecord, PipelineError>> {
    // Chains queued behind the semaphore must not start fetching after
    // cancellation; only work already past this point may finish its stage.
    if *cancel.borrow() {
        return None;
    }

    let asset = match fetcher.fetch(descriptor).await {
        Ok(asset) => asset,
        Err(e) => return Some(Err(e)),
    };
    if *cancel.borrow() {
        return None;
    }

    let thumb = match extractor.extract(&asset).await {
        Ok(thumb) => thumb,
        Err(e) => return Some(Err(e)),
    };
    if *cancel.borrow() {
        return None;
    }

    Some(publisher.publish(descriptor, &asset, &thumb).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FetchedAsset, Thumbnail};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    // ── Fakes ──

    #[derive(Clone, Copy)]
    enum FetchPlan {
        Ok,
        Transient,
        TriggerCancel,
    }

    struct FakeFetcher {
        plans: HashMap<String, FetchPlan>,
        calls: AtomicUsize,
        cancel_tx: Option<Arc<watch::Sender<bool>>>,
        scratch: PathBuf,
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(&self, desc: &TemplateDescriptor) -> Result<FetchedAsset, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.plans.get(&desc.id).copied().unwrap_or(FetchPlan::Ok) {
                FetchPlan::Transient => Err(PipelineError::Transfer {
                    id: desc.id.clone(),
                    reason: "timeout".into(),
                }),
                FetchPlan::TriggerCancel => {
                    if let Some(tx) = &self.cancel_tx {
                        let _ = tx.send(true);
                    }
                    Ok(self.asset(desc))
                }
                FetchPlan::Ok => Ok(self.asset(desc)),
            }
        }
    }

    impl FakeFetcher {
        fn asset(&self, desc: &TemplateDescriptor) -> FetchedAsset {
            FetchedAsset {
                descriptor_id: desc.id.clone(),
                local_video_path: self.scratch.join(&desc.id).join("preview.mp4"),
                byte_size: 10,
                checksum: "feed".into(),
            }
        }
    }

    struct FakeExtractor {
        decode_fail: Vec<String>,
    }

    #[async_trait]
    impl Extractor for FakeExtractor {
        async fn extract(&self, asset: &FetchedAsset) -> Result<Thumbnail, PipelineError> {
            if self.decode_fail.contains(&asset.descriptor_id) {
                return Err(PipelineError::Decode {
                    id: asset.descriptor_id.clone(),
                    reason: "zero duration".into(),
                });
            }
            Ok(Thumbnail {
                descriptor_id: asset.descriptor_id.clone(),
                local_image_path: asset.local_video_path.with_file_name("thumb.jpg"),
            })
        }
    }

    struct FakePublisher {
        partial: Vec<String>,
        failed: Vec<String>,
        published: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Publisher for FakePublisher {
        async fn publish(
            &self,
            desc: &TemplateDescriptor,
            _asset: &FetchedAsset,
            _thumb: &Thumbnail,
        ) -> Result<PublishedRecord, PipelineError> {
            self.published.lock().unwrap().push(desc.id.clone());
            let status = if self.failed.contains(&desc.id) {
                RecordStatus::Failed
            } else if self.partial.contains(&desc.id) {
                RecordStatus::Partial
            } else {
                RecordStatus::Ok
            };
            Ok(PublishedRecord {
                id: desc.id.clone(),
                title: desc.title.clone(),
                video_url: format!("https://files.example/{}.mp4", desc.id),
                thumbnail_url: match status {
                    RecordStatus::Ok => format!("https://files.example/{}.jpg", desc.id),
                    _ => String::new(),
                },
                deep_link: deep_link(&desc.id),
                status,
            })
        }
    }

    // ── Harness ──

    struct Harness {
        _dir: tempfile::TempDir,
        cfg: Config,
        conn: Connection,
        fetcher: Arc<FakeFetcher>,
        coordinator: PipelineCoordinator,
    }

    fn harness(
        plans: HashMap<String, FetchPlan>,
        decode_fail: Vec<String>,
        partial: Vec<String>,
        cancel_tx: Option<Arc<watch::Sender<bool>>>,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            concurrency: 2,
            max_descriptor_attempts: 3,
            scratch_dir: dir.path().join("scratch"),
            db_path: dir.path().join("ledger.sqlite"),
            dataset_path: dir.path().join("templates.csv"),
            ..Config::default()
        };
        let conn = db::connect(&cfg.db_path).unwrap();
        db::init_schema(&conn).unwrap();

        let fetcher = Arc::new(FakeFetcher {
            plans,
            calls: AtomicUsize::new(0),
            cancel_tx,
            scratch: cfg.scratch_dir.clone(),
        });
        let coordinator = PipelineCoordinator::new(
            cfg.clone(),
            fetcher.clone(),
            Arc::new(FakeExtractor { decode_fail }),
            Arc::new(FakePublisher {
                partial,
                failed: vec![],
                published: Mutex::new(Vec::new()),
            }),
        );
        Harness {
            _dir: dir,
            cfg,
            conn,
            fetcher,
            coordinator,
        }
    }

    fn descriptor(id: &str) -> TemplateDescriptor {
        TemplateDescriptor {
            id: id.to_string(),
            title: format!("Template {id}"),
            source_url: format!("https://www.capcut.com/template-detail/t/{id}"),
        }
    }

    fn no_cancel() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn successful_chain_lands_in_dataset_and_ledger() {
        let h = harness(HashMap::new(), vec![], vec![], None);
        db::insert_discovered(&h.conn, &[descriptor("1")]).unwrap();

        let summary = h.coordinator.run(&h.conn, None, no_cancel()).await.unwrap();
        assert_eq!(summary.done, 1);

        let rows = Dataset::existing(&h.cfg.dataset_path).unwrap();
        assert_eq!(rows["1"], RecordStatus::Ok);
        assert_eq!(db::get_stats(&h.conn, 3).unwrap().done, 1);
    }

    #[tokio::test]
    async fn done_ids_cause_no_network_calls_or_duplicate_rows() {
        let h = harness(HashMap::new(), vec![], vec![], None);
        db::insert_discovered(&h.conn, &[descriptor("1")]).unwrap();
        h.coordinator.run(&h.conn, None, no_cancel()).await.unwrap();
        let calls_after_first = h.fetcher.calls.load(Ordering::SeqCst);

        // Re-discover and re-run: the ledger short-circuits before any fetch.
        db::insert_discovered(&h.conn, &[descriptor("1")]).unwrap();
        let summary = h.coordinator.run(&h.conn, None, no_cancel()).await.unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), calls_after_first);

        let text = std::fs::read_to_string(&h.cfg.dataset_path).unwrap();
        assert_eq!(text.matches("files.example/1.mp4").count(), 1);
    }

    #[tokio::test]
    async fn decode_failure_does_not_stop_other_chains() {
        let h = harness(HashMap::new(), vec!["bad".to_string()], vec![], None);
        db::insert_discovered(&h.conn, &[descriptor("bad"), descriptor("good")]).unwrap();

        let summary = h.coordinator.run(&h.conn, None, no_cancel()).await.unwrap();
        assert_eq!(summary.done, 1);
        assert_eq!(summary.retrying, 1);

        let rows = Dataset::existing(&h.cfg.dataset_path).unwrap();
        assert_eq!(rows["good"], RecordStatus::Ok);
        // The decode failure still has retry budget, so no dataset row yet.
        assert!(!rows.contains_key("bad"));
        assert!(summary.failed_ids.contains(&"bad".to_string()));
    }

    #[tokio::test]
    async fn partial_publish_is_terminal_and_recorded() {
        let h = harness(HashMap::new(), vec![], vec!["p".to_string()], None);
        db::insert_discovered(&h.conn, &[descriptor("p")]).unwrap();

        let summary = h.coordinator.run(&h.conn, None, no_cancel()).await.unwrap();
        assert_eq!(summary.partial, 1);
        assert_eq!(Dataset::existing(&h.cfg.dataset_path).unwrap()["p"], RecordStatus::Partial);

        // Partial means the video is live: never reprocessed.
        let summary = h.coordinator.run(&h.conn, None, no_cancel()).await.unwrap();
        assert_eq!(summary.processed, 0);
    }

    #[tokio::test]
    async fn attempt_exhaustion_writes_one_failed_row() {
        let mut plans = HashMap::new();
        plans.insert("f".to_string(), FetchPlan::Transient);
        let h = harness(plans, vec![], vec![], None);
        db::insert_discovered(&h.conn, &[descriptor("f")]).unwrap();

        // max_descriptor_attempts is 3: two retryable runs, then terminal.
        for _ in 0..2 {
            let s = h.coordinator.run(&h.conn, None, no_cancel()).await.unwrap();
            assert_eq!(s.retrying, 1);
            assert_eq!(s.failed, 0);
        }
        let s = h.coordinator.run(&h.conn, None, no_cancel()).await.unwrap();
        assert_eq!(s.failed, 1);

        let rows = Dataset::existing(&h.cfg.dataset_path).unwrap();
        assert_eq!(rows["f"], RecordStatus::Failed);

        // Exhausted means done retrying: the next run is a no-op.
        let s = h.coordinator.run(&h.conn, None, no_cancel()).await.unwrap();
        assert_eq!(s.processed, 0);
        let text = std::fs::read_to_string(&h.cfg.dataset_path).unwrap();
        assert_eq!(text.matches("\nf,").count(), 1);
    }

    #[tokio::test]
    async fn cancellation_leaves_in_flight_descriptor_pending() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);

        // "a" publishes normally; "b"'s fetch triggers cancellation, so its
        // chain must stop before extract and leave no terminal trace.
        let mut plans = HashMap::new();
        plans.insert("b".to_string(), FetchPlan::TriggerCancel);
        let h = harness(plans, vec![], vec![], Some(cancel_tx));
        // Serialize the two chains so "a" completes before "b" dispatches.
        let h = Harness {
            coordinator: PipelineCoordinator::new(
                Config {
                    concurrency: 1,
                    ..h.cfg.clone()
                },
                h.fetcher.clone(),
                Arc::new(FakeExtractor { decode_fail: vec![] }),
                Arc::new(FakePublisher {
                    partial: vec![],
                    failed: vec![],
                    published: Mutex::new(Vec::new()),
                }),
            ),
            ..h
        };
        db::insert_discovered(&h.conn, &[descriptor("a"), descriptor("b")]).unwrap();

        let summary = h.coordinator.run(&h.conn, None, cancel_rx).await.unwrap();
        assert_eq!(summary.done, 1);

        let rows = Dataset::existing(&h.cfg.dataset_path).unwrap();
        assert!(rows.contains_key("a"));
        assert!(!rows.contains_key("b"));

        let stats = db::get_stats(&h.conn, 3).unwrap();
        assert_eq!(stats.done, 1);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn cancellation_stops_queued_chains_before_fetch() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);

        // "a"'s fetch flips the flag while "b" and "c" are parked on the
        // semaphore; neither of them may reach its fetch stage.
        let mut plans = HashMap::new();
        plans.insert("a".to_string(), FetchPlan::TriggerCancel);
        let h = harness(plans, vec![], vec![], Some(cancel_tx));
        let h = Harness {
            coordinator: PipelineCoordinator::new(
                Config {
                    concurrency: 1,
                    ..h.cfg.clone()
                },
                h.fetcher.clone(),
                Arc::new(FakeExtractor { decode_fail: vec![] }),
                Arc::new(FakePublisher {
                    partial: vec![],
                    failed: vec![],
                    published: Mutex::new(Vec::new()),
                }),
            ),
            ..h
        };
        db::insert_discovered(&h.conn, &[descriptor("a"), descriptor("b"), descriptor("c")])
            .unwrap();

        let summary = h.coordinator.run(&h.conn, None, cancel_rx).await.unwrap();
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.processed, 0);
        assert!(Dataset::existing(&h.cfg.dataset_path).unwrap().is_empty());
        assert_eq!(db::get_stats(&h.conn, 3).unwrap().pending, 3);
    }

    #[tokio::test]
    async fn publisher_reported_failure_counts_as_failed() {
        let h = harness(HashMap::new(), vec![], vec![], None);
        let coordinator = PipelineCoordinator::new(
            h.cfg.clone(),
            h.fetcher.clone(),
            Arc::new(FakeExtractor { decode_fail: vec![] }),
            Arc::new(FakePublisher {
                partial: vec![],
                failed: vec!["x".to_string()],
                published: Mutex::new(Vec::new()),
            }),
        );
        db::insert_discovered(&h.conn, &[descriptor("x")]).unwrap();

        let summary = coordinator.run(&h.conn, None, no_cancel()).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.done, 0);
        assert_eq!(summary.partial, 0);
        let rows = Dataset::existing(&h.cfg.dataset_path).unwrap();
        assert_eq!(rows["x"], RecordStatus::Failed);
    }

    #[tokio::test]
    async fn cancellation_before_dispatch_skips_everything() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let h = harness(HashMap::new(), vec![], vec![], None);
        db::insert_discovered(&h.conn, &[descriptor("1"), descriptor("2")]).unwrap();

        let summary = h.coordinator.run(&h.conn, None, rx).await.unwrap();
        assert_eq!(summary.skipped, 2);
        assert_eq!(db::get_stats(&h.conn, 3).unwrap().pending, 2);
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
    }
}
