use std::path::Path;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::NaiveDate;
use salesload_core::{line_total, FileBatch, PersistenceError, WriteOutcome};
use salesload_storage::{MemorySalesStore, SalesStore, StoreCounts};
use salesload_sync::{CancelFlag, FileOutcome, IngestPipeline, LoadConfig};
use tempfile::{tempdir, TempDir};

const VALID: &str = "doc_id,item,category,amount,price,discount\n\
                     D1,Milk,dairy,3,1.10,0.30\n\
                     D1,Bread,bakery,1,2.00,0\n\
                     D2,Tea,drinks,2,4.25,0.50\n";

fn run_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 5, 14).expect("date")
}

fn config(root: &Path, workers: usize) -> LoadConfig {
    LoadConfig {
        incoming_dir: root.join("incoming"),
        claimed_dir: root.join("claimed"),
        processed_dir: root.join("processed"),
        rejected_dir: root.join("rejected"),
        workers,
        ..LoadConfig::default()
    }
}

struct Fixture {
    dir: TempDir,
    store: Arc<MemorySalesStore>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("incoming")).expect("incoming");
        Self {
            dir,
            store: Arc::new(MemorySalesStore::new()),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn drop_file(&self, name: &str, body: &str) {
        std::fs::write(self.root().join("incoming").join(name), body).expect("write incoming");
    }

    fn pipeline(&self, workers: usize) -> IngestPipeline {
        IngestPipeline::with_run_date(config(self.root(), workers), self.store.clone(), run_date())
    }

    fn files_in(&self, area: &str) -> Vec<String> {
        let mut names = std::fs::read_dir(self.root().join(area))
            .expect("read area")
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        names.sort();
        names
    }
}

#[tokio::test]
async fn files_are_routed_by_name_and_outcome() {
    let fx = Fixture::new();
    fx.drop_file("3_2.csv", VALID);
    fx.drop_file("foo.csv", "not,even,checked\n");

    let summary = fx.pipeline(1).run_once().await.expect("run");

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.inserted_rows, 3);
    assert!(fx.root().join("processed/2026-05-14/3_2.csv").exists());
    assert_eq!(
        std::fs::read_to_string(fx.root().join("rejected/foo.csv")).expect("rejected"),
        "not,even,checked\n"
    );
    assert!(fx.files_in("incoming").is_empty());
    assert!(fx.files_in("claimed").is_empty());

    match &summary.files[1] {
        FileOutcome::Rejected { file, reason, .. } => {
            assert_eq!(file, "foo.csv");
            assert_eq!(reason, "naming");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn reloading_the_same_file_adds_no_rows() {
    let fx = Fixture::new();
    fx.drop_file("3_2.csv", VALID);
    fx.pipeline(1).run_once().await.expect("first run");
    let first = fx.store.lines().await;

    fx.drop_file("3_2.csv", VALID);
    let summary = fx.pipeline(1).run_once().await.expect("second run");

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.inserted_rows, 0);
    assert_eq!(summary.duplicate_rows, 3);
    let second = fx.store.lines().await;
    assert_eq!(
        first.iter().map(|l| &l.line).collect::<Vec<_>>(),
        second.iter().map(|l| &l.line).collect::<Vec<_>>()
    );
    assert_eq!(fx.files_in("processed/2026-05-14"), vec!["3_2.1.csv", "3_2.csv"]);
}

#[tokio::test]
async fn persisted_lines_carry_derived_totals_and_provenance() {
    let fx = Fixture::new();
    fx.drop_file("3_2.csv", VALID);
    fx.pipeline(1).run_once().await.expect("run");

    let lines = fx.store.lines().await;
    assert_eq!(lines.len(), 3);
    let expected_source = fx.root().join("incoming/3_2.csv").display().to_string();
    for stored in &lines {
        let line = &stored.line;
        assert_eq!(Some(line.line_total), line_total(line.amount, line.price, line.discount));
        assert_eq!((line.shop_num, line.cash_num), (3, 2));
        assert_eq!(line.source_file, expected_source);
    }
    let mut row_nums = lines.iter().map(|l| l.line.row_num).collect::<Vec<_>>();
    row_nums.sort();
    assert_eq!(row_nums, vec![1, 2, 3]);
}

#[tokio::test]
async fn one_negative_amount_rejects_the_file_and_persists_nothing() {
    let fx = Fixture::new();
    fx.drop_file(
        "4_1.csv",
        "doc_id,item,category,amount,price,discount\nD1,Milk,dairy,2,1,0\nD1,Tea,drinks,-1,1,0\n",
    );

    let summary = fx.pipeline(1).run_once().await.expect("run");

    assert_eq!(summary.rejected, 1);
    assert_eq!(fx.files_in("rejected"), vec!["4_1.csv"]);
    assert_eq!(fx.store.counts().await.expect("counts"), StoreCounts::default());
    match &summary.files[0] {
        FileOutcome::Rejected { reason, .. } => assert_eq!(reason, "validation"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn schema_and_coercion_failures_are_rejected_and_the_run_continues() {
    let fx = Fixture::new();
    fx.drop_file("1_1.csv", "doc_id,item,amount\nD1,Milk,1\n");
    fx.drop_file("1_2.csv", "doc_id,item,category,amount,price,discount\nD1,Milk,dairy,x,1,0\n");
    fx.drop_file("1_3.csv", VALID);

    let summary = fx.pipeline(1).run_once().await.expect("run");

    let reasons = summary
        .files
        .iter()
        .map(|o| match o {
            FileOutcome::Rejected { reason, .. } => reason.as_str(),
            FileOutcome::Processed { .. } => "processed",
            _ => "other",
        })
        .collect::<Vec<_>>();
    assert_eq!(reasons, vec!["schema", "coercion", "processed"]);
    assert_eq!(fx.files_in("rejected"), vec!["1_1.csv", "1_2.csv"]);
    assert!(fx.files_in("incoming").is_empty());
}

#[tokio::test]
async fn registers_of_one_shop_share_one_shop_row() {
    let fx = Fixture::new();
    fx.drop_file("5_1.csv", VALID);
    fx.drop_file("5_2.csv", VALID);

    fx.pipeline(1).run_once().await.expect("run");

    let counts = fx.store.counts().await.expect("counts");
    assert_eq!(counts.shops, 1);
    assert_eq!(counts.cash_registers, 2);
    assert_eq!(counts.sales_lines, 6);
}

struct UnreachableStore;

#[async_trait]
impl SalesStore for UnreachableStore {
    async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn write_file(&self, _batch: &FileBatch) -> Result<WriteOutcome, PersistenceError> {
        Err(PersistenceError::Connection("connection refused".into()))
    }

    async fn counts(&self) -> Result<StoreCounts, PersistenceError> {
        Ok(StoreCounts::default())
    }
}

#[tokio::test]
async fn storage_failure_rejects_the_file() {
    let fx = Fixture::new();
    fx.drop_file("3_2.csv", VALID);
    let pipeline =
        IngestPipeline::with_run_date(config(fx.root(), 1), Arc::new(UnreachableStore), run_date());

    let summary = pipeline.run_once().await.expect("run");

    assert_eq!(summary.rejected, 1);
    assert_eq!(fx.files_in("rejected"), vec!["3_2.csv"]);
    match &summary.files[0] {
        FileOutcome::Rejected { reason, message, .. } => {
            assert_eq!(reason, "persistence");
            assert!(message.contains("connection refused"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn parallel_workers_process_every_file_once() {
    let fx = Fixture::new();
    for shop in 1..=6 {
        for cash in 1..=3 {
            fx.drop_file(&format!("{shop}_{cash}.csv"), VALID);
        }
    }
    fx.drop_file("junk.txt", "x");

    let summary = fx.pipeline(4).run_once().await.expect("run");

    assert_eq!(summary.processed, 18);
    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.inserted_rows, 54);
    let names = summary.files.iter().map(|o| o.file().to_string()).collect::<Vec<_>>();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);

    let counts = fx.store.counts().await.expect("counts");
    assert_eq!(counts.shops, 6);
    assert_eq!(counts.cash_registers, 18);
    assert_eq!(counts.sales_lines, 54);
    assert!(fx.files_in("incoming").is_empty());
    assert!(fx.files_in("claimed").is_empty());
}

#[tokio::test]
async fn cancelled_run_leaves_unclaimed_files_in_incoming() {
    let fx = Fixture::new();
    fx.drop_file("3_2.csv", VALID);
    let pipeline = fx.pipeline(1);
    pipeline.cancel_flag().cancel();

    let summary = pipeline.run_once().await.expect("run");

    assert!(summary.cancelled);
    assert!(summary.files.is_empty());
    assert_eq!(fx.files_in("incoming"), vec!["3_2.csv"]);
}

/// Raises the run's cancel flag from inside the first write, while that file is claimed.
struct CancelDuringWrite {
    inner: MemorySalesStore,
    flag: OnceLock<CancelFlag>,
}

#[async_trait]
impl SalesStore for CancelDuringWrite {
    async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        self.inner.ensure_schema().await
    }

    async fn write_file(&self, batch: &FileBatch) -> Result<WriteOutcome, PersistenceError> {
        if let Some(flag) = self.flag.get() {
            flag.cancel();
        }
        self.inner.write_file(batch).await
    }

    async fn counts(&self) -> Result<StoreCounts, PersistenceError> {
        self.inner.counts().await
    }
}

#[tokio::test]
async fn cancelling_mid_run_finishes_the_claimed_file_only() {
    let fx = Fixture::new();
    for name in ["1_1.csv", "2_1.csv", "3_1.csv"] {
        fx.drop_file(name, VALID);
    }
    let store = Arc::new(CancelDuringWrite {
        inner: MemorySalesStore::new(),
        flag: OnceLock::new(),
    });
    let pipeline = IngestPipeline::with_run_date(config(fx.root(), 1), store.clone(), run_date());
    store.flag.set(pipeline.cancel_flag()).expect("flag set once");

    let summary = pipeline.run_once().await.expect("run");

    assert!(summary.cancelled);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.files.len(), 1);
    assert_eq!(fx.files_in("processed/2026-05-14"), vec!["1_1.csv"]);
    assert_eq!(fx.files_in("incoming"), vec!["2_1.csv", "3_1.csv"]);
    assert!(fx.files_in("claimed").is_empty());
    assert_eq!(store.counts().await.expect("counts").sales_lines, 3);
}

#[tokio::test]
async fn money_overflow_rejects_one_file_and_the_run_continues() {
    let fx = Fixture::new();
    fx.drop_file(
        "1_1.csv",
        "doc_id,item,category,amount,price,discount\nD1,X,c,1000000000,1e20,0\n",
    );
    fx.drop_file("2_1.csv", VALID);

    let summary = fx.pipeline(1).run_once().await.expect("run");

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.rejected, 1);
    match &summary.files[0] {
        FileOutcome::Rejected { file, reason, .. } => {
            assert_eq!(file, "1_1.csv");
            assert_eq!(reason, "validation");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(fx.files_in("rejected"), vec!["1_1.csv"]);
    assert_eq!(fx.files_in("processed/2026-05-14"), vec!["2_1.csv"]);
    assert!(fx.files_in("incoming").is_empty());
    assert!(fx.files_in("claimed").is_empty());
}

/// Panics on shop 1 and stores everything else.
struct PanicsOnShopOne(MemorySalesStore);

#[async_trait]
impl SalesStore for PanicsOnShopOne {
    async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        self.0.ensure_schema().await
    }

    async fn write_file(&self, batch: &FileBatch) -> Result<WriteOutcome, PersistenceError> {
        if batch.register.shop_num == 1 {
            panic!("store blew up");
        }
        self.0.write_file(batch).await
    }

    async fn counts(&self) -> Result<StoreCounts, PersistenceError> {
        self.0.counts().await
    }
}

#[tokio::test]
async fn panic_while_loading_rejects_only_that_file() {
    let fx = Fixture::new();
    fx.drop_file("1_1.csv", VALID);
    fx.drop_file("2_1.csv", VALID);
    let store = Arc::new(PanicsOnShopOne(MemorySalesStore::new()));
    let pipeline = IngestPipeline::with_run_date(config(fx.root(), 2), store.clone(), run_date());

    let summary = pipeline.run_once().await.expect("run");

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.rejected, 1);
    match &summary.files[0] {
        FileOutcome::Rejected { reason, .. } => assert_eq!(reason, "internal"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(fx.files_in("rejected"), vec!["1_1.csv"]);
    assert!(fx.files_in("claimed").is_empty());
    assert_eq!(store.counts().await.expect("counts").sales_lines, 3);
}

#[tokio::test]
async fn stale_claim_keeps_file_in_incoming() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.root().join("claimed")).expect("claimed");
    std::fs::write(fx.root().join("claimed/3_2.csv"), "older").expect("stale");
    fx.drop_file("3_2.csv", VALID);

    let summary = fx.pipeline(1).run_once().await.expect("run");

    assert_eq!(summary.skipped, 1);
    assert_eq!(fx.files_in("incoming"), vec!["3_2.csv"]);
    assert_eq!(fx.store.counts().await.expect("counts").sales_lines, 0);
}

#[tokio::test]
async fn subdirectories_of_incoming_are_left_alone() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.root().join("incoming/archive")).expect("subdir");
    fx.drop_file("3_2.csv", VALID);

    let summary = fx.pipeline(1).run_once().await.expect("run");

    assert_eq!(summary.files.len(), 1);
    assert!(fx.root().join("incoming/archive").is_dir());
}

#[tokio::test]
async fn summary_serializes_with_status_tags() {
    let fx = Fixture::new();
    fx.drop_file("3_2.csv", VALID);
    let summary = fx.pipeline(1).run_once().await.expect("run");

    let json = serde_json::to_value(&summary).expect("json");
    assert_eq!(json["files"][0]["status"], "processed");
    assert_eq!(json["run_date"], "2026-05-14");
    assert_eq!(json["inserted_rows"], 3);
}
