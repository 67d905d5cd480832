use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Context, Result};

use crate::types::{PublishedRecord, RecordStatus};

const COLUMNS: [&str; 6] = ["id", "title", "video_url", "thumbnail_url", "deep_link", "status"];

/// Append-only CSV dataset: one row per template id, header written once.
///
/// Only the pipeline's single receiver loop holds a `Dataset`, so rows are
/// never interleaved. Every append is flushed before the ledger records the
/// id as written.
pub struct Dataset {
    writer: csv::Writer<std::fs::File>,
}

impl Dataset {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }

        let is_new = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open dataset {}", path.display()))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if is_new {
            writer.write_record(COLUMNS)?;
            writer.flush()?;
        }

        Ok(Self { writer })
    }

    /// Append one record and flush. The caller guarantees the id is not
    /// already present (enforced through the ledger plus [`Dataset::existing`]).
    pub fn append(&mut self, record: &PublishedRecord) -> Result<()> {
        self.writer.serialize(record)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Ids (and statuses) already present in the dataset file. Used at run
    /// start to reconcile the ledger after a crash between CSV append and
    /// ledger flush.
    pub fn existing(path: &Path) -> Result<HashMap<String, RecordStatus>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("read dataset {}", path.display()))?;
        let mut out = HashMap::new();
        for row in reader.deserialize::<PublishedRecord>() {
            let rec = row.context("malformed dataset row")?;
            out.insert(rec.id, rec.status);
        }
        Ok(out)
    }
}
