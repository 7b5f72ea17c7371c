// src/write/mod.rs

use arrow::{
    compute::concat_batches,
    datatypes::Schema,
    record_batch::{RecordBatch, RecordBatchReader},
};
use chrono::{DateTime, Utc};
use glob::glob;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::Serialize;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Locator, WriteMode};
use crate::entity::Entity;
use crate::error::{PipelineError, Result};

const PART_FILE: &str = "part-00000.parquet";

#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub path: PathBuf,
    pub file: PathBuf,
    pub rows: usize,
    pub mode: WriteMode,
}

/// Exclusive claim on an output locator, held for the duration of a write.
#[derive(Debug)]
pub struct WriteLock {
    path: PathBuf,
}

impl WriteLock {
    /// Fails with `WriteConflict` if another live writer holds the lock.
    ///
    /// A lock left behind by a dead process, or older than `stale_after`, is
    /// reclaimed.
    pub fn acquire(target: &Path, locator: &Locator, stale_after: Duration) -> Result<Self> {
        let path = sibling(target, "lock");
        match Self::create(&path) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        if !lock_is_stale(&path, stale_after) {
            return Err(PipelineError::WriteConflict {
                locator: locator.to_string(),
            });
        }
        warn!(path = %path.display(), "reclaiming stale write lock");
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // another writer may have reclaimed it first
        match Self::create(&path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(PipelineError::WriteConflict {
                locator: locator.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn create(path: &Path) -> io::Result<Self> {
        let mut f = OpenOptions::new().write(true).create_new(true).open(path)?;
        // best effort; the file's existence is the lock
        let _ = writeln!(f, "{} {}", std::process::id(), Utc::now().to_rfc3339());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

/// `<pid> <rfc3339>` as written by `WriteLock::create`.
fn read_lock(path: &Path) -> Option<(u32, DateTime<Utc>)> {
    let text = fs::read_to_string(path).ok()?;
    let mut parts = text.split_whitespace();
    let pid = parts.next()?.parse().ok()?;
    let at = DateTime::parse_from_rfc3339(parts.next()?).ok()?;
    Some((pid, at.with_timezone(&Utc)))
}

fn lock_is_stale(path: &Path, stale_after: Duration) -> bool {
    match read_lock(path) {
        Some((pid, at)) => {
            if pid != std::process::id() && !process_alive(pid) {
                debug!(pid, "lock holder is gone");
                return true;
            }
            // a timestamp in the future reads as fresh
            (Utc::now() - at)
                .to_std()
                .map(|age| age > stale_after)
                .unwrap_or(false)
        }
        // unreadable or half-written: fall back to the file's age
        None => fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .map(|age| age > stale_after)
            .unwrap_or(false),
    }
}

fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).is_some()
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "failed to release write lock: {}", e);
        }
    }
}

/// `<parent>/.<name>.<suffix>`, next to the output directory.
fn sibling(target: &Path, suffix: &str) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".into());
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".{}.{}", name, suffix))
}

/// Persist `batch` at `target` (the resolved output locator).
///
/// Overwrite stages the full table next to the target and swaps it in with
/// renames, so readers see either the old or the new output. Append adds one
/// more part file and refuses parts with a different schema.
#[instrument(level = "info", skip_all, fields(entity = %entity, target = %target.display(), mode = ?mode))]
pub fn write_table(
    entity: Entity,
    batch: &RecordBatch,
    target: &Path,
    locator: &Locator,
    mode: WriteMode,
    stale_after: Duration,
) -> Result<WriteOutcome> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let _lock = WriteLock::acquire(target, locator, stale_after)?;

    let file = match mode {
        WriteMode::Overwrite => overwrite(batch, target)?,
        WriteMode::Append => append(entity, batch, target)?,
    };

    info!(rows = batch.num_rows(), file = %file.display(), "wrote table");
    Ok(WriteOutcome {
        path: target.to_path_buf(),
        file,
        rows: batch.num_rows(),
        mode,
    })
}

fn write_parquet_file(batch: &RecordBatch, path: &Path) -> Result<()> {
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_dictionary_enabled(true)
        .build();
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(BufWriter::new(file), batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

fn overwrite(batch: &RecordBatch, target: &Path) -> Result<PathBuf> {
    let stamp = Utc::now().timestamp_micros();
    let staging = sibling(target, &format!("staging-{}", stamp));
    fs::create_dir_all(&staging)?;

    if let Err(e) = write_parquet_file(batch, &staging.join(PART_FILE)) {
        discard(&staging);
        return Err(e);
    }

    if target.exists() {
        let old = sibling(target, &format!("old-{}", stamp));
        if let Err(e) = fs::rename(target, &old) {
            discard(&staging);
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&staging, target) {
            abandon_swap(&staging, &old, target);
            return Err(e.into());
        }
        if let Err(e) = fs::remove_dir_all(&old) {
            warn!(path = %old.display(), "could not remove replaced output: {}", e);
        }
    } else if let Err(e) = fs::rename(&staging, target) {
        discard(&staging);
        return Err(e.into());
    }
    Ok(target.join(PART_FILE))
}

fn discard(staging: &Path) {
    if let Err(e) = fs::remove_dir_all(staging) {
        warn!(path = %staging.display(), "could not remove staging output: {}", e);
    }
}

/// Undo a half-done swap: drop the staged table, then put the previous
/// output back. Both steps run even if one fails.
fn abandon_swap(staging: &Path, old: &Path, target: &Path) {
    discard(staging);
    if let Err(e) = fs::rename(old, target) {
        error!(
            old = %old.display(),
            target = %target.display(),
            "could not restore previous output: {}",
            e
        );
    }
}

fn append(entity: Entity, batch: &RecordBatch, target: &Path) -> Result<PathBuf> {
    fs::create_dir_all(target)?;

    if let Some(existing) = part_files(target)?.first() {
        let schema = read_schema(existing)?;
        if !same_columns(&schema, &batch.schema()) {
            return Err(PipelineError::SchemaDrift {
                entity: entity.to_string(),
                partition: existing.display().to_string(),
                detail: "appended table does not match the existing output schema".into(),
            });
        }
    }

    let mut stamp = Utc::now().timestamp_micros();
    let mut file = target.join(format!("part-{}.parquet", stamp));
    while file.exists() {
        stamp += 1;
        file = target.join(format!("part-{}.parquet", stamp));
    }
    let tmp = target.join(format!(".part-{}.parquet.tmp", stamp));

    if let Err(e) = write_parquet_file(batch, &tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, &file)?;
    debug!(file = %file.display(), "appended part");
    Ok(file)
}

/// Field names and types, ignoring metadata and nullability.
fn same_columns(a: &Schema, b: &Schema) -> bool {
    a.fields().len() == b.fields().len()
        && a
            .fields()
            .iter()
            .zip(b.fields().iter())
            .all(|(x, y)| x.name() == y.name() && x.data_type() == y.data_type())
}

/// Visible Parquet parts in `dir`, sorted.
pub fn part_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = glob(&format!("{}/*.parquet", dir.display()))?
        .filter_map(std::result::Result::ok)
        .collect();
    files.sort();
    Ok(files)
}

fn read_schema(path: &Path) -> Result<Arc<Schema>> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
    Ok(builder.schema().clone())
}

/// Read everything under an output directory back into one batch.
pub fn read_output(dir: &Path) -> Result<RecordBatch> {
    let files = part_files(dir)?;
    let mut batches = Vec::new();
    let mut schema = None;
    for path in &files {
        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?
            .with_batch_size(8192)
            .build()?;
        schema.get_or_insert_with(|| reader.schema());
        for batch in reader {
            batches.push(batch?);
        }
    }
    let schema = schema.ok_or_else(|| PipelineError::SourceNotFound {
        locator: dir.display().to_string(),
    })?;
    Ok(concat_batches(&schema, &batches)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use arrow::array::{ArrayRef, Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field};
    use tempfile::tempdir;

    const STALE: Duration = Duration::from_secs(3600);

    fn locator() -> Locator {
        "abfss://silver@acct/Returns".parse().unwrap()
    }

    fn batch(keys: &[i64]) -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new("ProductKey", DataType::Int64, true),
            Field::new("Region", DataType::Utf8, true),
        ]);
        let regions: StringArray = keys.iter().map(|k| Some(format!("r{}", k))).collect();
        RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(Int64Array::from(keys.to_vec())) as ArrayRef,
                Arc::new(regions),
            ],
        )
        .unwrap()
    }

    #[test]
    fn overwrite_twice_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let target = dir.path().join("Returns");
        let data = batch(&[1, 2, 3]);

        write_table(Entity::Returns, &data, &target, &locator(), WriteMode::Overwrite, STALE)?;
        let first = read_output(&target)?;
        write_table(Entity::Returns, &data, &target, &locator(), WriteMode::Overwrite, STALE)?;
        let second = read_output(&target)?;

        assert_eq!(first, second);
        assert_eq!(second.num_rows(), 3);
        assert_eq!(part_files(&target)?.len(), 1);

        // no staging, backup or lock left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path())?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with('.'))
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
        Ok(())
    }

    #[test]
    fn overwrite_replaces_previous_content() -> Result<()> {
        let dir = tempdir()?;
        let target = dir.path().join("Returns");
        write_table(Entity::Returns, &batch(&[1, 2, 3]), &target, &locator(), WriteMode::Overwrite, STALE)?;
        write_table(Entity::Returns, &batch(&[9]), &target, &locator(), WriteMode::Overwrite, STALE)?;
        assert_eq!(read_output(&target)?.columns(), batch(&[9]).columns());
        Ok(())
    }

    #[test]
    fn append_adds_parts() -> Result<()> {
        let dir = tempdir()?;
        let target = dir.path().join("Returns");
        write_table(Entity::Returns, &batch(&[1, 2]), &target, &locator(), WriteMode::Append, STALE)?;
        write_table(Entity::Returns, &batch(&[3]), &target, &locator(), WriteMode::Append, STALE)?;

        assert_eq!(part_files(&target)?.len(), 2);
        assert_eq!(read_output(&target)?.num_rows(), 3);
        Ok(())
    }

    #[test]
    fn append_with_other_schema_is_drift() -> Result<()> {
        let dir = tempdir()?;
        let target = dir.path().join("Returns");
        write_table(Entity::Returns, &batch(&[1]), &target, &locator(), WriteMode::Append, STALE)?;

        let other = batch(&[2]).project(&[0])?;
        let err = write_table(Entity::Returns, &other, &target, &locator(), WriteMode::Append, STALE)
            .unwrap_err();
        assert!(matches!(err, PipelineError::SchemaDrift { .. }));
        assert_eq!(part_files(&target)?.len(), 1);
        Ok(())
    }

    #[test]
    fn held_lock_is_a_write_conflict() -> Result<()> {
        let dir = tempdir()?;
        let target = dir.path().join("Returns");
        write_table(Entity::Returns, &batch(&[1]), &target, &locator(), WriteMode::Overwrite, STALE)?;

        let held = WriteLock::acquire(&target, &locator(), STALE)?;
        let err = write_table(Entity::Returns, &batch(&[2]), &target, &locator(), WriteMode::Overwrite, STALE)
            .unwrap_err();
        assert!(err.is_retryable());
        // prior output untouched
        assert_eq!(read_output(&target)?.columns(), batch(&[1]).columns());

        drop(held);
        write_table(Entity::Returns, &batch(&[2]), &target, &locator(), WriteMode::Overwrite, STALE)?;
        assert_eq!(read_output(&target)?.columns(), batch(&[2]).columns());
        Ok(())
    }

    #[test]
    fn lock_of_dead_process_is_reclaimed() -> Result<()> {
        let dir = tempdir()?;
        let target = dir.path().join("Returns");
        // beyond any kernel pid_max
        fs::write(
            sibling(&target, "lock"),
            format!("{} {}\n", u32::MAX, Utc::now().to_rfc3339()),
        )?;

        write_table(Entity::Returns, &batch(&[4]), &target, &locator(), WriteMode::Overwrite, STALE)?;
        assert_eq!(read_output(&target)?.columns(), batch(&[4]).columns());
        assert!(!sibling(&target, "lock").exists());
        Ok(())
    }

    #[test]
    fn expired_lock_is_reclaimed() -> Result<()> {
        let dir = tempdir()?;
        let target = dir.path().join("Returns");
        fs::write(
            sibling(&target, "lock"),
            format!("{} 2001-01-01T00:00:00+00:00\n", std::process::id()),
        )?;

        write_table(Entity::Returns, &batch(&[5]), &target, &locator(), WriteMode::Append, STALE)?;
        assert_eq!(read_output(&target)?.num_rows(), 1);
        Ok(())
    }

    #[test]
    fn fresh_lock_of_live_process_is_kept() -> Result<()> {
        let dir = tempdir()?;
        let target = dir.path().join("Returns");
        let lock = sibling(&target, "lock");
        fs::write(&lock, format!("{} {}\n", std::process::id(), Utc::now().to_rfc3339()))?;

        let err = write_table(Entity::Returns, &batch(&[6]), &target, &locator(), WriteMode::Overwrite, STALE)
            .unwrap_err();
        assert!(matches!(err, PipelineError::WriteConflict { .. }));
        assert!(lock.exists());
        assert!(!target.exists());
        Ok(())
    }

    #[test]
    fn abandoned_swap_clears_staging_even_without_backup() -> Result<()> {
        let dir = tempdir()?;
        let target = dir.path().join("Sales");
        let staging = sibling(&target, "staging-1");
        let old = sibling(&target, "old-1");
        fs::create_dir_all(&staging)?;
        fs::write(staging.join(PART_FILE), b"partial")?;

        // no backup to restore
        abandon_swap(&staging, &old, &target);
        assert!(!staging.exists());
        assert!(!target.exists());
        Ok(())
    }

    #[test]
    fn abandoned_swap_restores_previous_output() -> Result<()> {
        let dir = tempdir()?;
        let target = dir.path().join("Sales");
        let staging = sibling(&target, "staging-2");
        let old = sibling(&target, "old-2");
        fs::create_dir_all(&staging)?;
        fs::create_dir_all(&old)?;
        fs::write(old.join(PART_FILE), b"previous")?;

        abandon_swap(&staging, &old, &target);
        assert!(!staging.exists());
        assert!(!old.exists());
        assert_eq!(fs::read(target.join(PART_FILE))?, b"previous");
        Ok(())
    }
}
