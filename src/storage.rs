//! Run persistence: append-only writers and readers.
//!
//! Each run owns one numbered subdirectory of the storage root, allocated
//! as the lowest free integer. Inside it the writer keeps rows in a
//! tab-separated `data.tsv`, arbitrary named blobs (e.g. a final plot
//! image), and, written at close time, the run metadata as
//! `metadata.json`. Rows are appended in acquisition order, never
//! overwritten or reordered, and the data file is fsynced every few rows
//! so an interrupted process loses at most the tail of a run.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::StationError;
use crate::metadata::RunMetadata;

/// Row data file name inside a run directory.
pub const DATA_FILE: &str = "data.tsv";
/// Metadata file name inside a run directory.
pub const METADATA_FILE: &str = "metadata.json";

/// Highest run id the writer will try before giving up.
const MAX_RUN_ID: u32 = 1_000_000;

/// Append-only writer for one run.
pub struct RunWriter {
    dir: PathBuf,
    id: u32,
    datapath: PathBuf,
    writer: Option<csv::Writer<File>>,
    // Second handle onto data.tsv, kept for fsync.
    data_file: File,
    /// Run metadata, saved as `metadata.json` when the writer closes.
    /// Changes after close are ignored.
    pub metadata: RunMetadata,
    declared_columns: Option<usize>,
    fsync_every: usize,
    rows_since_fsync: usize,
}

impl RunWriter {
    /// Open a new run under `basedir`, assigning the lowest free integer
    /// id. Creates `basedir` if it does not exist.
    pub fn open(basedir: &Path, fsync_every: usize) -> Result<Self> {
        fs::create_dir_all(basedir)
            .with_context(|| format!("Failed to create storage root at {:?}", basedir))?;

        // Directory creation is the id lock: first creator wins.
        let mut id = 0u32;
        let dir = loop {
            if id > MAX_RUN_ID {
                return Err(StationError::RunIdsExhausted(MAX_RUN_ID).into());
            }
            let candidate = basedir.join(id.to_string());
            match fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => id += 1,
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to create run directory at {:?}", candidate)
                    })
                }
            }
        };

        let datapath = dir.join(DATA_FILE);
        let data_file = File::create(&datapath)
            .with_context(|| format!("Failed to create data file at {:?}", datapath))?;
        let fsync_handle = data_file
            .try_clone()
            .context("Failed to clone data file handle")?;
        let writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(data_file);

        log::info!("Run {} opened at '{}'.", id, dir.display());

        Ok(Self {
            dir,
            id,
            datapath,
            writer: Some(writer),
            data_file: fsync_handle,
            metadata: RunMetadata::new(),
            declared_columns: None,
            fsync_every: fsync_every.max(1),
            rows_since_fsync: 0,
        })
    }

    /// Run identifier, unique within the storage root.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The run's directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the row data file.
    pub fn datapath(&self) -> &Path {
        &self.datapath
    }

    /// Record the column schema in metadata and pin the row length. Must
    /// be called before the first row; rows of any other length are
    /// rejected afterwards.
    pub fn set_columns(&mut self, columns: &[String]) {
        self.metadata.insert("columns", columns);
        self.declared_columns = Some(columns.len());
    }

    /// Append one row in acquisition order.
    pub fn add_row(&mut self, row: &[f64]) -> Result<()> {
        if let Some(expected) = self.declared_columns {
            if row.len() != expected {
                return Err(StationError::ColumnCountMismatch {
                    expected,
                    got: row.len(),
                }
                .into());
            }
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| StationError::Storage("writer is closed".to_string()))?;
        writer
            .write_record(row.iter().map(|v| v.to_string()))
            .context("Failed to append row to data file")?;

        self.rows_since_fsync += 1;
        if self.rows_since_fsync >= self.fsync_every {
            self.rows_since_fsync = 0;
            writer.flush().context("Failed to flush data file")?;
            self.data_file
                .sync_data()
                .context("Failed to fsync data file")?;
        }
        Ok(())
    }

    /// Save arbitrary bytes under `name` in the run directory.
    pub fn add_blob(&self, name: &str, data: &[u8]) -> Result<PathBuf> {
        if name == DATA_FILE || name == METADATA_FILE {
            return Err(StationError::ReservedBlobName(name.to_string()).into());
        }
        let path = self.dir.join(name);
        fs::write(&path, data).with_context(|| format!("Failed to write blob at {:?}", path))?;
        Ok(path)
    }

    /// Flush and fsync row data, then save `metadata.json`. Idempotent;
    /// only the first call persists metadata.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer.flush().context("Failed to flush data file")?;
        self.data_file
            .sync_all()
            .context("Failed to fsync data file")?;

        let metadata_path = self.dir.join(METADATA_FILE);
        let file = File::create(&metadata_path)
            .with_context(|| format!("Failed to create metadata file at {:?}", metadata_path))?;
        serde_json::to_writer_pretty(&file, &self.metadata)
            .context("Failed to serialize run metadata")?;
        file.sync_all().context("Failed to fsync metadata file")?;

        log::info!("Run {} closed.", self.id);
        Ok(())
    }
}

impl Drop for RunWriter {
    fn drop(&mut self) {
        // The station closes on every exit path; this is the backstop.
        if self.writer.is_some() {
            if let Err(e) = self.close() {
                log::warn!("Run {} close failed during drop: {e:#}", self.id);
            }
        }
    }
}

/// Reader over a run previously written by a [`RunWriter`].
pub struct RunReader {
    dir: PathBuf,
    id: u32,
    /// Metadata loaded from `metadata.json`.
    pub metadata: RunMetadata,
}

impl RunReader {
    /// Open run `id` under `basedir`.
    pub fn open(basedir: &Path, id: u32) -> Result<Self> {
        let dir = basedir.join(id.to_string());
        let metadata_path = dir.join(METADATA_FILE);
        let file = File::open(&metadata_path)
            .with_context(|| format!("Failed to open metadata file at {:?}", metadata_path))?;
        let metadata: RunMetadata =
            serde_json::from_reader(file).context("Failed to parse run metadata")?;
        Ok(Self { dir, id, metadata })
    }

    /// Run identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The run's directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All rows in acquisition order.
    pub fn rows(&self) -> Result<Vec<Vec<f64>>> {
        let datapath = self.dir.join(DATA_FILE);
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_path(&datapath)
            .with_context(|| format!("Failed to open data file at {:?}", datapath))?;

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.context("Failed to read row")?;
            let row = record
                .iter()
                .map(|field| {
                    field
                        .parse::<f64>()
                        .with_context(|| format!("Non-numeric field '{field}' in data file"))
                })
                .collect::<Result<Vec<f64>>>()?;
            rows.push(row);
        }
        Ok(rows)
    }

    /// Read a named blob from the run directory.
    pub fn blob(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.dir.join(name);
        fs::read(&path).with_context(|| format!("Failed to read blob at {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_fill_lowest_free_slot() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("0")).unwrap();
        fs::create_dir(root.path().join("2")).unwrap();

        let writer = RunWriter::open(root.path(), 10).unwrap();
        assert_eq!(writer.id(), 1);

        let writer = RunWriter::open(root.path(), 10).unwrap();
        assert_eq!(writer.id(), 3);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let mut writer = RunWriter::open(root.path(), 2).unwrap();
        writer.set_columns(&["time".to_string(), "p1".to_string()]);
        writer.metadata.insert("type", "1D");
        writer.add_row(&[1.0, 10.0]).unwrap();
        writer.add_row(&[2.0, 20.0]).unwrap();
        writer.add_row(&[3.0, 30.0]).unwrap();
        writer.add_blob("plot.png", b"not really a png").unwrap();
        writer.close().unwrap();

        let reader = RunReader::open(root.path(), writer.id()).unwrap();
        assert_eq!(
            reader.metadata.get("type").and_then(|v| v.as_str()),
            Some("1D")
        );
        assert_eq!(reader.metadata.columns().unwrap().len(), 2);
        let rows = reader.rows().unwrap();
        assert_eq!(rows, vec![vec![1.0, 10.0], vec![2.0, 20.0], vec![3.0, 30.0]]);
        assert_eq!(reader.blob("plot.png").unwrap(), b"not really a png");
    }

    #[test]
    fn test_close_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let mut writer = RunWriter::open(root.path(), 10).unwrap();
        writer.metadata.insert("type", "0D");
        writer.close().unwrap();
        // Metadata changes after close are ignored.
        writer.metadata.insert("type", "changed");
        writer.close().unwrap();

        let reader = RunReader::open(root.path(), writer.id()).unwrap();
        assert_eq!(
            reader.metadata.get("type").and_then(|v| v.as_str()),
            Some("0D")
        );
    }

    #[test]
    fn test_row_length_pinned_to_schema() {
        let root = tempfile::tempdir().unwrap();
        let mut writer = RunWriter::open(root.path(), 10).unwrap();
        writer.set_columns(&["time".to_string(), "p1".to_string()]);
        assert!(writer.add_row(&[0.0]).is_err());
        assert!(writer.add_row(&[0.0, 1.0]).is_ok());
    }

    #[test]
    fn test_reserved_blob_names_rejected() {
        let root = tempfile::tempdir().unwrap();
        let writer = RunWriter::open(root.path(), 10).unwrap();
        assert!(writer.add_blob(DATA_FILE, b"x").is_err());
        assert!(writer.add_blob(METADATA_FILE, b"x").is_err());
    }
}
