//! Bucket access for source trading reports and target report objects.
//!
//! Objects are addressed by `/`-separated keys. Tabular objects are
//! delimited text with a header row; `.zip` keys carry one CSV entry.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;
use zip::ZipArchive;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        debug_assert_eq!(row.len(), self.headers.len());
        self.rows.push(row);
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|header| header == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {key}")]
    NotFound { key: String },
    #[error("failed to decode object {key}: {message}")]
    Decode { key: String, message: String },
    #[error("storage error for {key}: {message}")]
    Storage { key: String, message: String },
}

impl StoreError {
    fn storage(key: &str, message: impl Into<String>) -> Self {
        Self::Storage {
            key: key.to_string(),
            message: message.into(),
        }
    }

    fn decode(key: &str, message: impl Into<String>) -> Self {
        Self::Decode {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

pub trait ObjectStore {
    fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    fn read_object(&self, key: &str) -> Result<Table, StoreError> {
        let bytes = self.get_bytes(key)?;
        decode_object(key, &bytes, b',')
    }

    fn write_object(&self, key: &str, table: &Table) -> Result<(), StoreError> {
        let bytes = encode_csv(key, table)?;
        self.put_bytes(key, &bytes)
    }
}

pub fn decode_object(key: &str, bytes: &[u8], delimiter: u8) -> Result<Table, StoreError> {
    if key.to_ascii_lowercase().ends_with(".zip") {
        let csv_bytes = extract_zip_csv(key, bytes)?;
        decode_csv(key, &csv_bytes, delimiter)
    } else {
        decode_csv(key, bytes, delimiter)
    }
}

pub fn decode_csv(key: &str, bytes: &[u8], delimiter: u8) -> Result<Table, StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|err| StoreError::decode(key, err.to_string()))?
        .iter()
        .map(|field| field.trim().to_string())
        .collect::<Vec<_>>();

    let mut table = Table {
        headers,
        rows: Vec::new(),
    };
    for record in reader.records() {
        let record = record.map_err(|err| StoreError::decode(key, err.to_string()))?;
        table.rows.push(record.iter().map(str::to_string).collect());
    }

    Ok(table)
}

pub fn encode_csv(key: &str, table: &Table) -> Result<Vec<u8>, StoreError> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    if !table.headers.is_empty() {
        writer
            .write_record(&table.headers)
            .map_err(|err| StoreError::storage(key, err.to_string()))?;
    }
    for row in &table.rows {
        if row.len() != table.headers.len() {
            return Err(StoreError::storage(
                key,
                format!(
                    "row has {} fields, header has {}",
                    row.len(),
                    table.headers.len()
                ),
            ));
        }
        writer
            .write_record(row)
            .map_err(|err| StoreError::storage(key, err.to_string()))?;
    }

    writer
        .into_inner()
        .map_err(|err| StoreError::storage(key, err.to_string()))
}

fn extract_zip_csv(key: &str, bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut zip =
        ZipArchive::new(Cursor::new(bytes)).map_err(|err| StoreError::decode(key, err.to_string()))?;
    if zip.is_empty() {
        return Err(StoreError::decode(key, "archive has no entries"));
    }

    for idx in 0..zip.len() {
        let mut entry = zip
            .by_index(idx)
            .map_err(|err| StoreError::decode(key, err.to_string()))?;
        if entry.is_dir() || !entry.name().to_ascii_lowercase().ends_with(".csv") {
            continue;
        }

        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .map_err(|err| StoreError::decode(key, err.to_string()))?;
        return Ok(buf);
    }

    Err(StoreError::decode(key, "archive has no CSV entry"))
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if invalid {
        return Err(StoreError::storage(key, "invalid object key"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalBucket {
    root: PathBuf,
}

impl LocalBucket {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(key
            .split('/')
            .fold(self.root.clone(), |path, segment| path.join(segment)))
    }
}

impl ObjectStore for LocalBucket {
    fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        if !self.root.is_dir() {
            return Err(StoreError::storage(
                prefix,
                format!("bucket root {} is not a directory", self.root.display()),
            ));
        }

        let dir = prefix.rsplit_once('/').map_or("", |(dir, _)| dir);
        let start = if dir.is_empty() {
            self.root.clone()
        } else {
            self.object_path(dir)?
        };
        if !start.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        collect_keys(&start, dir, &mut keys)
            .map_err(|err| StoreError::storage(prefix, err.to_string()))?;
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(key)?;
        fs::read(&path).map_err(|err| match err.kind() {
            ErrorKind::NotFound => StoreError::NotFound {
                key: key.to_string(),
            },
            _ => StoreError::storage(key, err.to_string()),
        })
    }

    fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| StoreError::storage(key, err.to_string()))?;
        }
        write_atomic(&path, bytes).map_err(|err| StoreError::storage(key, err.to_string()))?;
        debug!(
            component = "object_store",
            event = "object_store.put",
            key,
            bytes = bytes.len(),
            path = %path.display()
        );
        Ok(())
    }
}

fn collect_keys(dir: &Path, rel: &str, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let key = if rel.is_empty() {
            name.clone()
        } else {
            format!("{rel}/{name}")
        };

        if entry.file_type()?.is_dir() {
            collect_keys(&entry.path(), &key, out)?;
        } else if !name.ends_with(".tmp") {
            out.push(key);
        }
    }
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "missing file name"))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)
}

#[derive(Debug, Default)]
pub struct InMemoryBucket {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    failing_write_prefix: Mutex<Option<String>>,
}

impl InMemoryBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(self, key: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(key, bytes);
        self
    }

    pub fn insert(&self, key: &str, bytes: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), bytes.into());
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn fail_writes_under(&self, prefix: &str) {
        *self
            .failing_write_prefix
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(prefix.to_string());
    }

    pub fn clear_write_failures(&self) {
        *self
            .failing_write_prefix
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl ObjectStore for InMemoryBucket {
    fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.object(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })
    }

    fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        let failing = self
            .failing_write_prefix
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(prefix) = failing {
            if key.starts_with(&prefix) {
                return Err(StoreError::storage(key, "simulated write failure"));
            }
        }

        self.insert(key, bytes);
        Ok(())
    }
}
