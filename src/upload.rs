//! Uploaded documents, scoped temporary storage and index naming.

use chrono::Utc;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use tempfile::NamedTempFile;

use crate::extract::is_pdf;

/// A single user upload, held in memory until ingestion.
#[derive(Debug, Clone)]
pub struct UploadedDocument {
    file_name: String,
    bytes: Vec<u8>,
}

impl UploadedDocument {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// `.pdf` extension (any case) and a PDF header.
    pub fn looks_like_pdf(&self) -> bool {
        let ext_ok = Path::new(&self.file_name)
            .extension()
            .map(|e| e.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false);
        ext_ok && is_pdf(&self.bytes)
    }

    /// Write the bytes to a fresh temporary `.pdf` file.
    ///
    /// The file is removed when the returned value is dropped, so callers
    /// keep it alive exactly as long as the ingestion call needs it.
    pub fn write_scoped(&self, dir: Option<&Path>) -> std::io::Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("chat-agent-upload-").suffix(".pdf");
        let mut file = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(&self.bytes)?;
        file.flush()?;
        Ok(file)
    }
}

/// Last issued index timestamp (unix millis). Shared by every session.
static LAST_INDEX_MILLIS: AtomicI64 = AtomicI64::new(0);

/// A fresh index name, `IndexName_<unix-millis>`.
///
/// The timestamp is bumped past the previously issued one when the clock has
/// not advanced, so two calls within the same tick never collide.
pub fn next_index_name() -> String {
    let now = Utc::now().timestamp_millis();
    let mut prev = LAST_INDEX_MILLIS.load(Ordering::Relaxed);
    loop {
        let next = next_after(prev, now);
        match LAST_INDEX_MILLIS.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return format!("IndexName_{}", next),
            Err(actual) => prev = actual,
        }
    }
}

fn next_after(last: i64, now: i64) -> i64 {
    if now > last {
        now
    } else {
        last + 1
    }
}
