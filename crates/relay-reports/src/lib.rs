//! Append-only filesystem report sink.
//!
//! Each report lives in `<root>/<id>.json`, where the identifier is the
//! hex SHA-256 of the session id and request id joined by a zero byte. The
//! file is a JSON envelope holding the payload in base64 together with its
//! own digest. Files are created once through an atomic no-clobber rename
//! and never modified afterwards.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use relay_core::{
    Report, ReportError, ReportId, ReportMeta, ReportSink, RequestId, SessionId, now_millis,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::Builder;
use tracing::{debug, info, warn};

const EXTENSION: &str = "json";

/// Deterministic report identifier for a (session, request) pair.
#[must_use]
pub fn report_id(session_id: SessionId, request_id: &RequestId) -> ReportId {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(request_id.as_str().as_bytes());
    ReportId::new(format!("{:x}", hasher.finalize()))
}

fn payload_digest(payload: &[u8]) -> String {
    format!("{:x}", Sha256::digest(payload))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReportRecord {
    id: ReportId,
    session_id: SessionId,
    request_id: RequestId,
    created_at: i64,
    sha256: String,
    size_bytes: usize,
    payload: String,
}

impl ReportRecord {
    fn meta(&self) -> ReportMeta {
        ReportMeta {
            id: self.id.clone(),
            session_id: self.session_id,
            request_id: self.request_id.clone(),
            created_at: self.created_at,
            size_bytes: self.size_bytes,
        }
    }

    fn into_report(self) -> Result<Report, ReportError> {
        let payload = BASE64.decode(&self.payload).map_err(|e| ReportError::Corrupt {
            id: self.id.clone(),
            reason: e.to_string(),
        })?;
        if payload_digest(&payload) != self.sha256 {
            return Err(ReportError::Corrupt {
                id: self.id,
                reason: "payload digest mismatch".to_string(),
            });
        }
        Ok(Report {
            id: self.id,
            session_id: self.session_id,
            request_id: self.request_id,
            created_at: self.created_at,
            payload,
        })
    }
}

/// Report sink rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileReportSink {
    root: PathBuf,
}

impl FileReportSink {
    /// Open a sink, creating the root directory if needed.
    ///
    /// # Errors
    /// Returns `Io` if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ReportError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        info!(root = %root.display(), "Report sink ready");
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &ReportId) -> PathBuf {
        self.root.join(format!("{id}.{EXTENSION}"))
    }
}

fn read_record(path: &Path) -> io::Result<ReportRecord> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Compare an existing record with the one being written.
fn check_existing(existing: &ReportRecord, incoming: &ReportRecord) -> Result<(), ReportError> {
    if existing.sha256 == incoming.sha256
        && existing.session_id == incoming.session_id
        && existing.request_id == incoming.request_id
    {
        Ok(())
    } else {
        Err(ReportError::Conflict(incoming.id.clone()))
    }
}

fn write_once(root: &Path, path: &Path, record: &ReportRecord) -> Result<(), ReportError> {
    match read_record(path) {
        Ok(existing) => return check_existing(&existing, record),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let contents = serde_json::to_vec(record).map_err(|e| ReportError::Internal(e.to_string()))?;
    let mut file = Builder::new().prefix(".tmp-report-").tempfile_in(root)?;
    file.write_all(&contents)?;
    file.as_file().sync_all()?;

    match file.persist_noclobber(path) {
        Ok(_) => Ok(()),
        Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
            // A concurrent writer won the race; its content decides.
            let existing = read_record(path)?;
            check_existing(&existing, record)
        }
        Err(err) => Err(err.error.into()),
    }
}

fn is_report_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(EXTENSION)
        && path
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|stem| ReportId::new(stem).is_well_formed())
}

#[async_trait]
impl ReportSink for FileReportSink {
    async fn write(
        &self,
        session_id: SessionId,
        request_id: &RequestId,
        payload: &[u8],
    ) -> Result<ReportId, ReportError> {
        let id = report_id(session_id, request_id);
        let record = ReportRecord {
            id: id.clone(),
            session_id,
            request_id: request_id.clone(),
            created_at: now_millis(),
            sha256: payload_digest(payload),
            size_bytes: payload.len(),
            payload: BASE64.encode(payload),
        };
        let root = self.root.clone();
        let path = self.path_for(&id);

        tokio::task::spawn_blocking(move || write_once(&root, &path, &record))
            .await
            .map_err(|e| ReportError::Internal(e.to_string()))??;

        debug!(report_id = %id, %session_id, %request_id, "Report stored");
        Ok(id)
    }

    async fn read(&self, id: &ReportId) -> Result<Report, ReportError> {
        if !id.is_well_formed() {
            return Err(ReportError::NotFound(id.clone()));
        }
        let bytes = match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ReportError::NotFound(id.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let record: ReportRecord =
            serde_json::from_slice(&bytes).map_err(|e| ReportError::Corrupt {
                id: id.clone(),
                reason: e.to_string(),
            })?;
        record.into_report()
    }

    async fn list(&self, session_id: SessionId) -> Result<Vec<ReportMeta>, ReportError> {
        let root = self.root.clone();
        let mut metas = tokio::task::spawn_blocking(move || -> io::Result<Vec<ReportMeta>> {
            let mut metas = Vec::new();
            for entry in std::fs::read_dir(&root)? {
                let path = entry?.path();
                if !is_report_file(&path) {
                    continue;
                }
                match read_record(&path) {
                    Ok(record) if record.session_id == session_id => metas.push(record.meta()),
                    Ok(_) => {}
                    Err(e) => warn!(path = %path.display(), "Skipping unreadable report: {e}"),
                }
            }
            Ok(metas)
        })
        .await
        .map_err(|e| ReportError::Internal(e.to_string()))??;

        metas.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(metas)
    }
}
