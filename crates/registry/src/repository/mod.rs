//! File-backed persistence: one JSON document per service under the records
//! directory, named after the path with `/` flattened to `_`.

use std::path::{Path, PathBuf};

use tracing::{error, info};

use shared::error::CommonError;

use crate::logic::ServiceRecord;

/// A record file that failed to parse at boot. The record is kept out of the
/// routing table and surfaced as unhealthy rather than taking the process
/// down.
#[derive(Debug, Clone)]
pub struct QuarantinedRecord {
    pub file: String,
    pub error: String,
}

#[derive(Clone)]
pub struct FileRepository {
    dir: PathBuf,
}

impl FileRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, service_path: &str) -> PathBuf {
        let stem = service_path
            .trim_matches('/')
            .replace('/', "_");
        self.dir.join(format!("{stem}.json"))
    }

    /// Load every record in the directory. Parse failures are quarantined,
    /// not fatal; an unreadable directory is.
    pub async fn load_all(
        &self,
    ) -> Result<(Vec<ServiceRecord>, Vec<QuarantinedRecord>), CommonError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut records = Vec::new();
        let mut quarantined = Vec::new();

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let file = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();

            let raw = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<ServiceRecord>(&raw) {
                Ok(record) => records.push(record),
                Err(e) => {
                    error!(file, "quarantining unparseable service record: {e}");
                    quarantined.push(QuarantinedRecord {
                        file,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            count = records.len(),
            quarantined = quarantined.len(),
            dir = %self.dir.display(),
            "loaded service records"
        );
        Ok((records, quarantined))
    }

    /// Persist one record atomically (temp file + rename).
    pub async fn save(&self, record: &ServiceRecord) -> Result<(), CommonError> {
        let target = self.file_for(&record.path);
        let json = serde_json::to_string_pretty(record)?;
        shared::fs::write_atomic(&target, json.as_bytes()).await
    }

    pub async fn delete(&self, service_path: &str) -> Result<(), CommonError> {
        let target = self.file_for(service_path);
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::validate_and_normalize;

    fn record(path: &str) -> ServiceRecord {
        let mut r: ServiceRecord = serde_json::from_value(serde_json::json!({
            "path": path,
            "server_name": "Test",
            "proxy_pass_url": "http://backend:8000/",
        }))
        .unwrap();
        validate_and_normalize(&mut r).unwrap();
        r
    }

    #[tokio::test]
    async fn save_load_delete_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = FileRepository::new(dir.path());

        repo.save(&record("/currenttime")).await.unwrap();
        repo.save(&record("/fininfo")).await.unwrap();

        let (records, quarantined) = repo.load_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(quarantined.is_empty());

        repo.delete("/currenttime").await.unwrap();
        let (records, _) = repo.load_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "/fininfo");

        // Deleting a missing record is a no-op.
        repo.delete("/currenttime").await.unwrap();
    }

    #[tokio::test]
    async fn nested_paths_flatten_into_filenames() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = FileRepository::new(dir.path());
        repo.save(&record("/team/currenttime")).await.unwrap();
        assert!(dir.path().join("team_currenttime.json").exists());
    }

    #[tokio::test]
    async fn unparseable_records_are_quarantined() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        let repo = FileRepository::new(dir.path());

        repo.save(&record("/ok")).await.unwrap();
        let (records, quarantined) = repo.load_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].file, "broken.json");
    }
}
