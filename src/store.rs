//! Request archive. Optional on-disk save of request metadata, grounded in
//! `original_source/proxy_tool/request_store.py`. Disabled unless
//! `Config::save_requests_dir` is set.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

#[derive(Debug, Serialize)]
struct SavedRequest<'a> {
    timestamp: String,
    method: &'a str,
    url: &'a str,
    headers: &'a HashMap<String, String>,
    body: Option<&'a str>,
}

pub struct RequestStore {
    dir: PathBuf,
}

impl RequestStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Saves one request as a timestamped JSON file. The timestamp is
    /// supplied by the caller rather than taken internally, matching
    /// `request_store.py`'s use of wall-clock time at call time.
    pub async fn save(
        &self,
        timestamp: chrono::DateTime<chrono::Utc>,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<&str>,
    ) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let filename = format!("request_{}.json", timestamp.format("%Y%m%d_%H%M%S_%3f"));
        let path = self.dir.join(filename);

        let record = SavedRequest {
            timestamp: timestamp.to_rfc3339(),
            method,
            url,
            headers,
            body,
        };
        let json = serde_json::to_string_pretty(&record)?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }

    pub async fn list_requests(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e),
        };
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                entries.push(path);
            }
        }
        entries.sort();
        entries.reverse();
        Ok(entries)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
