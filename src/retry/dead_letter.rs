use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::bulk::Action;

/// Destination for actions the cluster rejected permanently
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn write(&self, action: &Action, reason: &str) -> std::io::Result<()>;
}

/// Appends one JSON object per rejected action to a file
pub struct FileDeadLetterSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileDeadLetterSink {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeadLetterSink for FileDeadLetterSink {
    async fn write(&self, action: &Action, reason: &str) -> std::io::Result<()> {
        let entry = json!({
            "@timestamp": Utc::now().to_rfc3339(),
            "verb": action.verb,
            "params": action.params,
            "document": action.document,
            "reason": reason,
        });
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::ActionParams;
    use serde_json::Value;

    #[tokio::test]
    async fn test_file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dlq.ndjson");
        let sink = FileDeadLetterSink::open(&path).await.unwrap();

        let action = Action::index(
            ActionParams {
                id: Some("a".into()),
                ..Default::default()
            },
            json!({ "msg": "hello" }),
        );
        sink.write(&action, "status: 400").await.unwrap();
        sink.write(&Action::delete(ActionParams::default()), "status: 404")
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["verb"], "index");
        assert_eq!(lines[0]["params"]["_id"], "a");
        assert_eq!(lines[0]["document"]["msg"], "hello");
        assert_eq!(lines[0]["reason"], "status: 400");
        assert_eq!(lines[1]["verb"], "delete");
        assert!(lines[1]["document"].is_null());
    }
}
