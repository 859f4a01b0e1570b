use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use orion_error::prelude::*;
use rill_lang::FieldPath;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{Ack, DeadLetterSink, UpsertSink};
use crate::error::{CoreReason, CoreResult};
use crate::merge::{DeadLetter, MergeKey, MergePolicy, apply_upsert};

// ---------------------------------------------------------------------------
// FileCollection: keyed collection persisted as a JSON Lines snapshot
// ---------------------------------------------------------------------------

/// Keyed collection backed by a JSON Lines file, one stored document per
/// line. The whole snapshot is rewritten (temp file + rename) after every
/// change, so the file always holds a complete collection.
pub struct FileCollection {
    name: String,
    path: PathBuf,
    policy: MergePolicy,
    docs: Mutex<BTreeMap<MergeKey, Map<String, Value>>>,
}

impl FileCollection {
    /// Open `path`, loading documents already stored there. Keys are
    /// recomputed from the `on` fields.
    pub async fn open(
        path: impl AsRef<Path>,
        on: &[FieldPath],
        policy: MergePolicy,
    ) -> CoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .owe(CoreReason::Sink)
                .position(format!("create directory {}", parent.display()))?;
        }

        let mut docs = BTreeMap::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                for (lineno, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let doc: Map<String, Value> = serde_json::from_str(line)
                        .owe_data()
                        .position(format!("{}:{}", path.display(), lineno + 1))?;
                    docs.insert(MergeKey::from_document(&doc, on), doc);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .owe(CoreReason::Sink)
                    .position(format!("read {}", path.display()));
            }
        }

        Ok(Self {
            name: format!("file:{}", path.display()),
            path,
            policy,
            docs: Mutex::new(docs),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> usize {
        self.docs.lock().await.len()
    }

    async fn write_snapshot(&self, docs: &BTreeMap<MergeKey, Map<String, Value>>) -> CoreResult<()> {
        let mut body = String::new();
        for doc in docs.values() {
            let line = serde_json::to_string(doc).owe_data()?;
            body.push_str(&line);
            body.push('\n');
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .owe(CoreReason::Sink)
            .position(format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .owe(CoreReason::Sink)
            .position(format!("rename to {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl UpsertSink for FileCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upsert(&self, key: &MergeKey, record: Map<String, Value>) -> CoreResult<Ack> {
        let mut docs = self.docs.lock().await;
        let up = match apply_upsert(key, docs.get(key), record, &self.policy) {
            Ok(up) => up,
            Err(rejection) => return Ok(Ack::Rejected(rejection.to_string())),
        };
        if let Some(doc) = up.store {
            let previous = docs.insert(key.clone(), doc);
            if let Err(e) = self.write_snapshot(&docs).await {
                // Keep memory and disk in step so a retry starts clean.
                match previous {
                    Some(prev) => docs.insert(key.clone(), prev),
                    None => docs.remove(key),
                };
                return Err(e);
            }
        }
        Ok(Ack::Written(up.outcome))
    }
}

// ---------------------------------------------------------------------------
// FileDeadLetters: append-only JSON Lines
// ---------------------------------------------------------------------------

pub struct FileDeadLetters {
    name: String,
    writer: Mutex<tokio::io::BufWriter<tokio::fs::File>>,
}

impl FileDeadLetters {
    pub async fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .owe(CoreReason::Sink)
                .position(format!("create directory {}", parent.display()))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .owe(CoreReason::Sink)
            .position(format!("open {}", path.display()))?;
        Ok(Self {
            name: format!("file:{}", path.display()),
            writer: Mutex::new(tokio::io::BufWriter::new(file)),
        })
    }
}

#[async_trait]
impl DeadLetterSink for FileDeadLetters {
    fn name(&self) -> &str {
        &self.name
    }

    async fn append(&self, letter: &DeadLetter) -> CoreResult<()> {
        let mut line = serde_json::to_vec(letter).owe_data()?;
        line.push(b'\n');
        let mut w = self.writer.lock().await;
        w.write_all(&line).await.owe(CoreReason::Sink)?;
        w.flush().await.owe(CoreReason::Sink)?;
        Ok(())
    }

    async fn stop(&self) -> CoreResult<()> {
        let mut w = self.writer.lock().await;
        w.flush().await.owe(CoreReason::Sink)?;
        w.shutdown().await.owe(CoreReason::Sink)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{FailureStage, UpsertOutcome};
    use rill_config::{WhenMatched, WhenNotMatched};
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            other => panic!("not an object: {other}"),
        }
    }

    fn on() -> Vec<FieldPath> {
        vec![FieldPath::from_dotted("_id")]
    }

    fn merge_policy() -> MergePolicy {
        MergePolicy::new(WhenMatched::Merge, WhenNotMatched::Insert)
    }

    fn read_lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn snapshot_rewritten_after_each_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/good.jsonl");
        let coll = FileCollection::open(&path, &on(), merge_policy()).await.unwrap();

        for (id, n) in [("red", 1), ("blue", 4), ("red", 3)] {
            let doc = obj(json!({"_id": id, "n": n}));
            let key = MergeKey::from_document(&doc, &on());
            coll.upsert(&key, doc).await.unwrap();
        }

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert!(lines.contains(&json!({"_id": "red", "n": 3})));
        assert!(lines.contains(&json!({"_id": "blue", "n": 4})));
        assert!(!dir.path().join("out/good.jsonl.tmp").exists());
    }

    #[tokio::test]
    async fn reopen_loads_existing_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("good.jsonl");
        {
            let coll = FileCollection::open(&path, &on(), merge_policy()).await.unwrap();
            let doc = obj(json!({"_id": "red", "n": 3}));
            let key = MergeKey::from_document(&doc, &on());
            coll.upsert(&key, doc).await.unwrap();
        }

        let coll = FileCollection::open(&path, &on(), merge_policy()).await.unwrap();
        assert_eq!(coll.len().await, 1);
        let doc = obj(json!({"_id": "red", "n": 3}));
        let key = MergeKey::from_document(&doc, &on());
        let ack = coll.upsert(&key, doc).await.unwrap();
        assert_eq!(ack, Ack::Written(UpsertOutcome::Unchanged));
    }

    #[tokio::test]
    async fn corrupt_snapshot_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("good.jsonl");
        std::fs::write(&path, "{not json}\n").unwrap();
        assert!(FileCollection::open(&path, &on(), merge_policy()).await.is_err());
    }

    #[tokio::test]
    async fn dead_letters_appended_as_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dlq/dead.jsonl");
        let sink = FileDeadLetters::open(&path).await.unwrap();
        sink.append(&DeadLetter::new(json!({"x": 0}), "too small", FailureStage::Validate, "p"))
            .await
            .unwrap();
        sink.append(&DeadLetter::new(json!({"x": "22"}), "not int", FailureStage::Validate, "p"))
            .await
            .unwrap();
        sink.stop().await.unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["doc"], json!({"x": "22"}));
        assert_eq!(lines[0]["reason"], json!("too small"));
    }
}
