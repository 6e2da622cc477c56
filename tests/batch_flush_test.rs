//! Batch upload semantics against an in-memory object store.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use verdex::batch::BatchUploader;
use verdex::storage::ObjectStore;

/// In-memory store with a configurable set of keys whose uploads fail.
#[derive(Default)]
struct MockStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_keys: Mutex<HashSet<String>>,
}

impl MockStore {
    fn fail_on(&self, key: &str) {
        self.fail_keys.lock().unwrap().insert(key.to_string());
    }

    fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStore for MockStore {
    async fn put(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<()> {
        if self.fail_keys.lock().unwrap().contains(key) {
            anyhow::bail!("injected upload failure for {key}");
        }
        self.objects.lock().unwrap().insert(key.to_string(), body);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }
}

fn stage_pdfs(dir: &std::path::Path, names: &[&str]) -> Vec<PathBuf> {
    std::fs::create_dir_all(dir).unwrap();
    names
        .iter()
        .map(|name| {
            let path = dir.join(name);
            std::fs::write(&path, b"%PDF-1.7 test body").unwrap();
            path
        })
        .collect()
}

#[tokio::test]
async fn flush_uploads_verifies_and_deletes_local_copies() {
    let tmp = tempfile::tempdir().unwrap();
    let staging = tmp.path().join("staging");
    let store = Arc::new(MockStore::default());
    let mut uploader =
        BatchUploader::new(store.clone(), staging.clone(), "judgements/".into(), 25);

    let paths = stage_pdfs(&staging, &["a.pdf", "b.pdf", "c.pdf"]);
    for (path, name) in paths.iter().zip(["a.pdf", "b.pdf", "c.pdf"]) {
        uploader.push(name, path.clone());
    }

    let report = uploader.flush().await;
    assert_eq!(report.uploaded.len(), 3);
    assert!(report.quarantined.is_empty());
    assert_eq!(store.object_count(), 3);
    assert!(store.exists("judgements/a.pdf").await.unwrap());
    // verified uploads leave no local residue
    for path in &paths {
        assert!(!path.exists());
    }
    assert!(uploader.is_empty());
}

#[tokio::test]
async fn one_failure_in_a_batch_quarantines_only_that_file() {
    let tmp = tempfile::tempdir().unwrap();
    let staging = tmp.path().join("staging");
    let store = Arc::new(MockStore::default());
    store.fail_on("judgements/doc_13.pdf");
    let mut uploader =
        BatchUploader::new(store.clone(), staging.clone(), "judgements/".into(), 25);

    let names: Vec<String> = (1..=25).map(|i| format!("doc_{i}.pdf")).collect();
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let paths = stage_pdfs(&staging, &name_refs);
    let mut filled = false;
    for (path, name) in paths.iter().zip(&names) {
        filled = uploader.push(name, path.clone());
    }
    assert!(filled, "25th push must report the batch full");

    let report = uploader.flush().await;

    // Every file accounted for in exactly one list.
    assert_eq!(report.uploaded.len() + report.quarantined.len(), 25);
    assert_eq!(report.quarantined.len(), 1);
    assert_eq!(report.quarantined[0].filename, "doc_13.pdf");
    assert_eq!(store.object_count(), 24);

    // The failed file survives on disk under quarantine; the rest are gone.
    let quarantined = staging.join("failed_uploads").join("doc_13.pdf");
    assert!(quarantined.exists());
    assert!(!staging.join("doc_13.pdf").exists());
    assert!(!staging.join("doc_1.pdf").exists());
}

#[tokio::test]
async fn rediscover_restages_leftovers_from_a_crashed_run() {
    let tmp = tempfile::tempdir().unwrap();
    let staging = tmp.path().join("staging");
    stage_pdfs(&staging, &["left_over_1.pdf", "left_over_2.pdf"]);
    // non-pdf debris must be ignored
    std::fs::write(staging.join("notes.txt"), b"x").unwrap();

    let store = Arc::new(MockStore::default());
    let mut uploader =
        BatchUploader::new(store.clone(), staging.clone(), "judgements/".into(), 25);

    let found = uploader.rediscover().unwrap();
    assert_eq!(found, 2);
    assert_eq!(uploader.len(), 2);

    let report = uploader.flush().await;
    assert_eq!(report.uploaded.len(), 2);
    assert!(store.exists("judgements/left_over_1.pdf").await.unwrap());
}

#[tokio::test]
async fn flush_on_empty_batch_is_a_noop() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(MockStore::default());
    let mut uploader = BatchUploader::new(
        store.clone(),
        tmp.path().join("staging"),
        "judgements/".into(),
        25,
    );
    let report = uploader.flush().await;
    assert!(report.uploaded.is_empty());
    assert!(report.quarantined.is_empty());
    assert_eq!(store.object_count(), 0);
}
