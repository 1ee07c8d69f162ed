//! Shared fixtures for unit and integration tests.

use std::path::PathBuf;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;

use crate::entity::{Comment, Post};
use crate::store::{MemoryStorage, OverrideStore};

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

/// A unique path under the system temp dir for file-backed storage tests.
pub fn temp_storage_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(random_string(&format!("{tag}-"), 12)).with_extension("json")
}

pub fn memory_override_store() -> (Arc<MemoryStorage>, OverrideStore) {
    let backend = Arc::new(MemoryStorage::new());
    let store = OverrideStore::new(backend.clone());
    (backend, store)
}

/// A post payload as the backend would serve it.
pub fn post_payload(id: i64, score: i64, vote: i64, saved: bool) -> Post {
    serde_json::from_value(json!({
        "id": id,
        "title": format!("post {id}"),
        "content": "body",
        "score": score,
        "comments_count": 0,
        "community_name": "rustaceans",
        "user": { "id": 99, "username": "author" },
        "current_user_vote": vote,
        "is_saved": saved,
    }))
    .expect("valid post fixture")
}

/// A comment payload as the backend would serve it.
pub fn comment_payload(id: i64, post_id: i64, score: i64, vote: i64, saved: bool) -> Comment {
    serde_json::from_value(json!({
        "id": id,
        "content": format!("comment {id}"),
        "post_id": post_id,
        "user": { "id": 99, "username": "author" },
        "score": score,
        "current_user_vote": vote,
        "is_saved": saved,
    }))
    .expect("valid comment fixture")
}
