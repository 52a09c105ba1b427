//! Video record repository.
//!
//! The CRUD layer owns video documents. This repository reads them and
//! patches only the fields the transcoding core is allowed to change.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::info;

use vpipe_models::{ReadyUpdate, VideoId, VideoRecord, VideoStatus};

use crate::client::FirestoreClient;
use crate::error::{FirestoreError, FirestoreResult};
use crate::types::{Document, ToFirestoreValue, Value};

/// Default collection holding video documents.
pub const DEFAULT_VIDEOS_COLLECTION: &str = "videos";

/// Repository for video documents.
#[derive(Clone)]
pub struct VideoRepository {
    client: FirestoreClient,
    collection: String,
}

impl VideoRepository {
    pub fn new(client: FirestoreClient, collection: impl Into<String>) -> Self {
        Self {
            client,
            collection: collection.into(),
        }
    }

    /// Create using `FIRESTORE_VIDEOS_COLLECTION` (default `videos`).
    pub fn from_env(client: FirestoreClient) -> Self {
        let collection = std::env::var("FIRESTORE_VIDEOS_COLLECTION")
            .ok()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_VIDEOS_COLLECTION.to_string());
        Self::new(client, collection)
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Get a video by ID.
    pub async fn get(&self, video_id: &VideoId) -> FirestoreResult<Option<VideoRecord>> {
        let doc = self.client.get_document(&self.collection, video_id.as_str()).await?;
        doc.map(|d| document_to_video_record(&d, video_id)).transpose()
    }

    /// Mark a video as being transcoded.
    pub async fn mark_processing(&self, video_id: &VideoId) -> FirestoreResult<()> {
        self.patch(video_id, processing_fields()).await?;
        info!(video_id = %video_id, "Video marked processing");
        Ok(())
    }

    /// Publish the manifest and clear any previous error.
    pub async fn mark_ready(&self, video_id: &VideoId, update: &ReadyUpdate) -> FirestoreResult<()> {
        self.patch(video_id, ready_fields(update)).await?;
        counter!("vpipe_video_status_updates_total", "status" => "ready").increment(1);
        info!(video_id = %video_id, manifest_url = %update.manifest_url, "Video marked ready");
        Ok(())
    }

    /// Record a terminal failure. Any previous manifest URL is cleared.
    pub async fn mark_failed(&self, video_id: &VideoId, error_message: &str) -> FirestoreResult<()> {
        self.patch(video_id, failed_fields(error_message)).await?;
        counter!("vpipe_video_status_updates_total", "status" => "failed").increment(1);
        info!(video_id = %video_id, "Video marked failed: {}", error_message);
        Ok(())
    }

    async fn patch(&self, video_id: &VideoId, fields: HashMap<String, Value>) -> FirestoreResult<()> {
        let mask: Vec<&str> = fields.keys().map(String::as_str).collect();
        self.client
            .update_document(&self.collection, video_id.as_str(), fields.clone(), &mask)
            .await?;
        Ok(())
    }
}

fn processing_fields() -> HashMap<String, Value> {
    let mut fields = HashMap::new();
    fields.insert("status".to_string(), VideoStatus::Processing.as_str().to_firestore_value());
    fields.insert("updated_at".to_string(), Utc::now().to_firestore_value());
    fields
}

fn ready_fields(update: &ReadyUpdate) -> HashMap<String, Value> {
    let mut fields = HashMap::new();
    fields.insert("status".to_string(), VideoStatus::Ready.as_str().to_firestore_value());
    fields.insert("manifest_url".to_string(), update.manifest_url.to_firestore_value());
    fields.insert("error_message".to_string(), Value::NullValue(()));
    fields.insert("updated_at".to_string(), Utc::now().to_firestore_value());
    // Only overwrite the thumbnail when a new one was published
    if let Some(thumbnail_url) = &update.thumbnail_url {
        fields.insert("thumbnail_url".to_string(), thumbnail_url.to_firestore_value());
    }
    fields
}

fn failed_fields(error_message: &str) -> HashMap<String, Value> {
    let mut fields = HashMap::new();
    fields.insert("status".to_string(), VideoStatus::Failed.as_str().to_firestore_value());
    fields.insert("error_message".to_string(), error_message.to_firestore_value());
    fields.insert("manifest_url".to_string(), Value::NullValue(()));
    fields.insert("updated_at".to_string(), Utc::now().to_firestore_value());
    fields
}

fn document_to_video_record(doc: &Document, video_id: &VideoId) -> FirestoreResult<VideoRecord> {
    if doc.fields.is_none() {
        return Err(FirestoreError::invalid_response("Document has no fields"));
    }

    let get_string = |key: &str| doc.get::<String>(key).unwrap_or_default();
    let get_opt_string = |key: &str| doc.get::<String>(key).filter(|s| !s.is_empty());
    let get_time = |key: &str| doc.get::<DateTime<Utc>>(key);

    let status = get_opt_string("status")
        .as_deref()
        .and_then(VideoStatus::parse)
        .unwrap_or_default();
    let created_at = get_time("created_at").unwrap_or_else(Utc::now);

    Ok(VideoRecord {
        video_id: video_id.clone(),
        owner_id: get_string("owner_id"),
        title: get_string("title"),
        description: get_string("description"),
        source_file: get_string("source_file"),
        status,
        manifest_url: get_opt_string("manifest_url"),
        thumbnail_url: get_opt_string("thumbnail_url"),
        duration_secs: doc.get::<f64>("duration_secs").unwrap_or(0.0),
        file_size: doc.get::<u64>("file_size").unwrap_or(0),
        error_message: get_opt_string("error_message"),
        created_at,
        updated_at: get_time("updated_at").unwrap_or(created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(json: serde_json::Value) -> Document {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_document_to_video_record() {
        let d = doc(serde_json::json!({
            "fields": {
                "owner_id": {"stringValue": "user-1"},
                "title": {"stringValue": "Holiday"},
                "source_file": {"stringValue": "uploads/v1/raw.mp4"},
                "status": {"stringValue": "ready"},
                "manifest_url": {"stringValue": "https://cdn/videos/v1/master.m3u8"},
                "error_message": {"nullValue": null},
                "duration_secs": {"doubleValue": 30.0},
                "file_size": {"integerValue": "2048"},
                "created_at": {"timestampValue": "2024-05-01T10:00:00Z"}
            }
        }));
        let record = document_to_video_record(&d, &VideoId::from("v1")).unwrap();

        assert_eq!(record.video_id.as_str(), "v1");
        assert_eq!(record.owner_id, "user-1");
        assert_eq!(record.status, VideoStatus::Ready);
        assert_eq!(record.manifest_url.as_deref(), Some("https://cdn/videos/v1/master.m3u8"));
        assert!(record.thumbnail_url.is_none());
        assert!(record.error_message.is_none());
        assert_eq!(record.file_size, 2048);
        assert_eq!(record.updated_at, record.created_at);
    }

    #[test]
    fn test_unknown_status_defaults_to_uploading() {
        let d = doc(serde_json::json!({"fields": {"status": {"stringValue": "archived"}}}));
        let record = document_to_video_record(&d, &VideoId::from("v2")).unwrap();
        assert_eq!(record.status, VideoStatus::Uploading);
    }

    #[test]
    fn test_document_without_fields_is_invalid() {
        let d = doc(serde_json::json!({"name": "videos/v3"}));
        assert!(document_to_video_record(&d, &VideoId::from("v3")).is_err());
    }

    #[test]
    fn test_ready_fields_clear_error() {
        let fields = ready_fields(&ReadyUpdate {
            manifest_url: "https://cdn/m.m3u8".to_string(),
            thumbnail_url: None,
        });
        assert_eq!(fields["status"], Value::StringValue("ready".to_string()));
        assert_eq!(fields["error_message"], Value::NullValue(()));
        assert!(!fields.contains_key("thumbnail_url"));

        let fields = ready_fields(&ReadyUpdate {
            manifest_url: "https://cdn/m.m3u8".to_string(),
            thumbnail_url: Some("https://cdn/t.jpg".to_string()),
        });
        assert_eq!(fields["thumbnail_url"], Value::StringValue("https://cdn/t.jpg".to_string()));
    }

    #[test]
    fn test_failed_fields_clear_manifest() {
        let fields = failed_fields("Video duration 700.0s exceeds maximum of 600s");
        assert_eq!(fields["status"], Value::StringValue("failed".to_string()));
        assert_eq!(fields["manifest_url"], Value::NullValue(()));
        assert!(fields.contains_key("updated_at"));
        assert!(!fields.contains_key("thumbnail_url"));
    }
}
