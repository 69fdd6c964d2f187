//! Versioned encoding of task payloads at the storage boundary.
//!
//! Rows store their payload as a JSON document tagged with a format version:
//!
//! ```text
//! {"v":"1","screenshot_ids":[11,12],"thread_id":7,"embedding":[0.1,0.2]}
//! ```
//!
//! Rows written before the tag existed hold a bare id array (`[11,12]`).
//! Both forms decode into [`TaskPayload`]; encoding always writes the current
//! version. Nothing outside the store sees the stored form.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Typed payload carried by a task row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskPayload {
    /// Screenshots in the capture batch.
    pub screenshot_ids: Vec<i64>,
    /// Activity thread assigned by the thread stage.
    pub thread_id: Option<i64>,
    /// Vector produced by the embedding stage.
    pub embedding: Option<Vec<f32>>,
}

impl TaskPayload {
    /// Payload for a fresh capture batch.
    pub fn screenshots(ids: impl Into<Vec<i64>>) -> Self {
        Self {
            screenshot_ids: ids.into(),
            ..Self::default()
        }
    }

    pub fn with_thread(mut self, thread_id: i64) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Encode into the current stored format.
    pub fn encode(&self) -> Result<String> {
        let stored = StoredPayload::V1 {
            screenshot_ids: self.screenshot_ids.clone(),
            thread_id: self.thread_id,
            embedding: self.embedding.clone(),
        };
        Ok(serde_json::to_string(&stored)?)
    }

    /// Decode any supported stored format.
    pub fn decode(raw: &str) -> Result<Self> {
        let stored: StoredForm = serde_json::from_str(raw)
            .map_err(|e| Error::Serialization(format!("unreadable task payload: {e}")))?;
        Ok(match stored {
            StoredForm::Legacy(screenshot_ids) => Self::screenshots(screenshot_ids),
            StoredForm::Tagged(StoredPayload::V1 {
                screenshot_ids,
                thread_id,
                embedding,
            }) => Self {
                screenshot_ids,
                thread_id,
                embedding,
            },
        })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "v")]
enum StoredPayload {
    #[serde(rename = "1")]
    V1 {
        screenshot_ids: Vec<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        embedding: Option<Vec<f32>>,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredForm {
    Legacy(Vec<i64>),
    Tagged(StoredPayload),
}
