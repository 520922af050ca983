//! Job models shared between the store and the runner.

use std::collections::HashMap;

use tracing::warn;

/// Job lifecycle. `pending → downloading → processing → completed`, with
/// `failed` and `cancelled` as terminal alternates. The worker never
/// transitions a job out of `cancelled` or writes past `completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Downloading,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "downloading" => Some(Self::Downloading),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// The slice of a job row the worker consumes, joined with its captured
/// request context.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub url: String,
    pub title: String,
    pub retry_count: u32,
    pub referer: Option<String>,
    pub headers: HashMap<String, String>,
    pub source_page: Option<String>,
}

/// Parse the metadata `headers` column. The API layer stores a JSON object;
/// tolerate anything else by returning an empty map rather than failing the
/// job before it starts.
pub fn parse_headers(raw: Option<&str>) -> HashMap<String, String> {
    let Some(raw) = raw else {
        return HashMap::new();
    };
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(object)) => object
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect(),
        Ok(_) | Err(_) => {
            warn!("job_metadata.headers is not a JSON object; ignoring");
            HashMap::new()
        }
    }
}
