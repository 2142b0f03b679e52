use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::atomic::write_json_atomic;

pub const MANIFEST_FILE: &str = "global_props.json";

/// Per-folder `global_props.json`. Keys this struct does not model are kept in `extra`
/// and written back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub order: Vec<String>,
    #[serde(default)]
    pub error_clips: Vec<ErrorClip>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamps: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<Transcript>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorClip {
    pub clip: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Transcript {
    Entries(Vec<TranscriptEntry>),
    Single(TranscriptEntry),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TranscriptEntry {
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timestamp: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
            extra: Map::new(),
        }
    }
}

impl Manifest {
    pub fn path(folder: &Path) -> PathBuf {
        folder.join(MANIFEST_FILE)
    }

    pub fn load(folder: &Path) -> Result<Self> {
        let path = Self::path(folder);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse manifest {}", path.display()))
    }

    /// Rewrites `global_props.json` through a temporary file in the same folder.
    pub fn save(&self, folder: &Path) -> Result<()> {
        let path = Self::path(folder);
        write_json_atomic(&path, self)?;
        tracing::debug!(path = %path.display(), "manifest saved");
        Ok(())
    }

    /// Text of the most recent transcript entry, if it has any content.
    pub fn current_transcript(&self) -> Option<&str> {
        let entry = match self.transcript.as_ref()? {
            Transcript::Entries(entries) => entries.last()?,
            Transcript::Single(entry) => entry,
        };
        let text = entry.text.trim();
        (!text.is_empty()).then_some(text)
    }
}

/// `<stem>.json` metadata stored next to a media file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClipMetadata {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub notes: Vec<Value>,
    #[serde(default)]
    pub transcript: Vec<TranscriptEntry>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClipMetadata {
    pub fn sidecar_path(media: &Path) -> PathBuf {
        media.with_extension("json")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read clip metadata {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse clip metadata {}", path.display()))
    }

    pub fn load_or_new(path: &Path, label: &str) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        Ok(Self {
            label: label.to_owned(),
            ..Self::default()
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    pub fn push_transcript(&mut self, text: &str) {
        self.transcript.push(TranscriptEntry::now(text));
        self.text = text.to_owned();
    }

    /// Display label for chapter lists: title, then label.
    pub fn display_label(&self) -> Option<&str> {
        [self.title.trim(), self.label.trim()]
            .into_iter()
            .find(|value| !value.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::{json, Value};
    use tempfile::tempdir;

    use super::{ClipMetadata, ErrorClip, Manifest, Transcript, TranscriptEntry};

    #[test]
    fn unknown_manifest_fields_survive_a_rewrite() {
        let dir = tempdir().expect("tempdir should be created");
        fs::write(
            dir.path().join("global_props.json"),
            r#"{"order": ["a.mp4"], "client": "acme", "settings": {"lut": "rec709"}}"#,
        )
        .expect("manifest should be written");

        let mut manifest = Manifest::load(dir.path()).expect("manifest should load");
        manifest.error_clips.push(ErrorClip {
            clip: "b.mp4".to_owned(),
            error: "missing".to_owned(),
        });
        manifest.save(dir.path()).expect("manifest should save");

        let raw: Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join("global_props.json"))
                .expect("manifest should be readable"),
        )
        .expect("manifest should be json");
        assert_eq!(raw["client"], json!("acme"));
        assert_eq!(raw["settings"]["lut"], json!("rec709"));
        assert_eq!(raw["error_clips"][0]["clip"], json!("b.mp4"));
        assert!(raw.get("title").is_none());
    }

    #[test]
    fn current_transcript_takes_last_non_empty_entry() {
        let manifest: Manifest = serde_json::from_value(json!({
            "order": [],
            "transcript": [
                {"text": "first take", "timestamp": "2024-01-01T00:00:00Z"},
                {"text": "final take", "timestamp": "2024-01-02T00:00:00Z"}
            ]
        }))
        .expect("manifest should parse");
        assert_eq!(manifest.current_transcript(), Some("final take"));

        let single: Manifest = serde_json::from_value(json!({"transcript": {"text": " hi "}}))
            .expect("manifest should parse");
        assert_eq!(single.current_transcript(), Some("hi"));

        let blank = Manifest {
            transcript: Some(Transcript::Entries(vec![TranscriptEntry::now("   ")])),
            ..Manifest::default()
        };
        assert_eq!(blank.current_transcript(), None);
        assert_eq!(Manifest::default().current_transcript(), None);
    }

    #[test]
    fn clip_metadata_is_created_then_updated() {
        let dir = tempdir().expect("tempdir should be created");
        let path = ClipMetadata::sidecar_path(&dir.path().join("0001.mp3"));
        assert!(path.ends_with("0001.json"));

        let mut metadata =
            ClipMetadata::load_or_new(&path, "0001").expect("new metadata should be created");
        metadata.push_transcript("hello there");
        metadata.duration = Some(12.5);
        metadata.save(&path).expect("metadata should save");

        let raw: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("sidecar should be readable"))
                .expect("sidecar should be json");
        assert_eq!(raw["label"], json!("0001"));
        assert_eq!(raw["notes"], json!([]));
        assert_eq!(raw["transcript"][0]["text"], json!("hello there"));
        assert!(raw["transcript"][0]["timestamp"]
            .as_str()
            .is_some_and(|stamp| stamp.ends_with('Z')));
        assert_eq!(raw["duration"], json!(12.5));

        let mut reloaded =
            ClipMetadata::load_or_new(&path, "ignored").expect("metadata should reload");
        assert_eq!(reloaded.label, "0001");
        reloaded.push_transcript("second");
        assert_eq!(reloaded.transcript.len(), 2);
        assert_eq!(reloaded.text, "second");
    }

    #[test]
    fn missing_duration_serializes_as_null() {
        let raw = serde_json::to_value(ClipMetadata::default()).expect("should serialize");
        assert_eq!(raw["duration"], Value::Null);
    }

    #[test]
    fn display_label_prefers_title() {
        let metadata = ClipMetadata {
            label: "0003".to_owned(),
            title: "Safety briefing".to_owned(),
            ..ClipMetadata::default()
        };
        assert_eq!(metadata.display_label(), Some("Safety briefing"));
        assert_eq!(ClipMetadata::default().display_label(), None);
    }
}
