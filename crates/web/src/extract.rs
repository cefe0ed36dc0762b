//! Upload-bundle extraction
//!
//! Sniffs an uploaded archive into its analysis artifacts. Entries are
//! classified by content and name: a `.json` entry is the report iff parsing
//! it yields an object with a `suites` or `config` key, a `.zip` entry is
//! the trace (names containing "trace" preferred), images are screenshots,
//! `.mp4`/`.webm` is the video, and a `.md` entry whose name contains
//! "context" is the free-text context. A bare JSON report uploaded without
//! an archive wrapper passes straight through.

use std::io::{Cursor, Read};

use thiserror::Error;
use tracing::{debug, warn};

use triage_engine::AnalysisArtifacts;

/// Errors classifying an upload
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Invalid upload archive: {0}")]
    InvalidArchive(String),

    #[error("No test report found in upload (entries: {})", entries.join(", "))]
    MissingReport { entries: Vec<String> },
}

/// Artifacts recovered from one upload
#[derive(Debug, Default)]
pub struct ArtifactBundle {
    pub report: Vec<u8>,
    pub trace: Option<Vec<u8>>,
    pub screenshots: Vec<Vec<u8>>,
    pub video: Option<Vec<u8>>,
    pub context: Option<String>,
}

impl From<ArtifactBundle> for AnalysisArtifacts {
    fn from(bundle: ArtifactBundle) -> Self {
        AnalysisArtifacts {
            report: bundle.report,
            trace: bundle.trace,
            screenshots: bundle.screenshots,
            video: bundle.video,
            context: bundle.context,
        }
    }
}

/// How many entry names to include in a `MissingReport` error
const ENTRY_SAMPLE: usize = 10;

/// Sniff an upload into its artifacts.
pub fn extract_bundle(bytes: &[u8]) -> Result<ArtifactBundle, ExtractError> {
    // A bare report upload needs no unpacking
    if looks_like_report(bytes) {
        debug!("Upload is a bare report JSON");
        return Ok(ArtifactBundle {
            report: bytes.to_vec(),
            ..Default::default()
        });
    }

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ExtractError::InvalidArchive(format!("zip: {}", e)))?;

    let mut bundle = ArtifactBundle::default();
    let mut trace_candidates: Vec<(String, Vec<u8>)> = Vec::new();
    let mut entry_names = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| ExtractError::InvalidArchive(format!("zip entry: {}", e)))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        entry_names.push(name.clone());
        let lower = name.to_lowercase();

        let mut data = Vec::with_capacity(entry.size() as usize);
        if let Err(e) = entry.read_to_end(&mut data) {
            warn!("Skipping unreadable upload entry {}: {}", name, e);
            continue;
        }

        if lower.ends_with(".json") {
            if bundle.report.is_empty() && looks_like_report(&data) {
                bundle.report = data;
            } else {
                debug!("Ignoring non-report JSON entry: {}", name);
            }
        } else if lower.ends_with(".zip") {
            trace_candidates.push((lower.clone(), data));
        } else if lower.ends_with(".png") || lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
            bundle.screenshots.push(data);
        } else if lower.ends_with(".mp4") || lower.ends_with(".webm") {
            bundle.video = Some(data);
        } else if lower.ends_with(".md") && lower.contains("context") {
            bundle.context = Some(String::from_utf8_lossy(&data).into_owned());
        }
    }

    // Prefer a trace-named inner zip over any other
    trace_candidates.sort_by_key(|(name, _)| !name.contains("trace"));
    bundle.trace = trace_candidates.into_iter().next().map(|(_, data)| data);

    if bundle.report.is_empty() {
        return Err(ExtractError::MissingReport {
            entries: entry_names.into_iter().take(ENTRY_SAMPLE).collect(),
        });
    }

    Ok(bundle)
}

/// A JSON document is a report iff it is an object with a `suites` or
/// `config` key.
fn looks_like_report(bytes: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(bytes)
        .map(|v| v.get("suites").is_some() || v.get("config").is_some())
        .unwrap_or(false)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn zip_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            for (name, data) in entries {
                writer
                    .start_file(name.to_string(), SimpleFileOptions::default())
                    .unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    const REPORT: &[u8] = br#"{"suites": [], "stats": {"expected": 1}}"#;

    #[test]
    fn bare_report_passes_through() {
        let bundle = extract_bundle(REPORT).unwrap();
        assert_eq!(bundle.report, REPORT);
        assert!(bundle.trace.is_none());
    }

    #[test]
    fn sniffs_full_bundle() {
        let raw = zip_archive(&[
            ("results/report.json", REPORT),
            ("results/data.json", br#"{"unrelated": true}"#),
            ("results/trace.zip", b"PK-trace"),
            ("results/other.zip", b"PK-other"),
            ("results/failure-1.png", b"\x89PNG"),
            ("results/failure-2.jpeg", b"\xff\xd8"),
            ("results/video.webm", b"\x1a\x45"),
            ("results/context.md", b"staging env, flaky network"),
        ]);
        let bundle = extract_bundle(&raw).unwrap();
        assert_eq!(bundle.report, REPORT);
        assert_eq!(bundle.trace.as_deref(), Some(b"PK-trace" as &[u8]));
        assert_eq!(bundle.screenshots.len(), 2);
        assert!(bundle.video.is_some());
        assert_eq!(bundle.context.as_deref(), Some("staging env, flaky network"));
    }

    #[test]
    fn any_zip_serves_as_trace_when_none_is_named() {
        let raw = zip_archive(&[("report.json", REPORT), ("inner.zip", b"PK-x")]);
        let bundle = extract_bundle(&raw).unwrap();
        assert_eq!(bundle.trace.as_deref(), Some(b"PK-x" as &[u8]));
    }

    #[test]
    fn missing_report_names_entries() {
        let raw = zip_archive(&[("only.png", b"\x89PNG")]);
        let err = extract_bundle(&raw).unwrap_err();
        assert!(err.to_string().contains("only.png"));
    }

    #[test]
    fn non_report_json_is_not_a_report() {
        let raw = zip_archive(&[("data.json", br#"{"metrics": []}"#)]);
        assert!(matches!(
            extract_bundle(&raw),
            Err(ExtractError::MissingReport { .. })
        ));
    }
}
