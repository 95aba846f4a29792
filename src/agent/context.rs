//! Patient context assembly for retrieval-augmented generation.
//!
//! Concatenates every stored document for a patient into one text block,
//! in a fixed order, skipping anything absent. The output is used verbatim
//! as a prompt prefix; a missing document is omitted, never replaced with
//! placeholder text that could be mistaken for real data.

use std::sync::Arc;

use crate::storage::{ObjectStore, StorageError};

/// Document sources in assembly order. Paths are relative to
/// `patient_data/{patient_id}/`.
const CONTEXT_SOURCES: &[(&str, &str)] = &[
    ("Patient Profile", "patient_profile.txt"),
    ("Demographics", "basic_info.json"),
    ("Encounters", "board_items/encounters.json"),
    ("Clinical Summary", "board_items/patient_context.json"),
    ("Laboratory Results", "board_items/dashboard_lab_track.json"),
    ("Medications", "board_items/dashboard_medication_track.json"),
    ("Risk Events", "board_items/dashboard_risk_event_track.json"),
    ("Referral", "board_items/referral.json"),
];

/// Assembles the prompt preamble from stored patient documents.
pub struct ContextBuilder {
    store: Arc<dyn ObjectStore>,
}

impl ContextBuilder {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Build the context block for one patient.
    ///
    /// Returns an empty string when the patient has no stored documents.
    /// Absent documents are skipped; transport failures propagate so a
    /// storage outage is never silently treated as "no data".
    pub async fn build(&self, patient_id: &str) -> Result<String, StorageError> {
        let mut sections = Vec::new();

        for (label, file) in CONTEXT_SOURCES {
            let path = format!("patient_data/{patient_id}/{file}");
            let Some(content) = self.store.read_string(&path).await? else {
                tracing::debug!(patient_id, file, "Context document absent, skipping");
                continue;
            };
            sections.push(format!("## {label}\n{}\n", render_document(&content)));
        }

        if sections.is_empty() {
            return Ok(String::new());
        }

        let mut context = String::from("=== PATIENT CONTEXT ===\n\n");
        for section in &sections {
            context.push_str(section);
            context.push('\n');
        }
        context.push_str("=== END CONTEXT ===\n");
        Ok(context)
    }
}

/// Pretty-print JSON documents; keep plain text verbatim.
fn render_document(content: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(content) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| content.to_string()),
        Err(_) => content.trim_end().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn builder_with(seed: &[(&str, &str)]) -> ContextBuilder {
        let store = MemoryStore::new();
        for (path, content) in seed {
            store.insert(path, *content);
        }
        ContextBuilder::new(Arc::new(store))
    }

    #[tokio::test]
    async fn no_documents_yields_empty_string() {
        let builder = builder_with(&[]);
        let context = builder.build("P9999").await.unwrap();
        assert_eq!(context, "");
    }

    #[tokio::test]
    async fn absent_documents_are_skipped_without_placeholders() {
        let builder = builder_with(&[(
            "patient_data/P0001/board_items/dashboard_medication_track.json",
            r#"{"medications": [{"name": "Furosemide", "dose": "80mg daily"}]}"#,
        )]);

        let context = builder.build("P0001").await.unwrap();
        assert!(context.contains("## Medications"));
        assert!(context.contains("Furosemide"));
        // No other section headers and no filler for the missing documents.
        assert!(!context.contains("## Patient Profile"));
        assert!(!context.contains("## Encounters"));
        assert!(!context.to_lowercase().contains("not available"));
    }

    #[tokio::test]
    async fn sections_follow_fixed_order() {
        let builder = builder_with(&[
            (
                "patient_data/P0001/board_items/referral.json",
                r#"{"to": "hepatology"}"#,
            ),
            ("patient_data/P0001/patient_profile.txt", "58-year-old male."),
            (
                "patient_data/P0001/board_items/encounters.json",
                r#"[{"date": "2026-01-10"}]"#,
            ),
        ]);

        let context = builder.build("P0001").await.unwrap();
        let profile = context.find("## Patient Profile").unwrap();
        let encounters = context.find("## Encounters").unwrap();
        let referral = context.find("## Referral").unwrap();
        assert!(profile < encounters);
        assert!(encounters < referral);
    }

    #[tokio::test]
    async fn plain_text_documents_kept_verbatim() {
        let builder = builder_with(&[(
            "patient_data/P0001/patient_profile.txt",
            "History of decompensated cirrhosis.\n",
        )]);

        let context = builder.build("P0001").await.unwrap();
        assert!(context.contains("History of decompensated cirrhosis."));
        assert!(context.starts_with("=== PATIENT CONTEXT ==="));
        assert!(context.trim_end().ends_with("=== END CONTEXT ==="));
    }
}
