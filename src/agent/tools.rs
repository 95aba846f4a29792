//! Fixed tool set for model-initiated data retrieval.
//!
//! Each tool is a pure read against the object store, keyed by patient id.
//! The set is closed: names are parsed into `ToolName` at the boundary and
//! anything else is rejected before dispatch. Adding a tool is a code
//! change, not a runtime registration.

use std::str::FromStr;
use std::sync::Arc;

use serde_json::{json, Value};

use super::AgentError;
use crate::llm::ToolDecl;
use crate::storage::ObjectStore;

/// Characters of surrounding context kept around a search match.
const SNIPPET_CONTEXT_CHARS: usize = 200;

/// Default encounter count when the model does not pass a limit.
const DEFAULT_ENCOUNTER_LIMIT: usize = 10;

// ---------------------------------------------------------------------------
// Tool names
// ---------------------------------------------------------------------------

/// The closed set of operations the model may invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolName {
    PatientLabs,
    PatientMedications,
    PatientEncounters,
    SearchPatientData,
    DrugInteraction,
}

impl ToolName {
    pub const ALL: [ToolName; 5] = [
        ToolName::PatientLabs,
        ToolName::PatientMedications,
        ToolName::PatientEncounters,
        ToolName::SearchPatientData,
        ToolName::DrugInteraction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::PatientLabs => "get_patient_labs",
            ToolName::PatientMedications => "get_patient_medications",
            ToolName::PatientEncounters => "get_patient_encounters",
            ToolName::SearchPatientData => "search_patient_data",
            ToolName::DrugInteraction => "check_drug_interaction",
        }
    }
}

impl FromStr for ToolName {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolName::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| AgentError::UnknownTool(s.to_string()))
    }
}

/// Declarations advertised to the model alongside each request.
pub fn declarations() -> Vec<ToolDecl> {
    vec![
        ToolDecl {
            name: "get_patient_labs",
            description: "Retrieve laboratory test results for the patient. Returns chronological lab values including dates, biomarker names, values, and reference ranges.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "biomarker": {
                        "type": "string",
                        "description": "Optional: specific biomarker to retrieve (e.g. 'ALT', 'Bilirubin'). If not specified, returns all."
                    }
                }
            }),
        },
        ToolDecl {
            name: "get_patient_medications",
            description: "Retrieve current and past medications for the patient. Returns a medication timeline with dates, doses, and indications.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "active_only": {
                        "type": "boolean",
                        "description": "If true, returns only currently active medications"
                    }
                }
            }),
        },
        ToolDecl {
            name: "get_patient_encounters",
            description: "Retrieve past medical encounters/visits for the patient. Returns visit dates, providers, diagnoses, and treatments.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "limit": {
                        "type": "integer",
                        "description": "Maximum number of encounters to return (default: 10)"
                    }
                }
            }),
        },
        ToolDecl {
            name: "search_patient_data",
            description: "Search across the patient's records for specific keywords or conditions. Useful for finding mentions of symptoms, diagnoses, or treatments.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Search query (e.g. 'jaundice', 'liver failure')"
                    }
                },
                "required": ["query"]
            }),
        },
        ToolDecl {
            name: "check_drug_interaction",
            description: "Check for potential drug-drug interactions between two medications. Returns interaction severity and clinical recommendations.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "drug_a": {"type": "string", "description": "First medication name"},
                    "drug_b": {"type": "string", "description": "Second medication name"}
                },
                "required": ["drug_a", "drug_b"]
            }),
        },
    ]
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Dispatches parsed tool calls against the object store.
pub struct ToolExecutor {
    store: Arc<dyn ObjectStore>,
}

impl ToolExecutor {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Execute one tool. Results are structured JSON payloads fed back to
    /// the model; `PatientNotFound` and `InvalidArgument` indicate the data
    /// or arguments were bad, not that the executor failed.
    pub async fn execute(
        &self,
        tool: ToolName,
        patient_id: &str,
        args: &Value,
    ) -> Result<Value, AgentError> {
        tracing::info!(tool = tool.as_str(), patient_id, "Executing tool");
        match tool {
            ToolName::PatientLabs => self.patient_labs(patient_id, args).await,
            ToolName::PatientMedications => self.patient_medications(patient_id, args).await,
            ToolName::PatientEncounters => self.patient_encounters(patient_id, args).await,
            ToolName::SearchPatientData => self.search_patient_data(patient_id, args).await,
            ToolName::DrugInteraction => drug_interaction(args),
        }
    }

    async fn board_item(&self, patient_id: &str, file: &str) -> Result<Option<Value>, AgentError> {
        let path = format!("patient_data/{patient_id}/board_items/{file}");
        Ok(self.store.read_json(&path).await?)
    }

    async fn patient_labs(&self, patient_id: &str, args: &Value) -> Result<Value, AgentError> {
        let Some(lab_data) = self.board_item(patient_id, "dashboard_lab_track.json").await? else {
            return Err(AgentError::PatientNotFound(patient_id.to_string()));
        };

        let Some(biomarker) = optional_str(args, "biomarker")? else {
            return Ok(merge_status(lab_data));
        };

        let wanted = biomarker.to_lowercase();
        let filtered: Vec<Value> = lab_data["biomarkers"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter(|item| {
                        item["name"]
                            .as_str()
                            .is_some_and(|n| n.to_lowercase().contains(&wanted))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if filtered.is_empty() {
            return Err(AgentError::InvalidArgument(format!(
                "unknown biomarker '{biomarker}' for patient {patient_id}"
            )));
        }

        Ok(json!({
            "status": "success",
            "biomarkers": filtered,
            "count": filtered.len(),
        }))
    }

    async fn patient_medications(&self, patient_id: &str, args: &Value) -> Result<Value, AgentError> {
        let Some(med_data) = self
            .board_item(patient_id, "dashboard_medication_track.json")
            .await?
        else {
            return Err(AgentError::PatientNotFound(patient_id.to_string()));
        };

        let active_only = optional_bool(args, "active_only")?.unwrap_or(false);
        if !active_only {
            return Ok(merge_status(med_data));
        }

        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let filtered: Vec<Value> = med_data["medications"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter(|med| match med["endDate"].as_str() {
                        // Active: never ended, or ends in the future.
                        None => true,
                        Some(end) => end > today.as_str(),
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(json!({
            "status": "success",
            "medications": filtered,
            "count": filtered.len(),
        }))
    }

    async fn patient_encounters(&self, patient_id: &str, args: &Value) -> Result<Value, AgentError> {
        let Some(encounter_data) = self.board_item(patient_id, "encounters.json").await? else {
            return Err(AgentError::PatientNotFound(patient_id.to_string()));
        };

        let limit = optional_usize(args, "limit")?.unwrap_or(DEFAULT_ENCOUNTER_LIMIT);

        // Stored as either a bare list or an object with an "encounters" key.
        let encounters: Vec<Value> = match &encounter_data {
            Value::Array(items) => items.iter().take(limit).cloned().collect(),
            Value::Object(_) => encounter_data["encounters"]
                .as_array()
                .map(|items| items.iter().take(limit).cloned().collect())
                .unwrap_or_default(),
            _ => vec![],
        };

        Ok(json!({
            "status": "success",
            "encounters": encounters,
            "count": encounters.len(),
        }))
    }

    async fn search_patient_data(&self, patient_id: &str, args: &Value) -> Result<Value, AgentError> {
        let query = optional_str(args, "query")?
            .ok_or_else(|| AgentError::InvalidArgument("search requires a 'query' string".into()))?;
        if query.trim().is_empty() {
            return Err(AgentError::InvalidArgument("search query is empty".into()));
        }

        let files = [
            format!("patient_data/{patient_id}/patient_profile.txt"),
            format!("patient_data/{patient_id}/board_items/patient_context.json"),
        ];

        let mut results = Vec::new();
        for path in &files {
            let Some(content) = self.store.read_string(path).await? else {
                continue;
            };
            if let Some(snippet) = extract_snippet(&content, query, SNIPPET_CONTEXT_CHARS) {
                let source = path.rsplit('/').next().unwrap_or(path).to_string();
                results.push(json!({"source": source, "snippet": snippet}));
            }
        }

        Ok(json!({
            "query": query,
            "results": results,
            "count": results.len(),
        }))
    }
}

/// Drug-interaction lookup. Deliberately a placeholder: there is no backing
/// interaction database, and the payload says so instead of guessing.
fn drug_interaction(args: &Value) -> Result<Value, AgentError> {
    let drug_a = optional_str(args, "drug_a")?
        .ok_or_else(|| AgentError::InvalidArgument("interaction check requires 'drug_a'".into()))?;
    let drug_b = optional_str(args, "drug_b")?
        .ok_or_else(|| AgentError::InvalidArgument("interaction check requires 'drug_b'".into()))?;

    tracing::info!(drug_a, drug_b, "Drug interaction check requested (no backing database)");

    Ok(json!({
        "status": "not_implemented",
        "drug_a": drug_a,
        "drug_b": drug_b,
        "note": "Drug interaction checking has no backing database in this system. Do not present an interaction assessment as fact.",
        "severity": "unknown",
        "recommendation": "Consult a pharmacist or a drug interaction database.",
    }))
}

/// Replace the top-level payload with itself plus `"status": "success"`.
fn merge_status(mut data: Value) -> Value {
    if let Some(map) = data.as_object_mut() {
        map.insert("status".to_string(), json!("success"));
        data
    } else {
        json!({"status": "success", "data": data})
    }
}

// -- Argument extraction ----------------------------------------------------

fn optional_str<'a>(args: &'a Value, key: &str) -> Result<Option<&'a str>, AgentError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(AgentError::InvalidArgument(format!(
            "'{key}' must be a string, got {other}"
        ))),
    }
}

fn optional_bool(args: &Value, key: &str) -> Result<Option<bool>, AgentError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(AgentError::InvalidArgument(format!(
            "'{key}' must be a boolean, got {other}"
        ))),
    }
}

fn optional_usize(args: &Value, key: &str) -> Result<Option<usize>, AgentError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| {
                AgentError::InvalidArgument(format!("'{key}' must be a non-negative integer"))
            }),
    }
}

/// Extract a snippet of text around the first case-insensitive match of
/// `query`. Returns `None` when the text does not contain the query.
fn extract_snippet(text: &str, query: &str, context_chars: usize) -> Option<String> {
    let lower_text = text.to_lowercase();
    let lower_query = query.to_lowercase();

    // Lowercasing can change byte offsets for non-ASCII text; fall back to a
    // case-sensitive search on the original in that case.
    let pos = if lower_text.len() == text.len() {
        lower_text.find(&lower_query)
    } else {
        text.find(query)
    }?;

    let start = floor_char_boundary(text, pos.saturating_sub(context_chars));
    let end = ceil_char_boundary(text, (pos + query.len() + context_chars).min(text.len()));

    let mut snippet = String::new();
    if start > 0 {
        snippet.push_str("...");
    }
    snippet.push_str(&text[start..end]);
    if end < text.len() {
        snippet.push_str("...");
    }
    Some(snippet)
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}
