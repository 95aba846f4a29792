//! Per-patient chat sessions and turn orchestration.
//!
//! A `ChatSession` owns one patient's conversation: it assembles the prompt
//! (system instruction + patient context + recent history + new message),
//! calls the model, runs any requested tool calls through the executor, and
//! appends the turns. `SessionManager` caches one session per patient behind
//! an async mutex so concurrent turns for the same patient queue behind each
//! other while different patients proceed independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

use super::context::ContextBuilder;
use super::tools::{self, ToolExecutor, ToolName};
use super::AgentError;
use crate::llm::{ChatTurn, GenerationRequest, LlmClient, Role, ToolExchange};
use crate::storage::ObjectStore;

/// Default system instruction for the admin assistant.
const SYSTEM_INSTRUCTION: &str = "You are a clinical admin assistant for a hepatology service. \
Answer questions using the patient context provided and the available tools. Reference specific \
data when it is available, be explicit about limitations and uncertainty, and never present \
information that is not in the patient's records as fact.";

/// Words per fragment when re-chunking a buffered answer for streaming.
const STREAM_CHUNK_WORDS: usize = 5;

/// Pacing delay between re-chunked fragments.
const STREAM_CHUNK_DELAY: Duration = Duration::from_millis(50);

/// Turns of history included in the prompt.
const PROMPT_HISTORY_TURNS: usize = 8;

/// Tunables shared by every session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Maximum tool-call rounds per user turn. One round is the upstream
    /// behavior; the loop iterates until the model stops requesting tools
    /// when the bound is raised.
    pub max_tool_rounds: u32,
    /// Sliding window applied to in-memory history on every append.
    pub history_limit: usize,
    /// Whether tool declarations are advertised to the model.
    pub tools_enabled: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_tool_rounds: 1,
            history_limit: 100,
            tools_enabled: true,
        }
    }
}

// ---------------------------------------------------------------------------
// ChatSession
// ---------------------------------------------------------------------------

/// One patient's conversation with the assistant.
pub struct ChatSession {
    patient_id: String,
    history: Vec<ChatTurn>,
    /// Patient context, fetched once per session lifetime.
    context: Option<String>,
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn ObjectStore>,
    executor: ToolExecutor,
    options: SessionOptions,
}

/// Shape of the persisted history blob.
#[derive(Serialize)]
struct HistoryBlob<'a> {
    patient_id: &'a str,
    saved_at: String,
    conversation: &'a [ChatTurn],
}

impl ChatSession {
    pub fn new(
        patient_id: &str,
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn ObjectStore>,
        options: SessionOptions,
    ) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            history: Vec::new(),
            context: None,
            llm,
            executor: ToolExecutor::new(store.clone()),
            store,
            options,
        }
    }

    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    /// Ordered conversation turns.
    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    /// Discard all turns. Non-reversible.
    pub fn clear_history(&mut self) {
        self.history.clear();
        tracing::info!(patient_id = %self.patient_id, "Conversation history cleared");
    }

    /// Serialize the current history to storage, overwriting any prior save
    /// for this patient.
    pub async fn save_history(&self) -> Result<(), AgentError> {
        let blob = HistoryBlob {
            patient_id: &self.patient_id,
            saved_at: chrono::Utc::now().to_rfc3339(),
            conversation: &self.history,
        };
        let path = history_path(&self.patient_id);
        let bytes = serde_json::to_vec_pretty(&blob)
            .map_err(|e| AgentError::InvalidArgument(e.to_string()))?;
        self.store.write(&path, bytes).await?;
        tracing::info!(patient_id = %self.patient_id, path, "Saved chat history");
        Ok(())
    }

    /// Send a message and return the complete response.
    pub async fn send(&mut self, message: &str) -> Result<String, AgentError> {
        let request = self.prepare_request(message).await?;
        let text = self.run_tool_loop(request).await?;
        self.finish_turn(&text);
        Ok(text)
    }

    /// Send a message, streaming the response as ordered text fragments.
    ///
    /// The channel closing is the terminal signal: after the last fragment
    /// the receiver yields `None`. Dropping the receiver cancels the
    /// producer on its next send, so no tokens are consumed for a vanished
    /// caller. The session mutex is held for the duration of the turn,
    /// which is what serializes a second message behind this one.
    pub fn send_stream(
        session: Arc<tokio::sync::Mutex<ChatSession>>,
        message: String,
    ) -> mpsc::Receiver<Result<String, AgentError>> {
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let mut session = session.lock().await;

            if session.options.tools_enabled {
                // Tool detection needs the buffered completion; fragments
                // are re-chunked from the final text.
                match session.turn_buffered(&message).await {
                    Ok(text) => {
                        for fragment in chunk_fragments(&text, STREAM_CHUNK_WORDS) {
                            if tx.send(Ok(fragment)).await.is_err() {
                                tracing::debug!("Stream consumer gone, stopping fragment replay");
                                return;
                            }
                            tokio::time::sleep(STREAM_CHUNK_DELAY).await;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                    }
                }
            } else {
                // No tools declared: forward model fragments as they arrive.
                if let Err(e) = session.turn_streaming(&message, &tx).await {
                    let _ = tx.send(Err(e)).await;
                }
            }
        });

        rx
    }

    async fn turn_buffered(&mut self, message: &str) -> Result<String, AgentError> {
        let request = self.prepare_request(message).await?;
        let text = self.run_tool_loop(request).await?;
        self.finish_turn(&text);
        Ok(text)
    }

    async fn turn_streaming(
        &mut self,
        message: &str,
        tx: &mpsc::Sender<Result<String, AgentError>>,
    ) -> Result<(), AgentError> {
        let request = self.prepare_request(message).await?;
        let mut fragments = self.llm.generate_stream(&request).await?;
        let mut full_text = String::new();

        while let Some(fragment) = fragments.recv().await {
            let fragment = fragment?;
            full_text.push_str(&fragment);
            if tx.send(Ok(fragment)).await.is_err() {
                // Consumer gone: dropping the receiver stops the producer.
                tracing::debug!(patient_id = %self.patient_id, "Stream consumer gone mid-turn");
                return Ok(());
            }
        }

        self.finish_turn(&full_text);
        Ok(())
    }

    /// Build the generation request for a new message and record the user
    /// turn. The context is fetched on first use and cached for the session.
    async fn prepare_request(&mut self, message: &str) -> Result<GenerationRequest, AgentError> {
        if self.context.is_none() {
            let builder = ContextBuilder::new(self.store.clone());
            let context = builder.build(&self.patient_id).await?;
            tracing::info!(
                patient_id = %self.patient_id,
                context_bytes = context.len(),
                "Loaded patient context"
            );
            self.context = Some(context);
        }
        let context = self.context.as_deref().unwrap_or_default();

        let prompt = build_prompt(context, &self.history, message);
        self.push_turn(ChatTurn::now(Role::User, message));

        Ok(GenerationRequest {
            system: SYSTEM_INSTRUCTION.to_string(),
            prompt,
            tools: if self.options.tools_enabled {
                tools::declarations()
            } else {
                vec![]
            },
            tool_results: vec![],
        })
    }

    /// Invoke the model, executing requested tools and re-invoking with
    /// their results, up to the configured round bound.
    async fn run_tool_loop(&mut self, mut request: GenerationRequest) -> Result<String, AgentError> {
        let mut completion = self.llm.generate(&request).await?;
        let mut rounds = 0;

        while !completion.tool_calls.is_empty() && rounds < self.options.max_tool_rounds {
            rounds += 1;
            for call in std::mem::take(&mut completion.tool_calls) {
                let payload = self.execute_tool_call(&call).await?;
                self.push_turn(ChatTurn::now(Role::Tool, payload.to_string()));
                request.tool_results.push(ToolExchange {
                    call,
                    response: payload,
                });
            }
            completion = self.llm.generate(&request).await?;
        }

        if !completion.tool_calls.is_empty() {
            tracing::warn!(
                patient_id = %self.patient_id,
                rounds,
                "Tool round bound reached with calls still pending"
            );
        }

        Ok(completion.text)
    }

    /// Execute one model-requested tool call.
    ///
    /// Unknown names, missing records, and bad arguments become structured
    /// notes fed back to the model so the turn always completes; only
    /// infrastructure failures (storage, model) propagate.
    async fn execute_tool_call(
        &self,
        call: &crate::llm::ToolCall,
    ) -> Result<serde_json::Value, AgentError> {
        let tool: ToolName = match call.name.parse() {
            Ok(tool) => tool,
            Err(err) => {
                tracing::warn!(tool = %call.name, "Model requested unknown tool");
                return Ok(json!({
                    "status": "unavailable",
                    "message": err.to_string(),
                }));
            }
        };

        match self.executor.execute(tool, &self.patient_id, &call.arguments).await {
            Ok(payload) => Ok(payload),
            Err(err) if err.is_recoverable_in_turn() => {
                tracing::warn!(tool = tool.as_str(), error = %err, "Tool call failed, answering without it");
                Ok(json!({
                    "status": "error",
                    "message": err.to_string(),
                }))
            }
            Err(err) => Err(err),
        }
    }

    fn finish_turn(&mut self, text: &str) {
        self.push_turn(ChatTurn::now(Role::Assistant, text));
    }

    /// Append a turn, trimming to the configured sliding window. The
    /// upstream system grew history without bound; the window is this
    /// implementation's explicit answer to that gap.
    fn push_turn(&mut self, turn: ChatTurn) {
        self.history.push(turn);
        if self.history.len() > self.options.history_limit {
            let excess = self.history.len() - self.options.history_limit;
            self.history.drain(..excess);
        }
    }
}

/// Storage path of a patient's persisted history.
pub fn history_path(patient_id: &str) -> String {
    format!("patient_data/{patient_id}/chat_history.json")
}

/// Build the prompt from context, recent history, and the new message.
fn build_prompt(context: &str, history: &[ChatTurn], message: &str) -> String {
    let mut prompt = String::new();

    if !context.is_empty() {
        prompt.push_str(context);
        prompt.push('\n');
    }

    let recent: Vec<&ChatTurn> = history
        .iter()
        .filter(|t| t.role != Role::Tool)
        .rev()
        .take(PROMPT_HISTORY_TURNS)
        .collect();
    if !recent.is_empty() {
        prompt.push_str("<CONVERSATION_HISTORY>\n");
        for turn in recent.into_iter().rev() {
            prompt.push_str(&format!("{}: {}\n", turn.role.as_str(), turn.content));
        }
        prompt.push_str("</CONVERSATION_HISTORY>\n\n");
    }

    prompt.push_str(&format!("User question: {message}"));
    prompt
}

/// Split text into fragments of roughly `words` words each, preserving all
/// whitespace so the fragments concatenate back to the exact input.
fn chunk_fragments(text: &str, words: usize) -> Vec<String> {
    if text.is_empty() {
        return vec![];
    }
    let pieces: Vec<&str> = text.split_inclusive(char::is_whitespace).collect();
    pieces
        .chunks(words.max(1))
        .map(|group| group.concat())
        .collect()
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

/// Caches one `ChatSession` per patient.
///
/// Sessions sit behind a `tokio::sync::Mutex` so at most one turn per
/// patient is in flight; a second message queues behind the first.
/// Cross-patient traffic is fully independent.
pub struct SessionManager {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn ObjectStore>,
    options: SessionOptions,
    sessions: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<ChatSession>>>>,
}

impl SessionManager {
    pub fn new(llm: Arc<dyn LlmClient>, store: Arc<dyn ObjectStore>, options: SessionOptions) -> Self {
        Self {
            llm,
            store,
            options,
            sessions: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Get the session for a patient, creating it on first use.
    pub fn session(&self, patient_id: &str) -> Arc<tokio::sync::Mutex<ChatSession>> {
        let mut sessions = self.sessions.lock().expect("session map lock");
        sessions
            .entry(patient_id.to_string())
            .or_insert_with(|| {
                tracing::info!(patient_id, "Created chat session");
                Arc::new(tokio::sync::Mutex::new(ChatSession::new(
                    patient_id,
                    self.llm.clone(),
                    self.store.clone(),
                    self.options.clone(),
                )))
            })
            .clone()
    }

    /// Get the session for a patient only if one already exists.
    pub fn existing(&self, patient_id: &str) -> Option<Arc<tokio::sync::Mutex<ChatSession>>> {
        self.sessions
            .lock()
            .expect("session map lock")
            .get(patient_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Completion, LlmError, ToolCall};
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted model: pops one closure per `generate` call.
    struct ScriptedLlm {
        steps: Mutex<VecDeque<Box<dyn Fn(&GenerationRequest) -> Completion + Send>>>,
        calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn new(steps: Vec<Box<dyn Fn(&GenerationRequest) -> Completion + Send>>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn answering(text: &str) -> Self {
            let text = text.to_string();
            Self::new(vec![Box::new(move |_| Completion {
                text: text.clone(),
                tool_calls: vec![],
            })])
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn generate(&self, request: &GenerationRequest) -> Result<Completion, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self
                .steps
                .lock()
                .unwrap()
                .pop_front()
                .expect("scripted LLM ran out of steps");
            Ok(step(request))
        }
    }

    fn seeded_store() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        store.insert(
            "patient_data/P0001/board_items/dashboard_medication_track.json",
            r#"{"medications": [{"name": "Furosemide", "dose": "80mg daily"}]}"#,
        );
        Arc::new(store)
    }

    fn session_with(llm: Arc<dyn LlmClient>, store: Arc<MemoryStore>) -> ChatSession {
        ChatSession::new("P0001", llm, store, SessionOptions::default())
    }

    #[tokio::test]
    async fn send_appends_user_and_assistant_turns() {
        let llm = Arc::new(ScriptedLlm::answering("Hello!"));
        let mut session = session_with(llm, seeded_store());

        let response = session.send("hi").await.unwrap();
        assert_eq!(response, "Hello!");
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.history()[0].role, Role::User);
        assert_eq!(session.history()[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn clear_history_always_yields_empty() {
        let llm = Arc::new(ScriptedLlm::answering("Hello!"));
        let mut session = session_with(llm, seeded_store());
        session.send("hi").await.unwrap();

        session.clear_history();
        assert!(session.history().is_empty());

        // Clearing an already-empty history is fine too.
        session.clear_history();
        assert!(session.history().is_empty());
    }

    #[tokio::test]
    async fn medication_question_round_trips_through_the_tool() {
        // First call requests the medications tool; the second call answers
        // from the tool payload it was given.
        let llm = Arc::new(ScriptedLlm::new(vec![
            Box::new(|_| Completion {
                text: String::new(),
                tool_calls: vec![ToolCall {
                    name: "get_patient_medications".into(),
                    arguments: serde_json::json!({}),
                }],
            }),
            Box::new(|request: &GenerationRequest| {
                let meds = &request.tool_results[0].response["medications"];
                let name = meds[0]["name"].as_str().unwrap_or("unknown");
                let dose = meds[0]["dose"].as_str().unwrap_or("unknown");
                Completion {
                    text: format!("The patient is on {name} {dose}."),
                    tool_calls: vec![],
                }
            }),
        ]));
        let mut session = session_with(llm.clone(), seeded_store());

        let response = session.send("what medications is the patient on").await.unwrap();
        assert!(response.contains("Furosemide"));
        assert!(response.contains("80mg daily"));
        assert_eq!(llm.calls(), 2);

        // The tool result was recorded as a turn.
        assert!(session.history().iter().any(|t| t.role == Role::Tool));
    }

    #[tokio::test]
    async fn unknown_tool_request_never_crashes_the_turn() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Box::new(|_| Completion {
                text: String::new(),
                tool_calls: vec![ToolCall {
                    name: "frobnicate_patient".into(),
                    arguments: serde_json::json!({}),
                }],
            }),
            Box::new(|request: &GenerationRequest| {
                assert_eq!(request.tool_results[0].response["status"], "unavailable");
                Completion {
                    text: "I could not retrieve that data.".into(),
                    tool_calls: vec![],
                }
            }),
        ]));
        let mut session = session_with(llm, seeded_store());

        let response = session.send("do something exotic").await.unwrap();
        assert!(response.contains("could not retrieve"));
    }

    #[tokio::test]
    async fn missing_record_becomes_a_structured_note_not_a_crash() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Box::new(|_| Completion {
                text: String::new(),
                tool_calls: vec![ToolCall {
                    name: "get_patient_labs".into(),
                    arguments: serde_json::json!({}),
                }],
            }),
            Box::new(|request: &GenerationRequest| {
                assert_eq!(request.tool_results[0].response["status"], "error");
                Completion {
                    text: "No laboratory results are on file.".into(),
                    tool_calls: vec![],
                }
            }),
        ]));
        // Store has medications but no labs.
        let mut session = session_with(llm, seeded_store());

        let response = session.send("what are the latest labs").await.unwrap();
        assert!(response.contains("No laboratory results"));
    }

    #[tokio::test]
    async fn tool_rounds_respect_the_configured_bound() {
        // The model keeps requesting tools; with the default bound of 1 the
        // loop stops after a single round.
        let tool_call = || ToolCall {
            name: "get_patient_medications".into(),
            arguments: serde_json::json!({}),
        };
        let llm = Arc::new(ScriptedLlm::new(vec![
            Box::new(move |_| Completion {
                text: String::new(),
                tool_calls: vec![tool_call()],
            }),
            Box::new(move |_| Completion {
                text: "Partial answer.".into(),
                tool_calls: vec![tool_call()],
            }),
        ]));
        let mut session = session_with(llm.clone(), seeded_store());

        let response = session.send("keep digging").await.unwrap();
        assert_eq!(response, "Partial answer.");
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn history_window_drops_oldest_turns() {
        let store = seeded_store();
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm::new(
            (0..6)
                .map(|i| {
                    let text = format!("answer {i}");
                    Box::new(move |_: &GenerationRequest| Completion {
                        text: text.clone(),
                        tool_calls: vec![],
                    }) as Box<dyn Fn(&GenerationRequest) -> Completion + Send>
                })
                .collect(),
        ));
        let mut session = ChatSession::new(
            "P0001",
            llm,
            store,
            SessionOptions {
                history_limit: 4,
                ..SessionOptions::default()
            },
        );

        for i in 0..6 {
            session.send(&format!("question {i}")).await.unwrap();
        }
        assert_eq!(session.history().len(), 4);
        // Oldest turns are gone; the latest answer survives.
        assert_eq!(session.history().last().unwrap().content, "answer 5");
    }

    #[tokio::test]
    async fn save_history_overwrites_the_patient_blob() {
        let store = seeded_store();
        let llm = Arc::new(ScriptedLlm::answering("Noted."));
        let mut session = session_with(llm, store.clone());
        session.send("remember this").await.unwrap();

        session.save_history().await.unwrap();

        let blob = store
            .read_json("patient_data/P0001/chat_history.json")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(blob["patient_id"], "P0001");
        assert_eq!(blob["conversation"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stream_fragments_concatenate_to_the_buffered_answer() {
        let answer = "This is a streamed answer with more than five words in it.";
        let manager = SessionManager::new(
            Arc::new(ScriptedLlm::answering(answer)),
            seeded_store(),
            SessionOptions::default(),
        );
        let session = manager.session("P0001");

        let mut rx = ChatSession::send_stream(session.clone(), "test".into());
        let mut collected = String::new();
        let mut fragments = 0;
        while let Some(fragment) = rx.recv().await {
            collected.push_str(&fragment.unwrap());
            fragments += 1;
        }

        assert_eq!(collected, answer);
        assert!(fragments > 1);
        assert_eq!(session.lock().await.history().len(), 2);
    }

    #[tokio::test]
    async fn dropping_the_stream_receiver_stops_the_producer() {
        let answer = "word ".repeat(200);
        let manager = SessionManager::new(
            Arc::new(ScriptedLlm::answering(&answer)),
            seeded_store(),
            SessionOptions::default(),
        );
        let session = manager.session("P0001");

        let mut rx = ChatSession::send_stream(session.clone(), "test".into());
        let first = rx.recv().await.unwrap().unwrap();
        assert!(!first.is_empty());
        drop(rx);

        // The producer notices the closed channel and releases the session
        // mutex; a follow-up lock must not deadlock.
        tokio::time::timeout(Duration::from_secs(2), session.lock())
            .await
            .expect("session stayed locked after consumer went away");
    }

    #[tokio::test]
    async fn session_manager_reuses_sessions_per_patient() {
        let manager = SessionManager::new(
            Arc::new(ScriptedLlm::answering("hi")),
            seeded_store(),
            SessionOptions::default(),
        );
        let a = manager.session("P0001");
        let b = manager.session("P0001");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(manager.existing("P0002").is_none());
    }

    #[test]
    fn chunking_preserves_all_whitespace() {
        let text = "one two  three\nfour five six seven";
        let fragments = chunk_fragments(text, 5);
        assert!(fragments.len() > 1);
        assert_eq!(fragments.concat(), text);
    }

    #[test]
    fn chunking_empty_text_yields_no_fragments() {
        assert!(chunk_fragments("", 5).is_empty());
    }

    #[test]
    fn prompt_includes_context_history_and_question() {
        let history = vec![
            ChatTurn::now(Role::User, "earlier question"),
            ChatTurn::now(Role::Assistant, "earlier answer"),
            ChatTurn::now(Role::Tool, "{\"status\":\"success\"}"),
        ];
        let prompt = build_prompt("=== PATIENT CONTEXT ===\n", &history, "new question");

        assert!(prompt.starts_with("=== PATIENT CONTEXT ==="));
        assert!(prompt.contains("user: earlier question"));
        assert!(prompt.contains("assistant: earlier answer"));
        // Tool payloads travel through tool_results, not the prompt.
        assert!(!prompt.contains("status"));
        assert!(prompt.ends_with("User question: new question"));
    }
}
