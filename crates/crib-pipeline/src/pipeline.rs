//! Stage orchestration: drives clean, answer, and explain requests for
//! per-tab sessions

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crib_ai::{GenerateRequest, GenerationConfig, StreamEvent};

use crate::error::{Error, Result};
use crate::events::PipelineEvent;
use crate::generator::TextGenerator;
use crate::history::{HistoryEntry, HistoryLog};
use crate::prompts::{self, PromptOverrides, Tone};
use crate::session::{PageInfo, Session, SessionEvent, Stage, Status};
use crate::store::StateStore;

/// Default model for all stages
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Input beyond this many characters is truncated before the clean stage
pub const DEFAULT_MAX_SOURCE_CHARS: usize = 24_000;

/// Settings the pipeline applies to every run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub generation: GenerationConfig,
    pub prompts: PromptOverrides,
    pub tone: Tone,
    pub max_source_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            generation: GenerationConfig::default(),
            prompts: PromptOverrides::default(),
            tone: Tone::default(),
            max_source_chars: DEFAULT_MAX_SOURCE_CHARS,
        }
    }
}

/// Sessions plus the per-tab generation counters.
///
/// Counters live outside the sessions so they survive session removal;
/// a removed run's late events must still compare stale.
#[derive(Default)]
struct TabRegistry {
    sessions: HashMap<u32, Session>,
    generations: HashMap<u32, u64>,
}

impl TabRegistry {
    fn bump_generation(&mut self, tab_id: u32) -> u64 {
        let counter = self.generations.entry(tab_id).or_insert(0);
        *counter += 1;
        *counter
    }
}

struct PipelineInner {
    config: PipelineConfig,
    generator: Arc<dyn TextGenerator>,
    store: Arc<dyn StateStore>,
    tabs: Mutex<TabRegistry>,
    history: Mutex<HistoryLog>,
    event_tx: broadcast::Sender<PipelineEvent>,
}

/// Drives analysis runs and owns all session state.
///
/// All state is behind an `Arc`, so cloning is cheap and clones share
/// the same sessions, history, and event bus.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        generator: Arc<dyn TextGenerator>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(PipelineInner {
                config,
                generator,
                store,
                tabs: Mutex::new(TabRegistry::default()),
                history: Mutex::new(HistoryLog::new()),
                event_tx,
            }),
        }
    }

    /// Subscribe to pipeline events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Re-populate sessions and history from the store
    pub async fn load_state(&self) -> Result<()> {
        let sessions = self.inner.store.load_sessions().await?;
        let entries = self.inner.store.load_history().await?;

        {
            let mut tabs = self.inner.tabs.lock();
            for session in sessions {
                tabs.generations.insert(session.tab_id, session.generation);
                tabs.sessions.insert(session.tab_id, session);
            }
        }
        *self.inner.history.lock() = HistoryLog::from_entries(entries);
        Ok(())
    }

    /// Snapshot of the session for a tab
    pub fn tab_state(&self, tab_id: u32) -> Option<Session> {
        self.inner.tabs.lock().sessions.get(&tab_id).cloned()
    }

    /// History entries, newest first
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.history.lock().entries().to_vec()
    }

    pub async fn clear_history(&self) -> Result<()> {
        self.inner.history.lock().clear();
        self.inner.store.save_history(&[]).await
    }

    /// Run the clean and answer stages for a tab.
    ///
    /// A busy tab is rejected outright, never queued. A fresh request on
    /// a finished tab replaces its session wholesale; any events still in
    /// flight from the replaced run carry a stale generation and are
    /// dropped on arrival. Stage failures are recorded on the session and
    /// notified, not returned as errors here.
    pub async fn start_analysis(
        &self,
        tab_id: u32,
        source_text: impl Into<String>,
        page: Option<PageInfo>,
    ) -> Result<()> {
        let mut source_text = source_text.into();

        if source_text.chars().count() > self.inner.config.max_source_chars {
            tracing::warn!(
                tab_id,
                limit = self.inner.config.max_source_chars,
                "truncating oversized source text"
            );
            source_text = source_text
                .chars()
                .take(self.inner.config.max_source_chars)
                .collect();
        }

        // Decide the pre-flight outcome before touching any state. Both
        // checks run before any network call.
        let missing_key = self
            .inner
            .config
            .api_key
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .is_empty();
        let precheck = if missing_key {
            Some(Error::MissingApiKey)
        } else if source_text.trim().is_empty() {
            Some(Error::NoContent)
        } else {
            None
        };

        // Busy check, generation bump, and session replacement are one
        // critical section.
        let session = {
            let mut tabs = self.inner.tabs.lock();
            let busy = tabs
                .sessions
                .get(&tab_id)
                .map(|s| s.is_busy())
                .unwrap_or(false);
            if busy {
                return Err(Error::TabBusy(tab_id));
            }
            let generation = tabs.bump_generation(tab_id);
            let mut session =
                Session::new(tab_id, generation, source_text, page).apply(SessionEvent::Started);
            if let Some(ref err) = precheck {
                session = session.apply(SessionEvent::Failed {
                    stage: Stage::Clean,
                    message: err.to_string(),
                });
            }
            tabs.sessions.insert(tab_id, session.clone());
            session
        };

        self.persist_and_notify(&session).await;
        if let Some(err) = precheck {
            return Err(err);
        }

        let generation = session.generation;
        if self
            .commit_and_notify(
                tab_id,
                generation,
                SessionEvent::StageStarted {
                    stage: Stage::Clean,
                },
            )
            .await
            .is_none()
        {
            return Ok(());
        }

        let Some(cleaned) = self
            .run_stage(tab_id, generation, Stage::Clean, &session.source_text)
            .await
        else {
            return Ok(());
        };

        // The answer stage consumes the cleaned text, never the raw input.
        // Its completion transition moves the session out of answering, so
        // there is no separate stage-started event here.
        if self
            .run_stage(tab_id, generation, Stage::Answer, &cleaned)
            .await
            .is_some()
        {
            self.append_history(tab_id, generation).await;
        }
        Ok(())
    }

    /// Run the explanation stage for a completed analysis.
    ///
    /// Consumes the stored cleaned content; available only while the
    /// session is complete.
    pub async fn get_explanation(&self, tab_id: u32) -> Result<()> {
        let (generation, cleaned) = {
            let tabs = self.inner.tabs.lock();
            let session = tabs.sessions.get(&tab_id).ok_or(Error::NoSession(tab_id))?;
            if session.status != Status::Complete {
                return Err(Error::NotAnswered(tab_id));
            }
            let cleaned = session
                .cleaned_content
                .clone()
                .ok_or(Error::NotAnswered(tab_id))?;
            (session.generation, cleaned)
        };

        if self
            .commit_and_notify(
                tab_id,
                generation,
                SessionEvent::StageStarted {
                    stage: Stage::Explain,
                },
            )
            .await
            .is_none()
        {
            return Ok(());
        }

        if let Some(explanation) = self
            .run_stage(tab_id, generation, Stage::Explain, &cleaned)
            .await
        {
            self.record_explanation(tab_id, generation, &explanation)
                .await;
        }
        Ok(())
    }

    /// Abandon any in-flight run and forget the tab's session.
    ///
    /// The underlying stream is not aborted; bumping the generation makes
    /// its late events stale so they are discarded on arrival.
    pub async fn clear_and_rescan(&self, tab_id: u32) -> Result<()> {
        {
            let mut tabs = self.inner.tabs.lock();
            tabs.bump_generation(tab_id);
            tabs.sessions.remove(&tab_id);
        }
        self.inner.store.remove_session(tab_id).await
    }

    /// Delete the session when its tab closes or navigates away
    pub async fn close_tab(&self, tab_id: u32) -> Result<()> {
        self.clear_and_rescan(tab_id).await
    }

    // ---- Stage driver ----

    /// Run one stage to its terminal event, forwarding chunks.
    ///
    /// Returns the full text on success. Returns `None` when the stage
    /// failed (the failure is already committed and notified) or when the
    /// run was superseded mid-stream.
    async fn run_stage(
        &self,
        tab_id: u32,
        generation: u64,
        stage: Stage,
        input: &str,
    ) -> Option<String> {
        let request = GenerateRequest {
            system_prompt: prompts::resolve(stage, &self.inner.config.prompts, self.inner.config.tone)
                .to_string(),
            user_content: input.to_string(),
            config: self.inner.config.generation,
        };

        tracing::debug!(tab_id, stage = stage.as_str(), "dispatching stage request");
        let mut stream = match self
            .inner
            .generator
            .stream_generate(&self.inner.config.model, &request)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.fail_stage(tab_id, generation, stage, e.to_string())
                    .await;
                return None;
            }
        };

        while let Some(event) = stream.next().await {
            if !self.is_current(tab_id, generation) {
                tracing::warn!(
                    tab_id,
                    generation,
                    stage = stage.as_str(),
                    "dropping events from a superseded run"
                );
                return None;
            }
            match event {
                StreamEvent::Chunk { delta } => {
                    tracing::trace!(tab_id, stage = stage.as_str(), len = delta.len(), "chunk");
                    let _ = self.inner.event_tx.send(PipelineEvent::StreamChunk {
                        tab_id,
                        request_type: stage,
                        text: delta,
                    });
                }
                StreamEvent::Done { text, .. } => {
                    self.commit_and_notify(
                        tab_id,
                        generation,
                        SessionEvent::StageCompleted {
                            stage,
                            text: text.clone(),
                        },
                    )
                    .await?;
                    let _ = self.inner.event_tx.send(PipelineEvent::StreamEnd {
                        tab_id,
                        request_type: stage,
                        text: text.clone(),
                    });
                    return Some(text);
                }
                StreamEvent::Error { message } => {
                    self.fail_stage(tab_id, generation, stage, message).await;
                    return None;
                }
            }
        }

        // The stream dropped without a terminal event.
        self.fail_stage(
            tab_id,
            generation,
            stage,
            crib_ai::Error::EmptyResponse.to_string(),
        )
        .await;
        None
    }

    async fn fail_stage(&self, tab_id: u32, generation: u64, stage: Stage, message: String) {
        let committed = self
            .commit_and_notify(
                tab_id,
                generation,
                SessionEvent::Failed {
                    stage,
                    message: message.clone(),
                },
            )
            .await;
        if committed.is_some() {
            let _ = self.inner.event_tx.send(PipelineEvent::StreamError {
                tab_id,
                request_type: stage,
                message,
            });
        }
    }

    /// Apply an event through the pure transition, then persist and
    /// notify.
    ///
    /// Returns `None` (and applies nothing) when the tab's session has
    /// been replaced or removed since `generation` was issued.
    async fn commit_and_notify(
        &self,
        tab_id: u32,
        generation: u64,
        event: SessionEvent,
    ) -> Option<Session> {
        let session = {
            let mut tabs = self.inner.tabs.lock();
            let current = tabs.sessions.get(&tab_id)?;
            if current.generation != generation {
                tracing::warn!(
                    tab_id,
                    stale = generation,
                    current = current.generation,
                    "dropping event from a superseded run"
                );
                return None;
            }
            let next = current.clone().apply(event);
            tabs.sessions.insert(tab_id, next.clone());
            next
        };
        self.persist_and_notify(&session).await;
        Some(session)
    }

    /// Persist a committed session, then send the state update
    async fn persist_and_notify(&self, session: &Session) {
        if let Err(e) = self.inner.store.save_session(session).await {
            tracing::warn!(tab_id = session.tab_id, "failed to persist session: {}", e);
        }
        let _ = self.inner.event_tx.send(PipelineEvent::StateUpdate {
            session: session.clone(),
        });
    }

    fn is_current(&self, tab_id: u32, generation: u64) -> bool {
        self.inner
            .tabs
            .lock()
            .sessions
            .get(&tab_id)
            .map(|s| s.generation == generation)
            .unwrap_or(false)
    }

    /// Append a history entry for a freshly completed analysis
    async fn append_history(&self, tab_id: u32, generation: u64) {
        let entry = {
            let tabs = self.inner.tabs.lock();
            tabs.sessions
                .get(&tab_id)
                .filter(|s| s.generation == generation)
                .and_then(HistoryEntry::from_session)
        };
        let Some(entry) = entry else { return };

        let (id, snapshot) = {
            let mut history = self.inner.history.lock();
            let id = history.append(entry);
            (id, history.entries().to_vec())
        };
        if let Err(e) = self.inner.store.save_history(&snapshot).await {
            tracing::warn!("failed to persist history: {}", e);
        }
        self.commit_and_notify(tab_id, generation, SessionEvent::HistoryRecorded { id })
            .await;
    }

    /// Record a completed explanation on the session's history entry
    async fn record_explanation(&self, tab_id: u32, generation: u64, explanation: &str) {
        let history_id = {
            let tabs = self.inner.tabs.lock();
            tabs.sessions
                .get(&tab_id)
                .filter(|s| s.generation == generation)
                .and_then(|s| s.history_id)
        };
        let Some(history_id) = history_id else { return };

        let snapshot = {
            let mut history = self.inner.history.lock();
            if !history.record_explanation(history_id, explanation) {
                tracing::warn!(history_id, "no history entry to update with explanation");
                return;
            }
            history.entries().to_vec()
        };
        if let Err(e) = self.inner.store.save_history(&snapshot).await {
            tracing::warn!("failed to persist history: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answer::Confidence;
    use crate::store::MemoryStore;

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use crib_ai::{StreamEventStream, TokenUsage};

    /// A scripted generator that replays canned stream events per call
    struct MockGenerator {
        scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
        calls: AtomicU32,
        requests: Mutex<Vec<GenerateRequest>>,
    }

    impl MockGenerator {
        fn new(scripts: Vec<Vec<StreamEvent>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                calls: AtomicU32::new(0),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn request(&self, index: usize) -> GenerateRequest {
            self.requests.lock()[index].clone()
        }
    }

    #[async_trait]
    impl TextGenerator for MockGenerator {
        async fn stream_generate(
            &self,
            _model: &str,
            request: &GenerateRequest,
        ) -> crib_ai::Result<StreamEventStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push(request.clone());
            let events = self.scripts.lock().pop_front().unwrap_or_else(|| {
                vec![StreamEvent::Done {
                    text: "canned output".to_string(),
                    usage: TokenUsage::default(),
                }]
            });
            Ok(Box::pin(async_stream::stream! {
                for event in events {
                    yield event;
                }
            }))
        }
    }

    /// Generator whose streams wait on a semaphore before finishing
    struct GatedGenerator {
        gate: Arc<tokio::sync::Semaphore>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TextGenerator for GatedGenerator {
        async fn stream_generate(
            &self,
            _model: &str,
            _request: &GenerateRequest,
        ) -> crib_ai::Result<StreamEventStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate.clone();
            Ok(Box::pin(async_stream::stream! {
                let permit = gate.acquire().await;
                drop(permit);
                yield StreamEvent::Chunk { delta: "late ".to_string() };
                yield StreamEvent::Done {
                    text: "late output".to_string(),
                    usage: TokenUsage::default(),
                };
            }))
        }
    }

    fn done(text: &str) -> Vec<StreamEvent> {
        vec![StreamEvent::Done {
            text: text.to_string(),
            usage: TokenUsage::default(),
        }]
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            api_key: Some("test-key".to_string()),
            ..PipelineConfig::default()
        }
    }

    fn make_pipeline(
        scripts: Vec<Vec<StreamEvent>>,
    ) -> (Pipeline, Arc<MockGenerator>, Arc<MemoryStore>) {
        let generator = MockGenerator::new(scripts);
        let store = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::new(test_config(), generator.clone(), store.clone());
        (pipeline, generator, store)
    }

    // ---- Happy path ----

    #[tokio::test]
    async fn test_happy_path_appends_history() {
        let cleaned = "Q: 2+2=?\n- 3\n- 4\n- 5";
        let answer = "Answer: 4\nConfidence: High\nReason: basic arithmetic";
        let (pipeline, generator, _store) = make_pipeline(vec![
            vec![
                StreamEvent::Chunk {
                    delta: "Q: 2+2=?\n- 3\n".to_string(),
                },
                StreamEvent::Chunk {
                    delta: "- 4\n- 5".to_string(),
                },
                StreamEvent::Done {
                    text: cleaned.to_string(),
                    usage: TokenUsage::default(),
                },
            ],
            done(answer),
        ]);

        pipeline
            .start_analysis(
                7,
                "Q: 2+2=? a) 3 b) 4 c) 5 [ad] [nav]",
                Some(PageInfo {
                    title: "Quiz".to_string(),
                    url: "https://example.com/quiz".to_string(),
                }),
            )
            .await
            .unwrap();

        let session = pipeline.tab_state(7).unwrap();
        assert_eq!(session.status, Status::Complete);
        assert_eq!(session.cleaned_content.as_deref(), Some(cleaned));
        assert_eq!(session.answer.as_deref(), Some(answer));
        assert_eq!(session.confidence, Some(Confidence::High));
        assert_eq!(session.reason.as_deref(), Some("basic arithmetic"));
        assert!(session.error.is_none());

        // The answer stage consumed the cleaned text, never the raw input.
        assert_eq!(generator.call_count(), 2);
        assert_eq!(generator.request(1).user_content, cleaned);

        let history = pipeline.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].cleaned_content, cleaned);
        assert_eq!(history[0].answer, answer);
        assert_eq!(history[0].title, "Quiz");
        assert_eq!(session.history_id, Some(history[0].id));
    }

    #[tokio::test]
    async fn test_chunks_forwarded_without_loss() {
        let (pipeline, _generator, _store) = make_pipeline(vec![
            vec![
                StreamEvent::Chunk {
                    delta: "Hel".to_string(),
                },
                StreamEvent::Chunk {
                    delta: "lo".to_string(),
                },
                StreamEvent::Done {
                    text: "Hello".to_string(),
                    usage: TokenUsage::default(),
                },
            ],
            done("Answer: hi\nConfidence: Low\nReason: greeting"),
        ]);

        let mut receiver = pipeline.subscribe();
        pipeline.start_analysis(3, "hello there", None).await.unwrap();

        let mut chunks = Vec::new();
        let mut stream_end_text = None;
        while let Ok(event) = receiver.try_recv() {
            match event {
                PipelineEvent::StreamChunk {
                    request_type: Stage::Clean,
                    text,
                    ..
                } => chunks.push(text),
                PipelineEvent::StreamEnd {
                    request_type: Stage::Clean,
                    text,
                    ..
                } => stream_end_text = Some(text),
                _ => {}
            }
        }
        assert_eq!(chunks, vec!["Hel".to_string(), "lo".to_string()]);
        assert_eq!(chunks.concat(), "Hello");
        assert_eq!(stream_end_text.as_deref(), Some("Hello"));
        assert_eq!(
            pipeline.tab_state(3).unwrap().cleaned_content.as_deref(),
            Some("Hello")
        );
    }

    // ---- Pre-flight rejections ----

    #[tokio::test]
    async fn test_missing_api_key_fails_before_any_call() {
        let generator = MockGenerator::new(vec![]);
        let store = Arc::new(MemoryStore::new());
        let config = PipelineConfig {
            api_key: None,
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::new(config, generator.clone(), store);

        let result = pipeline.start_analysis(1, "some text", None).await;
        assert!(matches!(result, Err(Error::MissingApiKey)));

        let session = pipeline.tab_state(1).unwrap();
        assert_eq!(session.status, Status::Error);
        assert_eq!(session.error.as_deref(), Some("API Key has not been set."));
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_source_fails_before_any_call() {
        let (pipeline, generator, _store) = make_pipeline(vec![]);
        let result = pipeline.start_analysis(1, "   \n", None).await;
        assert!(matches!(result, Err(Error::NoContent)));

        let session = pipeline.tab_state(1).unwrap();
        assert_eq!(session.status, Status::Error);
        assert_eq!(
            session.error.as_deref(),
            Some("No readable content was found on this page.")
        );
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_input_truncated() {
        let generator = MockGenerator::new(vec![done("cleaned"), done("answered")]);
        let config = PipelineConfig {
            max_source_chars: 8,
            ..test_config()
        };
        let pipeline = Pipeline::new(config, generator.clone(), Arc::new(MemoryStore::new()));

        pipeline
            .start_analysis(1, "0123456789abcdef", None)
            .await
            .unwrap();
        assert_eq!(generator.request(0).user_content, "01234567");
        assert_eq!(pipeline.tab_state(1).unwrap().source_text, "01234567");
    }

    // ---- Stage failures ----

    #[tokio::test]
    async fn test_answer_stage_failure_keeps_cleaned_content() {
        let (pipeline, _generator, _store) = make_pipeline(vec![
            done("cleaned text"),
            vec![StreamEvent::Error {
                message: "quota exceeded".to_string(),
            }],
        ]);

        pipeline.start_analysis(4, "raw", None).await.unwrap();

        let session = pipeline.tab_state(4).unwrap();
        assert_eq!(session.status, Status::Error);
        assert_eq!(session.error.as_deref(), Some("quota exceeded"));
        assert_eq!(session.cleaned_content.as_deref(), Some("cleaned text"));
        assert!(session.answer.is_none());
        assert!(pipeline.history().is_empty());
    }

    #[tokio::test]
    async fn test_stage_failure_emits_stream_error() {
        let (pipeline, _generator, _store) = make_pipeline(vec![vec![StreamEvent::Error {
            message: "rate limited".to_string(),
        }]]);

        let mut receiver = pipeline.subscribe();
        pipeline.start_analysis(4, "raw", None).await.unwrap();

        let mut errors = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            if let PipelineEvent::StreamError { message, .. } = event {
                errors.push(message);
            }
        }
        assert_eq!(errors, vec!["rate limited".to_string()]);
    }

    // ---- Explanations ----

    #[tokio::test]
    async fn test_explanation_updates_history_entry() {
        let (pipeline, generator, _store) = make_pipeline(vec![
            done("cleaned"),
            done("Answer: B\nConfidence: Medium\nReason: recall"),
            done("because the second option matches the definition"),
        ]);

        pipeline.start_analysis(2, "raw", None).await.unwrap();
        pipeline.get_explanation(2).await.unwrap();

        let session = pipeline.tab_state(2).unwrap();
        assert_eq!(session.status, Status::Complete);
        assert_eq!(
            session.explanation.as_deref(),
            Some("because the second option matches the definition")
        );
        // The explanation request also consumed the cleaned text.
        assert_eq!(generator.request(2).user_content, "cleaned");

        let history = pipeline.history();
        assert_eq!(history.len(), 1);
        assert_eq!(
            history[0].explanation.as_deref(),
            Some("because the second option matches the definition")
        );
    }

    #[tokio::test]
    async fn test_explanation_failure_keeps_answer() {
        let (pipeline, _generator, _store) = make_pipeline(vec![
            done("cleaned"),
            done("Answer: B\nConfidence: Low\nReason: guess"),
            vec![StreamEvent::Error {
                message: "stream reset".to_string(),
            }],
        ]);

        pipeline.start_analysis(2, "raw", None).await.unwrap();
        pipeline.get_explanation(2).await.unwrap();

        let session = pipeline.tab_state(2).unwrap();
        assert_eq!(session.status, Status::Error);
        assert_eq!(session.error.as_deref(), Some("stream reset"));
        assert_eq!(
            session.answer.as_deref(),
            Some("Answer: B\nConfidence: Low\nReason: guess")
        );
        assert!(session.explanation.is_none());
        assert!(pipeline.history()[0].explanation.is_none());
    }

    #[tokio::test]
    async fn test_explanation_requires_completed_answer() {
        let (pipeline, _generator, _store) = make_pipeline(vec![]);
        assert!(matches!(
            pipeline.get_explanation(9).await,
            Err(Error::NoSession(9))
        ));

        // A failed analysis cannot be explained either.
        let config = PipelineConfig {
            api_key: None,
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::new(
            config,
            MockGenerator::new(vec![]),
            Arc::new(MemoryStore::new()),
        );
        let _ = pipeline.start_analysis(9, "text", None).await;
        assert!(matches!(
            pipeline.get_explanation(9).await,
            Err(Error::NotAnswered(9))
        ));
    }

    // ---- Concurrency and staleness ----

    #[tokio::test]
    async fn test_busy_tab_rejected_not_queued() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let generator = Arc::new(GatedGenerator {
            gate: gate.clone(),
            calls: AtomicU32::new(0),
        });
        let pipeline = Pipeline::new(test_config(), generator, Arc::new(MemoryStore::new()));

        let background = pipeline.clone();
        let task = tokio::spawn(async move { background.start_analysis(5, "raw", None).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(matches!(
            pipeline.start_analysis(5, "again", None).await,
            Err(Error::TabBusy(5))
        ));

        gate.add_permits(2);
        task.await.unwrap().unwrap();
        assert_eq!(pipeline.tab_state(5).unwrap().status, Status::Complete);
    }

    #[tokio::test]
    async fn test_rescan_discards_late_events_from_abandoned_stream() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let generator = Arc::new(GatedGenerator {
            gate: gate.clone(),
            calls: AtomicU32::new(0),
        });
        let pipeline = Pipeline::new(test_config(), generator, Arc::new(MemoryStore::new()));

        let mut receiver = pipeline.subscribe();
        let background = pipeline.clone();
        let task = tokio::spawn(async move { background.start_analysis(6, "raw", None).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // Abandon the run while its clean stage is still in flight.
        pipeline.clear_and_rescan(6).await.unwrap();
        gate.add_permits(4);
        task.await.unwrap().unwrap();

        assert!(pipeline.tab_state(6).is_none());
        assert!(pipeline.history().is_empty());

        let mut late_events = 0;
        while let Ok(event) = receiver.try_recv() {
            match event {
                PipelineEvent::StreamChunk { .. } | PipelineEvent::StreamEnd { .. } => {
                    late_events += 1;
                }
                _ => {}
            }
        }
        assert_eq!(
            late_events, 0,
            "abandoned stream must not surface chunk or end events"
        );
    }

    // ---- Configuration plumbing ----

    #[tokio::test]
    async fn test_prompt_override_and_temperature() {
        let generator = MockGenerator::new(vec![done("cleaned"), done("answered")]);
        let mut config = test_config();
        config.prompts.clean = Some("Transcribe the question verbatim.".to_string());
        config.generation.temperature = 0.9;
        let pipeline = Pipeline::new(config, generator.clone(), Arc::new(MemoryStore::new()));

        pipeline.start_analysis(1, "raw", None).await.unwrap();

        assert_eq!(
            generator.request(0).system_prompt,
            "Transcribe the question verbatim."
        );
        assert_eq!(generator.request(0).config.temperature, 0.9);
        // The answer stage keeps its built-in prompt.
        assert_eq!(
            generator.request(1).system_prompt,
            prompts::builtin(Stage::Answer, Tone::Casual)
        );
    }

    // ---- Persistence and snapshots ----

    #[tokio::test]
    async fn test_state_survives_reload() {
        let store = Arc::new(MemoryStore::new());
        let generator = MockGenerator::new(vec![
            done("cleaned"),
            done("Answer: A\nConfidence: High\nReason: fact"),
        ]);
        let pipeline = Pipeline::new(test_config(), generator, store.clone());
        pipeline.start_analysis(11, "raw", None).await.unwrap();

        // A fresh pipeline over the same store reconstructs everything.
        let reloaded = Pipeline::new(test_config(), MockGenerator::new(vec![]), store);
        reloaded.load_state().await.unwrap();

        let session = reloaded.tab_state(11).unwrap();
        assert_eq!(session.status, Status::Complete);
        assert_eq!(
            session.answer.as_deref(),
            Some("Answer: A\nConfidence: High\nReason: fact")
        );
        assert_eq!(reloaded.history().len(), 1);
    }

    #[tokio::test]
    async fn test_tab_state_snapshots_are_identical() {
        let (pipeline, _generator, _store) =
            make_pipeline(vec![done("cleaned"), done("answered")]);
        pipeline.start_analysis(1, "raw", None).await.unwrap();

        let first = serde_json::to_string(&pipeline.tab_state(1).unwrap()).unwrap();
        let second = serde_json::to_string(&pipeline.tab_state(1).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_close_tab_removes_session() {
        let (pipeline, _generator, store) = make_pipeline(vec![done("cleaned"), done("answered")]);
        pipeline.start_analysis(8, "raw", None).await.unwrap();
        assert!(pipeline.tab_state(8).is_some());

        pipeline.close_tab(8).await.unwrap();
        assert!(pipeline.tab_state(8).is_none());
        assert!(store.load_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_history() {
        let (pipeline, _generator, store) = make_pipeline(vec![
            done("cleaned"),
            done("Answer: A\nConfidence: High\nReason: fact"),
        ]);
        pipeline.start_analysis(1, "raw", None).await.unwrap();
        assert_eq!(pipeline.history().len(), 1);

        pipeline.clear_history().await.unwrap();
        assert!(pipeline.history().is_empty());
        assert!(store.load_history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rescan_allows_fresh_run_with_new_generation() {
        let (pipeline, _generator, _store) = make_pipeline(vec![
            done("cleaned"),
            done("answered"),
            done("cleaned again"),
            done("answered again"),
        ]);

        pipeline.start_analysis(2, "first", None).await.unwrap();
        let first_generation = pipeline.tab_state(2).unwrap().generation;

        pipeline.clear_and_rescan(2).await.unwrap();
        assert!(pipeline.tab_state(2).is_none());

        pipeline.start_analysis(2, "second", None).await.unwrap();
        let session = pipeline.tab_state(2).unwrap();
        assert!(session.generation > first_generation);
        assert_eq!(session.cleaned_content.as_deref(), Some("cleaned again"));
    }
}
