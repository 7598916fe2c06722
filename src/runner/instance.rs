//! Model instance lifecycle: one subprocess bound to one model.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use super::client::{
    ApiUsage, ChatCompletionChunk, ChatCompletionRequest, ChatMessage, OllamaApiClient,
};
use super::error::{RunnerError, RunnerResult};
use super::stream::{SseBuffer, ToolCallAccumulator, SSE_DONE};
use super::supervisor::{OllamaSupervisor, SupervisorConfig, READINESS_TIMEOUT};
use super::{ResponseHandler, WorkSource};
use crate::model;
use crate::protocol::{
    InferenceRequest, ModelInstanceState, TaskResponse, TaskResponseKind, ToolCall, Usage,
};
use crate::session::{SessionFilter, SessionMode, SessionSummary};

/// How long to sleep between work polls when the queue is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Configuration for one model instance.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Model this instance serves.
    pub model: String,
    /// Inference server binary.
    pub binary: String,
    /// Model cache directory.
    pub cache_dir: PathBuf,
    /// Idle time after which the instance reports stale.
    pub ttl: Duration,
    /// Bound on the job-history ring.
    pub job_history_limit: usize,
    /// Models to pre-pull once the server is ready.
    pub warmup_models: Vec<String>,
}

/// Identity of the request currently bound to the instance.
#[derive(Debug, Clone)]
struct RequestRef {
    session_id: String,
    interaction_id: String,
    owner: String,
}

impl RequestRef {
    fn of(request: &InferenceRequest) -> Self {
        Self {
            session_id: request.session_id.clone(),
            interaction_id: request.interaction_id.clone(),
            owner: request.owner.clone(),
        }
    }
}

#[derive(Debug)]
struct CurrentRequest {
    request: RequestRef,
    /// Set once a result frame has been claimed for this request, so
    /// the exit watcher and the inference path cannot both emit one.
    result_claimed: bool,
}

/// State shared between the main loop, the exit watcher, and state
/// snapshots. Only ever locked briefly.
#[derive(Debug)]
struct InstanceShared {
    current: Mutex<Option<CurrentRequest>>,
    last_activity: Mutex<Option<(Instant, DateTime<Utc>)>>,
    initial_session_id: Mutex<Option<String>>,
    job_history: Mutex<VecDeque<SessionSummary>>,
    ttl: Duration,
    job_history_limit: usize,
}

impl InstanceShared {
    fn new(ttl: Duration, job_history_limit: usize) -> Self {
        Self {
            current: Mutex::new(None),
            last_activity: Mutex::new(None),
            initial_session_id: Mutex::new(None),
            job_history: Mutex::new(VecDeque::new()),
            ttl,
            job_history_limit,
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Some((Instant::now(), Utc::now()));
    }

    fn begin(&self, request: &InferenceRequest) {
        self.touch();

        let mut initial = self.initial_session_id.lock().unwrap();
        if initial.is_none() {
            *initial = Some(request.session_id.clone());
        }
        drop(initial);

        *self.current.lock().unwrap() = Some(CurrentRequest {
            request: RequestRef::of(request),
            result_claimed: false,
        });

        let summary = SessionSummary {
            session_id: request.session_id.clone(),
            owner: request.owner.clone(),
            mode: SessionMode::Create,
            model: request.model.clone(),
            created_at: Utc::now(),
        };
        let mut history = self.job_history.lock().unwrap();
        history.push_front(summary);
        history.truncate(self.job_history_limit);
    }

    fn finish(&self) {
        self.touch();
        *self.current.lock().unwrap() = None;
    }

    /// Claim the right to emit the result frame for the bound request.
    /// Returns `None` when there is no request or its result has
    /// already been claimed.
    fn claim_result(&self) -> Option<RequestRef> {
        let mut current = self.current.lock().unwrap();
        match current.as_mut() {
            Some(c) if !c.result_claimed => {
                c.result_claimed = true;
                Some(c.request.clone())
            }
            _ => None,
        }
    }

    fn stale(&self) -> bool {
        self.last_activity
            .lock()
            .unwrap()
            .map(|(instant, _)| instant.elapsed() > self.ttl)
            .unwrap_or(false)
    }
}

/// One bound pair (subprocess, model name) on a runner.
pub struct ModelInstance {
    id: String,
    config: InstanceConfig,
    shared: Arc<InstanceShared>,
    supervisor: Arc<OllamaSupervisor>,
    cancel: CancellationToken,
    finished: tokio::sync::watch::Receiver<bool>,
}

impl ModelInstance {
    /// Boot a subprocess for the model and start the work loop.
    ///
    /// Fails without emitting any frame when the subprocess cannot be
    /// started or never becomes ready.
    pub async fn start(
        config: InstanceConfig,
        work_source: Arc<dyn WorkSource>,
        responses: Arc<dyn ResponseHandler>,
        parent_cancel: &CancellationToken,
    ) -> RunnerResult<Self> {
        let cancel = parent_cancel.child_token();
        let mut supervisor = OllamaSupervisor::new(SupervisorConfig {
            binary: config.binary.clone(),
            cache_dir: config.cache_dir.clone(),
        })?;

        supervisor.spawn()?;

        let http = reqwest::Client::new();
        if let Err(err) = supervisor
            .wait_ready(&http, READINESS_TIMEOUT, &cancel)
            .await
        {
            // Best-effort teardown of the half-started subprocess.
            let _ = supervisor.stop();
            return Err(err);
        }

        let api = OllamaApiClient::new(supervisor.base_url());
        let shared = Arc::new(InstanceShared::new(config.ttl, config.job_history_limit));
        let (finish_tx, finished) = tokio::sync::watch::channel(false);

        // Exit watcher: surfaces an unexpected subprocess death to the
        // bound request, then closes the finish channel.
        let child = supervisor.take_child();
        let supervisor = Arc::new(supervisor);
        if let Some(mut child) = child {
            let shared = Arc::clone(&shared);
            let responses = Arc::clone(&responses);
            let supervisor = Arc::clone(&supervisor);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let status = child.wait().await;
                if cancel.is_cancelled() {
                    info!("inference server stopped");
                } else {
                    let tail = supervisor.stderr_tail();
                    error!("inference server exited unexpectedly: {:?}", status);
                    if let Some(request) = shared.claim_result() {
                        let cause = match status {
                            Ok(status) => format!("inference server exited ({}) - {}", status, tail),
                            Err(err) => format!("inference server lost ({}) - {}", err, tail),
                        };
                        emit_error(&*responses, &request, &cause).await;
                    }
                }
                let _ = finish_tx.send(true);
            });
        }

        // Pre-pull warm-up models in parallel; failures are logged, not
        // fatal.
        for model_name in config.warmup_models.clone() {
            let api = api.clone();
            tokio::spawn(async move {
                info!("pulling warm-up model {}", model_name);
                let result = api
                    .pull(&model_name, |progress| {
                        debug!(
                            "pulling {} ({}/{})",
                            model_name,
                            progress.completed.unwrap_or(0),
                            progress.total.unwrap_or(0)
                        );
                    })
                    .await;
                match result {
                    Ok(()) => info!("warm-up model {} pulled", model_name),
                    Err(err) => error!("error pulling warm-up model {}: {}", model_name, err),
                }
            });
        }

        let instance = Self {
            id: uuid::Uuid::new_v4().to_string(),
            config: config.clone(),
            shared: Arc::clone(&shared),
            supervisor,
            cancel: cancel.clone(),
            finished,
        };

        let filter = SessionFilter::for_model(config.model.clone());
        tokio::spawn(run_loop(
            shared,
            api,
            filter,
            work_source,
            responses,
            cancel,
        ));

        Ok(instance)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Whether the instance has been idle longer than its TTL. An
    /// external reaper stops stale instances; the instance never
    /// self-terminates.
    pub fn stale(&self) -> bool {
        self.shared.stale()
    }

    /// Observability snapshot.
    pub fn state(&self) -> ModelInstanceState {
        let current = self.shared.current.lock().unwrap();
        let last_activity = *self.shared.last_activity.lock().unwrap();
        let history = self.shared.job_history.lock().unwrap();

        let stale = last_activity
            .map(|(instant, _)| instant.elapsed() > self.config.ttl)
            .unwrap_or(false);

        ModelInstanceState {
            id: self.id.clone(),
            model: self.config.model.clone(),
            mode: SessionMode::Create,
            initial_session_id: self.shared.initial_session_id.lock().unwrap().clone(),
            current_session_id: current.as_ref().map(|c| c.request.session_id.clone()),
            job_history: history.iter().cloned().collect(),
            ttl_secs: self.config.ttl.as_secs(),
            last_activity: last_activity.map(|(_, at)| at),
            stale,
            memory_bytes: model::memory_requirement(&self.config.model),
        }
    }

    /// Tree-kill the subprocess and cancel the work loop.
    pub fn stop(&self) -> RunnerResult<()> {
        self.supervisor.stop()?;
        self.cancel.cancel();
        Ok(())
    }

    /// True once `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the subprocess has exited and the finish channel
    /// closed.
    pub async fn wait_finished(&self) {
        let mut finished = self.finished.clone();
        while !*finished.borrow() {
            if finished.changed().await.is_err() {
                break;
            }
        }
    }
}

/// The instance main loop: drain the single-slot work channel, refill
/// it from the control plane, sleep briefly when there is nothing to
/// do.
async fn run_loop(
    shared: Arc<InstanceShared>,
    api: OllamaApiClient,
    filter: SessionFilter,
    work_source: Arc<dyn WorkSource>,
    responses: Arc<dyn ResponseHandler>,
    cancel: CancellationToken,
) {
    let (work_tx, mut work_rx) = mpsc::channel::<InferenceRequest>(1);

    loop {
        if cancel.is_cancelled() {
            info!("instance cancelled, exiting work loop");
            return;
        }

        match work_rx.try_recv() {
            Ok(request) => {
                info!("processing session {}", request.session_id);
                shared.begin(&request);

                match process_request(&shared, &api, &responses, &request, &cancel).await {
                    Ok(()) => {
                        debug!(
                            "session {} processed (stream={})",
                            request.session_id, request.stream
                        );
                    }
                    Err(err) => {
                        error!("error processing session {}: {}", request.session_id, err);
                        if let Some(request_ref) = shared.claim_result() {
                            emit_error(&*responses, &request_ref, &err.to_string()).await;
                        }
                        if err.is_connection_refused() {
                            // The subprocess is effectively dead; exit
                            // the host process and let the outer
                            // supervisor restart it cleanly.
                            error!("connection refused from local inference server, exiting");
                            std::process::exit(1);
                        }
                    }
                }

                shared.finish();
            }
            Err(TryRecvError::Empty) => {
                match work_source.next_request(&filter).await {
                    Ok(Some(request)) => {
                        debug!("enqueuing session {}", request.session_id);
                        if work_tx.send(request).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        }
                    }
                    Err(err) => {
                        warn!("error getting next request: {:?}", err);
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        }
                    }
                }
            }
            Err(TryRecvError::Disconnected) => return,
        }
    }
}

/// Drive one request against the subprocess, emitting protocol frames.
///
/// On success exactly one stream-done frame and one result frame have
/// been emitted; on error nothing terminal has been emitted and the
/// caller owns the single error result frame.
async fn process_request(
    shared: &InstanceShared,
    api: &OllamaApiClient,
    responses: &Arc<dyn ResponseHandler>,
    request: &InferenceRequest,
    cancel: &CancellationToken,
) -> RunnerResult<()> {
    let chat_request = ChatCompletionRequest {
        model: request.model.clone(),
        messages: vec![ChatMessage::user(&request.prompt)],
        stream: request.stream,
    };
    let request_ref = RequestRef::of(request);
    let start = Instant::now();

    if request.stream {
        let response = api.chat_stream(&chat_request).await?;
        let mut body = response.bytes_stream();
        let mut sse = SseBuffer::new();
        let mut content = String::new();
        let mut tool_calls = ToolCallAccumulator::new();
        let mut usage: Option<ApiUsage> = None;

        'recv: loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RunnerError::ServerExited("instance cancelled".into()));
                }
                chunk = body.next() => chunk,
            };

            let bytes = match chunk {
                // Transport closed without the done sentinel; treat it
                // like end of stream.
                None => break 'recv,
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(bytes)) => bytes,
            };

            sse.extend(&bytes);
            while let Some(data) = sse.next_data() {
                if data == SSE_DONE {
                    break 'recv;
                }

                let chunk: ChatCompletionChunk = match serde_json::from_str(&data) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        debug!("skipping unparseable stream chunk: {}", err);
                        continue;
                    }
                };

                if let Some(chunk_usage) = chunk.usage {
                    usage = Some(chunk_usage);
                }

                let mut delta_content = String::new();
                for choice in &chunk.choices {
                    if let Some(piece) = &choice.delta.content {
                        delta_content.push_str(piece);
                    }
                    if let Some(deltas) = &choice.delta.tool_calls {
                        for delta in deltas {
                            tool_calls.absorb(delta);
                        }
                    }
                }
                content.push_str(&delta_content);

                emit_stream_delta(&**responses, &request_ref, &delta_content).await;
            }
        }

        let aggregated = if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls.into_calls())
        };

        // Claiming first keeps a racing exit-watcher error from landing
        // between our stream-done and result frames.
        if shared.claim_result().is_some() {
            emit_stream_done(&**responses, &request_ref).await;
            let usage = finished_usage(usage, start);
            emit_result(&**responses, &request_ref, content, aggregated, None, usage).await;
        }
        Ok(())
    } else {
        let response = api.chat(&chat_request).await?;

        let mut content = String::new();
        let mut tool_calls = ToolCallAccumulator::new();
        let mut tool_call_id = None;
        if let Some(choice) = response.choices.first() {
            if let Some(message_content) = &choice.message.content {
                content.push_str(message_content);
            }
            if let Some(deltas) = &choice.message.tool_calls {
                for delta in deltas {
                    tool_calls.absorb(delta);
                }
            }
            tool_call_id = choice.message.tool_call_id.clone();
        }

        let aggregated = if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls.into_calls())
        };

        if shared.claim_result().is_some() {
            emit_stream_done(&**responses, &request_ref).await;
            let usage = finished_usage(response.usage, start);
            emit_result(
                &**responses,
                &request_ref,
                content,
                aggregated,
                tool_call_id,
                usage,
            )
            .await;
        }
        Ok(())
    }
}

fn finished_usage(api_usage: Option<ApiUsage>, start: Instant) -> Usage {
    let api_usage = api_usage.unwrap_or_default();
    Usage {
        prompt_tokens: api_usage.prompt_tokens,
        completion_tokens: api_usage.completion_tokens,
        total_tokens: api_usage.total_tokens,
        duration_ms: start.elapsed().as_millis() as i64,
    }
}

async fn emit(responses: &dyn ResponseHandler, response: TaskResponse) {
    if let Err(err) = responses.handle(response).await {
        error!("error writing response frame: {:?}", err);
    }
}

async fn emit_stream_delta(responses: &dyn ResponseHandler, request: &RequestRef, delta: &str) {
    emit(
        responses,
        TaskResponse {
            session_id: request.session_id.clone(),
            interaction_id: request.interaction_id.clone(),
            owner: request.owner.clone(),
            kind: TaskResponseKind::Stream,
            message: delta.to_string(),
            done: false,
            tool_calls: None,
            tool_call_id: None,
            usage: None,
            error: None,
        },
    )
    .await;
}

/// The empty stream-done frame that always precedes the result frame,
/// streaming or not, so consumers have a uniform reduce signal.
async fn emit_stream_done(responses: &dyn ResponseHandler, request: &RequestRef) {
    emit(
        responses,
        TaskResponse {
            session_id: request.session_id.clone(),
            interaction_id: request.interaction_id.clone(),
            owner: request.owner.clone(),
            kind: TaskResponseKind::Stream,
            message: String::new(),
            done: true,
            tool_calls: None,
            tool_call_id: None,
            usage: None,
            error: None,
        },
    )
    .await;
}

async fn emit_result(
    responses: &dyn ResponseHandler,
    request: &RequestRef,
    message: String,
    tool_calls: Option<Vec<ToolCall>>,
    tool_call_id: Option<String>,
    usage: Usage,
) {
    emit(
        responses,
        TaskResponse {
            session_id: request.session_id.clone(),
            interaction_id: request.interaction_id.clone(),
            owner: request.owner.clone(),
            kind: TaskResponseKind::Result,
            message,
            done: true,
            tool_calls,
            tool_call_id,
            usage: Some(usage),
            error: None,
        },
    )
    .await;
}

async fn emit_error(responses: &dyn ResponseHandler, request: &RequestRef, cause: &str) {
    emit(
        responses,
        TaskResponse {
            session_id: request.session_id.clone(),
            interaction_id: request.interaction_id.clone(),
            owner: request.owner.clone(),
            kind: TaskResponseKind::Result,
            message: String::new(),
            done: true,
            tool_calls: None,
            tool_call_id: None,
            usage: None,
            error: Some(cause.to_string()),
        },
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_false_before_first_activity() {
        let shared = InstanceShared::new(Duration::from_secs(5), 8);
        assert!(!shared.stale());
    }

    #[test]
    fn test_stale_threshold() {
        let shared = InstanceShared::new(Duration::from_secs(5), 8);
        *shared.last_activity.lock().unwrap() = Some((
            Instant::now() - Duration::from_secs(6),
            Utc::now() - chrono::Duration::seconds(6),
        ));
        assert!(shared.stale());

        *shared.last_activity.lock().unwrap() = Some((
            Instant::now() - Duration::from_secs(4),
            Utc::now() - chrono::Duration::seconds(4),
        ));
        assert!(!shared.stale());
    }

    fn request(session: &str) -> InferenceRequest {
        InferenceRequest {
            session_id: session.to_string(),
            interaction_id: format!("{}-i", session),
            owner: "alice".to_string(),
            model: "llama3:instruct".to_string(),
            prompt: "User: hi\nAssistant:".to_string(),
            stream: true,
        }
    }

    #[test]
    fn test_job_history_bounded_newest_first() {
        let shared = InstanceShared::new(Duration::from_secs(5), 2);
        shared.begin(&request("s1"));
        shared.finish();
        shared.begin(&request("s2"));
        shared.finish();
        shared.begin(&request("s3"));
        shared.finish();

        let history = shared.job_history.lock().unwrap();
        let ids: Vec<_> = history.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["s3", "s2"]);
    }

    #[test]
    fn test_claim_result_single_winner() {
        let shared = InstanceShared::new(Duration::from_secs(5), 8);
        shared.begin(&request("s1"));

        assert!(shared.claim_result().is_some());
        assert!(shared.claim_result().is_none());

        shared.finish();
        assert!(shared.claim_result().is_none());
    }

    #[test]
    fn test_initial_session_sticks() {
        let shared = InstanceShared::new(Duration::from_secs(5), 8);
        shared.begin(&request("s1"));
        shared.finish();
        shared.begin(&request("s2"));
        shared.finish();

        assert_eq!(
            shared.initial_session_id.lock().unwrap().as_deref(),
            Some("s1")
        );
    }

    // ------------------------------------------------------------------
    // Protocol framing against a mock inference server
    // ------------------------------------------------------------------

    use crate::runner::{ResponseHandler, WorkSource};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use std::collections::VecDeque as TestQueue;

    #[derive(Default)]
    struct CollectingHandler {
        frames: Mutex<Vec<TaskResponse>>,
    }

    impl CollectingHandler {
        fn frames(&self) -> Vec<TaskResponse> {
            self.frames.lock().unwrap().clone()
        }

        async fn wait_for_frames(&self, count: usize) -> Vec<TaskResponse> {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let frames = self.frames();
                    if frames.len() >= count {
                        return frames;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("timed out waiting for response frames")
        }
    }

    #[async_trait::async_trait]
    impl ResponseHandler for CollectingHandler {
        async fn handle(&self, response: TaskResponse) -> anyhow::Result<()> {
            self.frames.lock().unwrap().push(response);
            Ok(())
        }
    }

    struct ScriptedSource {
        requests: Mutex<TestQueue<InferenceRequest>>,
    }

    impl ScriptedSource {
        fn one(request: InferenceRequest) -> Self {
            let mut requests = TestQueue::new();
            requests.push_back(request);
            Self {
                requests: Mutex::new(requests),
            }
        }
    }

    #[async_trait::async_trait]
    impl WorkSource for ScriptedSource {
        async fn next_request(
            &self,
            _filter: &SessionFilter,
        ) -> anyhow::Result<Option<InferenceRequest>> {
            Ok(self.requests.lock().unwrap().pop_front())
        }
    }

    async fn serve_chat(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn run_scripted(base_url: String, request: InferenceRequest) -> Arc<CollectingHandler> {
        let shared = Arc::new(InstanceShared::new(Duration::from_secs(60), 8));
        let api = OllamaApiClient::new(base_url);
        let handler = Arc::new(CollectingHandler::default());
        let source = Arc::new(ScriptedSource::one(request));
        let cancel = CancellationToken::new();

        tokio::spawn(run_loop(
            shared,
            api,
            SessionFilter::default(),
            source,
            handler.clone() as Arc<dyn ResponseHandler>,
            cancel.clone(),
        ));

        handler
    }

    #[tokio::test]
    async fn test_streaming_happy_path_frame_order() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"he\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}],",
            "\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":2,\"total_tokens\":4}}\n\n",
            "data: [DONE]\n\n",
        );
        let router = axum::Router::new().route(
            "/v1/chat/completions",
            post(move || async move {
                (
                    [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
                    body,
                )
                    .into_response()
            }),
        );

        let base_url = serve_chat(router).await;
        let handler = run_scripted(base_url, request("s1")).await;
        let frames = handler.wait_for_frames(4).await;

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].kind, TaskResponseKind::Stream);
        assert_eq!(frames[0].message, "he");
        assert!(!frames[0].done);
        assert_eq!(frames[1].message, "llo");
        // The empty stream-done marker precedes the result.
        assert_eq!(frames[2].kind, TaskResponseKind::Stream);
        assert_eq!(frames[2].message, "");
        assert!(frames[2].done);
        // Exactly one result frame, last, with usage set.
        assert_eq!(frames[3].kind, TaskResponseKind::Result);
        assert!(frames[3].done);
        assert_eq!(frames[3].message, "hello");
        assert_eq!(frames[3].usage.as_ref().unwrap().total_tokens, 4);
        assert!(frames[3].error.is_none());
        assert_eq!(frames.iter().filter(|f| f.is_result()).count(), 1);
    }

    #[tokio::test]
    async fn test_stream_transport_error_yields_single_error_result() {
        let router = axum::Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                let chunks: Vec<Result<axum::body::Bytes, std::io::Error>> = vec![
                    Ok(axum::body::Bytes::from(
                        "data: {\"choices\":[{\"delta\":{\"content\":\"he\"}}]}\n\n",
                    )),
                    Err(std::io::Error::other("server crashed")),
                ];
                axum::response::Response::builder()
                    .header("content-type", "text/event-stream")
                    .body(axum::body::Body::from_stream(futures::stream::iter(chunks)))
                    .unwrap()
            }),
        );

        let base_url = serve_chat(router).await;
        let handler = run_scripted(base_url, request("s1")).await;
        let frames = handler.wait_for_frames(2).await;

        assert_eq!(frames[0].kind, TaskResponseKind::Stream);
        assert_eq!(frames[0].message, "he");

        let results: Vec<_> = frames.iter().filter(|f| f.is_result()).collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].done);
        assert!(results[0].error.as_ref().is_some_and(|e| !e.is_empty()));

        // No frame follows the error result.
        assert!(frames.last().unwrap().is_result());
    }

    #[tokio::test]
    async fn test_streamed_tool_calls_are_aggregated() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"t1\",",
            "\"type\":\"function\",\"function\":{\"name\":\"f\",\"arguments\":\"\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"t1\",",
            "\"function\":{\"arguments\":\"{\\\"x\\\":\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"t1\",",
            "\"function\":{\"arguments\":\"1}\"}}]}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let router = axum::Router::new().route(
            "/v1/chat/completions",
            post(move || async move {
                (
                    [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
                    body,
                )
                    .into_response()
            }),
        );

        let base_url = serve_chat(router).await;
        let handler = run_scripted(base_url, request("s1")).await;
        let frames = handler.wait_for_frames(5).await;

        let result = frames.iter().find(|f| f.is_result()).unwrap();
        let calls = result.tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "t1");
        assert_eq!(calls[0].function.name, "f");
        assert_eq!(calls[0].function.arguments, "{\"x\":1}");
    }

    #[tokio::test]
    async fn test_non_streaming_emits_stream_done_then_result() {
        use crate::runner::client::{ApiUsage, AssistantMessage, ChatChoice, ChatCompletionResponse};

        let router = axum::Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                axum::Json(ChatCompletionResponse {
                    choices: vec![ChatChoice {
                        message: AssistantMessage {
                            content: Some("hello".to_string()),
                            tool_calls: None,
                            tool_call_id: None,
                        },
                        finish_reason: Some("stop".to_string()),
                    }],
                    usage: Some(ApiUsage {
                        prompt_tokens: 2,
                        completion_tokens: 3,
                        total_tokens: 5,
                    }),
                })
            }),
        );

        let base_url = serve_chat(router).await;
        let mut req = request("s1");
        req.stream = false;
        let handler = run_scripted(base_url, req).await;
        let frames = handler.wait_for_frames(2).await;

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind, TaskResponseKind::Stream);
        assert!(frames[0].done);
        assert_eq!(frames[0].message, "");

        assert_eq!(frames[1].kind, TaskResponseKind::Result);
        assert_eq!(frames[1].message, "hello");
        let usage = frames[1].usage.as_ref().unwrap();
        assert_eq!(usage.total_tokens, 5);
        assert!(usage.duration_ms >= 0);
    }
}
