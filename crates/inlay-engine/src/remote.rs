use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use inlay_contracts::config::ApiModelConfig;
use inlay_contracts::error::GenerateError;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};

/// Poll budget: at most 60 GETs at 2 s spacing, a bounded ~2 minute wall.
pub const MAX_POLL_ATTEMPTS: u32 = 60;
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(120);
pub const POLL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Cooperative cancellation flag, observed at every suspension point of the
/// polling loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// HTTP-level failure carried into `GenerateError::RemoteTransport`.
#[derive(Debug, Clone)]
pub struct TransportFailure {
    pub status: Option<u16>,
    pub detail: String,
}

impl TransportFailure {
    fn into_error(self) -> GenerateError {
        GenerateError::RemoteTransport {
            status: self.status,
            detail: self.detail,
        }
    }
}

/// Capability set the runner needs from the wire: POST JSON, GET JSON, GET
/// bytes, and an interruptible wait. Tests inject fakes; production wraps
/// blocking reqwest.
pub trait RemoteTransport {
    fn post_json(
        &self,
        url: &str,
        api_key: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, TransportFailure>;

    fn get_json(&self, url: &str, api_key: &str, timeout: Duration)
        -> Result<Value, TransportFailure>;

    fn get_bytes(
        &self,
        url: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportFailure>;

    /// Sleep for `duration`, returning `false` early when the token is
    /// cancelled.
    fn wait(&self, duration: Duration, cancel: &CancelToken) -> bool;
}

impl RemoteTransport for Box<dyn RemoteTransport> {
    fn post_json(
        &self,
        url: &str,
        api_key: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, TransportFailure> {
        (**self).post_json(url, api_key, body, timeout)
    }

    fn get_json(
        &self,
        url: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Value, TransportFailure> {
        (**self).get_json(url, api_key, timeout)
    }

    fn get_bytes(
        &self,
        url: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportFailure> {
        (**self).get_bytes(url, api_key, timeout)
    }

    fn wait(&self, duration: Duration, cancel: &CancelToken) -> bool {
        (**self).wait(duration, cancel)
    }
}

/// Production transport over blocking reqwest with the `x-key` header style.
pub struct HttpTransport {
    http: HttpClient,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            http: HttpClient::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteTransport for HttpTransport {
    fn post_json(
        &self,
        url: &str,
        api_key: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, TransportFailure> {
        let response = self
            .http
            .post(url)
            .header("accept", "application/json")
            .header("x-key", api_key)
            .json(body)
            .timeout(timeout)
            .send()
            .map_err(|err| send_failure(&err))?;
        json_or_failure(response)
    }

    fn get_json(
        &self,
        url: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Value, TransportFailure> {
        let response = self
            .http
            .get(url)
            .header("accept", "application/json")
            .header("x-key", api_key)
            .timeout(timeout)
            .send()
            .map_err(|err| send_failure(&err))?;
        json_or_failure(response)
    }

    fn get_bytes(
        &self,
        url: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportFailure> {
        let response = self
            .http
            .get(url)
            .header("x-key", api_key)
            .timeout(timeout)
            .send()
            .map_err(|err| send_failure(&err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(TransportFailure {
                status: Some(status.as_u16()),
                detail: format!("download failed: {}", truncate_text(&body, 512)),
            });
        }
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| TransportFailure {
                status: None,
                detail: format!("body read failed: {err}"),
            })
    }

    fn wait(&self, duration: Duration, cancel: &CancelToken) -> bool {
        // sleep in slices so a cancel lands within ~50 ms
        let slice = Duration::from_millis(50);
        let mut remaining = duration;
        while remaining > Duration::ZERO {
            if cancel.is_cancelled() {
                return false;
            }
            let step = remaining.min(slice);
            thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        !cancel.is_cancelled()
    }
}

fn send_failure(err: &reqwest::Error) -> TransportFailure {
    TransportFailure {
        status: err.status().map(|status| status.as_u16()),
        detail: format!("request failed: {err}"),
    }
}

fn json_or_failure(response: reqwest::blocking::Response) -> Result<Value, TransportFailure> {
    let status = response.status();
    let body = response.text().map_err(|err| TransportFailure {
        status: Some(status.as_u16()),
        detail: format!("body read failed: {err}"),
    })?;
    if !status.is_success() {
        return Err(TransportFailure {
            status: Some(status.as_u16()),
            detail: truncate_text(&body, 512),
        });
    }
    serde_json::from_str(&body).map_err(|_| TransportFailure {
        status: Some(status.as_u16()),
        detail: format!("invalid JSON payload: {}", truncate_text(&body, 256)),
    })
}

fn truncate_text(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &text[..cut])
}

/// One generation job for the remote service.
#[derive(Debug, Clone)]
pub struct RemoteJobRequest {
    pub prompt: String,
    /// PNG bytes of the composed (or passthrough) input; absent for pure
    /// text-to-image.
    pub input_image_png: Option<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance: f64,
    pub seed: Option<i64>,
    pub depth_map_png: Option<Vec<u8>>,
    pub depth_strength: Option<f64>,
}

/// Submit → poll → download. One submit, at most [`MAX_POLL_ATTEMPTS`]
/// polls, no retries at this layer.
pub struct RemoteJobRunner<T: RemoteTransport> {
    transport: T,
}

impl<T: RemoteTransport> RemoteJobRunner<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn run(
        &self,
        api: &ApiModelConfig,
        api_key: &str,
        request: &RemoteJobRequest,
        cancel: &CancelToken,
        progress: Option<&dyn Fn(f64, &str)>,
    ) -> Result<Vec<u8>, GenerateError> {
        let payload = build_payload(api, request);
        report(progress, 0.02, "submitting");
        let submitted = self
            .transport
            .post_json(&api.submit_url(), api_key, &payload, SUBMIT_TIMEOUT)
            .map_err(TransportFailure::into_error)?;

        let polling_url = submitted
            .get("polling_url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                GenerateError::RemoteProtocol("submit response missing polling_url".to_string())
            })?;
        report(progress, 0.05, "submitted");

        for attempt in 1..=MAX_POLL_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(GenerateError::Cancelled);
            }
            let poll = self
                .transport
                .get_json(&polling_url, api_key, POLL_TIMEOUT)
                .map_err(TransportFailure::into_error)?;
            let status = poll
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_ascii_lowercase)
                .unwrap_or_default();

            if status == "ready" {
                let sample_url = extract_sample_url(&poll).ok_or_else(|| {
                    GenerateError::RemoteProtocol("ready response missing result sample".to_string())
                })?;
                report(progress, 0.9, "downloading");
                let bytes = self
                    .transport
                    .get_bytes(&sample_url, api_key, DOWNLOAD_TIMEOUT)
                    .map_err(TransportFailure::into_error)?;
                report(progress, 1.0, "done");
                return Ok(bytes);
            }
            if status == "failed" || status == "error" {
                let reason = poll
                    .get("error")
                    .or_else(|| poll.get("details"))
                    .and_then(Value::as_str)
                    .unwrap_or("service reported failure")
                    .to_string();
                return Err(GenerateError::RemoteJobFailed(reason));
            }

            report(
                progress,
                0.05 + 0.8 * attempt as f64 / MAX_POLL_ATTEMPTS as f64,
                "waiting for result",
            );
            if !self.transport.wait(POLL_INTERVAL, cancel) {
                return Err(GenerateError::Cancelled);
            }
        }

        Err(GenerateError::RemoteJobTimedOut {
            attempts: MAX_POLL_ATTEMPTS,
        })
    }
}

fn build_payload(api: &ApiModelConfig, request: &RemoteJobRequest) -> Value {
    let mut payload = Map::new();
    payload.insert("model".to_string(), json!(api.model_name));
    payload.insert("prompt".to_string(), json!(request.prompt));
    payload.insert("width".to_string(), json!(request.width));
    payload.insert("height".to_string(), json!(request.height));
    payload.insert("steps".to_string(), json!(request.steps));
    payload.insert("guidance".to_string(), json!(request.guidance));
    payload.insert("num_images_per_prompt".to_string(), json!(1));
    if let Some(bytes) = request.input_image_png.as_ref() {
        payload.insert("input_image".to_string(), json!(BASE64.encode(bytes)));
    }
    if let Some(seed) = request.seed {
        payload.insert("seed".to_string(), json!(seed));
    }
    if let Some(depth) = request.depth_map_png.as_ref() {
        payload.insert("depth_map".to_string(), json!(BASE64.encode(depth)));
        payload.insert(
            "depth_strength".to_string(),
            json!(request.depth_strength.unwrap_or(0.5)),
        );
    }
    Value::Object(payload)
}

/// `result.sample` is a single URL in the current protocol; older deployments
/// returned a list, in which case the first entry wins.
fn extract_sample_url(poll: &Value) -> Option<String> {
    let sample = poll.get("result")?.get("sample")?;
    let url = match sample {
        Value::String(url) => url.as_str(),
        Value::Array(items) => items.first()?.as_str()?,
        _ => return None,
    };
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

/// Progress is a pure side channel; a panicking callback must never abort
/// the job.
fn report(progress: Option<&dyn Fn(f64, &str)>, fraction: f64, stage: &str) {
    if let Some(callback) = progress {
        let _ = catch_unwind(AssertUnwindSafe(|| callback(fraction, stage)));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct FakeState {
        submits: AtomicU32,
        polls: AtomicU32,
        downloads: AtomicU32,
        waits: AtomicU32,
        simulated_wait: Mutex<Duration>,
        last_submit_body: Mutex<Option<Value>>,
    }

    /// Scripted transport: a submit response, a sequence of poll responses
    /// (last one repeats), and download bytes.
    struct FakeTransport {
        state: Arc<FakeState>,
        submit_response: Value,
        poll_responses: Vec<Value>,
        download_bytes: Vec<u8>,
        cancel_on_wait: Option<u32>,
    }

    impl FakeTransport {
        fn new(state: Arc<FakeState>, poll_responses: Vec<Value>) -> Self {
            Self {
                state,
                submit_response: json!({"id": "job-1", "polling_url": "https://poll.example/job-1"}),
                poll_responses,
                download_bytes: b"png-bytes".to_vec(),
                cancel_on_wait: None,
            }
        }
    }

    impl RemoteTransport for FakeTransport {
        fn post_json(
            &self,
            _url: &str,
            _api_key: &str,
            body: &Value,
            _timeout: Duration,
        ) -> Result<Value, TransportFailure> {
            self.state.submits.fetch_add(1, Ordering::SeqCst);
            *self.state.last_submit_body.lock().unwrap() = Some(body.clone());
            Ok(self.submit_response.clone())
        }

        fn get_json(
            &self,
            _url: &str,
            _api_key: &str,
            _timeout: Duration,
        ) -> Result<Value, TransportFailure> {
            let index = self.state.polls.fetch_add(1, Ordering::SeqCst) as usize;
            let response = self
                .poll_responses
                .get(index)
                .or_else(|| self.poll_responses.last())
                .cloned()
                .unwrap_or_else(|| json!({"status": "Pending"}));
            Ok(response)
        }

        fn get_bytes(
            &self,
            _url: &str,
            _api_key: &str,
            _timeout: Duration,
        ) -> Result<Vec<u8>, TransportFailure> {
            self.state.downloads.fetch_add(1, Ordering::SeqCst);
            Ok(self.download_bytes.clone())
        }

        fn wait(&self, duration: Duration, cancel: &CancelToken) -> bool {
            let waits = self.state.waits.fetch_add(1, Ordering::SeqCst) + 1;
            *self.state.simulated_wait.lock().unwrap() += duration;
            if let Some(limit) = self.cancel_on_wait {
                if waits >= limit {
                    cancel.cancel();
                    return false;
                }
            }
            !cancel.is_cancelled()
        }
    }

    fn api() -> ApiModelConfig {
        ApiModelConfig {
            api_base: "https://api.example/v1".to_string(),
            endpoint: "flux-kontext-pro".to_string(),
            model_name: "flux-kontext-pro".to_string(),
        }
    }

    fn request() -> RemoteJobRequest {
        RemoteJobRequest {
            prompt: "a red apple on a white table".to_string(),
            input_image_png: None,
            width: 1024,
            height: 1024,
            steps: 20,
            guidance: 4.0,
            seed: None,
            depth_map_png: None,
            depth_strength: None,
        }
    }

    fn ready_poll() -> Value {
        json!({"status": "Ready", "result": {"sample": "https://cdn.example/out.png"}})
    }

    #[test]
    fn happy_path_is_one_submit_one_poll_one_download() {
        let state = Arc::new(FakeState::default());
        let runner = RemoteJobRunner::new(FakeTransport::new(state.clone(), vec![ready_poll()]));
        let bytes = runner
            .run(&api(), "K", &request(), &CancelToken::new(), None)
            .unwrap();
        assert_eq!(bytes, b"png-bytes");
        assert_eq!(state.submits.load(Ordering::SeqCst), 1);
        assert_eq!(state.polls.load(Ordering::SeqCst), 1);
        assert_eq!(state.downloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn submit_payload_carries_request_fields() {
        let state = Arc::new(FakeState::default());
        let runner = RemoteJobRunner::new(FakeTransport::new(state.clone(), vec![ready_poll()]));
        let mut req = request();
        req.input_image_png = Some(vec![1, 2, 3]);
        req.seed = Some(7);
        runner
            .run(&api(), "K", &req, &CancelToken::new(), None)
            .unwrap();

        let body = state.last_submit_body.lock().unwrap().clone().unwrap();
        assert_eq!(body["model"], json!("flux-kontext-pro"));
        assert_eq!(body["prompt"], json!("a red apple on a white table"));
        assert_eq!(body["width"], json!(1024));
        assert_eq!(body["height"], json!(1024));
        assert_eq!(body["num_images_per_prompt"], json!(1));
        assert_eq!(body["seed"], json!(7));
        assert_eq!(body["input_image"], json!(BASE64.encode([1u8, 2, 3])));
        assert!(body.get("depth_map").is_none());
    }

    #[test]
    fn pure_text_request_omits_input_image() {
        let state = Arc::new(FakeState::default());
        let runner = RemoteJobRunner::new(FakeTransport::new(state.clone(), vec![ready_poll()]));
        runner
            .run(&api(), "K", &request(), &CancelToken::new(), None)
            .unwrap();
        let body = state.last_submit_body.lock().unwrap().clone().unwrap();
        assert!(body.get("input_image").is_none());
    }

    #[test]
    fn missing_polling_url_is_a_protocol_error() {
        let state = Arc::new(FakeState::default());
        let mut transport = FakeTransport::new(state.clone(), vec![ready_poll()]);
        transport.submit_response = json!({"id": "job-1"});
        let runner = RemoteJobRunner::new(transport);
        let err = runner
            .run(&api(), "K", &request(), &CancelToken::new(), None)
            .unwrap_err();
        assert!(matches!(err, GenerateError::RemoteProtocol(_)));
        assert_eq!(state.polls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pending_forever_times_out_after_sixty_polls() {
        let state = Arc::new(FakeState::default());
        let runner = RemoteJobRunner::new(FakeTransport::new(
            state.clone(),
            vec![json!({"status": "Pending"})],
        ));
        let err = runner
            .run(&api(), "K", &request(), &CancelToken::new(), None)
            .unwrap_err();
        assert!(matches!(err, GenerateError::RemoteJobTimedOut { attempts: 60 }));
        assert_eq!(state.polls.load(Ordering::SeqCst), 60);
        assert_eq!(state.submits.load(Ordering::SeqCst), 1);
        assert!(*state.simulated_wait.lock().unwrap() >= Duration::from_secs(120));
    }

    #[test]
    fn failed_status_surfaces_service_message_without_download() {
        let state = Arc::new(FakeState::default());
        let runner = RemoteJobRunner::new(FakeTransport::new(
            state.clone(),
            vec![
                json!({"status": "Pending"}),
                json!({"status": "Pending"}),
                json!({"status": "Failed", "error": "content_policy"}),
            ],
        ));
        let err = runner
            .run(&api(), "K", &request(), &CancelToken::new(), None)
            .unwrap_err();
        match err {
            GenerateError::RemoteJobFailed(message) => assert!(message.contains("content_policy")),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(state.polls.load(Ordering::SeqCst), 3);
        assert_eq!(state.downloads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancellation_during_wait_stops_before_next_poll() {
        let state = Arc::new(FakeState::default());
        let mut transport =
            FakeTransport::new(state.clone(), vec![json!({"status": "Pending"})]);
        transport.cancel_on_wait = Some(2);
        let runner = RemoteJobRunner::new(transport);
        let err = runner
            .run(&api(), "K", &request(), &CancelToken::new(), None)
            .unwrap_err();
        assert!(matches!(err, GenerateError::Cancelled));
        assert_eq!(state.polls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn plural_sample_list_takes_first_entry() {
        let state = Arc::new(FakeState::default());
        let runner = RemoteJobRunner::new(FakeTransport::new(
            state.clone(),
            vec![json!({
                "status": "Ready",
                "result": {"sample": ["https://cdn.example/a.png", "https://cdn.example/b.png"]}
            })],
        ));
        let bytes = runner
            .run(&api(), "K", &request(), &CancelToken::new(), None)
            .unwrap();
        assert_eq!(bytes, b"png-bytes");
        assert_eq!(state.downloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_progress_callback_does_not_abort_the_job() {
        let state = Arc::new(FakeState::default());
        let runner = RemoteJobRunner::new(FakeTransport::new(state.clone(), vec![ready_poll()]));
        let progress = |_fraction: f64, _stage: &str| panic!("listener went away");
        let bytes = runner
            .run(&api(), "K", &request(), &CancelToken::new(), Some(&progress))
            .unwrap();
        assert_eq!(bytes, b"png-bytes");
    }

    #[test]
    fn wall_clock_budget_is_bounded() {
        // submit + 60 * (poll + interval); the fake accumulates interval time
        let state = Arc::new(FakeState::default());
        let runner = RemoteJobRunner::new(FakeTransport::new(
            state.clone(),
            vec![json!({"status": "Queued"})],
        ));
        let _ = runner.run(&api(), "K", &request(), &CancelToken::new(), None);
        let simulated = *state.simulated_wait.lock().unwrap();
        assert_eq!(simulated, POLL_INTERVAL * MAX_POLL_ATTEMPTS);
    }
}
