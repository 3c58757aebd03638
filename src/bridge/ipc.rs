use super::{
    Backend, BackendError, CompressImageParams, FfmpegCheck, FileInfo, ProgressSender,
};
use crate::constants::{
    BACKEND_REQUEST_TIMEOUT_SECONDS, EVENT_CHANNEL_CAPACITY, IMAGE_JOB_PROGRESS_EVENT,
};
use crate::job::types::{CompressMode, CropRegion, JobProgressEvent, JobRequest, JobState};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, oneshot, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

/// JSON-RPC "method not found".
const METHOD_NOT_FOUND: i64 = -32601;
const UNSUPPORTED_CODES: &[&str] = &["unsupported", "method_not_found", "METHOD_NOT_FOUND"];
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

type Reply = Result<Value, BackendError>;

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct WireError {
    #[serde(default)]
    code: Option<Value>,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawInbound {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<WireError>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    channel: Option<u64>,
    #[serde(default)]
    payload: Option<Value>,
}

/// One newline-delimited message written by the sidecar.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inbound {
    Response {
        id: u64,
        result: Result<Value, WireError>,
    },
    Event {
        name: String,
        payload: Value,
    },
    Channel {
        channel: u64,
        payload: Value,
    },
}

pub(crate) fn decode_line(line: &str) -> Result<Inbound, BackendError> {
    let raw: RawInbound = serde_json::from_str(line)?;

    if let Some(name) = raw.event {
        return Ok(Inbound::Event {
            name,
            payload: raw.payload.unwrap_or(Value::Null),
        });
    }

    if let Some(channel) = raw.channel {
        return Ok(Inbound::Channel {
            channel,
            payload: raw.payload.unwrap_or(Value::Null),
        });
    }

    if let Some(id) = raw.id {
        let result = match raw.error {
            Some(err) => Err(err),
            None => Ok(raw.result.unwrap_or(Value::Null)),
        };
        return Ok(Inbound::Response { id, result });
    }

    Err(BackendError::Decode(format!(
        "message has no id, event or channel: {}",
        line
    )))
}

/// Structured mapping of an error reply. Only the error code decides whether
/// the entry point is missing; the message text is never inspected.
pub(crate) fn map_wire_error(method: &str, err: WireError) -> BackendError {
    let unsupported = match &err.code {
        Some(Value::Number(n)) => n.as_i64() == Some(METHOD_NOT_FOUND),
        Some(Value::String(s)) => UNSUPPORTED_CODES.contains(&s.as_str()),
        _ => false,
    };

    if unsupported {
        return BackendError::Unsupported {
            method: method.to_string(),
        };
    }

    BackendError::Remote {
        method: method.to_string(),
        code: err.code.map(|c| match c {
            Value::String(s) => s,
            other => other.to_string(),
        }),
        message: err.message,
    }
}

fn wire_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    stdin: AsyncMutex<Option<ChildStdin>>,
    child: AsyncMutex<Option<Child>>,
    pending: Mutex<HashMap<u64, (String, oneshot::Sender<Reply>)>>,
    channels: Mutex<HashMap<u64, ProgressSender>>,
    events: Mutex<Option<broadcast::Sender<JobProgressEvent>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    request_timeout: Duration,
}

impl Inner {
    fn dispatch(&self, message: Inbound) {
        match message {
            Inbound::Response { id, result } => {
                let Some((method, reply)) = lock(&self.pending).remove(&id) else {
                    warn!("Dropping response for unknown request {}", id);
                    return;
                };
                let result = result.map_err(|e| map_wire_error(&method, e));
                let _ = reply.send(result);
            }
            Inbound::Event { name, payload } => {
                if name != IMAGE_JOB_PROGRESS_EVENT {
                    debug!("Ignoring backend event {}", name);
                    return;
                }
                match serde_json::from_value::<JobProgressEvent>(payload) {
                    Ok(event) => {
                        if let Some(tx) = lock(&self.events).as_ref() {
                            // No listener is fine: nobody is waiting on a job.
                            let _ = tx.send(event);
                        }
                    }
                    Err(e) => warn!("Dropping malformed progress event: {}", e),
                }
            }
            Inbound::Channel { channel, payload } => {
                let Some(percent) = payload.as_f64() else {
                    warn!("Non-numeric payload on channel {}", channel);
                    return;
                };
                if let Some(tx) = lock(&self.channels).get(&channel) {
                    let _ = tx.send(percent as f32);
                }
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        lock(&self.events).take();
        lock(&self.channels).clear();
        let pending: Vec<_> = lock(&self.pending).drain().collect();
        for (_, (_, reply)) in pending {
            let _ = reply.send(Err(BackendError::Disconnected));
        }
    }
}

/// Holds a request's reply slot or a progress channel open for one call and
/// removes it when the call returns or its future is dropped.
struct Registration<'a> {
    inner: &'a Inner,
    request: Option<u64>,
    channel: Option<u64>,
}

impl<'a> Registration<'a> {
    fn request(inner: &'a Inner, id: u64, method: &str, reply: oneshot::Sender<Reply>) -> Self {
        lock(&inner.pending).insert(id, (method.to_string(), reply));
        Self {
            inner,
            request: Some(id),
            channel: None,
        }
    }

    fn channel(inner: &'a Inner, channel: u64, progress: ProgressSender) -> Self {
        lock(&inner.channels).insert(channel, progress);
        Self {
            inner,
            request: None,
            channel: Some(channel),
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.request {
            lock(&self.inner.pending).remove(&id);
        }
        if let Some(channel) = self.channel {
            lock(&self.inner.channels).remove(&channel);
        }
    }
}

/// Backend reached through a sidecar process speaking newline-delimited JSON
/// on stdio: `{"id","method","params"}` requests, `{"id","result"|"error"}`
/// replies, `{"event","payload"}` pushes and `{"channel","payload"}` progress.
#[derive(Clone)]
pub struct IpcBridge {
    inner: Arc<Inner>,
}

impl IpcBridge {
    pub fn spawn(command: &str, args: &[String]) -> Result<Self, BackendError> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::Transport(format!("failed to start {}: {}", command, e)))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Transport("sidecar stdout unavailable".to_string()))?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            stdin: AsyncMutex::new(stdin),
            child: AsyncMutex::new(Some(child)),
            pending: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            events: Mutex::new(Some(events)),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            request_timeout: Duration::from_secs(BACKEND_REQUEST_TIMEOUT_SECONDS),
        });

        tokio::spawn(read_loop(inner.clone(), stdout));
        info!("Backend sidecar started: {}", command);

        Ok(Self { inner })
    }

    pub async fn shutdown(&self) {
        self.inner.stdin.lock().await.take();

        if let Some(mut child) = self.inner.child.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => info!("Backend sidecar exited: {}", status),
                Ok(Err(e)) => warn!("Failed to wait for backend sidecar: {}", e),
                Err(_) => {
                    warn!("Backend sidecar did not exit, killing it");
                    if let Err(e) = child.kill().await {
                        error!("Failed to kill backend sidecar: {}", e);
                    }
                }
            }
        }
        self.inner.close();
    }

    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BackendError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let _registration = Registration::request(&self.inner, id, method, tx);

        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BackendError::Disconnected);
        }

        let mut line = serde_json::to_vec(&WireRequest { id, method, params })?;
        line.push(b'\n');

        {
            let mut stdin = self.inner.stdin.lock().await;
            let Some(writer) = stdin.as_mut() else {
                return Err(BackendError::Disconnected);
            };
            let written = async {
                writer.write_all(&line).await?;
                writer.flush().await
            }
            .await;
            written?;
        }

        let reply = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    return Err(BackendError::Timeout {
                        method: method.to_string(),
                    });
                }
            },
            None => rx.await,
        };

        reply.unwrap_or(Err(BackendError::Disconnected))
    }

    async fn call_quick<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, BackendError> {
        let value = self
            .call(method, params, Some(self.inner.request_timeout))
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

async fn read_loop(inner: Arc<Inner>, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match decode_line(&line) {
                    Ok(message) => inner.dispatch(message),
                    Err(e) => warn!("Ignoring backend output: {}", e),
                }
            }
            Ok(None) => {
                info!("Backend sidecar closed its output");
                break;
            }
            Err(e) => {
                error!("Failed to read from backend sidecar: {}", e);
                break;
            }
        }
    }
    inner.close();
}

#[async_trait::async_trait]
impl Backend for IpcBridge {
    async fn get_file_info(&self, path: &Path) -> Result<FileInfo, BackendError> {
        self.call_quick("get_file_info", json!({ "path": wire_path(path) }))
            .await
    }

    async fn list_image_files_in_directory(&self, dir: &Path) -> Result<Vec<PathBuf>, BackendError> {
        self.call_quick("list_image_files_in_directory", json!({ "dir": wire_path(dir) }))
            .await
    }

    async fn crop_image(
        &self,
        path: &Path,
        output_path: &Path,
        crop_region: CropRegion,
    ) -> Result<(), BackendError> {
        // Bounded by the caller.
        self.call(
            "crop_image",
            json!({
                "path": wire_path(path),
                "outputPath": wire_path(output_path),
                "cropRegion": crop_region,
            }),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn compress_image(
        &self,
        params: CompressImageParams,
        progress: ProgressSender,
    ) -> Result<(), BackendError> {
        let channel = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let _progress = Registration::channel(&self.inner, channel, progress);

        let mut payload = serde_json::to_value(&params)?;
        if let Value::Object(map) = &mut payload {
            map.insert("progressCallback".to_string(), json!(channel));
        }

        self.call("compress_image", payload, None).await.map(|_| ())
    }

    async fn compress_video(
        &self,
        path: &Path,
        output_path: &Path,
        mode: CompressMode,
    ) -> Result<(), BackendError> {
        self.call(
            "compress_video",
            json!({
                "path": wire_path(path),
                "outputPath": wire_path(output_path),
                "mode": mode,
            }),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn create_image_job(&self, request: &JobRequest) -> Result<String, BackendError> {
        let request = serde_json::to_value(request)?;
        self.call_quick("create_image_job", json!({ "request": request }))
            .await
    }

    async fn get_image_job(&self, job_id: &str) -> Result<JobState, BackendError> {
        self.call_quick("get_image_job", json!({ "jobId": job_id }))
            .await
    }

    async fn cancel_image_job(&self, job_id: &str) -> Result<(), BackendError> {
        self.call_quick::<Value>("cancel_image_job", json!({ "jobId": job_id }))
            .await
            .map(|_| ())
    }

    async fn copy_file(&self, from: &Path, to: &Path) -> Result<(), BackendError> {
        self.call("copy_file", json!({ "from": wire_path(from), "to": wire_path(to) }), None)
            .await
            .map(|_| ())
    }

    async fn open_folder(&self, path: &Path) -> Result<(), BackendError> {
        self.call_quick::<Value>("open_folder", json!({ "path": wire_path(path) }))
            .await
            .map(|_| ())
    }

    async fn check_ffmpeg(&self) -> Result<FfmpegCheck, BackendError> {
        self.call_quick("check_ffmpeg", json!({})).await
    }

    fn subscribe_job_progress(&self) -> broadcast::Receiver<JobProgressEvent> {
        match lock(&self.inner.events).as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                // Bridge already closed: hand out a receiver that reports Closed.
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::types::JobStatus;

    #[test]
    fn test_decode_response_and_error() {
        let ok = decode_line(r#"{"id":3,"result":"img-job-1"}"#).unwrap();
        assert_eq!(
            ok,
            Inbound::Response {
                id: 3,
                result: Ok(json!("img-job-1"))
            }
        );

        let void = decode_line(r#"{"id":4,"result":null}"#).unwrap();
        assert_eq!(
            void,
            Inbound::Response {
                id: 4,
                result: Ok(Value::Null)
            }
        );

        let failed = decode_line(r#"{"id":5,"error":{"code":"io","message":"disk full"}}"#).unwrap();
        assert!(matches!(failed, Inbound::Response { id: 5, result: Err(_) }));
    }

    #[test]
    fn test_decode_event_and_channel() {
        let event = decode_line(r#"{"event":"image-job-progress","payload":{"jobId":"j"}}"#).unwrap();
        assert!(matches!(event, Inbound::Event { ref name, .. } if name == "image-job-progress"));

        let channel = decode_line(r#"{"channel":9,"payload":42.5}"#).unwrap();
        assert_eq!(
            channel,
            Inbound::Channel {
                channel: 9,
                payload: json!(42.5)
            }
        );

        assert!(decode_line(r#"{"hello":"world"}"#).is_err());
        assert!(decode_line("not json").is_err());
    }

    #[test]
    fn test_unsupported_detection_uses_codes_only() {
        let missing = WireError {
            code: Some(json!(-32601)),
            message: "whatever".to_string(),
        };
        assert!(map_wire_error("create_image_job", missing).is_unsupported());

        let tagged = WireError {
            code: Some(json!("unsupported")),
            message: "whatever".to_string(),
        };
        assert!(map_wire_error("create_image_job", tagged).is_unsupported());

        // A job failure whose text mentions the command name is still a job failure.
        let job_failure = WireError {
            code: Some(json!("invalid_request")),
            message: "create_image_job: inputs must not be empty".to_string(),
        };
        let mapped = map_wire_error("create_image_job", job_failure);
        assert!(!mapped.is_unsupported());
        assert_eq!(mapped.to_string(), "create_image_job: inputs must not be empty");
    }

    #[cfg(unix)]
    fn sidecar(script: &str) -> IpcBridge {
        IpcBridge::spawn("sh", &["-c".to_string(), script.to_string()]).unwrap()
    }

    #[cfg(unix)]
    fn one_file_request() -> JobRequest {
        JobRequest {
            inputs: vec![PathBuf::from("a.png")],
            output_dir: None,
            mode: None,
            crop_region: None,
            options: None,
            pipeline: None,
            max_concurrency: None,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_job_submission_over_stdio() {
        let bridge = sidecar(
            r#"read line
printf '%s\n' '{"event":"image-job-progress","payload":{"jobId":"img-job-1","fileIndex":0,"totalFiles":1,"inputPath":"a.png","stageProgress":50,"overallProgress":50,"status":"running"}}'
printf '%s\n' '{"id":1,"result":"img-job-1"}'
sleep 1"#,
        );
        let mut events = bridge.subscribe_job_progress();

        let job_id = bridge.create_image_job(&one_file_request()).await.unwrap();
        assert_eq!(job_id, "img-job-1");

        let event = events.recv().await.unwrap();
        assert_eq!(event.job_id, "img-job-1");
        assert_eq!(event.status, JobStatus::Running);
        assert_eq!(event.stage_progress, 50.0);

        bridge.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_entry_point_is_unsupported() {
        let bridge = sidecar(
            r#"read line
printf '%s\n' '{"id":1,"error":{"code":-32601,"message":"Command create_image_job not found"}}'
sleep 1"#,
        );

        let err = bridge.create_image_job(&one_file_request()).await.unwrap_err();
        assert!(err.is_unsupported());
        bridge.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abandoned_call_releases_its_slots() {
        let bridge = sidecar("read line; read rest");
        let (progress, _progress_rx) = tokio::sync::mpsc::unbounded_channel();
        let params = CompressImageParams {
            path: PathBuf::from("a.png"),
            output_path: PathBuf::from("a_compressed.png"),
            mode: CompressMode::Lossless,
            crop_region: None,
            options: None,
        };

        let call = bridge.compress_image(params, progress);
        let abandoned = tokio::time::timeout(Duration::from_millis(300), call).await;

        assert!(abandoned.is_err());
        assert!(lock(&bridge.inner.pending).is_empty());
        assert!(lock(&bridge.inner.channels).is_empty());
        bridge.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sidecar_exit_fails_pending_calls() {
        let bridge = sidecar("read line; exit 0");

        let err = bridge.get_image_job("img-job-1").await.unwrap_err();
        assert_eq!(err, BackendError::Disconnected);

        let mut events = bridge.subscribe_job_progress();
        assert!(matches!(
            events.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
