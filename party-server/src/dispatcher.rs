//! The image request dispatcher.
//!
//! Owns the pool of upstream image servers. Every upstream has its own FIFO
//! of pending requests and a single in-flight slot; a poll loop starts work
//! on every idle upstream with a non-empty queue. A failed attempt rotates
//! the request to the next upstream it has not tried yet, and once every
//! upstream has been attempted the dispatcher synthesizes placeholder images
//! so a waiting script can always make progress. Completed results are
//! handed to the session layer over a channel; no HTTP call ever runs under
//! a session lock.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use protocol::PlayerId;
use rand::Rng;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

use crate::images::AssetCache;

/// The checkpoint used for plain and scribble-conditioned generation.
pub const TEXT_MODEL: &str = "v2-1_768-ema-pruned";
/// The checkpoint used for depth-conditioned generation.
pub const DEPTH_MODEL: &str = "512-depth-ema";
/// The conditioning model handed to the always-on extension for sketches.
pub const SCRIBBLE_CONTROL_MODEL: &str = "control_v11p_sd15_scribble";
/// Depth requests need a deterministic sampler so a fixed seed reproduces.
pub const DETERMINISTIC_SAMPLER: &str = "DPM++ 2M";
/// Every request runs with a fixed seed for reproducibility.
pub const FIXED_SEED: i64 = 585501288;

/// A stuck upstream converts into the rotation path after this long.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// The kind-specific part of a generation request.
#[derive(Debug, Clone)]
pub enum GenerationKind {
    /// Plain text to image.
    Text {
        prompt: String,
        negative_prompt: String,
    },
    /// Depth-conditioned: the named asset is loaded and sent as the initial
    /// image of an img2img call.
    Depth {
        image: String,
        prompt: String,
        negative_prompt: String,
        denoising_strength: f64,
    },
    /// Scribble-conditioned: a text-to-image call augmented with the
    /// always-on conditioning extension. The drawing arrives as base64 and
    /// is inverted from white background to black lines upstream.
    Sketch {
        prompt: String,
        sketch_base64: String,
    },
}

/// Everything the engine knows about a generation request when it submits
/// it. The dispatcher adds its own routing state on top.
#[derive(Debug, Clone)]
pub struct GenerationSpec {
    /// The session the result routes back to. A session that disappeared in
    /// the meantime makes the result droppable.
    pub session_code: String,
    /// The player whose script step requested the images, if any.
    pub player: Option<PlayerId>,
    /// The variable the result is written to.
    pub dest_var: String,
    pub kind: GenerationKind,
    pub batch_size: u32,
    pub iterations: u32,
}

impl GenerationSpec {
    /// How many image entries the callback must contain.
    pub fn expected_images(&self) -> usize {
        (self.batch_size.max(1) * self.iterations.max(1)) as usize
    }

    fn required_model(&self) -> &'static str {
        match self.kind {
            GenerationKind::Text { .. } | GenerationKind::Sketch { .. } => TEXT_MODEL,
            GenerationKind::Depth { .. } => DEPTH_MODEL,
        }
    }
}

/// A finished request: freshly minted image ids mapped to base64 payloads.
#[derive(Debug)]
pub struct GenerationResult {
    pub session_code: String,
    pub player: Option<PlayerId>,
    pub dest_var: String,
    pub images: IndexMap<String, String>,
}

/// Transport-level failures. Every variant is a retry signal for the
/// dispatch algorithm.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http failure: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream answered status {0}")]
    BadStatus(u16),
    #[error("upstream reply malformed: {0}")]
    MalformedReply(&'static str),
}

/// The HTTP contract of one upstream image server. Kept behind a trait so
/// the rotation and fallback logic is testable without a live backend.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// `GET /options`: the currently loaded model checkpoint.
    async fn active_model(&self, host: &str, port: u16) -> Result<String, TransportError>;
    /// `POST /options`: switch the active model and wait for the ack.
    async fn switch_model(&self, host: &str, port: u16, model: &str)
    -> Result<(), TransportError>;
    /// `POST /<endpoint>`: run a generation call, returning the base64
    /// images of the reply.
    async fn generate(
        &self,
        host: &str,
        port: u16,
        endpoint: &str,
        payload: serde_json::Value,
    ) -> Result<Vec<String>, TransportError>;
}

/// The real transport, backed by reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        HttpTransport { client }
    }

    fn url(host: &str, port: u16, endpoint: &str) -> String {
        format!("http://{host}:{port}/{endpoint}")
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamTransport for HttpTransport {
    async fn active_model(&self, host: &str, port: u16) -> Result<String, TransportError> {
        let response = self.client.get(Self::url(host, port, "options")).send().await?;
        if !response.status().is_success() {
            return Err(TransportError::BadStatus(response.status().as_u16()));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|_| TransportError::MalformedReply("options reply is not JSON"))?;
        let model = body
            .get("modelCheckpoint")
            .and_then(|value| value.as_str())
            .ok_or(TransportError::MalformedReply("missing modelCheckpoint"))?;
        Ok(model.to_string())
    }

    async fn switch_model(
        &self,
        host: &str,
        port: u16,
        model: &str,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .post(Self::url(host, port, "options"))
            .json(&json!({ "modelCheckpoint": model }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::BadStatus(response.status().as_u16()));
        }
        Ok(())
    }

    async fn generate(
        &self,
        host: &str,
        port: u16,
        endpoint: &str,
        payload: serde_json::Value,
    ) -> Result<Vec<String>, TransportError> {
        let response = self
            .client
            .post(Self::url(host, port, endpoint))
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::BadStatus(response.status().as_u16()));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|_| TransportError::MalformedReply("generation reply is not JSON"))?;
        let images = body
            .get("images")
            .and_then(|value| value.as_array())
            .ok_or(TransportError::MalformedReply("missing images field"))?;
        let mut payloads = Vec::with_capacity(images.len());
        for image in images {
            let Some(data) = image.as_str() else {
                return Err(TransportError::MalformedReply("non-string image entry"));
            };
            payloads.push(data.to_string());
        }
        Ok(payloads)
    }
}

/// A request while it travels through the pool.
struct PendingRequest {
    spec: GenerationSpec,
    /// Indices of upstreams this request has already been handed to. Grows
    /// monotonically; a request never lands on the same upstream twice.
    attempted: HashSet<usize>,
}

/// One upstream with its queue and in-flight slot.
struct UpstreamSlot {
    host: String,
    port: u16,
    pending: VecDeque<PendingRequest>,
    in_flight: bool,
}

struct DispatcherInner {
    slots: tokio::sync::Mutex<Vec<UpstreamSlot>>,
    transport: Box<dyn UpstreamTransport>,
    assets: AssetCache,
    placeholders: Vec<String>,
    results: mpsc::UnboundedSender<GenerationResult>,
    wake: Notify,
}

/// Cheap-to-clone handle on the dispatcher.
#[derive(Clone)]
pub struct ImageDispatcher {
    inner: Arc<DispatcherInner>,
}

impl ImageDispatcher {
    /// Builds the dispatcher over the configured upstream endpoints. Results
    /// are pushed into `results`; the receiving side is responsible for
    /// routing them to their session (or discarding them when the session is
    /// gone).
    pub fn new(
        endpoints: Vec<(String, u16)>,
        transport: Box<dyn UpstreamTransport>,
        assets: AssetCache,
        placeholders: Vec<String>,
        results: mpsc::UnboundedSender<GenerationResult>,
    ) -> Self {
        let slots = endpoints
            .into_iter()
            .map(|(host, port)| UpstreamSlot {
                host,
                port,
                pending: VecDeque::new(),
                in_flight: false,
            })
            .collect();
        // The fallback pool must never be empty, placeholder delivery draws
        // from it unconditionally.
        let placeholders = if placeholders.is_empty() {
            vec![String::new()]
        } else {
            placeholders
        };
        ImageDispatcher {
            inner: Arc::new(DispatcherInner {
                slots: tokio::sync::Mutex::new(slots),
                transport,
                assets,
                placeholders,
                results,
                wake: Notify::new(),
            }),
        }
    }

    /// Spawns the poll loop task. Call once at startup.
    pub fn start(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_loop(inner).await;
        });
    }

    /// Accepts a new request. Cheap; the HTTP work happens on the poll loop
    /// side, so this is safe to call while holding a session lock.
    pub async fn submit(&self, spec: GenerationSpec) {
        enqueue(
            &self.inner,
            PendingRequest {
                spec,
                attempted: HashSet::new(),
            },
        )
        .await;
    }
}

/// Picks the least-loaded upstream the request has not attempted yet and
/// appends it there. With every upstream attempted, the placeholder pool
/// answers instead; the callback is never dropped.
async fn enqueue(inner: &Arc<DispatcherInner>, mut request: PendingRequest) {
    let mut slots = inner.slots.lock().await;
    let mut order: Vec<usize> = (0..slots.len()).collect();
    order.sort_by_key(|&idx| slots[idx].pending.len());
    if let Some(&idx) = order.iter().find(|&&idx| !request.attempted.contains(&idx)) {
        request.attempted.insert(idx);
        slots[idx].pending.push_back(request);
        drop(slots);
        inner.wake.notify_one();
        return;
    }
    drop(slots);
    tracing::warn!(
        session = request.spec.session_code,
        dest_var = request.spec.dest_var,
        "Every upstream failed this request, delivering placeholders."
    );
    deliver_placeholders(inner, request.spec);
}

/// The poll loop: start the head request of every idle upstream, then sleep
/// until something changes. Distinct upstreams process in parallel; one
/// upstream never has more than one request in flight.
async fn run_loop(inner: Arc<DispatcherInner>) {
    loop {
        let start_now = {
            let mut slots = inner.slots.lock().await;
            let mut start_now = Vec::new();
            for (idx, slot) in slots.iter_mut().enumerate() {
                if !slot.in_flight
                    && let Some(request) = slot.pending.pop_front()
                {
                    slot.in_flight = true;
                    start_now.push((idx, request));
                }
            }
            start_now
        };
        for (idx, request) in start_now {
            let inner = inner.clone();
            tokio::spawn(async move {
                process(inner, idx, request).await;
            });
        }
        inner.wake.notified().await;
    }
}

/// Failures of one attempt against one upstream.
#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("asset {path} unavailable: {source}")]
    Asset { path: String, source: io::Error },
}

/// Runs the in-flight protocol for one request on one upstream and routes
/// the outcome: deliver on success, rotate on failure.
async fn process(inner: Arc<DispatcherInner>, idx: usize, request: PendingRequest) {
    let (host, port) = {
        let slots = inner.slots.lock().await;
        (slots[idx].host.clone(), slots[idx].port)
    };

    let outcome = attempt(&inner, &host, port, &request.spec).await;

    {
        let mut slots = inner.slots.lock().await;
        slots[idx].in_flight = false;
    }

    match outcome {
        Ok(images) => deliver(&inner, request.spec, images),
        Err(error) => {
            tracing::warn!(
                %error,
                upstream = format!("{host}:{port}"),
                session = request.spec.session_code,
                dest_var = request.spec.dest_var,
                "Generation attempt failed, rotating to the next upstream."
            );
            enqueue(&inner, request).await;
        }
    }
    inner.wake.notify_one();
}

/// Model check, eventual switch, payload build, submission.
async fn attempt(
    inner: &Arc<DispatcherInner>,
    host: &str,
    port: u16,
    spec: &GenerationSpec,
) -> Result<Vec<String>, AttemptError> {
    let required = spec.required_model();
    let active = inner.transport.active_model(host, port).await?;
    if active != required {
        tracing::debug!(
            upstream = format!("{host}:{port}"),
            from = active,
            to = required,
            "Switching upstream model."
        );
        inner.transport.switch_model(host, port, required).await?;
    }

    let (endpoint, payload) = build_payload(inner, spec).await?;
    let images = inner.transport.generate(host, port, endpoint, payload).await?;
    if images.is_empty() {
        return Err(TransportError::MalformedReply("empty images list").into());
    }
    Ok(images)
}

/// The JSON body for the upstream call, per request kind.
async fn build_payload(
    inner: &Arc<DispatcherInner>,
    spec: &GenerationSpec,
) -> Result<(&'static str, serde_json::Value), AttemptError> {
    let batch_size = spec.batch_size.max(1);
    let iterations = spec.iterations.max(1);
    match &spec.kind {
        GenerationKind::Text {
            prompt,
            negative_prompt,
        } => Ok((
            "txt2img",
            json!({
                "prompt": prompt,
                "negativePrompt": negative_prompt,
                "batchSize": batch_size,
                "nIterations": iterations,
                "seed": FIXED_SEED,
            }),
        )),
        GenerationKind::Sketch {
            prompt,
            sketch_base64,
        } => Ok((
            "txt2img",
            json!({
                "prompt": prompt,
                "negativePrompt": "",
                "batchSize": batch_size,
                "nIterations": iterations,
                "seed": FIXED_SEED,
                "alwaysOnScripts": {
                    "controlnet": {
                        "args": [{
                            "inputImage": sketch_base64,
                            "module": "invert (from white bg & black line)",
                            "model": SCRIBBLE_CONTROL_MODEL,
                        }],
                    },
                },
            }),
        )),
        GenerationKind::Depth {
            image,
            prompt,
            negative_prompt,
            denoising_strength,
        } => {
            let init_image =
                inner
                    .assets
                    .load(image)
                    .await
                    .map_err(|source| AttemptError::Asset {
                        path: image.clone(),
                        source,
                    })?;
            Ok((
                "img2img",
                json!({
                    "initImages": [init_image],
                    "prompt": prompt,
                    "negativePrompt": negative_prompt,
                    "denoisingStrength": denoising_strength,
                    "samplerName": DETERMINISTIC_SAMPLER,
                    "batchSize": batch_size,
                    "nIterations": iterations,
                    "seed": FIXED_SEED,
                }),
            ))
        }
    }
}

/// Mints an id per image, pads short replies by duplicating the first image
/// and trims long ones, so the callback always carries exactly
/// batch x iterations entries.
fn deliver(inner: &Arc<DispatcherInner>, spec: GenerationSpec, mut images: Vec<String>) {
    let expected = spec.expected_images();
    if images.len() < expected {
        tracing::warn!(
            session = spec.session_code,
            got = images.len(),
            expected,
            "Upstream returned fewer images than requested, padding."
        );
        if let Some(first) = images.first().cloned() {
            while images.len() < expected {
                images.push(first.clone());
            }
        }
    }
    images.truncate(expected);

    let images: IndexMap<String, String> = images
        .into_iter()
        .map(|payload| (Uuid::new_v4().to_string(), payload))
        .collect();
    push_result(inner, spec, images);
}

/// The end of the line: every upstream has failed, so the expected count is
/// served from the fallback pool.
fn deliver_placeholders(inner: &Arc<DispatcherInner>, spec: GenerationSpec) {
    let mut rng = rand::thread_rng();
    let images: IndexMap<String, String> = (0..spec.expected_images())
        .map(|_| {
            let pick = rng.gen_range(0..inner.placeholders.len());
            (
                Uuid::new_v4().to_string(),
                inner.placeholders[pick].clone(),
            )
        })
        .collect();
    push_result(inner, spec, images);
}

fn push_result(inner: &Arc<DispatcherInner>, spec: GenerationSpec, images: IndexMap<String, String>) {
    let result = GenerationResult {
        session_code: spec.session_code,
        player: spec.player,
        dest_var: spec.dest_var,
        images,
    };
    if inner.results.send(result).is_err() {
        tracing::error!("Result channel closed, dropping generation result.");
    }
}
