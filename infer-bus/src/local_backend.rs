//! In-process reference backend.
//!
//! Every request is computed on its own tokio task after a random latency,
//! so completions finish out of order. A delivery task per stream tag awaits
//! them in submission order and hands them to the observer, which gives the
//! per-tag FIFO guarantee the dispatcher relies on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{
    CompletionObserver, InferBackend, InferRequest, InferResponse, InferSession, ModelOutput,
    SessionDesc, Target, TargetOutput, UserData,
};
use crate::error::{BackendError, SubmitError};

pub type ModelFn =
    Arc<dyn Fn(&InferRequest, &Target) -> Result<ModelOutput, BackendError> + Send + Sync>;

pub struct LocalBackend {
    handle: Handle,
    model: ModelFn,
    latency_ms: (u64, u64),
    split_targets: bool,
}

impl LocalBackend {
    pub fn new(handle: Handle, model: ModelFn) -> Self {
        Self {
            handle,
            model,
            latency_ms: (0, 0),
            split_targets: false,
        }
    }

    /// Uniform random latency in `[min_ms, max_ms]` per request.
    pub fn with_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.latency_ms = (min_ms.min(max_ms), max_ms.max(min_ms));
        self
    }

    /// Report every target of a request in its own response.
    pub fn with_split_targets(mut self, split: bool) -> Self {
        self.split_targets = split;
        self
    }
}

impl InferBackend for LocalBackend {
    fn open_session(
        &self,
        desc: SessionDesc,
        observer: Arc<dyn CompletionObserver>,
    ) -> anyhow::Result<Arc<dyn InferSession>> {
        log::info!(
            "{}: open local session, device: {}, batch: {:?}/{}ms, engines: {}",
            desc.name,
            desc.device_id,
            desc.batch_strategy,
            desc.batch_timeout_ms,
            desc.engine_num
        );
        Ok(Arc::new(LocalSession {
            desc,
            handle: self.handle.clone(),
            model: Arc::clone(&self.model),
            latency_ms: self.latency_ms,
            split_targets: self.split_targets,
            observer,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            lanes: Mutex::new(HashMap::new()),
        }))
    }
}

struct LaneState {
    pending: usize,
    // bumped by discard; jobs from an older generation are dropped
    generation: u64,
    closed: bool,
}

struct LaneCounter {
    state: Mutex<LaneState>,
    drained: Condvar,
}

impl LaneCounter {
    fn lock(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Job {
    generation: u64,
    request_id: u64,
    stream_tag: String,
    user_data: UserData,
    task: JoinHandle<Vec<InferResponse>>,
}

struct Lane {
    tx: tokio::sync::mpsc::UnboundedSender<Job>,
    counter: Arc<LaneCounter>,
}

pub struct LocalSession {
    desc: SessionDesc,
    handle: Handle,
    model: ModelFn,
    latency_ms: (u64, u64),
    split_targets: bool,
    observer: Arc<dyn CompletionObserver>,
    cancel: CancellationToken,
    closed: AtomicBool,
    lanes: Mutex<HashMap<String, Arc<Lane>>>,
}

impl LocalSession {
    fn lane(&self, tag: &str) -> Arc<Lane> {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lane) = lanes.get(tag) {
            return Arc::clone(lane);
        }
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let counter = Arc::new(LaneCounter {
            state: Mutex::new(LaneState {
                pending: 0,
                generation: 0,
                closed: false,
            }),
            drained: Condvar::new(),
        });
        let lane = Arc::new(Lane {
            tx,
            counter: Arc::clone(&counter),
        });
        lanes.insert(tag.to_string(), Arc::clone(&lane));

        let name = format!("{}/{}", self.desc.name, tag);
        let cancel = self.cancel.clone();
        let observer = Arc::clone(&self.observer);
        self.handle
            .spawn(async move { Self::delivery_loop(name, cancel, rx, counter, observer).await });
        lane
    }

    fn existing_lane(&self, tag: &str) -> Option<Arc<Lane>> {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tag)
            .cloned()
    }

    async fn delivery_loop(
        name: String,
        cancel: CancellationToken,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<Job>,
        counter: Arc<LaneCounter>,
        observer: Arc<dyn CompletionObserver>,
    ) {
        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            if counter.lock().generation != job.generation {
                job.task.abort();
                continue;
            }
            let mut task = job.task;
            let responses = tokio::select! {
                _ = cancel.cancelled() => {
                    task.abort();
                    break;
                }
                res = &mut task => match res {
                    Ok(responses) => responses,
                    Err(e) => {
                        let status = if e.is_cancelled() {
                            log::debug!("{}: request {} cancelled", name, job.request_id);
                            BackendError::Discarded
                        } else {
                            // memory-layer failures abort before unwinding, so this is the model itself
                            log::error!("{}: model panicked on request {}: {:#?}", name, job.request_id, e);
                            BackendError::Inference(e.to_string())
                        };
                        vec![InferResponse {
                            request_id: job.request_id,
                            stream_tag: job.stream_tag.clone(),
                            status: Err(status),
                            outputs: Vec::new(),
                            user_data: Arc::clone(&job.user_data),
                        }]
                    }
                },
            };
            if counter.lock().generation != job.generation {
                continue;
            }

            let observer = Arc::clone(&observer);
            if let Err(e) = tokio::task::spawn_blocking(move || {
                for response in responses {
                    observer.on_complete(response);
                }
            })
            .await
            {
                log::error!("{}: completion callback panicked: {:#?}", name, e);
            }

            let mut state = counter.lock();
            if state.generation == job.generation {
                state.pending = state.pending.saturating_sub(1);
                if state.pending == 0 {
                    counter.drained.notify_all();
                }
            }
        }
        log::debug!("{}: delivery loop exit", name);
    }

    fn compute(
        model: &ModelFn,
        request: &InferRequest,
        targets: &[Target],
    ) -> Vec<TargetOutput> {
        targets
            .iter()
            .map(|target| TargetOutput {
                index: target.index,
                result: model(request, target),
            })
            .collect()
    }
}

impl InferSession for LocalSession {
    fn submit(&self, request: InferRequest) -> Result<(), SubmitError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SubmitError::SessionClosed);
        }
        if let Some((position, target)) = request
            .targets
            .iter()
            .enumerate()
            .find(|(position, target)| target.index != *position)
        {
            return Err(SubmitError::Rejected(format!(
                "request {}: target at {} has index {}, targets must be numbered 0..{}",
                request.id,
                position,
                target.index,
                request.targets.len()
            )));
        }
        let lane = self.lane(&request.stream_tag);
        let generation = {
            let mut state = lane.counter.lock();
            state.pending += 1;
            state.generation
        };

        let (min, max) = self.latency_ms;
        // pass-through requests skip the model
        let delay = if max > 0 && !request.is_empty() {
            rand::thread_rng().gen_range(min..=max)
        } else {
            0
        };
        let request_id = request.id;
        let stream_tag = request.stream_tag.clone();
        let user_data = Arc::clone(&request.user_data);
        let model = Arc::clone(&self.model);
        let split = self.split_targets;
        let task = self.handle.spawn(async move {
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let response = |outputs: Vec<TargetOutput>| InferResponse {
                request_id: request.id,
                stream_tag: request.stream_tag.clone(),
                status: Ok(()),
                outputs,
                user_data: Arc::clone(&request.user_data),
            };
            if split && request.targets.len() > 1 {
                request
                    .targets
                    .iter()
                    .map(|t| response(Self::compute(&model, &request, std::slice::from_ref(t))))
                    .collect()
            } else {
                vec![response(Self::compute(&model, &request, &request.targets))]
            }
        });

        let job = Job {
            generation,
            request_id,
            stream_tag,
            user_data,
            task,
        };
        if let Err(e) = lane.tx.send(job) {
            e.0.task.abort();
            let mut state = lane.counter.lock();
            state.pending = state.pending.saturating_sub(1);
            return Err(SubmitError::SessionClosed);
        }
        Ok(())
    }

    fn wait_drain(&self, tag: &str) {
        let Some(lane) = self.existing_lane(tag) else {
            return;
        };
        let mut state = lane.counter.lock();
        while state.pending > 0 && !state.closed {
            state = lane
                .counter
                .drained
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn discard_pending(&self, tag: &str) {
        let Some(lane) = self.existing_lane(tag) else {
            return;
        };
        let mut state = lane.counter.lock();
        log::info!("{}: discard {} pending request(s) of {}", self.desc.name, state.pending, tag);
        state.generation += 1;
        state.pending = 0;
        lane.counter.drained.notify_all();
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("{}: close local session", self.desc.name);
        self.cancel.cancel();
        let lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        for lane in lanes.values() {
            lane.counter.lock().closed = true;
            lane.counter.drained.notify_all();
        }
    }
}

impl Drop for LocalSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[path = "local_backend_test.rs"]
mod local_backend_test;
