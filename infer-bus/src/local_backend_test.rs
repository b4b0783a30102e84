use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{
    BatchStrategy, CompletionObserver, InferBackend, InferRequest, InferResponse, InferSession,
    ModelOutput, SessionDesc, Target, Tensor,
};
use crate::error::{BackendError, SubmitError};
use crate::local_backend::{LocalBackend, ModelFn};

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(String, u64, usize)>>,
}

impl CompletionObserver for Recorder {
    fn on_complete(&self, response: InferResponse) {
        assert!(response.status.is_ok());
        self.seen.lock().unwrap().push((
            response.stream_tag.clone(),
            response.request_id,
            response.outputs.len(),
        ));
    }
}

fn echo_model() -> ModelFn {
    Arc::new(|_request: &InferRequest, target: &Target| -> Result<ModelOutput, BackendError> {
        Ok(ModelOutput {
            tensors: vec![Tensor::from_f32(vec![1], &[target.index as f32])],
        })
    })
}

fn desc() -> SessionDesc {
    SessionDesc {
        name: "test".to_string(),
        device_id: 0,
        batch_strategy: BatchStrategy::Dynamic,
        batch_timeout_ms: 1000,
        priority: 0,
        engine_num: 1,
        preproc_on_device: false,
    }
}

fn request(id: u64, tag: &str, targets: usize) -> InferRequest {
    InferRequest {
        id,
        stream_tag: tag.to_string(),
        input: None,
        targets: (0..targets).map(|index| Target { index, roi: None }).collect(),
        user_data: Arc::new(()),
    }
}

fn open(backend: LocalBackend) -> anyhow::Result<(Arc<dyn InferSession>, Arc<Recorder>)> {
    let recorder = Arc::new(Recorder::default());
    let session = backend.open_session(desc(), Arc::clone(&recorder) as Arc<dyn CompletionObserver>)?;
    Ok((session, recorder))
}

async fn drain(session: &Arc<dyn InferSession>, tag: &str) -> anyhow::Result<()> {
    let session = Arc::clone(session);
    let tag = tag.to_string();
    tokio::task::spawn_blocking(move || session.wait_drain(&tag)).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_completions_keep_submission_order_per_tag() -> anyhow::Result<()> {
    let backend = LocalBackend::new(tokio::runtime::Handle::current(), echo_model()).with_latency(0, 20);
    let (session, recorder) = open(backend)?;

    for id in 0..20 {
        session.submit(request(id, "cam0", 1))?;
        session.submit(request(100 + id, "cam1", (id % 2) as usize))?;
    }
    drain(&session, "cam0").await?;
    drain(&session, "cam1").await?;

    let seen = recorder.seen.lock().unwrap().clone();
    let cam0: Vec<u64> = seen.iter().filter(|s| s.0 == "cam0").map(|s| s.1).collect();
    let cam1: Vec<u64> = seen.iter().filter(|s| s.0 == "cam1").map(|s| s.1).collect();
    assert_eq!(cam0, (0..20).collect::<Vec<_>>());
    assert_eq!(cam1, (100..120).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_split_targets_respond_per_target() -> anyhow::Result<()> {
    let backend = LocalBackend::new(tokio::runtime::Handle::current(), echo_model()).with_split_targets(true);
    let (session, recorder) = open(backend)?;

    session.submit(request(7, "cam0", 3))?;
    drain(&session, "cam0").await?;

    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|(_, id, outputs)| *id == 7 && *outputs == 1));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_discard_pending_drops_completions() -> anyhow::Result<()> {
    let backend = LocalBackend::new(tokio::runtime::Handle::current(), echo_model()).with_latency(150, 200);
    let (session, recorder) = open(backend)?;

    for id in 0..3 {
        session.submit(request(id, "cam0", 1))?;
    }
    session.discard_pending("cam0");
    // returns at once, nothing is pending any more
    tokio::time::timeout(Duration::from_millis(50), drain(&session, "cam0")).await??;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(recorder.seen.lock().unwrap().is_empty());

    // the tag keeps working after a discard
    session.submit(request(10, "cam0", 1))?;
    drain(&session, "cam0").await?;
    assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_submit_after_close_is_rejected() -> anyhow::Result<()> {
    let backend = LocalBackend::new(tokio::runtime::Handle::current(), echo_model());
    let (session, _recorder) = open(backend)?;

    session.submit(request(0, "cam0", 1))?;
    session.close();
    assert_eq!(
        session.submit(request(1, "cam0", 1)).unwrap_err(),
        SubmitError::SessionClosed
    );
    drain(&session, "cam0").await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_misnumbered_targets_are_rejected() -> anyhow::Result<()> {
    let backend = LocalBackend::new(tokio::runtime::Handle::current(), echo_model());
    let (session, recorder) = open(backend)?;

    let mut bad = request(3, "cam0", 2);
    bad.targets[1].index = 5;
    let err = session.submit(bad).unwrap_err();
    assert!(matches!(err, SubmitError::Rejected(ref reason) if reason.contains("index 5")));

    // nothing was counted for the rejected request
    tokio::time::timeout(Duration::from_millis(50), drain(&session, "cam0")).await??;
    assert!(recorder.seen.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_requests_skip_latency() -> anyhow::Result<()> {
    let backend = LocalBackend::new(tokio::runtime::Handle::current(), echo_model()).with_latency(300, 400);
    let (session, recorder) = open(backend)?;

    for id in 0..3 {
        session.submit(request(id, "cam0", 0))?;
    }
    tokio::time::timeout(Duration::from_millis(200), drain(&session, "cam0")).await??;
    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(seen, vec![("cam0".to_string(), 0, 0), ("cam0".to_string(), 1, 0), ("cam0".to_string(), 2, 0)]);
    Ok(())
}

#[derive(Default)]
struct StatusRecorder {
    statuses: Mutex<Vec<(u64, Result<(), BackendError>)>>,
}

impl CompletionObserver for StatusRecorder {
    fn on_complete(&self, response: InferResponse) {
        self.statuses.lock().unwrap().push((response.request_id, response.status));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_model_panic_reports_inference_error() -> anyhow::Result<()> {
    let model: ModelFn = Arc::new(|request: &InferRequest, _target: &Target| -> Result<ModelOutput, BackendError> {
        if request.id == 1 {
            panic!("model bug");
        }
        Ok(ModelOutput::default())
    });
    let backend = LocalBackend::new(tokio::runtime::Handle::current(), model);
    let recorder = Arc::new(StatusRecorder::default());
    let session = backend.open_session(desc(), Arc::clone(&recorder) as Arc<dyn CompletionObserver>)?;

    for id in 0..3 {
        session.submit(request(id, "cam0", 1))?;
    }
    tokio::time::timeout(Duration::from_secs(2), drain(&session, "cam0")).await??;

    let statuses = recorder.statuses.lock().unwrap().clone();
    assert_eq!(statuses.len(), 3);
    assert_eq!(statuses[0], (0, Ok(())));
    assert!(matches!(statuses[1], (1, Err(BackendError::Inference(_)))));
    assert_eq!(statuses[2], (2, Ok(())));
    Ok(())
}
