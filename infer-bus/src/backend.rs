//! Contract between the dispatcher and an asynchronous inference backend.
//!
//! Requests are submitted per stream tag. A backend must deliver the
//! completions of one tag in submission order; completions of different tags
//! may interleave freely and may arrive on any thread.

use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::device::MemoryLocation;
use crate::error::{BackendError, SubmitError};
use crate::frame::PixelFormat;
use crate::objects::BoundingBox;
use crate::syncmem::SyncedBuffer;

/// Opaque routing data; the backend hands it back untouched.
pub type UserData = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStrategy {
    #[default]
    Dynamic,
    Static,
}

#[derive(Clone, Debug)]
pub struct SessionDesc {
    pub name: String,
    pub device_id: i32,
    pub batch_strategy: BatchStrategy,
    pub batch_timeout_ms: u64,
    pub priority: i32,
    pub engine_num: u32,
    pub preproc_on_device: bool,
}

/// One unit of inference work: the whole frame, or a region of it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Target {
    pub index: usize,
    pub roi: Option<BoundingBox>,
}

/// A frame plane prepared on `location` for preprocessing.
#[derive(Clone)]
pub struct PlaneInput {
    pub buffer: Arc<SyncedBuffer>,
    pub location: MemoryLocation,
    pub stride: u32,
    pub bytes: usize,
    // keeps adopted producer memory behind `buffer` alive
    pub owner: UserData,
}

impl Debug for PlaneInput {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("PlaneInput")
            .field("buffer", &self.buffer)
            .field("location", &self.location)
            .field("stride", &self.stride)
            .field("bytes", &self.bytes)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct VideoInput {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<PlaneInput>,
}

pub struct InferRequest {
    pub id: u64,
    pub stream_tag: String,
    /// `None` for empty requests.
    pub input: Option<VideoInput>,
    pub targets: Vec<Target>,
    pub user_data: UserData,
}

impl InferRequest {
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl Debug for InferRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("InferRequest")
            .field("id", &self.id)
            .field("stream_tag", &self.stream_tag)
            .field("input", &self.input)
            .field("targets", &self.targets)
            .finish_non_exhaustive()
    }
}

/// Raw model output tensor, little-endian `f32` values.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Bytes,
}

impl Tensor {
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Self {
        let mut data = BytesMut::with_capacity(values.len() * 4);
        for v in values {
            data.put_f32_le(*v);
        }
        Self {
            shape,
            data: data.freeze(),
        }
    }

    pub fn to_f32(&self) -> Vec<f32> {
        self.data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelOutput {
    pub tensors: Vec<Tensor>,
}

#[derive(Clone, Debug)]
pub struct TargetOutput {
    pub index: usize,
    pub result: Result<ModelOutput, BackendError>,
}

pub struct InferResponse {
    pub request_id: u64,
    pub stream_tag: String,
    /// Request-level status; an error here fails every target not listed in
    /// `outputs`.
    pub status: Result<(), BackendError>,
    /// May cover a subset of the request's targets.
    pub outputs: Vec<TargetOutput>,
    pub user_data: UserData,
}

impl Debug for InferResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("InferResponse")
            .field("request_id", &self.request_id)
            .field("stream_tag", &self.stream_tag)
            .field("status", &self.status)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

pub trait CompletionObserver: Send + Sync {
    fn on_complete(&self, response: InferResponse);
}

pub trait InferSession: Send + Sync {
    fn submit(&self, request: InferRequest) -> Result<(), SubmitError>;

    /// Blocks until every request of `tag` has completed.
    fn wait_drain(&self, tag: &str);

    /// Drops queued and running requests of `tag` without completing them.
    fn discard_pending(&self, tag: &str);

    fn close(&self);
}

pub trait InferBackend: Send + Sync {
    fn open_session(
        &self,
        desc: SessionDesc,
        observer: Arc<dyn CompletionObserver>,
    ) -> anyhow::Result<Arc<dyn InferSession>>;
}
