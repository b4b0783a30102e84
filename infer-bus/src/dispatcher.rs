//! Ordered inference dispatch.
//!
//! Every non-EOS frame becomes exactly one backend request, so the backend's
//! per-tag FIFO completion order is also the frame order. Frames that are
//! sampled out or filtered still go through as empty requests.
//!
//! Lock order: the stream map lock is never held while touching frame
//! buffers, plugins, the backend or the downstream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use crate::backend::{
    CompletionObserver, InferBackend, InferRequest, InferResponse, InferSession, PlaneInput,
    Target, UserData, VideoInput,
};
use crate::device::MemoryLocation;
use crate::downstream::Downstream;
use crate::error::{DispatchError, SubmitError};
use crate::frame::FrameRecord;
use crate::frame_info::FrameInfo;
use crate::objects::InferObject;
use crate::params::InferParams;
use crate::plugin::{FrameFilter, ObjFilter, Postproc, frame_filters, obj_filters, postprocs};

#[derive(Debug)]
struct StreamDispatchContext {
    // identifies this life of the stream id; completions of an earlier
    // context with the same id never touch this one
    epoch: u64,
    drop_count: u32,
    pending: usize,
    // completions currently inside `Downstream::forward`
    forwarding: usize,
    removed: bool,
}

impl StreamDispatchContext {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            drop_count: 0,
            pending: 0,
            forwarding: 0,
            removed: false,
        }
    }
}

/// Routing record carried through the backend as opaque user data.
struct InFlight {
    info: Arc<FrameInfo>,
    epoch: u64,
    // object per target index, `None` for whole-frame targets
    objects: Vec<Option<Arc<InferObject>>>,
    claimed: Vec<AtomicBool>,
    remaining: AtomicUsize,
    forwarded: AtomicBool,
}

impl InFlight {
    fn new(info: Arc<FrameInfo>, epoch: u64, objects: Vec<Option<Arc<InferObject>>>) -> Self {
        let targets = objects.len();
        Self {
            info,
            epoch,
            objects,
            claimed: (0..targets).map(|_| AtomicBool::new(false)).collect(),
            remaining: AtomicUsize::new(targets),
            forwarded: AtomicBool::new(false),
        }
    }

    /// Marks target `index` done; false if it was done already.
    fn claim(&self, index: usize) -> bool {
        match self.claimed.get(index) {
            Some(flag) => !flag.swap(true, Ordering::AcqRel),
            None => false,
        }
    }
}

struct ObserverBridge(Weak<InferenceDispatcher>);

impl CompletionObserver for ObserverBridge {
    fn on_complete(&self, response: InferResponse) {
        match self.0.upgrade() {
            Some(dispatcher) => dispatcher.on_complete(response),
            None => log::debug!("dispatcher gone, drop response {}", response.request_id),
        }
    }
}

pub struct InferenceDispatcher {
    name: String,
    params: InferParams,
    frame_filter: Option<Box<dyn FrameFilter>>,
    obj_filter: Option<Box<dyn ObjFilter>>,
    postproc: Box<dyn Postproc>,
    downstream: Arc<dyn Downstream>,
    session: OnceLock<Arc<dyn InferSession>>,
    streams: Mutex<HashMap<String, StreamDispatchContext>>,
    drained: Condvar,
    closed: AtomicBool,
    next_request_id: AtomicU64,
    next_epoch: AtomicU64,
}

impl InferenceDispatcher {
    /// Builds the plugins named in `params` and opens a backend session.
    pub fn open(
        params: InferParams,
        backend: &dyn InferBackend,
        downstream: Arc<dyn Downstream>,
    ) -> Result<Arc<Self>, DispatchError> {
        let config_err = |e: anyhow::Error| DispatchError::Configuration(format!("{:#}", e));

        let mut postproc = postprocs()
            .create(&params.postproc_name, &params.custom_postproc_params)
            .map_err(config_err)?;
        postproc.set_threshold(params.threshold);
        let frame_filter = params
            .frame_filter_name
            .as_deref()
            .map(|name| frame_filters().create(name, &params.custom_filter_params))
            .transpose()
            .map_err(config_err)?;
        let obj_filter = params
            .obj_filter_name
            .as_deref()
            .map(|name| obj_filters().create(name, &params.custom_filter_params))
            .transpose()
            .map_err(config_err)?;

        let dispatcher = Arc::new(Self {
            name: params.name.clone(),
            frame_filter,
            obj_filter,
            postproc,
            downstream,
            session: OnceLock::new(),
            streams: Mutex::new(HashMap::new()),
            drained: Condvar::new(),
            closed: AtomicBool::new(false),
            next_request_id: AtomicU64::new(0),
            next_epoch: AtomicU64::new(0),
            params,
        });

        let observer = Arc::new(ObserverBridge(Arc::downgrade(&dispatcher)));
        let session = backend
            .open_session(dispatcher.params.session_desc(), observer)
            .map_err(|e| DispatchError::Configuration(format!("open session: {:#}", e)))?;
        let _ = dispatcher.session.set(session);
        log::info!(
            "{}: dispatcher open, device: {}, interval: {}, postproc: {}, object infer: {}",
            dispatcher.name,
            dispatcher.params.device_id,
            dispatcher.params.infer_interval,
            dispatcher.params.postproc_name,
            dispatcher.params.object_infer
        );
        Ok(dispatcher)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Feeds one frame. Blocks on EOS until the stream has drained.
    pub fn process(&self, info: Arc<FrameInfo>) -> Result<(), DispatchError> {
        if info.is_eos() {
            self.drain_stream(&info.stream_id);
            self.downstream.forward(info);
            return Ok(());
        }

        let (record, session, epoch, real) = {
            let mut streams = self.lock_streams();
            if streams.get(&info.stream_id).is_some_and(|ctx| ctx.removed) {
                return Ok(());
            }
            let record = info.frame()?;
            let session = self.session()?;
            let ctx = streams
                .entry(info.stream_id.clone())
                .or_insert_with(|| self.new_context());
            let interval = self.params.infer_interval.max(1);
            let real = ctx.drop_count % interval == 0;
            ctx.drop_count = (ctx.drop_count + 1) % interval;
            ctx.pending += 1;
            (record, session, ctx.epoch, real)
        };

        let result = self
            .build_request(&info, &record, epoch, real)
            .and_then(|request| session.submit(request).map_err(DispatchError::from));
        if let Err(e) = result {
            log::error!("{}: submit frame of {} failed: {:#}", self.name, info.stream_id, e);
            self.release_pending(&info.stream_id, epoch, false);
            return Err(e);
        }
        Ok(())
    }

    /// Stops a stream: later frames are dropped, in-flight work is discarded
    /// and a waiting EOS returns as soon as no forward is under way.
    pub fn remove_stream(&self, stream_id: &str) {
        {
            let mut streams = self.lock_streams();
            let ctx = streams
                .entry(stream_id.to_string())
                .or_insert_with(|| self.new_context());
            ctx.removed = true;
            ctx.pending = 0;
        }
        self.drained.notify_all();
        if let Some(session) = self.session.get() {
            session.discard_pending(stream_id);
        }
        log::info!("{}: stream {} removed", self.name, stream_id);
    }

    pub fn pending(&self, stream_id: &str) -> Option<usize> {
        self.lock_streams().get(stream_id).map(|ctx| ctx.pending)
    }

    pub fn has_stream(&self, stream_id: &str) -> bool {
        self.lock_streams().contains_key(stream_id)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(session) = self.session.get() {
            session.close();
        }
        self.drained.notify_all();
        log::info!("{}: dispatcher closed", self.name);
    }

    fn session(&self) -> Result<&Arc<dyn InferSession>, DispatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SubmitError::SessionClosed.into());
        }
        self.session
            .get()
            .ok_or_else(|| DispatchError::Configuration("backend session is not open".to_string()))
    }

    fn new_context(&self) -> StreamDispatchContext {
        StreamDispatchContext::new(self.next_epoch.fetch_add(1, Ordering::Relaxed))
    }

    fn lock_streams(&self) -> MutexGuard<'_, HashMap<String, StreamDispatchContext>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drain_stream(&self, stream_id: &str) {
        let mut streams = self.lock_streams();
        let Some(ctx) = streams.get(stream_id) else {
            return;
        };
        if !ctx.removed {
            log::debug!("{}: {} eos, wait {} pending", self.name, stream_id, ctx.pending);
        }
        loop {
            let closed = self.closed.load(Ordering::Acquire);
            match streams.get(stream_id) {
                Some(ctx) if ctx.forwarding > 0 || (ctx.pending > 0 && !ctx.removed && !closed) => {
                    streams = self
                        .drained
                        .wait(streams)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                _ => break,
            }
        }
        let removed = streams.remove(stream_id).is_some_and(|ctx| ctx.removed);
        drop(streams);

        if removed {
            if let Some(session) = self.session.get() {
                session.discard_pending(stream_id);
            }
        }
        log::info!("{}: stream {} eos", self.name, stream_id);
    }

    /// Settles one submission of context `epoch`; `forwarded` also ends
    /// the forward it started in `finish`.
    fn release_pending(&self, stream_id: &str, epoch: u64, forwarded: bool) {
        let mut streams = self.lock_streams();
        let Some(ctx) = streams.get_mut(stream_id).filter(|ctx| ctx.epoch == epoch) else {
            return;
        };
        if forwarded {
            ctx.forwarding = ctx.forwarding.saturating_sub(1);
        }
        if !ctx.removed {
            ctx.pending = ctx.pending.saturating_sub(1);
        }
        if ctx.pending == 0 || ctx.forwarding == 0 {
            self.drained.notify_all();
        }
    }

    /// Moves the frame onto the dispatcher's device.
    fn place(&self, record: &FrameRecord) {
        let device_id = self.params.device_id;
        match record.dst_device_id() {
            None => record.set_device_context_all(device_id),
            Some(id) if id != device_id => {
                log::debug!(
                    "{}: frame {} moves from device {} to {}",
                    self.name,
                    record.frame_id(),
                    id,
                    device_id
                );
                record.retarget_device(device_id);
            }
            Some(_) => {}
        }
    }

    fn build_request(
        &self,
        info: &Arc<FrameInfo>,
        record: &Arc<FrameRecord>,
        epoch: u64,
        real: bool,
    ) -> Result<InferRequest, DispatchError> {
        let mut objects = Vec::new();
        if real && self.frame_filter.as_ref().is_none_or(|f| f.filter(info)) {
            if self.params.object_infer {
                for object in info.objects()?.snapshot() {
                    if self.obj_filter.as_ref().is_none_or(|f| f.filter(info, &object)) {
                        objects.push(Some(object));
                    }
                }
            } else {
                objects.push(None);
            }
        }

        let targets: Vec<Target> = objects
            .iter()
            .enumerate()
            .map(|(index, object)| Target {
                index,
                roi: object.as_ref().map(|o| o.bbox),
            })
            .collect();
        let input = if targets.is_empty() {
            None
        } else {
            self.place(record);
            Some(self.video_input(record))
        };

        let user_data: UserData = Arc::new(InFlight::new(Arc::clone(info), epoch, objects));
        Ok(InferRequest {
            id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
            stream_tag: info.stream_id.clone(),
            input,
            targets,
            user_data,
        })
    }

    fn video_input(&self, record: &Arc<FrameRecord>) -> VideoInput {
        let location = if self.params.preproc_on_device {
            MemoryLocation::Device
        } else {
            MemoryLocation::Host
        };
        let planes = (0..record.plane_count())
            .map(|i| {
                let buffer = record.plane(i);
                match location {
                    MemoryLocation::Device => buffer.mutable_device_data(),
                    MemoryLocation::Host => buffer.mutable_host_data(),
                };
                PlaneInput {
                    buffer,
                    location,
                    stride: record.stride(i),
                    bytes: record.plane_bytes(i),
                    owner: Arc::clone(record) as UserData,
                }
            })
            .collect();
        VideoInput {
            format: record.format(),
            width: record.width(),
            height: record.height(),
            planes,
        }
    }

    fn on_complete(&self, response: InferResponse) {
        let inflight = match response.user_data.downcast::<InFlight>() {
            Ok(inflight) => inflight,
            Err(_) => {
                log::error!(
                    "{}: response {} carries foreign user data, dropped",
                    self.name,
                    response.request_id
                );
                return;
            }
        };
        let stream_id = &inflight.info.stream_id;

        let mut completed = 0;
        for output in response.outputs {
            if !inflight.claim(output.index) {
                log::warn!(
                    "{}: {} request {} reports target {} twice or out of range",
                    self.name,
                    stream_id,
                    response.request_id,
                    output.index
                );
                continue;
            }
            completed += 1;
            match output.result {
                Ok(model_output) => {
                    let object = inflight.objects[output.index].as_ref();
                    if let Err(e) = self.postproc.execute(&model_output, &inflight.info, object) {
                        log::warn!("{}: {} postproc failed: {:#}", self.name, stream_id, e);
                    }
                }
                Err(e) => {
                    log::warn!(
                        "{}: {} target {} has no result: {:#}",
                        self.name,
                        stream_id,
                        output.index,
                        e
                    );
                }
            }
        }
        if let Err(e) = &response.status {
            log::warn!("{}: {} request {} failed: {:#}", self.name, stream_id, response.request_id, e);
            completed += (0..inflight.claimed.len())
                .filter(|index| inflight.claim(*index))
                .count();
        }

        let remaining = if completed > 0 {
            inflight.remaining.fetch_sub(completed, Ordering::AcqRel) - completed
        } else {
            inflight.remaining.load(Ordering::Acquire)
        };
        if remaining == 0 && !inflight.forwarded.swap(true, Ordering::AcqRel) {
            self.finish(&inflight);
        }
    }

    fn finish(&self, inflight: &InFlight) {
        let stream_id = &inflight.info.stream_id;
        let live = {
            let mut streams = self.lock_streams();
            match streams.get_mut(stream_id) {
                Some(ctx) if ctx.epoch == inflight.epoch && !ctx.removed => {
                    // a racing EOS waits for this forward before it goes out
                    ctx.forwarding += 1;
                    true
                }
                _ => false,
            }
        };
        if live {
            self.downstream.forward(Arc::clone(&inflight.info));
        } else {
            log::debug!("{}: {} is gone, drop completed frame", self.name, stream_id);
        }
        self.release_pending(stream_id, inflight.epoch, live);
    }
}

impl Drop for InferenceDispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[path = "dispatcher_test.rs"]
mod dispatcher_test;
