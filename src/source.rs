use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use infer_bus::device::{CopyDirection, DeviceContext, MemoryLocation, MemoryOps};
use infer_bus::frame::{FrameDesc, FrameRecord, FrameSource, PixelFormat, SourceRelease};
use infer_bus::{FrameInfo, InferenceDispatcher};
use tokio_util::sync::CancellationToken;

/// Decoder stand-in: NV12 frames with a bright square moving across a dark
/// background, written to device memory the way a hardware decoder would.
pub struct SyntheticSource {
    stream_id: String,
    frames: u64,
    width: u32,
    height: u32,
    ctx: DeviceContext,
    ops: Arc<dyn MemoryOps>,
}

impl SyntheticSource {
    pub fn new(stream_id: &str, frames: u64, (width, height): (u32, u32), ops: Arc<dyn MemoryOps>) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            frames,
            width,
            height,
            ctx: DeviceContext::default(),
            ops,
        }
    }

    pub fn start(
        self,
        dispatcher: Arc<InferenceDispatcher>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::task::spawn_blocking(move || self.run(&dispatcher, &cancel))
    }

    fn run(&self, dispatcher: &InferenceDispatcher, cancel: &CancellationToken) -> anyhow::Result<()> {
        let produced = self.produce(dispatcher, cancel);
        if let Err(e) = &produced {
            log::error!("{}: producer failed: {:#}", self.stream_id, e);
            dispatcher.remove_stream(&self.stream_id);
        }
        // the consumer counts one eos per stream, send it even after a failure
        dispatcher.process(Arc::new(FrameInfo::eos(&self.stream_id)))?;
        log::info!("{}: producer done", self.stream_id);
        produced
    }

    fn produce(&self, dispatcher: &InferenceDispatcher, cancel: &CancellationToken) -> anyhow::Result<()> {
        for seq in 0..self.frames {
            if cancel.is_cancelled() {
                log::info!("{}: producer cancelled at frame {}", self.stream_id, seq);
                dispatcher.remove_stream(&self.stream_id);
                break;
            }
            let record = FrameRecord::new(
                FrameDesc::packed(seq, PixelFormat::Nv12, self.width, self.height),
                Arc::clone(&self.ops),
            );
            let source = self.decode(seq, &record)?;
            record.ingest(source, true);

            let info = FrameInfo::new(&self.stream_id, seq as i64).with_frame(Arc::new(record));
            dispatcher.process(Arc::new(info))?;
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    /// Renders frame `seq` into fresh device planes owned by the returned
    /// source; its release hook frees them.
    fn decode(&self, seq: u64, record: &FrameRecord) -> anyhow::Result<FrameSource> {
        let (w, h) = (self.width as usize, self.height as usize);
        let side = (w.min(h) / 4).max(1);
        let x0 = (seq as usize * 3) % w.saturating_sub(side).max(1);
        let y0 = (h - side) / 2;

        let mut luma = vec![16u8; record.plane_bytes(0)];
        for y in y0..y0 + side {
            luma[y * w + x0..y * w + x0 + side].fill(235);
        }
        let chroma = vec![128u8; record.plane_bytes(1)];

        let mut owned = DevicePlanes {
            ops: Arc::clone(&self.ops),
            ctx: self.ctx,
            planes: Vec::with_capacity(2),
        };
        for data in [&luma, &chroma] {
            let ptr = self.ops.alloc(data.len(), MemoryLocation::Device, self.ctx)?;
            owned.planes.push((ptr.as_ptr() as usize, data.len()));
            // SAFETY: ptr was just allocated for data.len() bytes and does not overlap data.
            unsafe {
                self.ops.copy(
                    ptr,
                    NonNull::from(data.as_slice()).cast::<u8>(),
                    data.len(),
                    CopyDirection::HostToDevice,
                    self.ctx,
                )?
            };
        }

        let planes = owned
            .planes
            .iter()
            .filter_map(|&(addr, _)| NonNull::new(addr as *mut u8))
            .collect();
        Ok(FrameSource::device(self.ctx, planes).with_release(SourceRelease::new(move || drop(owned))))
    }
}

/// Device allocations made by one decode, freed on drop.
struct DevicePlanes {
    ops: Arc<dyn MemoryOps>,
    ctx: DeviceContext,
    planes: Vec<(usize, usize)>,
}

impl Drop for DevicePlanes {
    fn drop(&mut self) {
        for &(addr, size) in &self.planes {
            if let Some(ptr) = NonNull::new(addr as *mut u8) {
                // SAFETY: allocated by decode() with this size; the frame released its planes first.
                unsafe { self.ops.free(ptr, size, MemoryLocation::Device, self.ctx) };
            }
        }
    }
}
