//! Frame data: planes of [`SyncedBuffer`] plus format and geometry.

use std::fmt::{Display, Formatter};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::device::{DeviceContext, MemoryLocation, MemoryOps};
use crate::error::{MemoryError, fatal};
use crate::syncmem::SyncedBuffer;

pub const MAX_PLANES: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Invalid,
    Bgr24,
    Rgb24,
    Nv12,
    Nv21,
}

impl PixelFormat {
    pub fn plane_count(&self) -> usize {
        match self {
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => 1,
            PixelFormat::Nv12 | PixelFormat::Nv21 => 2,
            PixelFormat::Invalid => 0,
        }
    }
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        let name = match self {
            PixelFormat::Invalid => "invalid",
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Nv21 => "nv21",
        };
        write!(f, "{}", name)
    }
}

/// Where the producer's original plane data lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceContext {
    pub location: MemoryLocation,
    pub device: DeviceContext,
}

impl Default for SourceContext {
    fn default() -> Self {
        Self {
            location: MemoryLocation::Host,
            device: DeviceContext::default(),
        }
    }
}

/// Scoped release hook for plane memory the frame does not own (e.g. a
/// decoder output buffer). Runs exactly once, when dropped.
pub struct SourceRelease(Option<Box<dyn FnOnce() + Send>>);

impl SourceRelease {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(release)))
    }
}

impl Drop for SourceRelease {
    fn drop(&mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

/// Producer-side plane pointers handed to [`FrameRecord::ingest`].
pub struct FrameSource {
    pub location: MemoryLocation,
    pub ctx: DeviceContext,
    pub planes: Vec<NonNull<u8>>,
    pub release: Option<SourceRelease>,
}

// SAFETY: the plane pointers are addresses owned by the producer, which
// keeps them alive until `release` runs.
unsafe impl Send for FrameSource {}

impl FrameSource {
    pub fn host(planes: Vec<NonNull<u8>>) -> Self {
        Self {
            location: MemoryLocation::Host,
            ctx: DeviceContext::default(),
            planes,
            release: None,
        }
    }

    pub fn device(ctx: DeviceContext, planes: Vec<NonNull<u8>>) -> Self {
        Self {
            location: MemoryLocation::Device,
            ctx,
            planes,
            release: None,
        }
    }

    pub fn with_release(mut self, release: SourceRelease) -> Self {
        self.release = Some(release);
        self
    }
}

/// Static description of a frame's geometry.
#[derive(Clone, Debug)]
pub struct FrameDesc {
    pub frame_id: u64,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Per-plane stride in pixels.
    pub strides: Vec<u32>,
    /// Device that downstream stages want the planes on, if any.
    pub dst_device_id: Option<i32>,
}

impl FrameDesc {
    /// Tightly packed strides (stride == width on every plane).
    pub fn packed(frame_id: u64, format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            frame_id,
            format,
            width,
            height,
            strides: vec![width; format.plane_count()],
            dst_device_id: None,
        }
    }

    pub fn with_dst_device(mut self, device_id: i32) -> Self {
        self.dst_device_id = Some(device_id);
        self
    }
}

/// Interleaved BGR24 view of a frame, tightly packed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DerivedImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl DerivedImage {
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }
}

pub struct FrameRecord {
    frame_id: u64,
    format: PixelFormat,
    width: u32,
    height: u32,
    strides: [u32; MAX_PLANES],
    dst_device_id: AtomicI32,
    // planes are declared before `release` so adopted memory outlives them
    planes: RwLock<Vec<Arc<SyncedBuffer>>>,
    derived: Mutex<Option<Arc<DerivedImage>>>,
    source: Mutex<SourceContext>,
    release: Mutex<Option<SourceRelease>>,
    ops: Arc<dyn MemoryOps>,
}

impl FrameRecord {
    pub fn new(desc: FrameDesc, ops: Arc<dyn MemoryOps>) -> Self {
        let mut strides = [0u32; MAX_PLANES];
        for (slot, stride) in strides.iter_mut().zip(desc.strides.iter()) {
            *slot = *stride;
        }
        Self {
            frame_id: desc.frame_id,
            format: desc.format,
            width: desc.width,
            height: desc.height,
            strides,
            dst_device_id: AtomicI32::new(desc.dst_device_id.unwrap_or(-1)),
            planes: RwLock::new(Vec::new()),
            derived: Mutex::new(None),
            source: Mutex::new(SourceContext::default()),
            release: Mutex::new(None),
            ops,
        }
    }

    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self, plane: usize) -> u32 {
        self.strides.get(plane).copied().unwrap_or(0)
    }

    pub fn dst_device_id(&self) -> Option<i32> {
        let id = self.dst_device_id.load(Ordering::Acquire);
        (id >= 0).then_some(id)
    }

    pub fn source(&self) -> SourceContext {
        *lock(&self.source)
    }

    /// Device context of the source planes.
    pub fn ctx(&self) -> DeviceContext {
        lock(&self.source).device
    }

    pub fn plane_count(&self) -> usize {
        self.format.plane_count()
    }

    pub fn plane_bytes(&self, plane: usize) -> usize {
        if plane >= self.plane_count() {
            return 0;
        }
        let height = self.height as usize;
        let stride = self.strides[plane] as usize;
        match self.format {
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => height * stride * 3,
            PixelFormat::Nv12 | PixelFormat::Nv21 => {
                if plane == 0 {
                    height * stride
                } else {
                    (height * stride).div_ceil(2)
                }
            }
            PixelFormat::Invalid => 0,
        }
    }

    pub fn total_bytes(&self) -> usize {
        (0..self.plane_count()).map(|i| self.plane_bytes(i)).sum()
    }

    /// Plane `index`. Panics when out of range.
    pub fn plane(&self, index: usize) -> Arc<SyncedBuffer> {
        let planes = self.planes.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&planes[index])
    }

    pub fn planes(&self) -> Vec<Arc<SyncedBuffer>> {
        self.planes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Creates empty planes pinned to the destination device (or device 0);
    /// the producer then writes them through the buffer accessors.
    pub fn allocate_planes(&self) {
        self.check_format("allocate_planes");
        let ctx = DeviceContext::new(self.dst_device_id().unwrap_or(0), -1);
        let planes = (0..self.plane_count())
            .map(|i| Arc::new(SyncedBuffer::with_context(self.plane_bytes(i), ctx, Arc::clone(&self.ops))))
            .collect();
        self.replace_planes(planes);
    }

    /// Builds the planes from producer memory.
    ///
    /// | source | wanted | action |
    /// |---|---|---|
    /// | device | device | adopt, zero-copy |
    /// | device | host | allocate + copy device->host |
    /// | host | device | allocate + copy host->device |
    /// | host | host | allocate + copy host->host |
    ///
    /// Planes never own the source pointers. After a deep copy the source
    /// release hook runs right away; for zero-copy it runs when the frame
    /// drops.
    pub fn ingest(&self, source: FrameSource, want_device: bool) {
        self.check_format("ingest");
        let count = self.plane_count();
        if source.planes.len() < count {
            fatal(MemoryError::Configuration(format!(
                "frame {}: {} needs {} planes, source has {}",
                self.frame_id,
                self.format,
                count,
                source.planes.len()
            )));
        }
        *lock(&self.source) = SourceContext {
            location: source.location,
            device: source.ctx,
        };

        let dst_device = self
            .ingest_destination(&source, want_device)
            .unwrap_or_else(|e| fatal(e));

        let mut planes = Vec::with_capacity(count);
        let zero_copy = source.location == MemoryLocation::Device && want_device;
        for (i, src) in source.planes.iter().take(count).enumerate() {
            let bytes = self.plane_bytes(i);
            let buffer = if zero_copy {
                let buffer = SyncedBuffer::with_context(bytes, source.ctx, Arc::clone(&self.ops));
                // SAFETY: the producer keeps the plane alive until `release`
                // runs, which happens after the planes are dropped.
                unsafe { buffer.set_device_data(*src) };
                buffer
            } else {
                let ctx = DeviceContext::new(dst_device, -1);
                let buffer = SyncedBuffer::with_context(bytes, ctx, Arc::clone(&self.ops));
                let dst = if want_device {
                    MemoryLocation::Device
                } else {
                    MemoryLocation::Host
                };
                // SAFETY: the producer guarantees each plane holds plane_bytes(i).
                unsafe { buffer.load_from(*src, source.location, dst, source.ctx) };
                buffer
            };
            planes.push(Arc::new(buffer));
        }

        self.replace_planes(planes);
        if zero_copy {
            self.dst_device_id.store(source.ctx.device_id, Ordering::Release);
            *lock(&self.release) = source.release;
        } else {
            if want_device {
                self.dst_device_id.store(dst_device, Ordering::Release);
            }
            // deep copy done, the producer buffer can go back
            drop(source.release);
        }
    }

    /// Pins every plane to `device_id` without moving data.
    pub fn set_device_context_all(&self, device_id: i32) {
        for plane in self.planes() {
            plane.set_device_context(device_id, -1);
        }
        self.dst_device_id.store(device_id, Ordering::Release);
    }

    /// Moves all planes to another accelerator and updates the destination
    /// marker.
    pub fn retarget_device(&self, device_id: i32) {
        self.check_format("retarget_device");
        if let Err(e) = self.ops.check_device(device_id) {
            fatal(e);
        }
        {
            let mut planes = self.planes.write().unwrap_or_else(PoisonError::into_inner);
            let moved: Vec<_> = planes
                .iter()
                .map(|plane| {
                    let ctx = DeviceContext::new(device_id, plane.channel());
                    Arc::new(plane.clone_to_device(ctx))
                })
                .collect();
            *planes = moved;
        }
        {
            let mut source = lock(&self.source);
            if source.location == MemoryLocation::Device {
                source.device.device_id = device_id;
            }
        }
        self.dst_device_id.store(device_id, Ordering::Release);
        self.invalidate_derived();
    }

    /// Cached interleaved BGR24 view, computed on first use.
    pub fn derived_image(&self) -> Arc<DerivedImage> {
        let mut derived = lock(&self.derived);
        if let Some(image) = derived.as_ref() {
            return Arc::clone(image);
        }
        self.check_format("derived_image");
        let planes = self.planes();
        if planes.len() < self.plane_count() {
            fatal(MemoryError::Configuration(format!(
                "frame {}: derived image requested before planes exist",
                self.frame_id
            )));
        }
        let image = Arc::new(self.convert_to_bgr(&planes));
        *derived = Some(Arc::clone(&image));
        image
    }

    pub fn invalidate_derived(&self) {
        lock(&self.derived).take();
    }

    fn replace_planes(&self, planes: Vec<Arc<SyncedBuffer>>) {
        *self.planes.write().unwrap_or_else(PoisonError::into_inner) = planes;
        self.invalidate_derived();
    }

    fn check_format(&self, op: &str) {
        if let Err(e) = self.validate_format(op) {
            fatal(e);
        }
    }

    fn validate_format(&self, op: &str) -> Result<(), MemoryError> {
        if self.format == PixelFormat::Invalid {
            return Err(MemoryError::Configuration(format!(
                "frame {}: {} on a frame with invalid pixel format",
                self.frame_id, op
            )));
        }
        Ok(())
    }

    /// Device the deep copies of `ingest` land on.
    fn ingest_destination(&self, source: &FrameSource, want_device: bool) -> Result<i32, MemoryError> {
        match (source.location, self.dst_device_id()) {
            (_, Some(id)) => Ok(id),
            (MemoryLocation::Device, None) => Ok(source.ctx.device_id),
            (MemoryLocation::Host, None) if want_device => Err(MemoryError::Configuration(format!(
                "frame {}: host source needs a destination device to upload to",
                self.frame_id
            ))),
            (MemoryLocation::Host, None) => Ok(0),
        }
    }

    fn convert_to_bgr(&self, planes: &[Arc<SyncedBuffer>]) -> DerivedImage {
        let width = self.width as usize;
        let height = self.height as usize;
        let mut bgr = Vec::with_capacity(width * height * 3);
        match self.format {
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => {
                let swap = self.format == PixelFormat::Rgb24;
                let pitch = self.strides[0] as usize * 3;
                planes[0].with_host(|data| {
                    for row in 0..height {
                        let line = &data[row * pitch..row * pitch + width * 3];
                        for px in line.chunks_exact(3) {
                            if swap {
                                bgr.extend_from_slice(&[px[2], px[1], px[0]]);
                            } else {
                                bgr.extend_from_slice(px);
                            }
                        }
                    }
                });
            }
            PixelFormat::Nv12 | PixelFormat::Nv21 => {
                let y_plane = planes[0].read_host();
                let uv_plane = planes[1].read_host();
                let y_pitch = self.strides[0] as usize;
                let uv_pitch = self.strides[1] as usize;
                let uv_rows = if uv_pitch == 0 { 0 } else { uv_plane.len() / uv_pitch };
                let (u_off, v_off) = if self.format == PixelFormat::Nv12 { (0, 1) } else { (1, 0) };
                for j in 0..height {
                    let uv_row = (j / 2).min(uv_rows.saturating_sub(1));
                    for i in 0..width {
                        let y = y_plane[j * y_pitch + i] as f32;
                        let uv_idx = uv_row * uv_pitch + (i / 2) * 2;
                        let (u, v) = if uv_idx + 1 < uv_plane.len() {
                            (
                                uv_plane[uv_idx + u_off] as f32 - 128.0,
                                uv_plane[uv_idx + v_off] as f32 - 128.0,
                            )
                        } else {
                            (0.0, 0.0)
                        };

                        // BT.601
                        let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
                        let g = (y - 0.344136 * u - 0.714136 * v).clamp(0.0, 255.0) as u8;
                        let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
                        bgr.extend_from_slice(&[b, g, r]);
                    }
                }
            }
            PixelFormat::Invalid => fatal(MemoryError::Configuration(format!(
                "frame {}: unsupported pixel format {}",
                self.frame_id, self.format
            ))),
        }
        DerivedImage {
            width: self.width,
            height: self.height,
            data: bgr,
        }
    }
}

impl Display for FrameRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "FrameRecord id: {}, format: {}, width: {}, height: {}, planes: {}, dst_device: {:?}",
            self.frame_id,
            self.format,
            self.width,
            self.height,
            self.plane_count(),
            self.dst_device_id()
        )
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "frame_test.rs"]
mod frame_test;
