//! Frame memory and ordered inference dispatch for analytics pipelines.

pub mod backend;
pub mod collection;
pub mod device;
pub mod dispatcher;
pub mod downstream;
pub mod error;
pub mod frame;
pub mod frame_info;
pub mod local_backend;
pub mod objects;
pub mod params;
pub mod plugin;
pub mod syncmem;

pub use dispatcher::InferenceDispatcher;
pub use frame::FrameRecord;
pub use frame_info::FrameInfo;
pub use syncmem::SyncedBuffer;
