use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::collection::{Collection, FRAME_TAG, OBJECTS_TAG};
use crate::error::CollectionError;
use crate::frame::FrameRecord;
use crate::objects::InferObjects;

/// The unit that travels between pipeline stages.
#[derive(Debug)]
pub struct FrameInfo {
    pub stream_id: String,
    pub timestamp: i64,
    eos: bool,
    pub collection: Collection,
}

impl FrameInfo {
    pub fn new(stream_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            stream_id: stream_id.into(),
            timestamp,
            eos: false,
            collection: Collection::new(),
        }
    }

    /// End-of-stream marker.
    pub fn eos(stream_id: impl Into<String>) -> Self {
        Self {
            eos: true,
            ..Self::new(stream_id, -1)
        }
    }

    /// Attaches `frame` and an empty result container.
    pub fn with_frame(self, frame: Arc<FrameRecord>) -> Self {
        self.collection.add_shared(FRAME_TAG, frame);
        self.collection.add(OBJECTS_TAG, InferObjects::new());
        self
    }

    pub fn is_eos(&self) -> bool {
        self.eos
    }

    pub fn frame(&self) -> Result<Arc<FrameRecord>, CollectionError> {
        self.collection.get::<FrameRecord>(FRAME_TAG)
    }

    pub fn objects(&self) -> Result<Arc<InferObjects>, CollectionError> {
        self.collection.get::<InferObjects>(OBJECTS_TAG)
    }
}

impl Display for FrameInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        if self.eos {
            return write!(f, "FrameInfo stream: {}, eos", self.stream_id);
        }
        write!(f, "FrameInfo stream: {}, timestamp: {}", self.stream_id, self.timestamp)
    }
}
