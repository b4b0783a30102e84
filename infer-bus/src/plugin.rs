//! Filter and postprocessor plugins, looked up by name.
//!
//! Each role has one trait and a process-wide [`Registry`] of factories.
//! Registries are created on first access with the built-in plugins already
//! registered; more can be added at startup with [`Registry::register`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use crate::backend::ModelOutput;
use crate::frame_info::FrameInfo;
use crate::objects::{Attribute, BoundingBox, InferObject};
use crate::params::PluginParams;

pub trait FrameFilter: Send + Sync {
    /// `false` skips inference for the frame.
    fn filter(&self, frame: &FrameInfo) -> bool;
}

pub trait ObjFilter: Send + Sync {
    /// `false` skips inference for the object.
    fn filter(&self, frame: &FrameInfo, object: &InferObject) -> bool;
}

pub trait Postproc: Send + Sync {
    fn set_threshold(&mut self, _threshold: f32) {}

    /// Attaches `output` to the frame, or to `object` for object inference.
    fn execute(
        &self,
        output: &ModelOutput,
        frame: &FrameInfo,
        object: Option<&Arc<InferObject>>,
    ) -> anyhow::Result<()>;
}

pub type Factory<T> = Arc<dyn Fn(&PluginParams) -> anyhow::Result<Box<T>> + Send + Sync>;

pub struct Registry<T: ?Sized> {
    kind: &'static str,
    factories: RwLock<HashMap<String, Factory<T>>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            factories: RwLock::new(HashMap::new()),
        }
    }

    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn(&PluginParams) -> anyhow::Result<Box<T>> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write().unwrap_or_else(PoisonError::into_inner);
        if factories.insert(name.to_string(), Arc::new(factory)).is_some() {
            log::warn!("{} `{}` registered twice, keeping the latest", self.kind, name);
        }
    }

    pub fn create(&self, name: &str, params: &PluginParams) -> anyhow::Result<Box<T>> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("{} `{}` is not registered", self.kind, name))?;
        factory(params)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

pub fn frame_filters() -> &'static Registry<dyn FrameFilter> {
    static REGISTRY: LazyLock<Registry<dyn FrameFilter>> = LazyLock::new(|| {
        let registry: Registry<dyn FrameFilter> = Registry::new("frame filter");
        registry.register("min_size", |p| Ok(Box::new(MinSizeFilter::from_params(p)?)));
        registry.register("stream_allowlist", |p| Ok(Box::new(StreamAllowlist::from_params(p))));
        registry
    });
    &REGISTRY
}

pub fn obj_filters() -> &'static Registry<dyn ObjFilter> {
    static REGISTRY: LazyLock<Registry<dyn ObjFilter>> = LazyLock::new(|| {
        let registry: Registry<dyn ObjFilter> = Registry::new("object filter");
        registry.register("min_score", |p| Ok(Box::new(MinScoreFilter::from_params(p)?)));
        registry.register("labels", |p| Ok(Box::new(LabelFilter::from_params(p)?)));
        registry
    });
    &REGISTRY
}

pub fn postprocs() -> &'static Registry<dyn Postproc> {
    static REGISTRY: LazyLock<Registry<dyn Postproc>> = LazyLock::new(|| {
        let registry: Registry<dyn Postproc> = Registry::new("postproc");
        registry.register("detection", |_| Ok(Box::new(DetectionPostproc::default())));
        registry.register("classification", |_| Ok(Box::new(ClassificationPostproc::default())));
        registry
    });
    &REGISTRY
}

fn parse_param<V: std::str::FromStr>(params: &PluginParams, key: &str, default: V) -> anyhow::Result<V>
where
    V::Err: std::fmt::Display,
{
    match params.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("bad value `{}` for `{}`: {}", raw, key, e)),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Keeps frames of at least `min_width` x `min_height` pixels.
pub struct MinSizeFilter {
    min_width: u32,
    min_height: u32,
}

impl MinSizeFilter {
    pub fn from_params(params: &PluginParams) -> anyhow::Result<Self> {
        Ok(Self {
            min_width: parse_param(params, "min_width", 0)?,
            min_height: parse_param(params, "min_height", 0)?,
        })
    }
}

impl FrameFilter for MinSizeFilter {
    fn filter(&self, frame: &FrameInfo) -> bool {
        match frame.frame() {
            Ok(record) => record.width() >= self.min_width && record.height() >= self.min_height,
            Err(_) => false,
        }
    }
}

/// Keeps frames whose stream id is listed in `streams`.
pub struct StreamAllowlist {
    streams: HashSet<String>,
}

impl StreamAllowlist {
    pub fn from_params(params: &PluginParams) -> Self {
        let streams = params
            .get("streams")
            .map(|raw| split_list(raw).map(str::to_string).collect())
            .unwrap_or_default();
        Self { streams }
    }
}

impl FrameFilter for StreamAllowlist {
    fn filter(&self, frame: &FrameInfo) -> bool {
        self.streams.contains(&frame.stream_id)
    }
}

pub struct MinScoreFilter {
    score: f32,
}

impl MinScoreFilter {
    pub fn from_params(params: &PluginParams) -> anyhow::Result<Self> {
        Ok(Self {
            score: parse_param(params, "score", 0.5)?,
        })
    }
}

impl ObjFilter for MinScoreFilter {
    fn filter(&self, _frame: &FrameInfo, object: &InferObject) -> bool {
        object.score >= self.score
    }
}

/// Keeps objects whose label is listed in `labels`.
pub struct LabelFilter {
    labels: HashSet<i32>,
}

impl LabelFilter {
    pub fn from_params(params: &PluginParams) -> anyhow::Result<Self> {
        let mut labels = HashSet::new();
        if let Some(raw) = params.get("labels") {
            for label in split_list(raw) {
                labels.insert(
                    label
                        .parse()
                        .map_err(|e| anyhow::anyhow!("bad label `{}`: {}", label, e))?,
                );
            }
        }
        Ok(Self { labels })
    }
}

impl ObjFilter for LabelFilter {
    fn filter(&self, _frame: &FrameInfo, object: &InferObject) -> bool {
        self.labels.contains(&object.label)
    }
}

/// Detection rows of `[label, score, x, y, w, h]`, box normalized to the
/// inferred region.
#[derive(Default)]
pub struct DetectionPostproc {
    threshold: f32,
}

impl Postproc for DetectionPostproc {
    fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    fn execute(
        &self,
        output: &ModelOutput,
        frame: &FrameInfo,
        object: Option<&Arc<InferObject>>,
    ) -> anyhow::Result<()> {
        let tensor = output
            .tensors
            .first()
            .ok_or_else(|| anyhow::anyhow!("detection output has no tensor"))?;
        let values = tensor.to_f32();
        if values.len() % 6 != 0 {
            return Err(anyhow::anyhow!(
                "detection output of {} values is not a multiple of 6",
                values.len()
            ));
        }
        let objects = frame.objects()?;
        let roi = object.map(|o| o.bbox).unwrap_or_else(BoundingBox::full);
        for row in values.chunks_exact(6) {
            let score = row[1];
            if score < self.threshold {
                continue;
            }
            let bbox = roi.project(&BoundingBox::new(row[2], row[3], row[4], row[5])).clamp();
            if !bbox.is_valid() {
                continue;
            }
            let id = objects.len().to_string();
            let detected = objects.push(InferObject::new(id, row[0] as i32, score, bbox));
            if let Some(parent) = object {
                detected.add_extra("parent", parent.id.clone());
            }
        }
        Ok(())
    }
}

/// Arg-max over class scores.
#[derive(Default)]
pub struct ClassificationPostproc {
    threshold: f32,
}

impl Postproc for ClassificationPostproc {
    fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    fn execute(
        &self,
        output: &ModelOutput,
        frame: &FrameInfo,
        object: Option<&Arc<InferObject>>,
    ) -> anyhow::Result<()> {
        let tensor = output
            .tensors
            .first()
            .ok_or_else(|| anyhow::anyhow!("classification output has no tensor"))?;
        let Some((label, score)) = tensor
            .to_f32()
            .into_iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
        else {
            return Ok(());
        };
        if score < self.threshold {
            return Ok(());
        }
        match object {
            Some(object) => object.add_attribute(
                "classification",
                Attribute {
                    id: 0,
                    value: label as i32,
                    score,
                },
            ),
            None => {
                let objects = frame.objects()?;
                let id = objects.len().to_string();
                objects.push(InferObject::new(id, label as i32, score, BoundingBox::full()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "plugin_test.rs"]
mod plugin_test;
