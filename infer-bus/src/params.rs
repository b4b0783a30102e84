use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::backend::{BatchStrategy, SessionDesc};

/// Free-form plugin parameters, `key -> value` strings.
pub type PluginParams = HashMap<String, String>;

/// Already validated `name -> value` module parameters. Deserializes from a
/// flat JSON object; non-string values keep their JSON text.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "HashMap<String, serde_json::Value>")]
pub struct ParamSet(HashMap<String, String>);

impl From<HashMap<String, serde_json::Value>> for ParamSet {
    fn from(map: HashMap<String, serde_json::Value>) -> Self {
        map.into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect()
    }
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ParamSet {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

fn default_name() -> String {
    "infer".to_string()
}

fn default_interval() -> u32 {
    1
}

fn default_batch_timeout() -> u64 {
    1000
}

fn default_engine_num() -> u32 {
    1
}

fn default_postproc() -> String {
    "detection".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferParams {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub device_id: i32,
    /// Submit every Nth frame for inference; 0 and 1 mean every frame.
    #[serde(default = "default_interval")]
    pub infer_interval: u32,
    #[serde(default)]
    pub batch_strategy: BatchStrategy,
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout: u64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_engine_num")]
    pub engine_num: u32,
    #[serde(default)]
    pub threshold: f32,
    /// Infer on every object of the frame instead of the whole frame.
    #[serde(default)]
    pub object_infer: bool,
    #[serde(default)]
    pub preproc_on_device: bool,
    #[serde(default = "default_postproc")]
    pub postproc_name: String,
    #[serde(default)]
    pub frame_filter_name: Option<String>,
    #[serde(default)]
    pub obj_filter_name: Option<String>,
    #[serde(default)]
    pub custom_postproc_params: PluginParams,
    #[serde(default)]
    pub custom_filter_params: PluginParams,
}

impl Default for InferParams {
    fn default() -> Self {
        Self {
            name: default_name(),
            device_id: 0,
            infer_interval: default_interval(),
            batch_strategy: BatchStrategy::default(),
            batch_timeout: default_batch_timeout(),
            priority: 0,
            engine_num: default_engine_num(),
            threshold: 0.0,
            object_infer: false,
            preproc_on_device: false,
            postproc_name: default_postproc(),
            frame_filter_name: None,
            obj_filter_name: None,
            custom_postproc_params: PluginParams::new(),
            custom_filter_params: PluginParams::new(),
        }
    }
}

impl InferParams {
    /// Each value is read as JSON when it parses, as a plain string otherwise.
    pub fn from_param_set(params: &ParamSet) -> anyhow::Result<Self> {
        let map: serde_json::Map<String, serde_json::Value> = params
            .0
            .iter()
            .map(|(k, v)| {
                let value = serde_json::from_str(v).unwrap_or_else(|_| serde_json::Value::String(v.clone()));
                (k.clone(), value)
            })
            .collect();
        serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| anyhow::anyhow!("invalid infer params: {}", e))
    }

    pub fn session_desc(&self) -> SessionDesc {
        SessionDesc {
            name: self.name.clone(),
            device_id: self.device_id,
            batch_strategy: self.batch_strategy,
            batch_timeout_ms: self.batch_timeout,
            priority: self.priority,
            engine_num: self.engine_num,
            preproc_on_device: self.preproc_on_device,
        }
    }
}
