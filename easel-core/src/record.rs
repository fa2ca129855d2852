//! Drawable records.
//!
//! A record is a flat JSON object with a stable `id` and a `typeName`.
//! All other properties are kept as raw JSON so that the collaboration
//! layer never needs to understand shape geometry.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Borrow;
use std::fmt;
use uuid::Uuid;

/// Stable record key, unique within a document (e.g. `shape:8f3c…`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh id of the form `<type>:<uuid>`.
    pub fn unique(kind: RecordKind) -> Self {
        Self(format!("{}:{}", kind.type_name(), Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before the first `:`, if any.
    pub fn prefix(&self) -> Option<&str> {
        self.0.split_once(':').map(|(prefix, _)| prefix)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for RecordId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Declared kind of a record, parsed from its `typeName`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Shape,
    Binding,
    Asset,
    Page,
    Document,
    Camera,
    Instance,
    Pointer,
    Other,
}

impl RecordKind {
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "shape" => RecordKind::Shape,
            "binding" => RecordKind::Binding,
            "asset" => RecordKind::Asset,
            "page" => RecordKind::Page,
            "document" => RecordKind::Document,
            "camera" => RecordKind::Camera,
            "instance" => RecordKind::Instance,
            "pointer" => RecordKind::Pointer,
            _ => RecordKind::Other,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RecordKind::Shape => "shape",
            RecordKind::Binding => "binding",
            RecordKind::Asset => "asset",
            RecordKind::Page => "page",
            RecordKind::Document => "document",
            RecordKind::Camera => "camera",
            RecordKind::Instance => "instance",
            RecordKind::Pointer => "pointer",
            RecordKind::Other => "other",
        }
    }

    /// Shapes, bindings and assets are shared between peers; everything
    /// else (camera, pointer, instance state) stays local.
    pub fn is_collaborative(&self) -> bool {
        matches!(self, RecordKind::Shape | RecordKind::Binding | RecordKind::Asset)
    }
}

/// A single editor record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    #[serde(rename = "typeName")]
    pub type_name: String,
    #[serde(flatten)]
    pub props: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<RecordId>, kind: RecordKind) -> Self {
        Self {
            id: id.into(),
            type_name: kind.type_name().to_string(),
            props: Map::new(),
        }
    }

    /// A shape record at page position (`x`, `y`).
    pub fn shape(id: impl Into<RecordId>, x: f64, y: f64) -> Self {
        Self::new(id, RecordKind::Shape)
            .with_prop("x", x)
            .with_prop("y", y)
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    pub fn set_prop(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.props.insert(key.into(), value.into());
    }

    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    pub fn kind(&self) -> RecordKind {
        RecordKind::from_type_name(&self.type_name)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
