//! Pseudo-object shapes.
//!
//! A handler may answer with an object whose methods stay callable from the
//! caller's process for a limited time. The object travels as an
//! [`ObjectDescriptor`]; later invocations travel as [`FunctionCallData`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A remote object as seen by the process that received it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    /// Registration id in the owning process.
    #[serde(rename = "__uuid__")]
    pub uuid: String,
    /// Plain data captured when the object was returned.
    #[serde(default)]
    pub attributes: Value,
    /// Methods that may be invoked through `function_call`.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Seconds the registration lives after creation.
    pub expiry: f64,
}

impl ObjectDescriptor {
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.iter().any(|m| m == name)
    }
}

/// Arguments of a `function_call` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallData {
    #[serde(rename = "__uuid__")]
    pub object: String,
    #[serde(rename = "__func__")]
    pub method: String,
    #[serde(rename = "__args__", default)]
    pub args: Vec<Value>,
    #[serde(rename = "__kwargs__", default)]
    pub kwargs: Map<String, Value>,
}

impl FunctionCallData {
    pub fn new(object: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            method: method.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }
}
