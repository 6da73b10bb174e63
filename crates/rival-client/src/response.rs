use crate::connection::Connection;
use crate::error::{Result, RivalError};
use rival_core::ObjectDescriptor;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// The result of a correlated call.
#[derive(Debug, Clone)]
pub enum Response {
    Value(Value),
    /// The peer answered with a remote object.
    Object(ObjectProxy),
}

impl Response {
    /// The plain value, or the attributes of a remote object.
    pub fn into_value(self) -> Value {
        match self {
            Self::Value(value) => value,
            Self::Object(proxy) => proxy.descriptor.attributes,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Object(_) => None,
        }
    }

    pub fn into_object(self) -> Option<ObjectProxy> {
        match self {
            Self::Object(proxy) => Some(proxy),
            Self::Value(_) => None,
        }
    }

    /// Deserialize the plain value into `T`.
    pub fn parse<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            Self::Value(value) => Ok(serde_json::from_value(value)?),
            Self::Object(proxy) => Err(RivalError::InvalidReply(format!(
                "expected a value, got remote object {}",
                proxy.id()
            ))),
        }
    }
}

/// Handle to an object living in another process.
#[derive(Clone)]
pub struct ObjectProxy {
    connection: Connection,
    owner: String,
    descriptor: ObjectDescriptor,
}

impl ObjectProxy {
    pub(crate) fn new(connection: Connection, owner: String, descriptor: ObjectDescriptor) -> Self {
        Self {
            connection,
            owner,
            descriptor,
        }
    }

    /// Logical identifier of the process holding the object.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn id(&self) -> &str {
        &self.descriptor.uuid
    }

    pub fn attributes(&self) -> &Value {
        &self.descriptor.attributes
    }

    pub fn methods(&self) -> &[String] {
        &self.descriptor.methods
    }

    pub fn descriptor(&self) -> &ObjectDescriptor {
        &self.descriptor
    }

    /// Invoke `method` on the remote object.
    ///
    /// Names the owner did not advertise are rejected without a round trip.
    pub async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Response> {
        self.ensure_method(method)?;
        self.connection
            .function_call(&self.owner, &self.descriptor.uuid, method, args, kwargs)
            .await
    }

    /// [`call`](Self::call) with an explicit deadline instead of the
    /// connection's function call timeout.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Response> {
        self.ensure_method(method)?;
        self.connection
            .function_call_with_timeout(
                &self.owner,
                &self.descriptor.uuid,
                method,
                args,
                kwargs,
                timeout,
            )
            .await
    }

    fn ensure_method(&self, method: &str) -> Result<()> {
        if self.descriptor.has_method(method) {
            Ok(())
        } else {
            Err(RivalError::InvalidArgument(format!(
                "remote object {} has no method {method}",
                self.descriptor.uuid
            )))
        }
    }
}

impl fmt::Debug for ObjectProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectProxy")
            .field("owner", &self.owner)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}
