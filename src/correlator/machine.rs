//! Machine provisioning exchange.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{BoxError, Connector, RequestHandler, Serving};
use crate::envelope::{EnvelopeError, Payload};
use crate::error::{Error, Result};

/// Command kind of machine requests.
pub const MACHINE_REQUESTED: &str = "machine-requested";

/// A virtual machine to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub cpu: u32,
    /// Memory in megabytes.
    pub mem: u64,
    /// Disc size in gigabytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disc: Option<u64>,
    /// Public key to install for the login user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkey: Option<String>,
}

impl MachineRequest {
    pub fn new(name: impl Into<String>, cpu: u32, mem: u64) -> Self {
        Self {
            name: name.into(),
            image: None,
            cpu,
            mem,
            disc: None,
            pkey: None,
        }
    }

    pub fn to_payload(&self) -> Result<Payload> {
        to_payload(self)
    }

    pub fn from_payload(payload: &Payload) -> Result<Self> {
        serde_json::from_value(Value::Object(payload.clone()))
            .map_err(|e| Error::InvalidReply(format!("invalid machine request: {}", e)))
    }
}

/// Where to reach a created machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub host: String,
    pub username: String,
}

impl Machine {
    /// Project a result payload, ignoring extra fields.
    pub fn from_payload(payload: Payload) -> Result<Self> {
        serde_json::from_value(Value::Object(payload)).map_err(|e| Error::Projection(e.to_string()))
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<Payload> {
    match serde_json::to_value(value).map_err(EnvelopeError::from)? {
        Value::Object(fields) => Ok(fields),
        other => Err(EnvelopeError::Malformed(format!("expected an object, got {}", other)).into()),
    }
}

/// Creates machines on behalf of requesters.
#[async_trait]
pub trait MachineProvider: Send + Sync {
    /// Whether this provider has room for the machine.
    async fn confirm(&self, _request: &MachineRequest) -> bool {
        true
    }

    async fn create(&self, request: MachineRequest) -> std::result::Result<Machine, BoxError>;
}

/// Serves machine requests with a [`MachineProvider`].
struct Provisioner<P: ?Sized>(Arc<P>);

#[async_trait]
impl<P> RequestHandler for Provisioner<P>
where
    P: MachineProvider + ?Sized,
{
    async fn accept(&self, request: &Payload) -> bool {
        match MachineRequest::from_payload(request) {
            Ok(request) => self.0.confirm(&request).await,
            // Claimed anyway so the requester hears about it through a failure.
            Err(_) => true,
        }
    }

    async fn handle(&self, request: Payload) -> std::result::Result<Payload, BoxError> {
        let request = MachineRequest::from_payload(&request)?;
        let machine = self.0.create(request).await?;
        Ok(to_payload(&machine)?)
    }
}

impl Connector {
    /// Request a machine from whichever responder claims it first.
    pub async fn create_machine(&self, request: &MachineRequest) -> Result<Machine> {
        let payload = request.to_payload()?;
        self.request_with(MACHINE_REQUESTED, payload, Machine::from_payload)
            .await
    }

    /// Answer machine requests with `provider`.
    pub async fn wait_for_machines<P>(&self, provider: Arc<P>) -> Result<Serving>
    where
        P: MachineProvider + ?Sized + 'static,
    {
        self.serve(MACHINE_REQUESTED, Arc::new(Provisioner(provider)))
            .await
    }
}
