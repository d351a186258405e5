//! Status heartbeats and error events
//!
//! Every worker publishes a periodic JSON heartbeat on `status_<module>`
//! and pushes error events on `events_<module>`. Both carry the module
//! name, an ISO-8601 timestamp and a monotonic message id.

use serde_json::{json, Value};
use tracing::warn;

use super::error::{PipelineError, PipelineResult};
use crate::protocol;
use crate::transport;

/// Builder and publisher for a worker's status channel.
pub struct StatusReporter {
    module: &'static str,
    status_msg_id: u64,
    events_msg_id: u64,
}

impl StatusReporter {
    pub fn new(module: &'static str) -> Self {
        Self {
            module,
            status_msg_id: 0,
            events_msg_id: 0,
        }
    }

    pub fn module(&self) -> &'static str {
        self.module
    }

    /// Assemble a status payload, consuming one message id.
    ///
    /// `extra` must be a JSON object; its fields are merged next to the
    /// common `module`/`timestamp`/`msg_ID` trio.
    pub fn status_payload(&mut self, extra: Value) -> Value {
        let payload = self.base_payload(self.status_msg_id, extra);
        self.status_msg_id += 1;
        payload
    }

    /// Assemble an error-event payload, consuming one message id.
    pub fn error_payload(&mut self, error: &PipelineError) -> Value {
        let extra = json!({
            "type": "error",
            "error": error.tag(),
            "description": error.to_string(),
        });
        let payload = self.base_payload(self.events_msg_id, extra);
        self.events_msg_id += 1;
        payload
    }

    fn base_payload(&self, msg_id: u64, extra: Value) -> Value {
        let mut payload = json!({
            "module": self.module,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "msg_ID": msg_id,
        });
        if let (Some(map), Some(extra_map)) = (payload.as_object_mut(), extra.as_object()) {
            for (key, value) in extra_map {
                map.insert(key.clone(), value.clone());
            }
        }
        payload
    }

    /// Publish a heartbeat on `status_<module>`.
    pub fn publish_status(
        &mut self,
        socket: Option<&zmq::Socket>,
        extra: Value,
    ) -> PipelineResult<()> {
        let payload = self.status_payload(extra);
        self.publish(socket, &protocol::status_topic(self.module), &payload)
    }

    /// Publish an error event on `events_<module>`.
    ///
    /// Failures to deliver the event itself are logged, never propagated:
    /// the error path must not create more errors.
    pub fn publish_error(&mut self, socket: Option<&zmq::Socket>, error: &PipelineError) {
        let payload = self.error_payload(error);
        if let Err(send_error) =
            self.publish(socket, &protocol::events_topic(self.module), &payload)
        {
            warn!(module = self.module, error = %send_error, "unable to publish error event");
        }
    }

    fn publish(
        &self,
        socket: Option<&zmq::Socket>,
        topic: &str,
        payload: &Value,
    ) -> PipelineResult<()> {
        let Some(socket) = socket else {
            warn!(module = self.module, topic, "status socket not available");
            return Ok(());
        };
        transport::send_message(socket, topic, payload.to_string().as_bytes())
    }
}
