use std::sync::Arc;

use postcrew_core::events::{EventSink, RunEvent};
use postcrew_core::ids::Channel;

use crate::broker::Broker;

/// Publishes run events on their run's channel. Nobody listening is fine.
pub struct EventEmitter {
    broker: Arc<dyn Broker>,
}

impl EventEmitter {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

impl EventSink for EventEmitter {
    fn publish(&self, event: RunEvent) {
        let channel = Channel::for_run(&event.run_id);
        match serde_json::to_string(&event) {
            Ok(payload) => {
                let delivered = self.broker.publish(&channel, payload);
                tracing::trace!(
                    run_id = %event.run_id,
                    event_type = event.event_type(),
                    delivered,
                    "event published"
                );
            }
            Err(e) => {
                tracing::error!(run_id = %event.run_id, error = %e, "failed to serialize event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;
    use postcrew_core::events::EventBody;
    use postcrew_core::ids::{ProjectId, RunId};

    fn error_event(run: &str) -> RunEvent {
        RunEvent::new(
            RunId::from_raw(run),
            ProjectId::from_raw("proj_1"),
            EventBody::WorkflowError { error: "boom".into() },
        )
    }

    #[tokio::test]
    async fn publishes_on_run_channel() {
        let broker = Arc::new(LocalBroker::default());
        let (_, mut rx) = broker.subscribe(&Channel::for_run(&RunId::from_raw("run_1")));
        let emitter = EventEmitter::new(broker.clone());

        emitter.publish(error_event("run_1"));
        emitter.publish(error_event("run_2"));

        let json: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(json["type"], "workflow_error");
        assert_eq!(json["run_id"], "run_1");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn publishing_without_listeners_is_fine() {
        let emitter = EventEmitter::new(Arc::new(LocalBroker::default()));
        emitter.publish(error_event("run_1"));
    }
}
