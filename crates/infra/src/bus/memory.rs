//! In-memory push bus for tests/dev.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{BusError, PushBus};

type RejectFn = Box<dyn Fn(&Value) -> bool + Send + Sync>;

/// Records every published push; can be told to reject some.
#[derive(Default)]
pub struct InMemoryPushBus {
    published: Mutex<Vec<(String, Value)>>,
    reject: Mutex<Option<RejectFn>>,
}

impl std::fmt::Debug for InMemoryPushBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryPushBus")
            .field("published", &self.count())
            .finish_non_exhaustive()
    }
}

impl InMemoryPushBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every publish whose payload satisfies `predicate`.
    pub fn reject_when(&self, predicate: impl Fn(&Value) -> bool + Send + Sync + 'static) {
        if let Ok(mut reject) = self.reject.lock() {
            *reject = Some(Box::new(predicate));
        }
    }

    pub fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.published.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[async_trait]
impl PushBus for InMemoryPushBus {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<(), BusError> {
        let rejected = self
            .reject
            .lock()
            .map_err(|_| BusError::Connection("bus lock poisoned".to_string()))?
            .as_ref()
            .is_some_and(|reject| reject(payload));
        if rejected {
            return Err(BusError::Publish {
                topic: topic.to_string(),
                message: "rejected".to_string(),
            });
        }
        self.published
            .lock()
            .map_err(|_| BusError::Connection("bus lock poisoned".to_string()))?
            .push((topic.to_string(), payload.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn records_and_rejects() {
        let bus = InMemoryPushBus::new();
        bus.reject_when(|p| p["to"] == "bad");

        bus.publish("push-game_gcm", &json!({"to": "ok"})).await.unwrap();
        assert!(bus.publish("push-game_gcm", &json!({"to": "bad"})).await.is_err());

        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "push-game_gcm");
    }
}
