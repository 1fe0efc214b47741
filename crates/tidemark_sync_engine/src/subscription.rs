//! Stream subscription handles.

use crate::connection::ManagerInner;
use crate::error::SyncResult;
use serde_json::Value;
use std::sync::Weak;
use tracing::warn;

/// Key of a subscription: stream name and serialized parameters.
pub(crate) type SubscriptionKey = (String, String);

pub(crate) fn subscription_key(name: &str, params: Option<&Value>) -> SubscriptionKey {
    (
        name.to_string(),
        params.map(Value::to_string).unwrap_or_default(),
    )
}

/// A reference to an active stream subscription.
///
/// Every handle must be released with [`SyncStreamSubscription::unsubscribe`].
/// The subscription stays active while at least one handle for the same
/// name and parameters is outstanding. Dropping a handle without
/// unsubscribing keeps the subscription alive and logs a warning.
#[must_use = "a subscription handle must be released with `unsubscribe`"]
pub struct SyncStreamSubscription {
    id: u64,
    name: String,
    params: Option<Value>,
    manager: Weak<ManagerInner>,
    released: bool,
}

impl SyncStreamSubscription {
    pub(crate) fn new(
        id: u64,
        name: String,
        params: Option<Value>,
        manager: Weak<ManagerInner>,
    ) -> Self {
        Self {
            id,
            name,
            params,
            manager,
            released: false,
        }
    }

    /// Handle id, unique per connection manager.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stream name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stream parameters.
    pub fn params(&self) -> Option<&Value> {
        self.params.as_ref()
    }

    /// Releases the handle.
    ///
    /// Removes the subscription once no handle for it remains.
    pub async fn unsubscribe(mut self) -> SyncResult<()> {
        self.released = true;
        let Some(manager) = self.manager.upgrade() else {
            return Ok(());
        };
        let key = subscription_key(&self.name, self.params.as_ref());
        manager.unsubscribe(&key, self.id).await
    }
}

impl std::fmt::Debug for SyncStreamSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStreamSubscription")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

impl Drop for SyncStreamSubscription {
    fn drop(&mut self) {
        if !self.released && self.manager.strong_count() > 0 {
            warn!(
                id = self.id,
                stream = %self.name,
                "subscription handle dropped without unsubscribe, the stream stays subscribed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_distinguish_parameters() {
        let a = subscription_key("lists", Some(&json!({"owner": "a"})));
        let b = subscription_key("lists", Some(&json!({"owner": "b"})));
        assert_ne!(a, b);
        assert_eq!(a, subscription_key("lists", Some(&json!({"owner": "a"}))));
        assert_eq!(subscription_key("lists", None).1, "");
    }

    #[test]
    fn key_ignores_object_key_order() {
        let a = subscription_key("s", Some(&json!({"x": 1, "y": 2})));
        let b = subscription_key("s", Some(&json!({"y": 2, "x": 1})));
        assert_eq!(a, b);
    }
}
