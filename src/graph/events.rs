//! Completion events raised when a fan-in input runs dry

use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Subscriber queue depth for completion events
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Caller-chosen label attached to a mixer or concatenator input
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelToken(Arc<str>);

impl ChannelToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChannelToken {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for ChannelToken {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for ChannelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An input carrying `token` finished playback and was removed from `node`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFinishedEvent {
    pub node: String,
    pub token: ChannelToken,
}

/// Fan-out point for [`ChannelFinishedEvent`]s
#[derive(Debug)]
pub struct ChannelEvents {
    sender: broadcast::Sender<ChannelFinishedEvent>,
}

impl ChannelEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelFinishedEvent> {
        self.sender.subscribe()
    }

    /// Publish without waiting; events are dropped when nobody listens
    pub fn publish(&self, node: &str, token: ChannelToken) {
        let _ = self.sender.send(ChannelFinishedEvent {
            node: node.to_string(),
            token,
        });
    }
}

impl Default for ChannelEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let events = ChannelEvents::new();
        let mut rx = events.subscribe();

        events.publish("mixer", ChannelToken::from("voice"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.node, "mixer");
        assert_eq!(event.token.as_str(), "voice");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let events = ChannelEvents::new();
        events.publish("mixer", ChannelToken::from(String::from("music")));
    }
}
