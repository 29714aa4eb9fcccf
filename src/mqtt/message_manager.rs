use bytes::Bytes;
use chrono::NaiveDateTime;
use std::fmt;

const PREVIEW_LEN: usize = 64;

/// A publish as seen by the delivery loop
#[derive(Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: NaiveDateTime,
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let content = String::from_utf8_lossy(&self.payload);
        let preview: String = content.chars().take(PREVIEW_LEN).collect();
        let ellipsis = if content.chars().count() > PREVIEW_LEN {
            "..."
        } else {
            ""
        };
        write!(
            f,
            "{} - {}: {}{}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            preview,
            ellipsis
        )
    }
}

impl InboundMessage {
    pub fn from_publish(publish: rumqttc::Publish) -> Self {
        InboundMessage {
            topic: publish.topic,
            payload: publish.payload,
            received_at: chrono::Local::now().naive_local(),
        }
    }
}
