use std::sync::Arc;

use mqtt3_packet::QoS;

use crate::client::MqttClient;

/// Longest topic name delivered to a handler, terminator included.
/// Longer names are truncated.
pub const TOPIC_LEN_MAX: usize = 64;

/// An application message, outbound through [`MqttClient::publish`] or
/// inbound to a subscription handler.
///
/// For inbound messages the payload borrows the session's read buffer and
/// is only valid for the duration of the handler call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Message<'a> {
    pub qos: QoS,
    /// the broker stores the message as the topic's last known good value.
    pub retained: bool,
    /// the message may be a re-delivery of an earlier attempt.
    pub dup: bool,
    /// packet identifier, 0 for QoS 0 messages.
    pub id: u16,
    pub payload: &'a [u8],
}

impl<'a> Message<'a> {
    pub fn new(payload: &'a [u8], qos: QoS) -> Self {
        Message {
            qos,
            retained: false,
            dup: false,
            id: 0,
            payload,
        }
    }

    pub fn retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }
}

/// A received message paired with its (possibly truncated) topic name,
/// handed to subscription handlers and the interceptor.
#[derive(Debug, Clone, Copy)]
pub struct MessageData<'a> {
    pub topic_name: &'a str,
    pub message: &'a Message<'a>,
}

impl<'a> MessageData<'a> {
    pub(crate) fn new(topic_name: &'a str, message: &'a Message<'a>) -> Self {
        let mut end = topic_name.len().min(TOPIC_LEN_MAX - 1);
        while !topic_name.is_char_boundary(end) {
            end -= 1;
        }

        MessageData {
            topic_name: &topic_name[..end],
            message,
        }
    }
}

/// Callback invoked on the background thread for every message matching a
/// subscription. Must not block on operations that themselves need the
/// background thread to make progress.
pub type MessageHandler = Arc<dyn Fn(&MqttClient, &MessageData) + Send + Sync>;

/// Catch-all for PUBLISH messages whose topic matches no subscription.
pub type InterceptorHandler = Arc<dyn Fn(&MqttClient, &MessageData) + Send + Sync>;

/// Invoked just before each reconnect attempt, e.g. to rotate credentials.
pub type ReconnectHandler = Arc<dyn Fn(&MqttClient) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_name_truncated() {
        let message = Message::new(b"x", QoS::AtMostOnce);

        let short = MessageData::new("a/b", &message);
        assert_eq!(short.topic_name, "a/b");

        let long = "t/".repeat(100);
        let truncated = MessageData::new(&long, &message);
        assert_eq!(truncated.topic_name.len(), TOPIC_LEN_MAX - 1);
        assert!(long.starts_with(truncated.topic_name));
    }

    #[test]
    fn test_truncation_respects_char_boundary() {
        let topic = format!("{}é", "x".repeat(TOPIC_LEN_MAX - 2));
        let message = Message::new(b"", QoS::AtMostOnce);

        let data = MessageData::new(&topic, &message);
        assert_eq!(data.topic_name, &topic[..TOPIC_LEN_MAX - 2]);
    }
}
