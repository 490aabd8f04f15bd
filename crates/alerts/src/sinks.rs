//! Delivery sinks. Chat bridges, push services, and webhooks implement
//! [`AlertSink`] and register with the router under a channel name.

use async_trait::async_trait;
use parking_lot::Mutex;

use coda_domain::Result;

use crate::formatters::RichMessage;

#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the sink renders rich messages natively.
    fn supports_rich(&self) -> bool {
        false
    }

    async fn send(&self, channel: &str, text: &str) -> Result<()>;

    /// Default rich delivery falls back to the plain text.
    async fn send_rich(&self, channel: &str, message: &RichMessage) -> Result<()> {
        self.send(channel, &message.plain).await
    }
}

/// Sink that writes alerts to the log. Wired as a default channel so a
/// bare deployment still surfaces alerts somewhere.
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, channel: &str, text: &str) -> Result<()> {
        tracing::info!(channel, alert = text, "alert delivered");
        Ok(())
    }
}

/// Records deliveries instead of sending them; rich-capable. Test double
/// for everything that exercises the router.
#[derive(Default)]
pub struct RecordingSink {
    name: String,
    rich: Mutex<Vec<(String, RichMessage)>>,
    plain: Mutex<Vec<(String, String)>>,
    pub fail: std::sync::atomic::AtomicBool,
}

impl RecordingSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn rich_sent(&self) -> Vec<(String, RichMessage)> {
        self.rich.lock().clone()
    }

    pub fn plain_sent(&self) -> Vec<(String, String)> {
        self.plain.lock().clone()
    }

    pub fn total(&self) -> usize {
        self.rich.lock().len() + self.plain.lock().len()
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_rich(&self) -> bool {
        true
    }

    async fn send(&self, channel: &str, text: &str) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(coda_domain::Error::Other("sink down".into()));
        }
        self.plain.lock().push((channel.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_rich(&self, channel: &str, message: &RichMessage) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(coda_domain::Error::Other("sink down".into()));
        }
        self.rich.lock().push((channel.to_string(), message.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatters::format_event;
    use coda_domain::{Event, Severity};

    #[tokio::test]
    async fn default_send_rich_falls_back_to_plain() {
        struct PlainOnly(Mutex<Vec<String>>);

        #[async_trait]
        impl AlertSink for PlainOnly {
            fn name(&self) -> &str {
                "plain"
            }
            async fn send(&self, _channel: &str, text: &str) -> Result<()> {
                self.0.lock().push(text.to_string());
                Ok(())
            }
        }

        let sink = PlainOnly(Mutex::new(Vec::new()));
        let event = Event::new(
            "alert.email.urgent",
            "email",
            Severity::High,
            serde_json::json!({"message": "hi"}),
        );
        sink.send_rich("inbox", &format_event(&event)).await.unwrap();
        let sent = sink.0.lock();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("hi"));
    }

    #[tokio::test]
    async fn recording_sink_captures_rich() {
        let sink = RecordingSink::new("discord");
        let event = Event::new("alert.test.x", "t", Severity::Low, serde_json::json!({}));
        sink.send_rich("general", &format_event(&event)).await.unwrap();
        assert_eq!(sink.rich_sent().len(), 1);
        assert_eq!(sink.total(), 1);
    }
}
