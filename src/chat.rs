use std::path::Path;

use async_trait::async_trait;

/// One audio file bound for a grouped-media message.
pub struct AudioDocument {
    pub file_path: std::path::PathBuf,
    pub filename: String,
    pub mime_type: String,
    pub title: String,
    pub performer: String,
    pub duration_seconds: u32,
    pub thumbnail_path: Option<std::path::PathBuf>,
}

/// An inbound message from the chat platform, trimmed to what the Job
/// Controller needs.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub chat_id: i64,
    pub sender_id: i64,
    pub text: String,
}

/// The external contract the Job Controller is built against. No real
/// transport (Telegram/Discord/Matrix) is implemented here - only the
/// surface the core pipeline needs, plus an in-memory double for tests.
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> anyhow::Result<()>;

    async fn send_link(&self, chat_id: i64, text: &str, url: &str) -> anyhow::Result<()>;

    async fn send_grouped_audio(
        &self,
        chat_id: i64,
        items: Vec<AudioDocument>,
        caption: &str,
    ) -> anyhow::Result<()>;

    async fn send_document(
        &self,
        chat_id: i64,
        path: &Path,
        filename: &str,
    ) -> anyhow::Result<()>;
}

/// A transport-less adapter that just logs what it would have sent. There is
/// no bundled real chat transport (Telegram/Discord/Matrix) - wiring one up
/// means implementing this trait against that platform's SDK and handing an
/// `Arc<dyn ChatAdapter>` to the Job Controller instead of this one.
pub struct LoggingChatAdapter;

#[async_trait]
impl ChatAdapter for LoggingChatAdapter {
    async fn send_text(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        log::info!("[chat {chat_id}] {text}");
        Ok(())
    }

    async fn send_link(&self, chat_id: i64, text: &str, url: &str) -> anyhow::Result<()> {
        log::info!("[chat {chat_id}] {text} {url}");
        Ok(())
    }

    async fn send_grouped_audio(
        &self,
        chat_id: i64,
        items: Vec<AudioDocument>,
        caption: &str,
    ) -> anyhow::Result<()> {
        log::info!(
            "[chat {chat_id}] grouped media ({} items): {caption}",
            items.len()
        );
        Ok(())
    }

    async fn send_document(&self, chat_id: i64, _path: &Path, filename: &str) -> anyhow::Result<()> {
        log::info!("[chat {chat_id}] document: {filename}");
        Ok(())
    }
}

#[cfg(test)]
pub mod test_double {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum SentMessage {
        Text(String),
        Link(String, String),
        GroupedAudio { filenames: Vec<String>, caption: String },
        Document(String),
    }

    #[derive(Default)]
    pub struct RecordingAdapter {
        pub sent: Mutex<Vec<SentMessage>>,
    }

    #[async_trait]
    impl ChatAdapter for RecordingAdapter {
        async fn send_text(&self, _chat_id: i64, text: &str) -> anyhow::Result<()> {
            self.sent.lock().await.push(SentMessage::Text(text.to_string()));
            Ok(())
        }

        async fn send_link(&self, _chat_id: i64, text: &str, url: &str) -> anyhow::Result<()> {
            self.sent
                .lock()
                .await
                .push(SentMessage::Link(text.to_string(), url.to_string()));
            Ok(())
        }

        async fn send_grouped_audio(
            &self,
            _chat_id: i64,
            items: Vec<AudioDocument>,
            caption: &str,
        ) -> anyhow::Result<()> {
            let filenames = items.into_iter().map(|i| i.filename).collect();
            self.sent.lock().await.push(SentMessage::GroupedAudio {
                filenames,
                caption: caption.to_string(),
            });
            Ok(())
        }

        async fn send_document(
            &self,
            _chat_id: i64,
            _path: &Path,
            filename: &str,
        ) -> anyhow::Result<()> {
            self.sent
                .lock()
                .await
                .push(SentMessage::Document(filename.to_string()));
            Ok(())
        }
    }
}
