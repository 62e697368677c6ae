//! Write-back pipeline.
//!
//! Cache scripts publish a message for every applied like, follow and comment
//! deletion. One background task per channel consumes those messages and
//! applies the durable row mutation with its companion counter adjustment in
//! a single transaction. Delivery is at-most-once: a message published while
//! no consumer is subscribed is lost, and a message that fails to apply is
//! logged and dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clipstream_storage::{CounterColumn, DynDurableStore, StorageError, with_transaction};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::task::JoinHandle;

use crate::cache::keys::channels;
use crate::cache::{CacheBackend, Toggle};
use crate::error::CoreError;

/// Every write-back channel, one consumer each.
pub const CHANNELS: [&str; 3] = [channels::LIKE, channels::FOLLOW, channels::COMMENT_DELETE];

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// A cache-confirmed mutation awaiting its durable counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBackMessage {
    /// `<user>:<video>:like` or `<user>:<video>:unlike`
    Like {
        user_id: i64,
        video_id: i64,
        toggle: Toggle,
    },
    /// `<user>:<target>:follow` or `<user>:<target>:unfollow`
    Follow {
        user_id: i64,
        target_id: i64,
        toggle: Toggle,
    },
    /// `<video>:<comment>`
    CommentDeleted { video_id: i64, comment_id: i64 },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown write-back channel '{0}'")]
    UnknownChannel(String),

    #[error("malformed payload {payload:?} on {channel}")]
    Malformed { channel: String, payload: String },
}

impl WriteBackMessage {
    pub fn channel(&self) -> &'static str {
        match self {
            Self::Like { .. } => channels::LIKE,
            Self::Follow { .. } => channels::FOLLOW,
            Self::CommentDeleted { .. } => channels::COMMENT_DELETE,
        }
    }

    pub fn encode(&self) -> String {
        match *self {
            Self::Like {
                user_id,
                video_id,
                toggle,
            } => {
                let action = if toggle.is_on() { "like" } else { "unlike" };
                format!("{user_id}:{video_id}:{action}")
            }
            Self::Follow {
                user_id,
                target_id,
                toggle,
            } => {
                let action = if toggle.is_on() { "follow" } else { "unfollow" };
                format!("{user_id}:{target_id}:{action}")
            }
            Self::CommentDeleted {
                video_id,
                comment_id,
            } => format!("{video_id}:{comment_id}"),
        }
    }

    pub fn decode(channel: &str, payload: &str) -> Result<Self, DecodeError> {
        let malformed = || DecodeError::Malformed {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        let parts: Vec<&str> = payload.split(':').collect();
        let id = |i: usize| -> Result<i64, DecodeError> {
            parts
                .get(i)
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(malformed)
        };

        match channel {
            channels::LIKE | channels::FOLLOW => {
                if parts.len() != 3 {
                    return Err(malformed());
                }
                let (actor, target) = (id(0)?, id(1)?);
                let toggle = match (channel, parts[2]) {
                    (channels::LIKE, "like") | (channels::FOLLOW, "follow") => Toggle::On,
                    (channels::LIKE, "unlike") | (channels::FOLLOW, "unfollow") => Toggle::Off,
                    _ => return Err(malformed()),
                };
                Ok(if channel == channels::LIKE {
                    Self::Like {
                        user_id: actor,
                        video_id: target,
                        toggle,
                    }
                } else {
                    Self::Follow {
                        user_id: actor,
                        target_id: target,
                        toggle,
                    }
                })
            }
            channels::COMMENT_DELETE => {
                if parts.len() != 2 {
                    return Err(malformed());
                }
                Ok(Self::CommentDeleted {
                    video_id: id(0)?,
                    comment_id: id(1)?,
                })
            }
            other => Err(DecodeError::UnknownChannel(other.to_string())),
        }
    }
}

/// Counters of processed messages.
#[derive(Debug, Default)]
pub struct PipelineStats {
    applied: AtomicU64,
    dropped: AtomicU64,
}

impl PipelineStats {
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Applied plus dropped.
    pub fn processed(&self) -> u64 {
        self.applied() + self.dropped()
    }
}

pub struct WriteBackPipeline {
    cache: CacheBackend,
    store: DynDurableStore,
    max_backoff: Duration,
    stats: Arc<PipelineStats>,
}

impl WriteBackPipeline {
    pub fn new(cache: CacheBackend, store: DynDurableStore) -> Self {
        Self {
            cache,
            store,
            max_backoff: Duration::from_secs(300),
            stats: Arc::new(PipelineStats::default()),
        }
    }

    #[must_use]
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(INITIAL_BACKOFF);
        self
    }

    /// Subscribes to every channel, then spawns one consumer task per channel.
    ///
    /// All subscriptions are established before this returns, so messages
    /// published afterwards are delivered.
    pub async fn spawn_all(self) -> Result<WriteBackHandle, CoreError> {
        let pipeline = Arc::new(self);
        let mut streams = Vec::with_capacity(CHANNELS.len());
        for channel in CHANNELS {
            streams.push((channel, pipeline.cache.subscribe(channel).await?));
        }

        let tasks = streams
            .into_iter()
            .map(|(channel, stream)| {
                let worker = Arc::clone(&pipeline);
                tokio::spawn(async move { worker.run_channel(channel, stream).await })
            })
            .collect();

        tracing::info!(channels = ?CHANNELS, "Write-back consumers started");
        Ok(WriteBackHandle {
            tasks,
            stats: Arc::clone(&pipeline.stats),
        })
    }

    /// Consumes `channel` for the lifetime of the task, resubscribing with
    /// exponential backoff whenever the subscription is lost.
    async fn run_channel(self: Arc<Self>, channel: &'static str, initial: BoxStream<'static, String>) {
        let mut backoff = INITIAL_BACKOFF;
        let mut next = Some(initial);

        loop {
            let stream = match next.take() {
                Some(stream) => stream,
                None => match self.cache.subscribe(channel).await {
                    Ok(stream) => {
                        tracing::info!(channel = %channel, "Write-back consumer resubscribed");
                        backoff = INITIAL_BACKOFF;
                        stream
                    }
                    Err(e) => {
                        tracing::error!(
                            channel = %channel,
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "Write-back subscription failed, reconnecting..."
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(self.max_backoff);
                        continue;
                    }
                },
            };

            self.consume(channel, stream).await;

            tracing::warn!(
                channel = %channel,
                backoff_secs = backoff.as_secs(),
                "Write-back subscription closed, reconnecting..."
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    async fn consume(&self, channel: &'static str, mut stream: BoxStream<'static, String>) {
        while let Some(payload) = stream.next().await {
            let msg = match WriteBackMessage::decode(channel, &payload) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "Dropping undecodable write-back message");
                    self.record_drop(channel, "decode");
                    continue;
                }
            };

            match self.apply(&msg).await {
                Ok(changed) => {
                    tracing::debug!(channel = %channel, payload = %payload, changed, "Write-back applied");
                    self.stats.applied.fetch_add(1, Ordering::SeqCst);
                    crate::metrics::record_writeback_applied(channel);
                }
                Err(e) => {
                    tracing::error!(
                        channel = %channel,
                        payload = %payload,
                        error = %e,
                        "Failed to apply write-back message, dropped"
                    );
                    self.record_drop(channel, "apply");
                }
            }
        }
    }

    fn record_drop(&self, channel: &'static str, reason: &'static str) {
        self.stats.dropped.fetch_add(1, Ordering::SeqCst);
        crate::metrics::record_writeback_dropped(channel, reason);
    }

    /// Applies one message to the durable store in a transaction.
    ///
    /// Returns whether a row changed. Removals of rows that are already gone
    /// leave the counters untouched.
    pub async fn apply(&self, msg: &WriteBackMessage) -> Result<bool, StorageError> {
        let store = &*self.store;
        match *msg {
            WriteBackMessage::Like {
                user_id,
                video_id,
                toggle: Toggle::On,
            } => {
                with_transaction(store, move |tx| {
                    Box::pin(async move {
                        tx.insert_like(user_id, video_id).await?;
                        tx.adjust_counter(video_id, CounterColumn::LikeCount, 1)
                            .await?;
                        Ok(true)
                    })
                })
                .await
            }
            WriteBackMessage::Like {
                user_id,
                video_id,
                toggle: Toggle::Off,
            } => {
                with_transaction(store, move |tx| {
                    Box::pin(async move {
                        let removed = tx.delete_like(user_id, video_id).await?;
                        if removed {
                            tx.adjust_counter(video_id, CounterColumn::LikeCount, -1)
                                .await?;
                        }
                        Ok(removed)
                    })
                })
                .await
            }
            WriteBackMessage::Follow {
                user_id,
                target_id,
                toggle: Toggle::On,
            } => {
                with_transaction(store, move |tx| {
                    Box::pin(async move {
                        tx.insert_follow(user_id, target_id).await?;
                        Ok(true)
                    })
                })
                .await
            }
            WriteBackMessage::Follow {
                user_id,
                target_id,
                toggle: Toggle::Off,
            } => {
                with_transaction(store, move |tx| {
                    Box::pin(async move { tx.delete_follow(user_id, target_id).await })
                })
                .await
            }
            WriteBackMessage::CommentDeleted {
                video_id,
                comment_id,
            } => {
                with_transaction(store, move |tx| {
                    Box::pin(async move {
                        let removed = tx.delete_comment(comment_id).await?;
                        if removed {
                            tx.adjust_counter(video_id, CounterColumn::CommentCount, -1)
                                .await?;
                        }
                        Ok(removed)
                    })
                })
                .await
            }
        }
    }
}

/// Handle to the running consumers.
pub struct WriteBackHandle {
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<PipelineStats>,
}

impl WriteBackHandle {
    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_finished())
    }

    /// Stops every consumer and waits for them to exit. Messages published
    /// afterwards are not applied.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!("Write-back consumers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipstream_db_memory::InMemoryStore;
    use clipstream_storage::{DurableStore, Video};
    use tokio_test::block_on;

    fn pipeline() -> (WriteBackPipeline, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        block_on(store.seed_video(Video {
            id: 42,
            author_id: 2,
            title: "clip".into(),
            play_url: String::new(),
            cover_url: String::new(),
            like_count: 5,
            comment_count: 1,
            publish_at_ms: 1,
        }));
        let pipeline = WriteBackPipeline::new(CacheBackend::new_local(), store.clone());
        (pipeline, store)
    }

    fn like_count(store: &InMemoryStore) -> i64 {
        block_on(store.get_video(42)).unwrap().unwrap().like_count
    }

    #[test]
    fn test_apply_like_and_unlike() {
        let (pipeline, store) = pipeline();
        let like = WriteBackMessage::Like {
            user_id: 1,
            video_id: 42,
            toggle: Toggle::On,
        };
        assert!(block_on(pipeline.apply(&like)).unwrap());
        assert_eq!(like_count(&store), 6);

        // A duplicate row fails the whole transaction.
        assert!(block_on(pipeline.apply(&like)).is_err());
        assert_eq!(like_count(&store), 6);

        let unlike = WriteBackMessage::Like {
            user_id: 1,
            video_id: 42,
            toggle: Toggle::Off,
        };
        assert!(block_on(pipeline.apply(&unlike)).unwrap());
        assert!(!block_on(pipeline.apply(&unlike)).unwrap());
        assert_eq!(like_count(&store), 5);
    }

    #[test]
    fn test_apply_missing_comment_keeps_counter() {
        let (pipeline, store) = pipeline();
        let deleted = WriteBackMessage::CommentDeleted {
            video_id: 42,
            comment_id: 7,
        };
        assert!(!block_on(pipeline.apply(&deleted)).unwrap());
        let video = block_on(store.get_video(42)).unwrap().unwrap();
        assert_eq!(video.comment_count, 1);
    }

    #[test]
    fn test_encode_decode() {
        let like = WriteBackMessage::Like {
            user_id: 1,
            video_id: 42,
            toggle: Toggle::On,
        };
        assert_eq!(like.encode(), "1:42:like");
        assert_eq!(WriteBackMessage::decode(channels::LIKE, "1:42:like"), Ok(like));

        let unfollow = WriteBackMessage::decode(channels::FOLLOW, "1:2:unfollow").unwrap();
        assert_eq!(
            unfollow,
            WriteBackMessage::Follow {
                user_id: 1,
                target_id: 2,
                toggle: Toggle::Off
            }
        );
        assert_eq!(unfollow.channel(), channels::FOLLOW);

        let deleted = WriteBackMessage::decode(channels::COMMENT_DELETE, "42:7").unwrap();
        assert_eq!(deleted.encode(), "42:7");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(WriteBackMessage::decode(channels::LIKE, "1:42").is_err());
        assert!(WriteBackMessage::decode(channels::LIKE, "1:42:follow").is_err());
        assert!(WriteBackMessage::decode(channels::FOLLOW, "x:2:follow").is_err());
        assert!(WriteBackMessage::decode(channels::COMMENT_DELETE, "42:7:1").is_err());
        assert_eq!(
            WriteBackMessage::decode("writeback:other", "1:2"),
            Err(DecodeError::UnknownChannel("writeback:other".into()))
        );
    }
}
