use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use clipstream_storage::{
    Comment, CounterColumn, DurableStore, NewComment, NewUser, NewVideo, StorageError,
    StoreTransaction, User, Video, tables,
};

use crate::transaction::InMemoryTransaction;

/// Read operations tracked by [`QueryStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    GetUser,
    GetVideo,
    GetComment,
    ListVideos,
    VideosByAuthor,
    LikedVideoIds,
    FollowedIds,
    FollowerIds,
    CommentsOnVideo,
}

impl QueryKind {
    const ALL: [QueryKind; 9] = [
        QueryKind::GetUser,
        QueryKind::GetVideo,
        QueryKind::GetComment,
        QueryKind::ListVideos,
        QueryKind::VideosByAuthor,
        QueryKind::LikedVideoIds,
        QueryKind::FollowedIds,
        QueryKind::FollowerIds,
        QueryKind::CommentsOnVideo,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Per-operation read counters, so tests can assert how often the cache layer
/// fell through to the store.
#[derive(Debug, Default)]
pub struct QueryStats {
    counts: [AtomicUsize; 9],
}

impl QueryStats {
    fn record(&self, kind: QueryKind) {
        self.counts[kind.index()].fetch_add(1, Ordering::SeqCst);
    }

    /// Number of times `kind` has been executed.
    pub fn count(&self, kind: QueryKind) -> usize {
        self.counts[kind.index()].load(Ordering::SeqCst)
    }

    /// Sum over every read operation.
    pub fn total(&self) -> usize {
        QueryKind::ALL.iter().map(|k| self.count(*k)).sum()
    }

    /// Resets every counter to zero.
    pub fn reset(&self) {
        for counter in &self.counts {
            counter.store(0, Ordering::SeqCst);
        }
    }
}

/// Table contents. Cloned wholesale when a transaction begins.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tables {
    pub(crate) users: BTreeMap<i64, User>,
    pub(crate) videos: BTreeMap<i64, Video>,
    pub(crate) comments: BTreeMap<i64, Comment>,
    /// (user_id, video_id)
    pub(crate) likes: BTreeSet<(i64, i64)>,
    /// (follower_id, target_id)
    pub(crate) follows: BTreeSet<(i64, i64)>,
}

impl Tables {
    pub(crate) fn adjust_counter(
        &mut self,
        video_id: i64,
        column: CounterColumn,
        delta: i64,
    ) -> Result<(), StorageError> {
        let video = self
            .videos
            .get_mut(&video_id)
            .ok_or_else(|| StorageError::not_found(tables::VIDEOS, video_id))?;
        match column {
            CounterColumn::LikeCount => video.like_count += delta,
            CounterColumn::CommentCount => video.comment_count += delta,
        }
        Ok(())
    }

    pub(crate) fn recount_counters(&mut self, video_id: i64) -> Result<Video, StorageError> {
        let like_count = self.likes.iter().filter(|(_, v)| *v == video_id).count() as i64;
        let comment_count = self
            .comments
            .values()
            .filter(|c| c.video_id == video_id)
            .count() as i64;
        let video = self
            .videos
            .get_mut(&video_id)
            .ok_or_else(|| StorageError::not_found(tables::VIDEOS, video_id))?;
        video.like_count = like_count;
        video.comment_count = comment_count;
        Ok(video.clone())
    }

    pub(crate) fn insert_comment(&mut self, id: i64, comment: NewComment) -> Result<Comment, StorageError> {
        if !self.videos.contains_key(&comment.video_id) {
            return Err(StorageError::not_found(tables::VIDEOS, comment.video_id));
        }
        let row = Comment {
            id,
            user_id: comment.user_id,
            video_id: comment.video_id,
            parent_id: comment.parent_id,
            content: comment.content,
            created_at_ms: comment.created_at_ms,
        };
        self.comments.insert(id, row.clone());
        Ok(row)
    }
}

/// In-memory durable store.
///
/// All tables sit behind one `RwLock`. A transaction takes the write lock for
/// its whole lifetime and works on a private copy, which replaces the tables on
/// commit. This serializes writers the same way row locks would for the
/// workloads the cache layer produces.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    pub(crate) tables: Arc<RwLock<Tables>>,
    pub(crate) sequence: Arc<AtomicI64>,
    stats: Arc<QueryStats>,
    pub(crate) fail_commits: Arc<AtomicBool>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            sequence: Arc::new(AtomicI64::new(1)),
            stats: Arc::new(QueryStats::default()),
            fail_commits: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Read counters for this store.
    pub fn stats(&self) -> &QueryStats {
        &self.stats
    }

    /// Makes every subsequent commit fail with a transaction error.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn next_id(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn bump_sequence_past(&self, id: i64) {
        self.sequence.fetch_max(id + 1, Ordering::SeqCst);
    }

    /// Inserts a user row verbatim, keeping its id.
    pub async fn seed_user(&self, user: User) {
        self.bump_sequence_past(user.id);
        self.tables.write().await.users.insert(user.id, user);
    }

    /// Inserts a video row verbatim, keeping its id and counters.
    pub async fn seed_video(&self, video: Video) {
        self.bump_sequence_past(video.id);
        self.tables.write().await.videos.insert(video.id, video);
    }

    /// Records a like without touching any counter.
    pub async fn seed_like(&self, user_id: i64, video_id: i64) {
        self.tables.write().await.likes.insert((user_id, video_id));
    }

    /// Records a follow edge.
    pub async fn seed_follow(&self, follower_id: i64, target_id: i64) {
        self.tables
            .write()
            .await
            .follows
            .insert((follower_id, target_id));
    }

    /// Number of committed like rows.
    pub async fn like_rows(&self) -> usize {
        self.tables.read().await.likes.len()
    }

    /// Returns `true` if the like row is committed.
    pub async fn has_like_row(&self, user_id: i64, video_id: i64) -> bool {
        self.tables.read().await.likes.contains(&(user_id, video_id))
    }

    /// Returns `true` if the follow edge is committed.
    pub async fn has_follow_row(&self, follower_id: i64, target_id: i64) -> bool {
        self.tables
            .read()
            .await
            .follows
            .contains(&(follower_id, target_id))
    }
}

fn newest_videos_first(videos: &mut [Video]) {
    videos.sort_by(|a, b| {
        b.publish_at_ms
            .cmp(&a.publish_at_ms)
            .then_with(|| b.id.cmp(&a.id))
    });
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn create_user(&self, user: NewUser) -> Result<User, StorageError> {
        let mut tables = self.tables.write().await;
        if tables.users.values().any(|u| u.username == user.username) {
            return Err(StorageError::already_exists(tables::USERS, user.username));
        }
        let row = User {
            id: self.next_id(),
            username: user.username,
            nickname: user.nickname,
            avatar_url: user.avatar_url,
            background_img_url: user.background_img_url,
        };
        tables.users.insert(row.id, row.clone());
        Ok(row)
    }

    async fn create_video(&self, video: NewVideo) -> Result<Video, StorageError> {
        if video.title.trim().is_empty() {
            return Err(StorageError::invalid_row("video title must not be empty"));
        }
        let row = Video {
            id: self.next_id(),
            author_id: video.author_id,
            title: video.title,
            play_url: video.play_url,
            cover_url: video.cover_url,
            like_count: 0,
            comment_count: 0,
            publish_at_ms: video.publish_at_ms,
        };
        self.tables.write().await.videos.insert(row.id, row.clone());
        Ok(row)
    }

    async fn create_comment(&self, comment: NewComment) -> Result<Comment, StorageError> {
        let id = self.next_id();
        let mut tables = self.tables.write().await;
        let video_id = comment.video_id;
        let row = tables.insert_comment(id, comment)?;
        tables.adjust_counter(video_id, CounterColumn::CommentCount, 1)?;
        Ok(row)
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>, StorageError> {
        self.stats.record(QueryKind::GetUser);
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn get_video(&self, id: i64) -> Result<Option<Video>, StorageError> {
        self.stats.record(QueryKind::GetVideo);
        Ok(self.tables.read().await.videos.get(&id).cloned())
    }

    async fn get_comment(&self, id: i64) -> Result<Option<Comment>, StorageError> {
        self.stats.record(QueryKind::GetComment);
        Ok(self.tables.read().await.comments.get(&id).cloned())
    }

    async fn list_videos(&self) -> Result<Vec<Video>, StorageError> {
        self.stats.record(QueryKind::ListVideos);
        let mut videos: Vec<Video> = self.tables.read().await.videos.values().cloned().collect();
        newest_videos_first(&mut videos);
        Ok(videos)
    }

    async fn videos_by_author(&self, author_id: i64) -> Result<Vec<Video>, StorageError> {
        self.stats.record(QueryKind::VideosByAuthor);
        let mut videos: Vec<Video> = self
            .tables
            .read()
            .await
            .videos
            .values()
            .filter(|v| v.author_id == author_id)
            .cloned()
            .collect();
        newest_videos_first(&mut videos);
        Ok(videos)
    }

    async fn liked_video_ids(&self, user_id: i64) -> Result<Vec<i64>, StorageError> {
        self.stats.record(QueryKind::LikedVideoIds);
        Ok(self
            .tables
            .read()
            .await
            .likes
            .range((user_id, i64::MIN)..=(user_id, i64::MAX))
            .map(|(_, video_id)| *video_id)
            .collect())
    }

    async fn followed_ids(&self, user_id: i64) -> Result<Vec<i64>, StorageError> {
        self.stats.record(QueryKind::FollowedIds);
        Ok(self
            .tables
            .read()
            .await
            .follows
            .range((user_id, i64::MIN)..=(user_id, i64::MAX))
            .map(|(_, target)| *target)
            .collect())
    }

    async fn follower_ids(&self, user_id: i64) -> Result<Vec<i64>, StorageError> {
        self.stats.record(QueryKind::FollowerIds);
        Ok(self
            .tables
            .read()
            .await
            .follows
            .iter()
            .filter(|(_, target)| *target == user_id)
            .map(|(follower, _)| *follower)
            .collect())
    }

    async fn comments_on_video(&self, video_id: i64) -> Result<Vec<Comment>, StorageError> {
        self.stats.record(QueryKind::CommentsOnVideo);
        let mut comments: Vec<Comment> = self
            .tables
            .read()
            .await
            .comments
            .values()
            .filter(|c| c.video_id == video_id)
            .cloned()
            .collect();
        comments.sort_by(|a, b| {
            b.created_at_ms
                .cmp(&a.created_at_ms)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(comments)
    }

    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>, StorageError> {
        let guard = Arc::clone(&self.tables).write_owned().await;
        Ok(Box::new(InMemoryTransaction::new(
            guard,
            Arc::clone(&self.sequence),
            self.fail_commits.load(Ordering::SeqCst),
        )))
    }

    fn backend_name(&self) -> &'static str {
        "in-memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipstream_storage::with_transaction;

    fn video(id: i64, author_id: i64, publish_at_ms: i64) -> Video {
        Video {
            id,
            author_id,
            title: format!("video {id}"),
            play_url: String::new(),
            cover_url: String::new(),
            like_count: 0,
            comment_count: 0,
            publish_at_ms,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_user() {
        let store = InMemoryStore::new();
        let user = store
            .create_user(NewUser {
                username: "alice".into(),
                nickname: "Alice".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let fetched = store.get_user(user.id).await.unwrap();
        assert_eq!(fetched, Some(user));
        assert_eq!(store.get_user(999).await.unwrap(), None);
        assert_eq!(store.stats().count(QueryKind::GetUser), 2);
    }

    #[tokio::test]
    async fn test_duplicate_username_rejected() {
        let store = InMemoryStore::new();
        let new_user = NewUser {
            username: "bob".into(),
            ..Default::default()
        };
        store.create_user(new_user.clone()).await.unwrap();
        let err = store.create_user(new_user).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_seeded_ids_do_not_collide() {
        let store = InMemoryStore::new();
        store.seed_video(video(42, 1, 100)).await;
        let created = store
            .create_video(NewVideo {
                author_id: 1,
                title: "fresh".into(),
                play_url: String::new(),
                cover_url: String::new(),
                publish_at_ms: 200,
            })
            .await
            .unwrap();
        assert!(created.id > 42);
        assert_eq!(created.like_count, 0);
    }

    #[tokio::test]
    async fn test_list_videos_newest_first() {
        let store = InMemoryStore::new();
        store.seed_video(video(1, 1, 100)).await;
        store.seed_video(video(2, 2, 300)).await;
        store.seed_video(video(3, 1, 200)).await;

        let ids: Vec<i64> = store
            .list_videos()
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.id)
            .collect();
        assert_eq!(ids, vec![2, 3, 1]);

        let by_author: Vec<i64> = store
            .videos_by_author(1)
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.id)
            .collect();
        assert_eq!(by_author, vec![3, 1]);
    }

    #[tokio::test]
    async fn test_create_comment_bumps_counter() {
        let store = InMemoryStore::new();
        store.seed_video(video(7, 1, 100)).await;
        let comment = store
            .create_comment(NewComment {
                user_id: 2,
                video_id: 7,
                parent_id: 0,
                content: "nice".into(),
                created_at_ms: 10,
            })
            .await
            .unwrap();

        assert_eq!(store.get_video(7).await.unwrap().unwrap().comment_count, 1);
        assert_eq!(store.comments_on_video(7).await.unwrap(), vec![comment]);
    }

    #[tokio::test]
    async fn test_create_comment_missing_video() {
        let store = InMemoryStore::new();
        let err = store
            .create_comment(NewComment {
                user_id: 2,
                video_id: 404,
                parent_id: 0,
                content: "hello".into(),
                created_at_ms: 10,
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_relationship_reads() {
        let store = InMemoryStore::new();
        store.seed_follow(1, 2).await;
        store.seed_follow(1, 3).await;
        store.seed_follow(4, 2).await;
        store.seed_like(1, 42).await;

        assert_eq!(store.followed_ids(1).await.unwrap(), vec![2, 3]);
        assert_eq!(store.follower_ids(2).await.unwrap(), vec![1, 4]);
        assert_eq!(store.liked_video_ids(1).await.unwrap(), vec![42]);
        assert!(store.liked_video_ids(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transaction_commit_applies_all() {
        let store = InMemoryStore::new();
        store.seed_video(video(42, 9, 100)).await;

        with_transaction(&store, |tx| {
            Box::pin(async move {
                tx.insert_like(1, 42).await?;
                tx.adjust_counter(42, CounterColumn::LikeCount, 1).await
            })
        })
        .await
        .unwrap();

        assert!(store.has_like_row(1, 42).await);
        assert_eq!(store.get_video(42).await.unwrap().unwrap().like_count, 1);
    }

    #[tokio::test]
    async fn test_transaction_error_rolls_back() {
        let store = InMemoryStore::new();
        store.seed_video(video(42, 9, 100)).await;

        let result: Result<(), StorageError> = with_transaction(&store, |tx| {
            Box::pin(async move {
                tx.insert_like(1, 42).await?;
                tx.adjust_counter(404, CounterColumn::LikeCount, 1).await
            })
        })
        .await;

        assert!(result.unwrap_err().is_not_found());
        assert!(!store.has_like_row(1, 42).await);
        assert_eq!(store.get_video(42).await.unwrap().unwrap().like_count, 0);
    }

    #[tokio::test]
    async fn test_failed_commit_discards_writes() {
        let store = InMemoryStore::new();
        store.seed_video(video(42, 9, 100)).await;
        store.set_fail_commits(true);

        let result = with_transaction(&store, |tx| {
            Box::pin(async move { tx.insert_follow(1, 2).await })
        })
        .await;

        assert!(result.is_err());
        assert!(!store.has_follow_row(1, 2).await);
    }

    #[tokio::test]
    async fn test_stats_reset() {
        let store = InMemoryStore::new();
        store.get_video(1).await.unwrap();
        store.list_videos().await.unwrap();
        assert_eq!(store.stats().total(), 2);
        store.stats().reset();
        assert_eq!(store.stats().total(), 0);
    }
}
