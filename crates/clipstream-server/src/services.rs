//! Display views assembled from cached records and membership sets.
//!
//! Independent sub-lookups of a view run concurrently and are joined. A list
//! member that cannot be resolved is skipped with a warning.

use clipstream_storage::{Comment, User, Video};
use futures_util::future::join_all;
use serde::Serialize;

use crate::engine::CounterEngine;
use crate::error::CoreError;
use crate::feed::FeedIndex;
use crate::rebuild::OwnerSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserInfo {
    pub user: User,
    pub follow_count: usize,
    pub follower_count: usize,
    /// Whether the viewer follows this user.
    pub is_followed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoInfo {
    pub video: Video,
    pub author: UserInfo,
    /// Whether the viewer liked this video.
    pub is_liked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommentInfo {
    pub comment: Comment,
    pub commenter: UserInfo,
}

fn collect_views<T>(results: Vec<Result<T, CoreError>>, kind: &str) -> Vec<T> {
    results
        .into_iter()
        .filter_map(|result| match result {
            Ok(view) => Some(view),
            Err(e) => {
                tracing::warn!(kind = %kind, error = %e, "Failed to build view, skipped");
                None
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct UserService {
    engine: CounterEngine,
}

impl UserService {
    pub fn new(engine: CounterEngine) -> Self {
        Self { engine }
    }

    /// Profile of `user_id` as seen by `viewer`.
    pub async fn user_info(&self, user_id: i64, viewer: Option<i64>) -> Result<UserInfo, CoreError> {
        let is_followed = async {
            match viewer {
                Some(viewer) if viewer != user_id => self.engine.is_following(viewer, user_id).await,
                _ => Ok(false),
            }
        };
        let (user, follow_count, follower_count, is_followed) = tokio::join!(
            self.engine.loader().get_user(user_id),
            self.engine.followed_count(user_id),
            self.engine.follower_count(user_id),
            is_followed,
        );

        Ok(UserInfo {
            user: user?,
            follow_count: follow_count?,
            follower_count: follower_count?,
            is_followed: is_followed?,
        })
    }

    pub async fn followers(&self, owner: i64, viewer: Option<i64>) -> Result<Vec<UserInfo>, CoreError> {
        self.list(OwnerSet::UserFollowers(owner), viewer).await
    }

    pub async fn following(&self, owner: i64, viewer: Option<i64>) -> Result<Vec<UserInfo>, CoreError> {
        self.list(OwnerSet::UserFollowed(owner), viewer).await
    }

    async fn list(&self, set: OwnerSet, viewer: Option<i64>) -> Result<Vec<UserInfo>, CoreError> {
        let mut ids = self.engine.members(set).await?;
        ids.sort_unstable_by(|a, b| b.cmp(a));
        let results = join_all(ids.iter().map(|id| self.user_info(*id, viewer))).await;
        Ok(collect_views(results, "user"))
    }
}

#[derive(Clone)]
pub struct VideoService {
    engine: CounterEngine,
    feed: FeedIndex,
    users: UserService,
}

impl VideoService {
    pub fn new(engine: CounterEngine, feed: FeedIndex) -> Self {
        Self {
            users: UserService::new(engine.clone()),
            engine,
            feed,
        }
    }

    pub fn users(&self) -> &UserService {
        &self.users
    }

    pub async fn video_info(&self, video: Video, viewer: Option<i64>) -> Result<VideoInfo, CoreError> {
        let video_id = video.id;
        let is_liked = async {
            match viewer {
                Some(viewer) => self.engine.has_liked(viewer, video_id).await,
                None => Ok(false),
            }
        };
        let (author, is_liked) =
            tokio::join!(self.users.user_info(video.author_id, viewer), is_liked);

        Ok(VideoInfo {
            video,
            author: author?,
            is_liked: is_liked?,
        })
    }

    /// A page of the global feed newer than `cursor_ms`, newest first.
    pub async fn feed(
        &self,
        viewer: Option<i64>,
        cursor_ms: Option<i64>,
        size: Option<usize>,
    ) -> Result<Vec<VideoInfo>, CoreError> {
        let ids = self
            .feed
            .page(cursor_ms.unwrap_or(0), self.feed.page_size(size))
            .await?;
        let videos = self.engine.loader().get_videos(&ids).await;
        Ok(self.video_infos(videos, viewer).await)
    }

    /// Videos published by `owner`, newest first.
    pub async fn published_videos(
        &self,
        owner: i64,
        viewer: Option<i64>,
    ) -> Result<Vec<VideoInfo>, CoreError> {
        let ids = self.engine.members(OwnerSet::UserVideos(owner)).await?;
        let videos = self.engine.loader().get_videos(&ids).await;
        Ok(self.video_infos(videos, viewer).await)
    }

    /// Videos liked by `owner`, highest id first.
    pub async fn liked_videos(
        &self,
        owner: i64,
        viewer: Option<i64>,
    ) -> Result<Vec<VideoInfo>, CoreError> {
        let mut ids = self.engine.members(OwnerSet::UserLikes(owner)).await?;
        ids.sort_unstable_by(|a, b| b.cmp(a));
        let videos = self.engine.loader().get_videos(&ids).await;
        Ok(self.video_infos(videos, viewer).await)
    }

    /// Comments on `video_id`, newest first.
    pub async fn comments(
        &self,
        video_id: i64,
        viewer: Option<i64>,
    ) -> Result<Vec<CommentInfo>, CoreError> {
        self.engine.loader().get_video(video_id).await?;
        let ids = self.engine.members(OwnerSet::VideoComments(video_id)).await?;
        let comments = self.engine.loader().get_comments(&ids).await;

        let results = join_all(comments.into_iter().map(|comment| async move {
            let commenter = self.users.user_info(comment.user_id, viewer).await?;
            Ok::<_, CoreError>(CommentInfo { comment, commenter })
        }))
        .await;
        Ok(collect_views(results, "comment"))
    }

    async fn video_infos(&self, videos: Vec<Video>, viewer: Option<i64>) -> Vec<VideoInfo> {
        let results = join_all(videos.into_iter().map(|v| self.video_info(v, viewer))).await;
        collect_views(results, "video")
    }
}
