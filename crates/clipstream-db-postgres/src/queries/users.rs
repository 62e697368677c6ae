//! User queries.

use sqlx_core::executor::Executor;
use sqlx_core::query_as::query_as;
use sqlx_postgres::Postgres;

use clipstream_storage::{NewUser, StorageError, User, tables};

use crate::error::{is_unique_violation, query_error};

type UserRow = (i64, String, String, String, String);

fn into_user(row: UserRow) -> User {
    User {
        id: row.0,
        username: row.1,
        nickname: row.2,
        avatar_url: row.3,
        background_img_url: row.4,
    }
}

/// Inserts a user and returns the stored row.
pub async fn insert<'c, E>(executor: E, user: NewUser) -> Result<User, StorageError>
where
    E: Executor<'c, Database = Postgres>,
{
    let username = user.username.clone();
    let row: UserRow = query_as(
        r#"INSERT INTO users (username, nickname, avatar_url, background_img_url)
           VALUES ($1, $2, $3, $4)
           RETURNING id, username, nickname, avatar_url, background_img_url"#,
    )
    .bind(user.username)
    .bind(user.nickname)
    .bind(user.avatar_url)
    .bind(user.background_img_url)
    .fetch_one(executor)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StorageError::already_exists(tables::USERS, username)
        } else {
            query_error("Failed to create user", e)
        }
    })?;

    Ok(into_user(row))
}

/// Reads a user by id.
pub async fn get<'c, E>(executor: E, id: i64) -> Result<Option<User>, StorageError>
where
    E: Executor<'c, Database = Postgres>,
{
    let row: Option<UserRow> = query_as(
        r#"SELECT id, username, nickname, avatar_url, background_img_url
           FROM users
           WHERE id = $1"#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await
    .map_err(|e| query_error("Failed to read user", e))?;

    Ok(row.map(into_user))
}
