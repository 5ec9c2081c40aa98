use serde_json::{Value, json};
use sqlx::SqlitePool;

use crate::appresult::AppResult;
use crate::db;

#[derive(Debug, Clone)]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub body: String,
    pub data: String,
    pub is_read: bool,
    pub created_at: String,
}

impl Notification {
    /// Serialized form, identical on the websocket push and the list
    /// endpoint; `data` carries the deep-link refs as a nested object.
    pub fn payload(&self) -> AppResult<Value> {
        let data: Value = serde_json::from_str(&self.data)?;
        Ok(json!({
            "id": self.id,
            "title": self.title,
            "message": self.body,
            "data": data,
            "is_read": self.is_read,
            "created_at": self.created_at,
        }))
    }
}

pub async fn create(
    db_pool: &SqlitePool,
    user_id: i64,
    title: &str,
    body: &str,
    data: &Value,
) -> AppResult<Notification> {
    let created_at = db::now();
    let data = data.to_string();
    let result = sqlx::query(
        "INSERT INTO notifications (user_id,title,body,data,created_at) VALUES (?,?,?,?,?)",
    )
    .bind(user_id)
    .bind(title)
    .bind(body)
    .bind(&data)
    .bind(&created_at)
    .execute(db_pool)
    .await?;

    Ok(Notification {
        id: result.last_insert_rowid(),
        user_id,
        title: title.to_owned(),
        body: body.to_owned(),
        data,
        is_read: false,
        created_at,
    })
}

pub async fn list_for_user(db_pool: &SqlitePool, user_id: i64) -> AppResult<Vec<Notification>> {
    let rows: Vec<(i64, i64, String, String, String, bool, String)> = sqlx::query_as(
        "SELECT id,user_id,title,body,data,is_read,created_at FROM notifications \
         WHERE user_id=? ORDER BY id DESC",
    )
    .bind(user_id)
    .fetch_all(db_pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, user_id, title, body, data, is_read, created_at)| Notification {
            id,
            user_id,
            title,
            body,
            data,
            is_read,
            created_at,
        })
        .collect())
}

pub async fn unread_count(db_pool: &SqlitePool, user_id: i64) -> AppResult<i64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM notifications WHERE user_id=? AND is_read=0")
            .bind(user_id)
            .fetch_one(db_pool)
            .await?;
    Ok(count)
}

// Ownership rides in the WHERE clause: acting on someone else's
// notification looks exactly like acting on a missing one.
pub async fn mark_read(db_pool: &SqlitePool, id: i64, user_id: i64) -> AppResult<bool> {
    let result = sqlx::query("UPDATE notifications SET is_read=1 WHERE id=? AND user_id=?")
        .bind(id)
        .bind(user_id)
        .execute(db_pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn mark_all_read(db_pool: &SqlitePool, user_id: i64) -> AppResult<u64> {
    let result = sqlx::query("UPDATE notifications SET is_read=1 WHERE user_id=? AND is_read=0")
        .bind(user_id)
        .execute(db_pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn delete(db_pool: &SqlitePool, id: i64, user_id: i64) -> AppResult<bool> {
    let result = sqlx::query("DELETE FROM notifications WHERE id=? AND user_id=?")
        .bind(id)
        .bind(user_id)
        .execute(db_pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::init_schema(&pool).await.unwrap();
        for (id, username) in [(1, "alice"), (2, "bob")] {
            sqlx::query("INSERT INTO users (id,username,role) VALUES (?,?,'renter')")
                .bind(id)
                .bind(username)
                .execute(&pool)
                .await
                .unwrap();
        }
        pool
    }

    fn sample_data() -> Value {
        json!({ "room_id": 1, "sender_id": 2, "message_id": 3 })
    }

    #[tokio::test]
    async fn payload_carries_deep_link_data() {
        let pool = test_pool().await;
        let notification = create(&pool, 1, "New message from bob", "hi", &sample_data())
            .await
            .unwrap();
        let payload = notification.payload().unwrap();
        assert_eq!(payload["title"], "New message from bob");
        assert_eq!(payload["message"], "hi");
        assert_eq!(payload["data"]["message_id"], 3);
        assert_eq!(payload["is_read"], false);
    }

    #[tokio::test]
    async fn listing_counts_unread_and_is_scoped_to_the_user() {
        let pool = test_pool().await;
        create(&pool, 1, "a", "1", &sample_data()).await.unwrap();
        create(&pool, 1, "b", "2", &sample_data()).await.unwrap();
        create(&pool, 2, "c", "3", &sample_data()).await.unwrap();

        let mine = list_for_user(&pool, 1).await.unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(unread_count(&pool, 1).await.unwrap(), 2);
        assert_eq!(unread_count(&pool, 2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn mark_read_requires_ownership() {
        let pool = test_pool().await;
        let notification = create(&pool, 1, "a", "1", &sample_data()).await.unwrap();

        assert!(!mark_read(&pool, notification.id, 2).await.unwrap());
        assert_eq!(unread_count(&pool, 1).await.unwrap(), 1);

        assert!(mark_read(&pool, notification.id, 1).await.unwrap());
        assert_eq!(unread_count(&pool, 1).await.unwrap(), 0);
        // marking again still succeeds, the row just stays read
        assert!(mark_read(&pool, notification.id, 1).await.unwrap());
    }

    #[tokio::test]
    async fn mark_all_read_only_touches_unread_rows() {
        let pool = test_pool().await;
        let first = create(&pool, 1, "a", "1", &sample_data()).await.unwrap();
        create(&pool, 1, "b", "2", &sample_data()).await.unwrap();
        mark_read(&pool, first.id, 1).await.unwrap();

        assert_eq!(mark_all_read(&pool, 1).await.unwrap(), 1);
        assert_eq!(unread_count(&pool, 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_requires_ownership() {
        let pool = test_pool().await;
        let notification = create(&pool, 1, "a", "1", &sample_data()).await.unwrap();

        assert!(!delete(&pool, notification.id, 2).await.unwrap());
        assert!(delete(&pool, notification.id, 1).await.unwrap());
        assert!(!delete(&pool, notification.id, 1).await.unwrap());
        assert!(list_for_user(&pool, 1).await.unwrap().is_empty());
    }
}
