use sqlx::SqlitePool;

use crate::appresult::{AppError, AppResult};
use crate::db;

#[derive(Debug, Clone)]
pub struct Message {
    pub id: i64,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub body: String,
    pub created_at: String,
    pub is_read: bool,
}

#[derive(Debug, Clone)]
pub struct Room {
    pub id: i64,
    pub user_lo: i64,
    pub user_hi: i64,
    pub created_at: String,
    pub last_message_id: Option<i64>,
}

impl Room {
    pub fn participant_ids(&self) -> Vec<i64> {
        if self.user_lo == self.user_hi {
            vec![self.user_lo]
        } else {
            vec![self.user_lo, self.user_hi]
        }
    }

    pub fn has_participant(&self, user_id: i64) -> bool {
        self.user_lo == user_id || self.user_hi == user_id
    }
}

fn normalize(a: i64, b: i64) -> (i64, i64) {
    if a <= b { (a, b) } else { (b, a) }
}

fn room_from_row(row: (i64, i64, i64, String, Option<i64>)) -> Room {
    let (id, user_lo, user_hi, created_at, last_message_id) = row;
    Room { id, user_lo, user_hi, created_at, last_message_id }
}

async fn room_by_pair(db_pool: &SqlitePool, lo: i64, hi: i64) -> AppResult<Option<Room>> {
    let row: Option<(i64, i64, i64, String, Option<i64>)> = sqlx::query_as(
        "SELECT id,user_lo,user_hi,created_at,last_message_id FROM rooms WHERE user_lo=? AND user_hi=?",
    )
    .bind(lo)
    .bind(hi)
    .fetch_optional(db_pool)
    .await?;
    Ok(row.map(room_from_row))
}

pub async fn room_by_id(db_pool: &SqlitePool, room_id: i64) -> AppResult<Option<Room>> {
    let row: Option<(i64, i64, i64, String, Option<i64>)> = sqlx::query_as(
        "SELECT id,user_lo,user_hi,created_at,last_message_id FROM rooms WHERE id=?",
    )
    .bind(room_id)
    .fetch_optional(db_pool)
    .await?;
    Ok(row.map(room_from_row))
}

pub async fn rooms_for_user(db_pool: &SqlitePool, user_id: i64) -> AppResult<Vec<Room>> {
    let rows: Vec<(i64, i64, i64, String, Option<i64>)> = sqlx::query_as(
        "SELECT id,user_lo,user_hi,created_at,last_message_id FROM rooms WHERE user_lo=? OR user_hi=? ORDER BY id",
    )
    .bind(user_id)
    .bind(user_id)
    .fetch_all(db_pool)
    .await?;
    Ok(rows.into_iter().map(room_from_row).collect())
}

/// One room per unordered pair. Concurrent first contacts race between the
/// lookup and the insert; the UNIQUE pair key turns the loser's insert into
/// a no-op and the re-read below returns the winner's row.
pub async fn get_or_create_room(db_pool: &SqlitePool, user_a: i64, user_b: i64) -> AppResult<Room> {
    let (lo, hi) = normalize(user_a, user_b);
    if let Some(room) = room_by_pair(db_pool, lo, hi).await? {
        return Ok(room);
    }

    sqlx::query(
        "INSERT INTO rooms (user_lo,user_hi,created_at) VALUES (?,?,?) \
         ON CONFLICT(user_lo,user_hi) DO NOTHING",
    )
    .bind(lo)
    .bind(hi)
    .bind(db::now())
    .execute(db_pool)
    .await?;

    room_by_pair(db_pool, lo, hi).await?.ok_or_else(|| {
        AppError::from(anyhow::anyhow!("room for pair ({lo},{hi}) missing after insert"))
    })
}

pub async fn append_message(
    db_pool: &SqlitePool,
    sender_id: i64,
    receiver_id: i64,
    body: &str,
) -> AppResult<(Message, Room)> {
    let mut room = get_or_create_room(db_pool, sender_id, receiver_id).await?;

    let created_at = db::now();
    let result = sqlx::query(
        "INSERT INTO messages (sender_id,receiver_id,body,created_at) VALUES (?,?,?,?)",
    )
    .bind(sender_id)
    .bind(receiver_id)
    .bind(body)
    .bind(&created_at)
    .execute(db_pool)
    .await?;
    let id = result.last_insert_rowid();

    sqlx::query("UPDATE rooms SET last_message_id=? WHERE id=?")
        .bind(id)
        .bind(room.id)
        .execute(db_pool)
        .await?;
    room.last_message_id = Some(id);

    let message = Message {
        id,
        sender_id,
        receiver_id,
        body: body.to_owned(),
        created_at,
        is_read: false,
    };
    Ok((message, room))
}

pub async fn messages_for_room(db_pool: &SqlitePool, room: &Room) -> AppResult<Vec<Message>> {
    let rows: Vec<(i64, i64, i64, String, String, bool)> = sqlx::query_as(
        "SELECT id,sender_id,receiver_id,body,created_at,is_read FROM messages \
         WHERE (sender_id=? AND receiver_id=?) OR (sender_id=? AND receiver_id=?) \
         ORDER BY created_at,id",
    )
    .bind(room.user_lo)
    .bind(room.user_hi)
    .bind(room.user_hi)
    .bind(room.user_lo)
    .fetch_all(db_pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, sender_id, receiver_id, body, created_at, is_read)| Message {
            id,
            sender_id,
            receiver_id,
            body,
            created_at,
            is_read,
        })
        .collect())
}

/// Flips `is_read` only when `reader_id` is the receiver and the message is
/// still unread. Unknown message, foreign message and already-read all
/// report `false`; the caller broadcasts a receipt only on `true`.
pub async fn mark_read(db_pool: &SqlitePool, message_id: i64, reader_id: i64) -> AppResult<bool> {
    let result = sqlx::query("UPDATE messages SET is_read=1 WHERE id=? AND receiver_id=? AND is_read=0")
        .bind(message_id)
        .bind(reader_id)
        .execute(db_pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
