use chrono::Utc;
use tracing::instrument;

use loom_core::ids::{MessageId, ThreadId};
use loom_core::messages::{Answer, Message, Question};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Stores questions and answers as JSON payloads, ordered per thread.
///
/// Appends run as one transaction under the database connection lock, so
/// reading the next sequence number and inserting the row cannot interleave
/// with another writer, whichever repo instance it goes through.
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, question), fields(thread_id = %question.thread_id, message_id = %question.id))]
    pub fn append_question(&self, question: &Question) -> Result<i64, StoreError> {
        self.append(&Message::Question(question.clone()))
    }

    #[instrument(skip(self, answer), fields(thread_id = %answer.thread_id, message_id = %answer.id, status = %answer.status))]
    pub fn append_answer(&self, answer: &Answer) -> Result<i64, StoreError> {
        self.append(&Message::Answer(answer.clone()))
    }

    /// Append a message at the end of its thread. Returns its sequence number.
    fn append(&self, message: &Message) -> Result<i64, StoreError> {
        let thread_id = message.thread_id();

        let (role, status, error) = match message {
            Message::Question(_) => ("question", None, false),
            Message::Answer(a) => ("answer", Some(a.status.to_string()), a.metadata.error),
        };
        let payload = serde_json::to_string(message)?;
        let created_at = row_helpers::format_timestamp(&message.created_at());
        let now = row_helpers::format_timestamp(&Utc::now());

        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let max_seq: Option<i64> = tx
                .query_row(
                    "SELECT (SELECT MAX(sequence) FROM messages WHERE thread_id = ?1)
                     FROM threads WHERE id = ?1",
                    [thread_id.as_str()],
                    |row| row.get(0),
                )
                .map_err(|_| StoreError::NotFound(format!("thread {thread_id}")))?;
            let sequence = max_seq.map_or(0, |s| s + 1);

            tx.execute(
                "INSERT INTO messages (id, thread_id, parent_id, sequence, role, status, error, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    message.id().as_str(),
                    thread_id.as_str(),
                    message.parent_id().map(MessageId::as_str),
                    sequence,
                    role,
                    status,
                    error,
                    payload,
                    created_at,
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::Conflict(format!("message {} already stored", message.id()))
                }
                other => other.into(),
            })?;

            tx.execute(
                "UPDATE threads SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, thread_id.as_str()],
            )?;

            tx.commit()?;
            Ok(sequence)
        })
    }

    /// All messages of a thread in append order.
    #[instrument(skip(self), fields(thread_id = %thread_id))]
    pub fn list(&self, thread_id: &ThreadId) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM messages WHERE thread_id = ?1 ORDER BY sequence ASC",
            )?;
            let mut rows = stmt.query([thread_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(message_id = %id))]
    pub fn get(&self, id: &MessageId) -> Result<Message, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT payload FROM messages WHERE id = ?1")?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_message(row),
                None => Err(StoreError::NotFound(format!("message {id}"))),
            }
        })
    }

    /// Id of the newest message in a thread; the parent of the next question.
    #[instrument(skip(self), fields(thread_id = %thread_id))]
    pub fn last_message_id(&self, thread_id: &ThreadId) -> Result<Option<MessageId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM messages WHERE thread_id = ?1 ORDER BY sequence DESC LIMIT 1",
            )?;
            let mut rows = stmt.query([thread_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(MessageId::from_raw(row_helpers::get::<String>(
                    row, 0, "messages", "id",
                )?))),
                None => Ok(None),
            }
        })
    }

    pub fn count(&self, thread_id: &ThreadId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE thread_id = ?1",
                [thread_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }

    /// Attach generated next-step suggestions to a stored answer.
    #[instrument(skip(self, steps), fields(message_id = %answer_id, steps = steps.len()))]
    pub fn record_next_steps(&self, answer_id: &MessageId, steps: &[String]) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let raw: String = tx
                .query_row(
                    "SELECT payload FROM messages WHERE id = ?1",
                    [answer_id.as_str()],
                    |row| row.get(0),
                )
                .map_err(|_| StoreError::NotFound(format!("message {answer_id}")))?;

            let mut message: Message = row_helpers::parse_json(&raw, "messages", "payload")?;
            match &mut message {
                Message::Answer(answer) => answer.next_steps = steps.to_vec(),
                Message::Question(_) => {
                    return Err(StoreError::Conflict(format!(
                        "message {answer_id} is a question"
                    )))
                }
            }

            tx.execute(
                "UPDATE messages SET payload = ?1 WHERE id = ?2",
                rusqlite::params![serde_json::to_string(&message)?, answer_id.as_str()],
            )?;
            tx.commit()?;
            Ok(())
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    let raw: String = row_helpers::get(row, 0, "messages", "payload")?;
    row_helpers::parse_json(&raw, "messages", "payload")
}
