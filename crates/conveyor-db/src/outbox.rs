use async_trait::async_trait;
use conveyor_reconcile::{EmitError, Notification, NotificationEmitter};
use sqlx::Row;

use crate::PgTx;

/// Notification emitter that inserts into `messages` on the caller's
/// transaction. A rolled-back reconciliation leaves no message behind.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgMessageOutbox;

#[async_trait]
impl NotificationEmitter<PgTx> for PgMessageOutbox {
    async fn emit(&self, tx: &mut PgTx, notification: &Notification) -> Result<(), EmitError> {
        let row = sqlx::query(
            r#"
            insert into messages (event_type, payload)
            values ($1, $2)
            returning message_id
            "#,
        )
        .bind(notification.kind.as_str())
        .bind(notification.payload_json())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) => EmitError::Rejected(db.to_string()),
            other => EmitError::Unavailable(other.to_string()),
        })?;

        let message_id: i64 = row
            .try_get("message_id")
            .map_err(|e| EmitError::Rejected(e.to_string()))?;
        tracing::debug!(
            message_id,
            event_type = notification.kind.as_str(),
            "notification enqueued"
        );
        Ok(())
    }
}
