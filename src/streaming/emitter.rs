//! Event emission seam for the streaming engine.
//!
//! Chat streams publish to the task room; subscription runs instead fold
//! their terminal events into the owning `BackgroundExecution` so nothing
//! is broadcast for tasks nobody is watching live.

use crate::bus::EventBus;
use crate::events::Envelope;
use crate::store::{Database, ExecutionStatus};

pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: &Envelope);
}

/// Publishes every event to a bus room.
pub struct RoomEmitter {
    bus: EventBus,
    room: String,
}

impl RoomEmitter {
    pub fn new(bus: EventBus, room: impl Into<String>) -> Self {
        Self {
            bus,
            room: room.into(),
        }
    }
}

impl EventEmitter for RoomEmitter {
    fn emit(&self, event: &Envelope) {
        self.bus.publish(&self.room, event.clone());
    }
}

/// Updates the backing execution row on terminal events; drops the rest.
pub struct SubscriptionEmitter {
    db: Database,
    execution_id: i64,
}

impl SubscriptionEmitter {
    pub fn new(db: Database, execution_id: i64) -> Self {
        Self { db, execution_id }
    }
}

impl EventEmitter for SubscriptionEmitter {
    fn emit(&self, event: &Envelope) {
        let outcome = match event.event.as_str() {
            "chat:done" => Some((ExecutionStatus::Completed, None)),
            "chat:cancelled" => Some((ExecutionStatus::Cancelled, None)),
            "chat:error" => {
                let message = event.data["error"].as_str().unwrap_or("stream failed");
                Some((ExecutionStatus::Failed, Some(message.to_string())))
            }
            _ => None,
        };
        if let Some((status, error)) = outcome {
            if let Err(e) =
                self.db
                    .update_execution_status(self.execution_id, status, error.as_deref())
            {
                tracing::warn!(
                    execution_id = self.execution_id,
                    error = %e,
                    "failed to record execution outcome"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::executions::NewExecution;

    fn execution(db: &Database) -> i64 {
        db.create_execution(&NewExecution {
            subscription_id: 1,
            user_id: 7,
            trigger_type: "cron".into(),
            trigger_reason: "due".into(),
            prompt: "digest".into(),
        })
        .unwrap()
        .id
    }

    #[test]
    fn done_marks_execution_completed() {
        let db = Database::open_in_memory().unwrap();
        let id = execution(&db);
        let emitter = SubscriptionEmitter::new(db.clone(), id);

        emitter.emit(&Envelope::chat_chunk(1, 2, 3, "x", 0)); // ignored
        emitter.emit(&Envelope::chat_done(
            1,
            2,
            3,
            1,
            &crate::store::SubtaskResult::text("x"),
        ));

        let row = db.get_execution(id).unwrap();
        assert_eq!(row.status, ExecutionStatus::Completed);
    }

    #[test]
    fn error_marks_execution_failed_with_message() {
        let db = Database::open_in_memory().unwrap();
        let id = execution(&db);
        let emitter = SubscriptionEmitter::new(db.clone(), id);

        emitter.emit(&Envelope::chat_error(1, 2, 3, "model melted"));

        let row = db.get_execution(id).unwrap();
        assert_eq!(row.status, ExecutionStatus::Failed);
        assert_eq!(row.error_message.as_deref(), Some("model melted"));
    }
}
