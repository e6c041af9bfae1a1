use uuid::Uuid;

use super::Reading;

/// An in-flight slice of one session's readings.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub session_key: String,
    pub readings: Vec<Reading>,
    /// Set by the guaranteed transport so redeliveries can be recognised.
    pub message_id: Option<Uuid>,
}

impl Batch {
    pub fn new(session_key: impl Into<String>, readings: Vec<Reading>) -> Self {
        Self {
            session_key: session_key.into(),
            readings,
            message_id: None,
        }
    }

    pub fn with_message_id(mut self, message_id: Uuid) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}
