use thiserror::Error;
use ulid::Ulid;

/// Coarse category an outer layer maps to a response (404/403/409/422/500).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    Conflict,
    Invalid,
    Internal,
}

#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("room not found: {0}")]
    RoomNotFound(Ulid),

    #[error("booking not found: {0}")]
    BookingNotFound(Ulid),

    #[error("waitlist entry not found: {0}")]
    EntryNotFound(Ulid),

    #[error("room already exists: {0}")]
    RoomExists(Ulid),

    #[error("user {actor} may not modify {target}")]
    Forbidden { actor: Ulid, target: Ulid },

    #[error("conflict with booking: {booking}")]
    Conflict { booking: Ulid },

    #[error("already on the waitlist for this slot: entry {entry}")]
    DuplicateWaitlistEntry { entry: Ulid },

    #[error("booking already cancelled: {0}")]
    AlreadyCancelled(Ulid),

    #[error("invalid request: {0}")]
    Invalid(&'static str),

    #[error("storage error: {0}")]
    Storage(String),
}

impl SchedulingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulingError::RoomNotFound(_)
            | SchedulingError::BookingNotFound(_)
            | SchedulingError::EntryNotFound(_) => ErrorKind::NotFound,
            SchedulingError::Forbidden { .. } => ErrorKind::Forbidden,
            SchedulingError::Conflict { .. }
            | SchedulingError::DuplicateWaitlistEntry { .. }
            | SchedulingError::AlreadyCancelled(_)
            | SchedulingError::RoomExists(_) => ErrorKind::Conflict,
            SchedulingError::Invalid(_) => ErrorKind::Invalid,
            SchedulingError::Storage(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        let id = Ulid::new();
        assert_eq!(SchedulingError::BookingNotFound(id).kind(), ErrorKind::NotFound);
        assert_eq!(
            SchedulingError::Forbidden { actor: id, target: id }.kind(),
            ErrorKind::Forbidden
        );
        assert_eq!(
            SchedulingError::DuplicateWaitlistEntry { entry: id }.kind(),
            ErrorKind::Conflict
        );
        assert_eq!(SchedulingError::AlreadyCancelled(id).kind(), ErrorKind::Conflict);
        assert_eq!(SchedulingError::Invalid("end before start").kind(), ErrorKind::Invalid);
        assert_eq!(SchedulingError::Storage("disk".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn already_cancelled_message_is_explicit() {
        let id = Ulid::new();
        let msg = SchedulingError::AlreadyCancelled(id).to_string();
        assert!(msg.contains("already cancelled"));
        assert!(msg.contains(&id.to_string()));
    }
}
