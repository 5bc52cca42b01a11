use thiserror::Error;

/// Errors produced by the store layer.
///
/// The domain variants map one-to-one onto the failure responses of the
/// request boundary; the infrastructure variants (`Sqlite`, `Io`, ...) are
/// the "store unavailable" class and surface as persistence failures.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// UUID parsing error.
    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    /// Chrono parsing error.
    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),

    /// Message payload (de)serialization error.
    #[error("Content serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A user tried to open a direct conversation with themselves.
    #[error("Cannot create a conversation with yourself")]
    SelfConversation,

    /// Group creation with fewer than two total participants.
    #[error("Invalid group: {0}")]
    InvalidGroup(String),

    /// The acting user is not a participant of the conversation.
    #[error("Not a participant of this conversation")]
    NotParticipant,

    /// A non-admin attempted an admin-only action.
    #[error("Only group admins may perform this action")]
    NotAuthorized,

    /// Adding a user who is already a participant, or promoting an existing
    /// admin.
    #[error("User is already a member")]
    AlreadyMember,

    /// The target of a membership operation does not hold the required role.
    #[error("User is not a member")]
    NotAMember,

    /// Demoting the sole admin while other participants remain.
    #[error("Cannot demote the last admin; promote another admin first")]
    LastAdmin,

    /// Group-only operation attempted on a direct conversation.
    #[error("Not a group conversation")]
    NotAGroup,

    /// Message content rejected at the store boundary.
    #[error("Invalid message content: {0}")]
    InvalidContent(#[from] parley_shared::model::ContentError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
