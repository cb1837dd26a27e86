//! Core domain models and strongly-typed identifiers.
//!
//! Defines notifications, delivery jobs, device tokens, and newtype ID
//! wrappers for compile-time type safety. Includes database serialization
//! traits and state transition logic for the push delivery pipeline.

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed notification identifier.
///
/// Wraps a UUID to prevent mixing with other ID types. A notification is
/// immutable once created, and this ID follows it through its entire
/// delivery lifecycle.
///
/// # Example
///
/// ```
/// use pushline_core::models::NotificationId;
/// let notification_id = NotificationId::new();
/// println!("Dispatching notification: {}", notification_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationId(pub Uuid);

impl NotificationId {
    /// Creates a new random notification ID.
    ///
    /// Uses UUID v4 for globally unique identifiers without coordination.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for NotificationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for NotificationId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for NotificationId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for NotificationId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed delivery job identifier.
///
/// Each job represents one queued delivery of a notification. The job, not
/// the notification, carries retry state and the terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for JobId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for JobId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed user identifier.
///
/// Identifies the recipient of a notification. Device tokens are registered
/// against a user, and token resolution is scoped to a single user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    /// Creates a new random user ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for UserId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for UserId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for UserId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for UserId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Delivery job lifecycle status.
///
/// Jobs progress through these states during processing. State transitions
/// are strictly controlled to maintain consistency:
///
/// ```text
/// Pending -> Processing -> Completed
///                       -> Failed
///                       -> Pending (retry, below max)
///                       -> DeadLetter (retries exhausted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued and waiting for a worker.
    ///
    /// Jobs in this state are eligible for claiming on the next poll,
    /// whether freshly enqueued or requeued after a retryable failure.
    Pending,

    /// Worker actively delivering.
    ///
    /// A worker has claimed this job and holds it exclusively.
    /// This state prevents duplicate deliveries.
    Processing,

    /// At least one device received the push.
    ///
    /// Terminal success state. Partial fan-out success still completes
    /// the job; per-token failures are not retried individually.
    Completed,

    /// Permanently failed without a delivery attempt being possible.
    ///
    /// Terminal state reached when the recipient has no registered device
    /// tokens. The job is not retried; a device registered later needs a
    /// freshly enqueued job.
    Failed,

    /// Moved to the dead-letter queue after retries were exhausted.
    ///
    /// Terminal failure state. Requires manual intervention or
    /// reprocessing. Used for debugging and audit trail.
    DeadLetter,
}

impl JobStatus {
    /// Returns true for states the pipeline never transitions out of.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::DeadLetter)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::DeadLetter => write!(f, "dead_letter"),
        }
    }
}

impl sqlx::Type<PgDb> for JobStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dead_letter" => Ok(Self::DeadLetter),
            _ => Err(format!("invalid job status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for JobStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Core notification entity.
///
/// Represents a message addressed to a user. Delivery state lives on the
/// associated [`DeliveryJob`]; the notification itself only records whether
/// a push went out (`sent`) and whether the user has read it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    /// Unique identifier for this notification.
    pub id: NotificationId,

    /// Recipient of this notification.
    pub user_id: UserId,

    /// Short title shown in the push banner.
    pub title: String,

    /// Message body.
    pub body: String,

    /// Opaque key/value payload forwarded to the client application.
    ///
    /// The key `notificationId` is reserved: the dispatch path always
    /// overwrites it with this notification's ID so clients can deep-link
    /// back to the record.
    pub metadata: sqlx::types::Json<HashMap<String, String>>,

    /// Whether a push for this notification reached at least one device.
    ///
    /// Flipped to true exactly once, when the delivery job completes.
    pub sent: bool,

    /// Whether the user has opened the notification.
    pub read: bool,

    /// Soft-delete flag. Deleted notifications stay on disk for audit but
    /// are excluded from user-facing listings.
    pub deleted: bool,

    /// When this notification was created.
    pub created_at: DateTime<Utc>,

    /// When this notification was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    /// Metadata as a regular HashMap for easy access.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata.0
    }

    /// Create a Notification with the given data.
    pub fn new(
        id: NotificationId,
        user_id: UserId,
        title: String,
        body: String,
        metadata: HashMap<String, String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            title,
            body,
            metadata: sqlx::types::Json(metadata),
            sent: false,
            read: false,
            deleted: false,
            created_at,
            updated_at: created_at,
        }
    }
}

/// Queued delivery of a notification.
///
/// One job per notification. Carries the retry counter, the last error seen,
/// and the provider message ID once delivery succeeds.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryJob {
    /// Unique identifier for this job.
    pub id: JobId,

    /// Notification this job delivers.
    pub notification_id: NotificationId,

    /// Current processing status.
    pub status: JobStatus,

    /// Number of failed delivery attempts so far.
    ///
    /// Incremented on each retryable failure. The job moves to
    /// `dead_letter` once this reaches the configured maximum.
    pub retries: i32,

    /// Error message from the most recent failed attempt.
    pub last_error: Option<String>,

    /// Provider message ID recorded on successful delivery.
    pub message_id: Option<String>,

    /// When this job was enqueued.
    pub created_at: DateTime<Utc>,

    /// When a worker last claimed this job.
    ///
    /// Used to detect jobs stranded in `processing` by a crashed worker.
    pub processing_at: Option<DateTime<Utc>>,

    /// When this job last changed state.
    pub updated_at: DateTime<Utc>,
}

impl DeliveryJob {
    /// Create a pending DeliveryJob for a notification.
    pub fn new(id: JobId, notification_id: NotificationId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            notification_id,
            status: JobStatus::Pending,
            retries: 0,
            last_error: None,
            message_id: None,
            created_at,
            processing_at: None,
            updated_at: created_at,
        }
    }
}

/// Device platform a push token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Apple devices via APNs-backed tokens.
    Ios,
    /// Android devices.
    Android,
    /// Web push registrations.
    Web,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ios => write!(f, "ios"),
            Self::Android => write!(f, "android"),
            Self::Web => write!(f, "web"),
        }
    }
}

impl sqlx::Type<PgDb> for Platform {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for Platform {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "ios" => Ok(Self::Ios),
            "android" => Ok(Self::Android),
            "web" => Ok(Self::Web),
            _ => Err(format!("invalid platform: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for Platform {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Registered push token for a user's device.
///
/// A user may hold any number of tokens across platforms. Tokens are upserted
/// on registration so re-installing an app does not create duplicates.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceToken {
    /// Unique identifier for this registration.
    pub id: Uuid,

    /// User this token belongs to.
    pub user_id: UserId,

    /// Opaque provider token string.
    pub token: String,

    /// Platform the token was issued for.
    pub platform: Platform,

    /// When this token was registered.
    pub created_at: DateTime<Utc>,
}
