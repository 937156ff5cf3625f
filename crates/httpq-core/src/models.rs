//! Core domain models and strongly-typed identifiers.
//!
//! Defines the webhook event record and its state taxonomy, the transient
//! views produced while sending (pending deliveries, delivery responses,
//! attempted webhooks), and the collaborator entities the enqueuer resolves
//! before admitting an event. Identifiers are UUID newtypes so an event id
//! can never be passed where a subscription id is expected.

use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl sqlx::postgres::PgHasArrayType for $name {
            fn array_type_info() -> PgTypeInfo {
                <Uuid as sqlx::postgres::PgHasArrayType>::array_type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a webhook event; also the payload of queue entries.
    EventId
);
uuid_id!(
    /// Identifier of a tenant, the owner of every other entity.
    TenantId
);
uuid_id!(
    /// Identifier of a tenant's downstream consumer.
    ConsumerId
);
uuid_id!(
    /// Identifier of a named event category.
    TopicId
);
uuid_id!(
    /// Identifier of a payload schema version.
    VersionId
);
uuid_id!(
    /// Identifier of a consumer-to-topic binding with a delivery URL.
    SubscriptionId
);

/// Delivery state of a webhook event.
///
/// `Pending` is the initial state and `Delivered` the only terminal success.
/// Every other variant describes why the latest attempt did not deliver and
/// remains eligible for retry until the attempt ceiling is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookState {
    /// Admitted, no attempt made yet.
    Pending,
    /// Receiver answered HTTP 200.
    Delivered,
    /// Receiver answered with a status other than 200 or 429.
    HttpError,
    /// Destination host could not be resolved.
    UnknownHost,
    /// Deadline elapsed or the connection closed mid-flight.
    Timeout,
    /// TLS negotiation failed.
    TlsError,
    /// Receiver rate-limited us with HTTP 429.
    Backoff,
    /// Any other transport failure.
    Other,
}

impl WebhookState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 8] = [
        Self::Pending,
        Self::Delivered,
        Self::HttpError,
        Self::UnknownHost,
        Self::Timeout,
        Self::TlsError,
        Self::Backoff,
        Self::Other,
    ];

    /// Stored representation of the state.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Delivered => "DELIVERED",
            Self::HttpError => "HTTP_ERROR",
            Self::UnknownHost => "UNKNOWN_HOST",
            Self::Timeout => "TIMEOUT",
            Self::TlsError => "TLS_ERROR",
            Self::Backoff => "BACKOFF",
            Self::Other => "OTHER",
        }
    }

    /// Whether the state is terminal success.
    pub const fn is_delivered(self) -> bool {
        matches!(self, Self::Delivered)
    }

    /// Whether the state records a failed attempt.
    pub const fn is_undelivered(self) -> bool {
        !matches!(self, Self::Pending | Self::Delivered)
    }
}

impl fmt::Display for WebhookState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("invalid webhook state: {s}"))
    }
}

impl sqlx::Type<PgDb> for WebhookState {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <str as sqlx::Type<PgDb>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for WebhookState {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl sqlx::Encode<'_, PgDb> for WebhookState {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// A webhook event as stored in the partitioned event log.
///
/// Foreign references and the request payload are fixed at creation. The
/// response columns are overwritten by every attempt.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookEvent {
    /// Unique identifier of the event.
    pub id: EventId,

    /// Delivery state after the latest attempt.
    pub state: WebhookState,

    /// Owning tenant.
    pub tenant_id: TenantId,

    /// Consumer the payload was rendered for.
    pub consumer_id: ConsumerId,

    /// Topic the event was published on.
    pub topic_id: TopicId,

    /// Payload version chosen from the consumer's binding.
    pub version_id: VersionId,

    /// Subscription providing the delivery URL.
    pub subscription_id: SubscriptionId,

    /// Number of delivery attempts made so far. Never decremented.
    pub try_count: i32,

    /// Headers captured at admission.
    pub request_headers: Option<Json<HashMap<String, String>>>,

    /// Payload captured at admission.
    pub request_body: Option<Json<serde_json::Value>>,

    /// URL used by the latest attempt.
    pub url: Option<String>,

    /// Headers of the latest response.
    pub response_headers: Option<Json<HashMap<String, String>>>,

    /// Body of the latest response, absent for rate-limited attempts.
    pub response_body: Option<String>,

    /// Status code of the latest response, absent on transport failure.
    pub response_code: Option<i32>,

    /// Duration of the latest attempt in milliseconds.
    pub duration_ms: Option<i64>,

    /// When the event was admitted. Retry times are measured from here.
    pub created_at: DateTime<Utc>,

    /// When the row was last written.
    pub updated_at: DateTime<Utc>,

    /// When the event reached `Delivered`.
    pub delivered_at: Option<DateTime<Utc>>,

    /// Daily partition the row lives in.
    pub partition_date: NaiveDate,
}

/// Request to admit a new webhook event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWebhookEvent {
    /// Tenant publishing the event.
    pub tenant_id: TenantId,

    /// Consumer the event is addressed to.
    pub consumer_id: ConsumerId,

    /// Name of the topic, unique within the tenant.
    pub topic_name: String,

    /// Payload rendered once per tenant version, keyed by version name.
    ///
    /// The key set must equal the tenant's version set exactly.
    pub versioned_payload: HashMap<String, serde_json::Value>,

    /// Headers to forward with every delivery attempt.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Everything needed to attempt delivery of one claimed event.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PendingDelivery {
    /// Event being delivered.
    pub event_id: EventId,

    /// Current URL of the event's subscription.
    pub url: String,

    /// Headers captured at admission.
    pub request_headers: Option<Json<HashMap<String, String>>>,

    /// Payload captured at admission, as JSON text.
    pub request_body: Option<String>,
}

/// Classified outcome of a single delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResponse {
    /// Event the attempt was made for.
    pub event_id: EventId,

    /// State derived from the outcome.
    pub state: WebhookState,

    /// HTTP status, absent when no response was received.
    pub status_code: Option<u16>,

    /// Response headers, empty when no response was received.
    pub headers: HashMap<String, String>,

    /// Response body. Not kept for HTTP 429 or transport failures.
    pub body: Option<String>,

    /// Wall time spent on the attempt.
    pub duration: Duration,

    /// URL the attempt was sent to.
    pub url: String,
}

/// Post-update view of an event after an attempt was recorded.
///
/// Only used to choose between rescheduling and disabling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct AttemptedWebhook {
    /// Event the attempt was recorded for.
    pub event_id: EventId,

    /// State written by the attempt.
    pub state: WebhookState,

    /// Subscription the event is bound to.
    pub subscription_id: SubscriptionId,

    /// Attempt count after the increment.
    pub try_count: i32,

    /// Creation time of the event.
    pub created_at: DateTime<Utc>,
}

/// Retry queue entry to insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryEntry {
    /// Event to retry.
    pub event_id: EventId,

    /// Earliest time the entry may be claimed.
    pub execute_at: DateTime<Utc>,
}

/// Binding of a consumer to a topic with a delivery URL.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    /// Unique identifier.
    pub id: SubscriptionId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Consumer receiving deliveries.
    pub consumer_id: ConsumerId,
    /// Topic being delivered.
    pub topic_id: TopicId,
    /// Destination URL.
    pub url: String,
    /// When the subscription was created.
    pub created_at: DateTime<Utc>,
    /// When the subscription was last modified.
    pub updated_at: DateTime<Utc>,
    /// Inactive subscriptions receive no deliveries.
    pub is_active: bool,
    /// Set when retries were exhausted for one of its events.
    pub is_failing: bool,
}

impl Subscription {
    /// Whether deliveries may currently be sent to this subscription.
    pub fn accepts_deliveries(&self) -> bool {
        self.is_active && !self.is_failing
    }
}

/// A tenant's downstream identity, bound to one payload version.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Consumer {
    /// Unique identifier.
    pub id: ConsumerId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Identifier of the consumer in the tenant's own system.
    pub external_id: String,
    /// Version of the payload this consumer receives.
    pub version_id: VersionId,
    /// When the consumer was created.
    pub created_at: DateTime<Utc>,
}

/// A named event category.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Topic {
    /// Unique identifier.
    pub id: TopicId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Name, unique within the tenant.
    pub name: String,
    /// When the topic was created.
    pub created_at: DateTime<Utc>,
}

/// A named payload schema variant.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Version {
    /// Unique identifier.
    pub id: VersionId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Version name, used as the key of versioned payloads.
    pub version: String,
    /// When the version was created.
    pub created_at: DateTime<Utc>,
}
