use serde::Serialize;
use std::fmt;

/// Control-plane error taxonomy.
///
/// Every public operation resolves to one of these kinds. The split between
/// retryable and fatal drives the retry wrapper: only `Timeout` and
/// `Unavailable` are re-attempted automatically, and breaker failure streaks
/// count `Timeout`, `Unavailable` and `Internal`.
#[derive(Debug, Clone)]
pub enum ControlError {
    /// Request malformed or violating static constraints. Never retried.
    InvalidArgument(String),
    /// Credential missing or invalid. Never retried.
    Unauthorized(String),
    /// Denied at the edge by the rate limiter; client may retry after the hint.
    RateLimited { retry_after_ms: u64 },
    /// A follower refused a write; the client should redirect to the leader.
    NotLeader { leader: Option<String> },
    /// The marketplace cannot satisfy the requested bandwidth.
    CapacityExhausted(String),
    /// The requested QoS cannot be met by any band.
    QoSInfeasible(String),
    /// A circuit breaker short-circuited the call.
    CircuitOpen { resource: String },
    /// Deadline exceeded. Counts as a breaker failure.
    Timeout(String),
    /// Channel integrity verification failed; the allocation is released.
    IntegrityLost { channel_id: String },
    /// Backing store unreachable; callers treat as a cache miss.
    CacheUnavailable(String),
    /// Connection pool exhausted within the acquire deadline.
    PoolExhausted { class: String },
    /// Transient downstream failure. Breaker-retryable.
    Unavailable(String),
    /// Unexpected condition; logged with correlation id.
    Internal(String),
}

impl ControlError {
    /// Stable label used in `aether_errors_total{kind}` and wire responses.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::InvalidArgument(_) => "invalid_argument",
            ControlError::Unauthorized(_) => "unauthorized",
            ControlError::RateLimited { .. } => "rate_limited",
            ControlError::NotLeader { .. } => "not_leader",
            ControlError::CapacityExhausted(_) => "capacity_exhausted",
            ControlError::QoSInfeasible(_) => "qos_infeasible",
            ControlError::CircuitOpen { .. } => "circuit_open",
            ControlError::Timeout(_) => "timeout",
            ControlError::IntegrityLost { .. } => "integrity_lost",
            ControlError::CacheUnavailable(_) => "cache_unavailable",
            ControlError::PoolExhausted { .. } => "pool_exhausted",
            ControlError::Unavailable(_) => "unavailable",
            ControlError::Internal(_) => "internal",
        }
    }

    /// Whether the retry wrapper may re-attempt the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControlError::Timeout(_) | ControlError::Unavailable(_)
        )
    }

    /// Whether the error counts toward a breaker's consecutive-failure
    /// streak. `CircuitOpen` itself is excluded so an open breaker cannot
    /// feed its own failure count.
    pub fn counts_as_breaker_failure(&self) -> bool {
        matches!(
            self,
            ControlError::Timeout(_)
                | ControlError::Unavailable(_)
                | ControlError::Internal(_)
        )
    }
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            ControlError::Unauthorized(msg) => write!(f, "unauthorized: {}", msg),
            ControlError::RateLimited { retry_after_ms } => {
                write!(f, "rate limited, retry after {}ms", retry_after_ms)
            }
            ControlError::NotLeader { leader: Some(addr) } => {
                write!(f, "not the leader, redirect to {}", addr)
            }
            ControlError::NotLeader { leader: None } => {
                write!(f, "not the leader, no leader known")
            }
            ControlError::CapacityExhausted(msg) => write!(f, "capacity exhausted: {}", msg),
            ControlError::QoSInfeasible(msg) => write!(f, "qos infeasible: {}", msg),
            ControlError::CircuitOpen { resource } => {
                write!(f, "circuit open for {}", resource)
            }
            ControlError::Timeout(msg) => write!(f, "timeout: {}", msg),
            ControlError::IntegrityLost { channel_id } => {
                write!(f, "channel integrity lost: {}", channel_id)
            }
            ControlError::CacheUnavailable(msg) => write!(f, "cache unavailable: {}", msg),
            ControlError::PoolExhausted { class } => write!(f, "pool exhausted: {}", class),
            ControlError::Unavailable(msg) => write!(f, "unavailable: {}", msg),
            ControlError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ControlError {}

/// Structured error record returned over the wire.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub kind: String,
    pub message: String,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorResponse {
    pub fn from_error(err: &ControlError, correlation_id: &str) -> Self {
        let leader = match err {
            ControlError::NotLeader { leader } => leader.clone(),
            _ => None,
        };
        let retry_after_ms = match err {
            ControlError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        };
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            correlation_id: correlation_id.to_string(),
            leader,
            retry_after_ms,
        }
    }

    /// HTTP status the API layer maps this error to.
    pub fn http_status(err: &ControlError) -> u16 {
        match err {
            ControlError::InvalidArgument(_) => 400,
            ControlError::Unauthorized(_) => 401,
            ControlError::RateLimited { .. } => 429,
            ControlError::NotLeader { .. } => 421,
            ControlError::CapacityExhausted(_) | ControlError::QoSInfeasible(_) => 409,
            ControlError::CircuitOpen { .. } | ControlError::Unavailable(_) => 503,
            ControlError::Timeout(_) => 504,
            ControlError::IntegrityLost { .. } => 502,
            ControlError::CacheUnavailable(_) => 503,
            ControlError::PoolExhausted { .. } => 503,
            ControlError::Internal(_) => 500,
        }
    }
}

/// Generate a short correlation id for logs and wire responses.
pub fn correlation_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}
