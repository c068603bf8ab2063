pub mod meter;
pub mod middleware;
pub mod store;
pub mod tier_limits;

pub use meter::{UsageMeter, UsageMeterConfig, UsageMeterMetrics};
pub use middleware::usage_limit_middleware;
pub use store::UsageBackend;
pub use tier_limits::TierLimitTable;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::{Display, EnumIter, EnumString};

/// Category of chargeable action being metered. Raw request rate is the rate
/// limiter's business; these gate business value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    AiGeneration,
    DmReply,
    MoneyPlay,
    ImageGeneration,
    SocialPost,
    FacialRecognition,
    VideoGeneration,
}

/// Subscription level determining quota limits per operation kind.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Display,
    EnumString,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UserTier {
    #[default]
    Free,
    Starter,
    Creator,
    Pro,
    Agency,
    Education,
}

/// A per-period allowance. Serialized as an integer with `-1` meaning
/// unlimited, matching the subscription records the meter reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaLimit {
    Limited(u64),
    Unlimited,
}

impl QuotaLimit {
    /// Whether a caller at `current` uses may perform one more operation.
    pub fn permits(&self, current: u64) -> bool {
        match self {
            QuotaLimit::Limited(limit) => current < *limit,
            QuotaLimit::Unlimited => true,
        }
    }
}

impl std::fmt::Display for QuotaLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaLimit::Limited(limit) => write!(f, "{limit}"),
            QuotaLimit::Unlimited => write!(f, "unlimited"),
        }
    }
}

impl Serialize for QuotaLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            QuotaLimit::Limited(limit) => serializer.serialize_i64(*limit as i64),
            QuotaLimit::Unlimited => serializer.serialize_i64(-1),
        }
    }
}

impl<'de> Deserialize<'de> for QuotaLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        if raw < -1 {
            return Err(D::Error::custom(format!(
                "quota limit must be -1 (unlimited) or non-negative, got {raw}"
            )));
        }
        Ok(if raw == -1 {
            QuotaLimit::Unlimited
        } else {
            QuotaLimit::Limited(raw as u64)
        })
    }
}

/// Result of a quota check. Always carries the limit and current usage so a
/// client can render "you've used 20/20 today" instead of a bare denial.
#[derive(Debug, Clone)]
pub struct UsageCheck {
    pub allowed: bool,
    pub reason: Option<String>,
    pub limit: QuotaLimit,
    pub current: u64,
}

impl UsageCheck {
    pub fn allow(limit: QuotaLimit, current: u64) -> Self {
        Self {
            allowed: true,
            reason: None,
            limit,
            current,
        }
    }

    pub fn deny(reason: String, limit: QuotaLimit, current: u64) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            limit,
            current,
        }
    }
}
