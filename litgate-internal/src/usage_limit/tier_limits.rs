use crate::usage_limit::{OperationKind, QuotaLimit, UserTier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Static mapping from subscription tier to per-operation-kind daily limits.
///
/// Immutable configuration loaded at startup. A `(tier, kind)` pair with no
/// entry resolves to a limit of 0 (deny), so forgetting to price a new
/// operation kind can never mean "unlimited".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierLimitTable {
    limits: HashMap<UserTier, HashMap<OperationKind, QuotaLimit>>,
}

impl TierLimitTable {
    pub fn empty() -> Self {
        Self {
            limits: HashMap::new(),
        }
    }

    /// Effective limit for one tier and operation kind. Missing entries
    /// fail closed.
    pub fn limit_for(&self, tier: UserTier, kind: OperationKind) -> QuotaLimit {
        self.limits
            .get(&tier)
            .and_then(|kinds| kinds.get(&kind))
            .copied()
            .unwrap_or(QuotaLimit::Limited(0))
    }

    /// All limits for one tier, for the usage-stats surface.
    pub fn limits_for_tier(&self, tier: UserTier) -> HashMap<OperationKind, QuotaLimit> {
        self.limits.get(&tier).cloned().unwrap_or_default()
    }

    /// Overlay explicit entries onto this table, keeping everything not
    /// overridden.
    pub fn with_overrides(
        mut self,
        overrides: HashMap<UserTier, HashMap<OperationKind, QuotaLimit>>,
    ) -> Self {
        for (tier, kinds) in overrides {
            self.limits.entry(tier).or_default().extend(kinds);
        }
        self
    }

    /// Treat this table (e.g. parsed from a config file) as overrides on the
    /// built-in defaults.
    pub fn overlaid_on_defaults(self) -> Self {
        TierLimitTable::default().with_overrides(self.limits)
    }
}

impl Default for TierLimitTable {
    fn default() -> Self {
        use OperationKind::*;
        use QuotaLimit::{Limited, Unlimited};

        let mut limits = HashMap::new();

        limits.insert(
            UserTier::Free,
            row(&[
                (AiGeneration, Limited(5)),
                (DmReply, Limited(3)),
                (MoneyPlay, Limited(1)),
                (ImageGeneration, Limited(2)),
                (SocialPost, Limited(1)),
                (FacialRecognition, Limited(2)),
                (VideoGeneration, Limited(1)),
            ]),
        );

        limits.insert(
            UserTier::Starter,
            row(&[
                (AiGeneration, Limited(50)),
                (DmReply, Limited(20)),
                (MoneyPlay, Limited(5)),
                (ImageGeneration, Limited(10)),
                (SocialPost, Limited(5)),
                (FacialRecognition, Limited(10)),
                (VideoGeneration, Limited(5)),
            ]),
        );

        limits.insert(
            UserTier::Creator,
            row(&[
                (AiGeneration, Limited(500)),
                (DmReply, Limited(100)),
                (MoneyPlay, Unlimited),
                (ImageGeneration, Limited(50)),
                (SocialPost, Limited(25)),
                (FacialRecognition, Limited(50)),
                (VideoGeneration, Limited(20)),
            ]),
        );

        limits.insert(UserTier::Pro, unlimited_row());
        limits.insert(UserTier::Agency, unlimited_row());

        // Teachers get everything except image generation, which is capped
        // per classroom allotment.
        let mut education = unlimited_row();
        education.insert(ImageGeneration, Limited(500));
        limits.insert(UserTier::Education, education);

        Self { limits }
    }
}

fn row(entries: &[(OperationKind, QuotaLimit)]) -> HashMap<OperationKind, QuotaLimit> {
    entries.iter().copied().collect()
}

fn unlimited_row() -> HashMap<OperationKind, QuotaLimit> {
    use strum::IntoEnumIterator;
    OperationKind::iter()
        .map(|kind| (kind, QuotaLimit::Unlimited))
        .collect()
}
