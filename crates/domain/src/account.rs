use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, Duration, Utc};
use fleetlease_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::LeaseOutcome;

/// Account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(Uuid);

impl AccountId {
    /// Creates a random account identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an account identifier from an existing UUID value.
    #[must_use]
    pub fn from_uuid(value: Uuid) -> Self {
        Self(value)
    }

    /// Returns the underlying UUID value.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for AccountId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Farming stage of an account; drives which cooldown applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FarmStage {
    /// First day of activity.
    #[serde(rename = "DAY_1")]
    Day1,
    /// Second day of activity.
    #[serde(rename = "DAY_2")]
    Day2,
    /// Third day of activity.
    #[serde(rename = "DAY_3")]
    Day3,
    /// Fully trusted account.
    #[serde(rename = "TRUST")]
    Trust,
}

impl FarmStage {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day1 => "DAY_1",
            Self::Day2 => "DAY_2",
            Self::Day3 => "DAY_3",
            Self::Trust => "TRUST",
        }
    }

    /// Parses storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "DAY_1" => Ok(Self::Day1),
            "DAY_2" => Ok(Self::Day2),
            "DAY_3" => Ok(Self::Day3),
            "TRUST" => Ok(Self::Trust),
            _ => Err(AppError::Validation(format!(
                "unknown farm stage '{value}'"
            ))),
        }
    }
}

/// Persisted account record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Stable account identifier.
    pub id: AccountId,
    /// Login name on the target platform.
    pub username: String,
    /// Browser profile handle used by the automation script.
    pub profile_id: String,
    /// Farming stage, when assigned.
    pub stage: Option<FarmStage>,
    /// Reputation score (total karma).
    pub score: i64,
    /// Disabled accounts are never leased.
    pub enabled: bool,
    /// Whether one worker currently holds the account.
    pub in_use: bool,
    /// Completed successful lease cycles.
    pub usage_count: i64,
    /// Account creation timestamp on the target platform.
    pub created_at: DateTime<Utc>,
    /// Cooldown end; `None` for accounts that were never leased.
    pub next_eligible_at: Option<DateTime<Utc>>,
    /// Start of the last lease.
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Account {
    /// Creates an enabled, idle account record.
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        profile_id: impl Into<String>,
        stage: Option<FarmStage>,
        score: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AccountId::new(),
            username: username.into(),
            profile_id: profile_id.into(),
            stage,
            score,
            enabled: true,
            in_use: false,
            usage_count: 0,
            created_at,
            next_eligible_at: None,
            last_used_at: None,
        }
    }

    /// Returns whether the cooldown has elapsed at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible_at.is_none_or(|due| due <= now)
    }
}

/// One configured lease frequency for a farm stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFrequency {
    /// Farm stage the frequency applies to.
    pub stage: FarmStage,
    /// Successful leases allowed per day.
    pub frequency: u32,
}

/// Validated per-stage lease frequencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<StageFrequency>", into = "Vec<StageFrequency>")]
pub struct FrequencyByStage(BTreeMap<FarmStage, u32>);

impl FrequencyByStage {
    /// Creates validated stage frequencies.
    pub fn new(entries: Vec<StageFrequency>) -> AppResult<Self> {
        if entries.is_empty() {
            return Err(AppError::Validation(
                "frequency by stage must contain at least one stage".to_owned(),
            ));
        }

        let mut frequencies = BTreeMap::new();
        for entry in entries {
            if entry.frequency == 0 {
                return Err(AppError::Validation(format!(
                    "frequency for stage '{}' must be greater than zero",
                    entry.stage.as_str()
                )));
            }

            if frequencies.insert(entry.stage, entry.frequency).is_some() {
                return Err(AppError::Validation(format!(
                    "duplicate frequency for stage '{}'",
                    entry.stage.as_str()
                )));
            }
        }

        Ok(Self(frequencies))
    }

    /// Returns the stages with a configured frequency.
    #[must_use]
    pub fn stages(&self) -> Vec<FarmStage> {
        self.0.keys().copied().collect()
    }

    /// Returns the configured frequency for one stage.
    #[must_use]
    pub fn frequency(&self, stage: FarmStage) -> Option<u32> {
        self.0.get(&stage).copied()
    }

    /// Returns the cooldown after a successful lease: `floor(24 / frequency)` hours.
    #[must_use]
    pub fn cooldown(&self, stage: FarmStage) -> Option<Duration> {
        self.frequency(stage)
            .map(|frequency| Duration::hours(i64::from(24 / frequency)))
    }

    /// Computes the next eligibility timestamp for a released account.
    pub fn next_eligible_at(
        &self,
        stage: Option<FarmStage>,
        outcome: LeaseOutcome,
        now: DateTime<Utc>,
    ) -> AppResult<DateTime<Utc>> {
        if outcome == LeaseOutcome::Failure {
            return Ok(now);
        }

        let stage = stage.ok_or_else(|| {
            AppError::Validation("account has no farm stage to derive a cooldown".to_owned())
        })?;
        let cooldown = self.cooldown(stage).ok_or_else(|| {
            AppError::Validation(format!(
                "no frequency configured for stage '{}'",
                stage.as_str()
            ))
        })?;

        Ok(now + cooldown)
    }
}

impl TryFrom<Vec<StageFrequency>> for FrequencyByStage {
    type Error = AppError;

    fn try_from(value: Vec<StageFrequency>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FrequencyByStage> for Vec<StageFrequency> {
    fn from(value: FrequencyByStage) -> Self {
        value
            .0
            .into_iter()
            .map(|(stage, frequency)| StageFrequency { stage, frequency })
            .collect()
    }
}

/// Declarative eligibility rules for leasing an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountEligibility {
    /// Accounts must be created at or before this instant.
    pub created_before: DateTime<Utc>,
    /// Minimum reputation score.
    pub minimum_score: i64,
    /// Allowed farm stages.
    pub stages: Vec<FarmStage>,
    /// Optional restriction to a fairness window of account ids.
    pub candidate_ids: Option<Vec<AccountId>>,
}

impl AccountEligibility {
    /// Builds the base rules from age, score and stage policy at `now`.
    ///
    /// Fails when the minimum age reaches outside the representable calendar.
    pub fn new(
        now: DateTime<Utc>,
        minimum_age_days: u32,
        minimum_score: i64,
        stages: Vec<FarmStage>,
    ) -> AppResult<Self> {
        let created_before = Duration::try_days(i64::from(minimum_age_days))
            .and_then(|minimum_age| now.checked_sub_signed(minimum_age))
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "minimum account age of {minimum_age_days} days is out of range"
                ))
            })?;

        Ok(Self {
            created_before,
            minimum_score,
            stages,
            candidate_ids: None,
        })
    }

    /// Restricts the rules to the given candidate window.
    #[must_use]
    pub fn within(mut self, candidate_ids: Vec<AccountId>) -> Self {
        self.candidate_ids = Some(candidate_ids);
        self
    }

    /// Returns whether the account satisfies enabled, age, score and stage rules.
    #[must_use]
    pub fn matches_base(&self, account: &Account) -> bool {
        account.enabled
            && account.created_at <= self.created_before
            && account.score >= self.minimum_score
            && account
                .stage
                .is_some_and(|stage| self.stages.contains(&stage))
    }

    /// Returns whether the account can be claimed right now.
    #[must_use]
    pub fn matches(&self, account: &Account, now: DateTime<Utc>) -> bool {
        self.matches_base(account)
            && !account.in_use
            && account.is_due(now)
            && self
                .candidate_ids
                .as_ref()
                .is_none_or(|ids| ids.contains(&account.id))
    }
}

/// Candidate ordering used when claiming accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountOrdering {
    /// Oldest `created_at` first; used to build the fairness window.
    OldestCreatedFirst,
    /// Earliest `next_eligible_at` first, never-leased accounts before all others.
    LongestOverdueFirst,
}

impl AccountOrdering {
    /// Compares two accounts; ties fall back to creation time then id.
    #[must_use]
    pub fn compare(&self, left: &Account, right: &Account) -> Ordering {
        let primary = match self {
            Self::OldestCreatedFirst => left.created_at.cmp(&right.created_at),
            Self::LongestOverdueFirst => left.next_eligible_at.cmp(&right.next_eligible_at),
        };

        primary
            .then_with(|| left.created_at.cmp(&right.created_at))
            .then_with(|| left.id.cmp(&right.id))
    }
}
