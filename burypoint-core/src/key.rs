//! Cache key system shared by every tier.
//!
//! A [`CacheKey`] names one day of raw records for one tracking point. The
//! [`Fingerprint`] derived from it is the only lookup key any tier ever sees,
//! so a writer and a reader can never disagree about the storage key format.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ValidationError;

/// Prefix shared by every fingerprint.
const FINGERPRINT_PREFIX: &str = "raw";

/// Separator between fingerprint components.
const SEPARATOR: char = ':';

/// Calendar date format used on the wire and inside fingerprints.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

// ============================================================================
// DATE RANGE
// ============================================================================

/// Inclusive range of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    /// Create a new range. `start` must not be after `end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ValidationError> {
        if start > end {
            return Err(ValidationError::InvalidDateRange {
                start: start.format(DATE_FORMAT).to_string(),
                end: end.format(DATE_FORMAT).to_string(),
            });
        }
        Ok(Self { start, end })
    }

    /// A range covering exactly one day.
    pub fn single(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    /// The rolling window of `days` days ending at (and including) `today`.
    ///
    /// A window of zero days is treated as one day. A window reaching past
    /// the earliest representable date starts at [`NaiveDate::MIN`].
    pub fn trailing(today: NaiveDate, days: u32) -> Self {
        let span = i64::from(days.max(1)) - 1;
        let start = Duration::try_days(span)
            .and_then(|span| today.checked_sub_signed(span))
            .unwrap_or(NaiveDate::MIN);
        Self { start, end: today }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Number of days in the range (always at least 1).
    pub fn len(&self) -> usize {
        ((self.end - self.start).num_days() + 1) as usize
    }

    /// A valid range is never empty; provided for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Check whether a day falls inside the range.
    pub fn contains(&self, day: NaiveDate) -> bool {
        day >= self.start && day <= self.end
    }

    /// Iterate every day of the range in ascending order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |day| *day <= end)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..={}",
            self.start.format(DATE_FORMAT),
            self.end.format(DATE_FORMAT)
        )
    }
}

// ============================================================================
// CACHE KEY
// ============================================================================

/// Identity of one day's raw records for one tracking point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheKey {
    pub date: NaiveDate,
    pub tracking_point_id: i64,
    pub project_id: String,
}

impl CacheKey {
    pub fn new(date: NaiveDate, tracking_point_id: i64, project_id: impl Into<String>) -> Self {
        Self {
            date,
            tracking_point_id,
            project_id: project_id.into(),
        }
    }

    /// Derive the fingerprint used as the lookup key in every tier.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(format!(
            "{FINGERPRINT_PREFIX}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}",
            self.project_id,
            self.tracking_point_id,
            self.date.format(DATE_FORMAT)
        ))
    }

    /// The date formatted as `YYYY-MM-DD`.
    pub fn date_string(&self) -> String {
        self.date.format(DATE_FORMAT).to_string()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.project_id,
            self.tracking_point_id,
            self.date.format(DATE_FORMAT)
        )
    }
}

// ============================================================================
// FINGERPRINT
// ============================================================================

/// Deterministic storage key derived from a [`CacheKey`].
///
/// # Format
///
/// `raw:{project_id}:{tracking_point_id}:{YYYY-MM-DD}`
///
/// The project comes first so that a key-prefix scan can select one
/// project's entries. Decoding splits from the right, so project ids may
/// themselves contain `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The canonical form as bytes, for byte-keyed stores.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Parse a stored key back into its [`CacheKey`].
    ///
    /// Returns `None` if the prefix is missing, the project id is empty, the
    /// tracking point is not an integer or the date is malformed.
    pub fn decode(raw: &str) -> Option<CacheKey> {
        let rest = raw
            .strip_prefix(FINGERPRINT_PREFIX)?
            .strip_prefix(SEPARATOR)?;

        let mut parts = rest.rsplitn(3, SEPARATOR);
        let date = NaiveDate::parse_from_str(parts.next()?, DATE_FORMAT).ok()?;
        let tracking_point_id = parts.next()?.parse::<i64>().ok()?;
        let project_id = parts.next()?;
        if project_id.is_empty() {
            return None;
        }

        Some(CacheKey::new(date, tracking_point_id, project_id))
    }

    /// Decode raw key bytes (as stored by byte-keyed tiers).
    pub fn decode_bytes(raw: &[u8]) -> Option<CacheKey> {
        std::str::from_utf8(raw).ok().and_then(Self::decode)
    }

    /// Prefix selecting every fingerprint.
    pub fn all_prefix() -> String {
        format!("{FINGERPRINT_PREFIX}{SEPARATOR}")
    }

    /// Prefix selecting every fingerprint of one project.
    pub fn project_prefix(project_id: &str) -> String {
        format!("{FINGERPRINT_PREFIX}{SEPARATOR}{project_id}{SEPARATOR}")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&CacheKey> for Fingerprint {
    fn from(key: &CacheKey) -> Self {
        key.fingerprint()
    }
}

// ============================================================================
// CLEAR SCOPE
// ============================================================================

/// Selection of cache entries removed by a `clear`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ClearScope {
    /// Every entry in the tier.
    #[default]
    All,
    /// Entries whose date falls inside the range (date range changed).
    Dates(DateRange),
    /// Entries of one tracking point.
    TrackingPoint(i64),
    /// Entries of one project.
    Project(String),
}

impl ClearScope {
    /// Check whether a key is selected by this scope.
    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            Self::All => true,
            Self::Dates(range) => range.contains(key.date),
            Self::TrackingPoint(id) => key.tracking_point_id == *id,
            Self::Project(project) => key.project_id == *project,
        }
    }

    /// Narrowest key prefix that covers every key this scope can match.
    pub fn key_prefix(&self) -> String {
        match self {
            Self::Project(project) => Fingerprint::project_prefix(project),
            _ => Fingerprint::all_prefix(),
        }
    }
}
