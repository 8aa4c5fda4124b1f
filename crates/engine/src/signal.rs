//! Signal function contract and the method registry
//!
//! Every detection method implements [`SignalFunction`]. Methods are
//! registered once into a [`SignalRegistry`], which validates ids up front
//! and is then shared read-only by the backtester and the combinator.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::profiles::ProfileView;
use crate::types::{Action, HistoricalRecord};

// ============================================================================
// Ids and categories
// ============================================================================

/// Method id: uppercase letter prefix + number, e.g. `S1`, `E14`.
///
/// Ordered by (prefix, number) so `E9 < E10`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SignalId {
    prefix: String,
    number: u32,
}

impl SignalId {
    pub fn new(s: &str) -> Result<Self, RegistryError> {
        let split = s
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| RegistryError::MalformedId(s.to_string()))?;
        let (prefix, digits) = s.split_at(split);

        if prefix.is_empty()
            || !prefix.chars().all(|c| c.is_ascii_uppercase())
            || !digits.chars().all(|c| c.is_ascii_digit())
        {
            return Err(RegistryError::MalformedId(s.to_string()));
        }
        let number = digits
            .parse::<u32>()
            .map_err(|_| RegistryError::MalformedId(s.to_string()))?;

        Ok(Self {
            prefix: prefix.to_string(),
            number,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn number(&self) -> u32 {
        self.number
    }
}

impl Ord for SignalId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.prefix
            .cmp(&other.prefix)
            .then(self.number.cmp(&other.number))
    }
}

impl PartialOrd for SignalId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix, self.number)
    }
}

impl FromStr for SignalId {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.trim())
    }
}

impl TryFrom<String> for SignalId {
    type Error = RegistryError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(&s)
    }
}

impl From<SignalId> for String {
    fn from(id: SignalId) -> Self {
        id.to_string()
    }
}

/// Disjoint method group, e.g. "S" (suspicious wallets) or "M" (Markov)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Category(String);

impl Category {
    pub fn new(name: &str) -> Result<Self, RegistryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::EmptyCategory);
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Function contract
// ============================================================================

/// Output of one method on one market
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalResult {
    /// -1.0 (strong NO) to 1.0 (strong YES)
    pub signal: f64,
    /// 0.0 (no information) to 1.0
    pub confidence: f64,
    /// Actions this method considers non-noise, handed to the next method.
    /// `None` passes the input through unchanged.
    pub filtered_actions: Option<Vec<Action>>,
    /// Diagnostics only, never used for scoring
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SignalResult {
    pub fn new(signal: f64, confidence: f64) -> Self {
        Self {
            signal,
            confidence,
            ..Default::default()
        }
    }

    /// No opinion
    pub fn neutral() -> Self {
        Self::default()
    }

    pub fn with_filtered(mut self, actions: Vec<Action>) -> Self {
        self.filtered_actions = Some(actions);
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Signal and confidence are finite and confidence lies in [0, 1]
    pub fn is_within_contract(&self) -> bool {
        self.signal.is_finite()
            && self.confidence.is_finite()
            && (0.0..=1.0).contains(&self.confidence)
    }
}

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("signal function failed: {0}")]
    Failed(String),

    #[error("signal function returned out-of-contract result (signal={signal}, confidence={confidence})")]
    OutOfContract { signal: f64, confidence: f64 },

    #[error("signal function panicked: {0}")]
    Panicked(String),
}

/// A detection method
pub trait SignalFunction: Send + Sync {
    fn evaluate(
        &self,
        record: &HistoricalRecord,
        actions: &[Action],
        profiles: &ProfileView<'_>,
    ) -> Result<SignalResult, SignalError>;
}

impl<F> SignalFunction for F
where
    F: Fn(&HistoricalRecord, &[Action], &ProfileView<'_>) -> Result<SignalResult, SignalError>
        + Send
        + Sync,
{
    fn evaluate(
        &self,
        record: &HistoricalRecord,
        actions: &[Action],
        profiles: &ProfileView<'_>,
    ) -> Result<SignalResult, SignalError> {
        self(record, actions, profiles)
    }
}

/// Pin a closure to the [`SignalFunction`] call shape so its argument and
/// return types are inferred.
pub fn signal_fn<F>(f: F) -> F
where
    F: Fn(&HistoricalRecord, &[Action], &ProfileView<'_>) -> Result<SignalResult, SignalError>
        + Send
        + Sync,
{
    f
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("malformed signal id '{0}' (expected uppercase prefix + number, e.g. E14)")]
    MalformedId(String),

    #[error("signal id {0} registered twice")]
    DuplicateId(SignalId),

    #[error("category name must not be empty")]
    EmptyCategory,

    #[error("cannot retire unknown signal id {0}")]
    UnknownId(SignalId),
}

/// One registered method
#[derive(Clone)]
pub struct SignalEntry {
    pub id: SignalId,
    pub category: Category,
    pub description: String,
    /// Retired methods stay registered so stored results stay readable,
    /// but never enter a search.
    pub active: bool,
    function: Arc<dyn SignalFunction>,
}

impl SignalEntry {
    pub fn function(&self) -> &dyn SignalFunction {
        self.function.as_ref()
    }
}

impl fmt::Debug for SignalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalEntry")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("description", &self.description)
            .field("active", &self.active)
            .finish()
    }
}

/// Immutable id → method map, built once
#[derive(Debug, Clone, Default)]
pub struct SignalRegistry {
    entries: BTreeMap<SignalId, SignalEntry>,
}

impl SignalRegistry {
    pub fn builder() -> SignalRegistryBuilder {
        SignalRegistryBuilder::default()
    }

    pub fn get(&self, id: &SignalId) -> Option<&SignalEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &SignalId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn is_active(&self, id: &SignalId) -> bool {
        self.entries.get(id).is_some_and(|e| e.active)
    }

    pub fn entries(&self) -> impl Iterator<Item = &SignalEntry> {
        self.entries.values()
    }

    /// Active ids in ascending order
    pub fn active_ids(&self) -> Vec<SignalId> {
        self.entries
            .values()
            .filter(|e| e.active)
            .map(|e| e.id.clone())
            .collect()
    }

    /// Active ids grouped by category; categories with no active member are omitted
    pub fn active_by_category(&self) -> BTreeMap<Category, Vec<SignalId>> {
        let mut groups: BTreeMap<Category, Vec<SignalId>> = BTreeMap::new();
        for entry in self.entries.values().filter(|e| e.active) {
            groups
                .entry(entry.category.clone())
                .or_default()
                .push(entry.id.clone());
        }
        groups
    }

    /// All registered methods, retired included (complexity normaliser)
    pub fn total_count(&self) -> usize {
        self.entries.len()
    }

    pub fn active_count(&self) -> usize {
        self.entries.values().filter(|e| e.active).count()
    }

    /// Copy of this registry with `ids` additionally retired
    pub fn with_retired(&self, ids: &[SignalId]) -> Result<Self, RegistryError> {
        let mut entries = self.entries.clone();
        for id in ids {
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| RegistryError::UnknownId(id.clone()))?;
            entry.active = false;
        }
        Ok(Self { entries })
    }
}

struct PendingEntry {
    id: Result<SignalId, RegistryError>,
    category: Result<Category, RegistryError>,
    description: String,
    function: Arc<dyn SignalFunction>,
}

#[derive(Default)]
pub struct SignalRegistryBuilder {
    pending: Vec<PendingEntry>,
    retired: Vec<String>,
}

impl SignalRegistryBuilder {
    pub fn register<F>(mut self, id: &str, category: &str, description: &str, function: F) -> Self
    where
        F: SignalFunction + 'static,
    {
        self.pending.push(PendingEntry {
            id: SignalId::new(id),
            category: Category::new(category),
            description: description.to_string(),
            function: Arc::new(function),
        });
        self
    }

    /// Register as retired
    pub fn retire(mut self, id: &str) -> Self {
        self.retired.push(id.to_string());
        self
    }

    /// Validate everything; the first bad id or duplicate fails the build
    pub fn build(self) -> Result<SignalRegistry, RegistryError> {
        let mut entries = BTreeMap::new();

        for pending in self.pending {
            let id = pending.id?;
            let category = pending.category?;
            if entries.contains_key(&id) {
                return Err(RegistryError::DuplicateId(id));
            }
            entries.insert(
                id.clone(),
                SignalEntry {
                    id,
                    category,
                    description: pending.description,
                    active: true,
                    function: pending.function,
                },
            );
        }

        for raw in self.retired {
            let id = SignalId::new(&raw)?;
            let entry = entries
                .get_mut(&id)
                .ok_or_else(|| RegistryError::UnknownId(id.clone()))?;
            entry.active = false;
        }

        Ok(SignalRegistry { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(signal: f64, confidence: f64) -> impl SignalFunction {
        signal_fn(move |_, _, _| Ok(SignalResult::new(signal, confidence)))
    }

    #[test]
    fn test_signal_id_parse_and_order() {
        let e9: SignalId = "E9".parse().unwrap();
        let e10: SignalId = "E10".parse().unwrap();
        let d5: SignalId = "D5".parse().unwrap();
        assert!(e9 < e10);
        assert!(d5 < e9);
        assert_eq!(e10.to_string(), "E10");
        assert_eq!(e10.prefix(), "E");
        assert_eq!(e10.number(), 10);
    }

    #[test]
    fn test_signal_id_rejects_malformed() {
        for bad in ["", "12", "e1", "E", "E1a", "E-1", "E 1"] {
            assert!(SignalId::new(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_signal_id_serde_round_trip_as_string() {
        let id: SignalId = "M26".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"M26\"");
        let back: SignalId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<SignalId>("\"bad\"").is_err());
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let err = SignalRegistry::builder()
            .register("S1", "S", "a", constant(0.0, 0.0))
            .register("S1", "S", "b", constant(0.0, 0.0))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId(_)));
    }

    #[test]
    fn test_registry_rejects_malformed_and_empty_category() {
        let err = SignalRegistry::builder()
            .register("s1", "S", "a", constant(0.0, 0.0))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::MalformedId(_)));

        let err = SignalRegistry::builder()
            .register("S1", " ", "a", constant(0.0, 0.0))
            .build()
            .unwrap_err();
        assert_eq!(err, RegistryError::EmptyCategory);
    }

    #[test]
    fn test_retired_methods_excluded_from_active_views() {
        let registry = SignalRegistry::builder()
            .register("S1", "S", "a", constant(0.0, 0.0))
            .register("S3", "S", "b", constant(0.0, 0.0))
            .register("D5", "D", "c", constant(0.0, 0.0))
            .retire("S3")
            .build()
            .unwrap();

        assert_eq!(registry.total_count(), 3);
        assert_eq!(registry.active_count(), 2);
        let s3: SignalId = "S3".parse().unwrap();
        assert!(registry.contains(&s3));
        assert!(!registry.is_active(&s3));

        let groups = registry.active_by_category();
        let s = groups.get(&Category::new("S").unwrap()).unwrap();
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].to_string(), "S1");
    }

    #[test]
    fn test_with_retired_unknown_id_fails() {
        let registry = SignalRegistry::builder()
            .register("S1", "S", "a", constant(0.0, 0.0))
            .build()
            .unwrap();
        let unknown: SignalId = "Z9".parse().unwrap();
        assert!(registry.with_retired(&[unknown]).is_err());

        let s1: SignalId = "S1".parse().unwrap();
        let retired = registry.with_retired(&[s1.clone()]).unwrap();
        assert!(!retired.is_active(&s1));
        assert!(registry.is_active(&s1));
    }

    #[test]
    fn test_contract_check() {
        assert!(SignalResult::new(0.4, 0.9).is_within_contract());
        assert!(!SignalResult::new(f64::NAN, 0.5).is_within_contract());
        assert!(!SignalResult::new(0.1, 1.5).is_within_contract());
        assert!(!SignalResult::new(0.1, -0.1).is_within_contract());
    }
}
