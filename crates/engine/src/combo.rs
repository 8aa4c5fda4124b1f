//! Method combos: sets of signal ids evaluated together

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::signal::{RegistryError, SignalId};

/// A non-empty set of unique method ids.
///
/// Members are kept sorted, so the canonical id (`"D5,E14,S1"`) is the same
/// whatever order the combo was discovered in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Combo {
    members: BTreeSet<SignalId>,
}

impl Combo {
    /// Duplicates collapse; `None` when no ids are given
    pub fn new(ids: impl IntoIterator<Item = SignalId>) -> Option<Self> {
        let members: BTreeSet<SignalId> = ids.into_iter().collect();
        if members.is_empty() {
            None
        } else {
            Some(Self { members })
        }
    }

    pub fn single(id: SignalId) -> Self {
        Self {
            members: BTreeSet::from([id]),
        }
    }

    /// Canonical identity: sorted ids joined by ","
    pub fn id(&self) -> String {
        self.member_strings().join(",")
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: &SignalId) -> bool {
        self.members.contains(id)
    }

    /// Members in execution order (ascending)
    pub fn members(&self) -> impl Iterator<Item = &SignalId> {
        self.members.iter()
    }

    pub fn member_strings(&self) -> Vec<String> {
        self.members.iter().map(ToString::to_string).collect()
    }

    pub fn with(&self, id: &SignalId) -> Self {
        let mut members = self.members.clone();
        members.insert(id.clone());
        Self { members }
    }

    /// `None` if removing `id` would leave the combo empty
    pub fn without(&self, id: &SignalId) -> Option<Self> {
        let mut members = self.members.clone();
        members.remove(id);
        if members.is_empty() {
            None
        } else {
            Some(Self { members })
        }
    }

    pub fn union<'a>(parts: impl IntoIterator<Item = &'a Combo>) -> Option<Self> {
        Self::new(parts.into_iter().flat_map(|c| c.members.iter().cloned()))
    }
}

impl fmt::Display for Combo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ComboParseError {
    #[error("combo must contain at least one method id")]
    Empty,
    #[error(transparent)]
    Id(#[from] RegistryError),
}

impl FromStr for Combo {
    type Err = ComboParseError;

    /// Accepts ids in any order, comma separated
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ids = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(SignalId::new)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(ids).ok_or(ComboParseError::Empty)
    }
}

/// All combos of size 1..=`max_size` drawn from `ids`
pub fn combos_up_to(ids: &[SignalId], max_size: usize) -> Vec<Combo> {
    (1..=max_size.min(ids.len()))
        .flat_map(|k| index_combinations(ids.len(), k))
        .filter_map(|indices| Combo::new(indices.into_iter().map(|i| ids[i].clone())))
        .collect()
}

/// k-subsets of `0..n` as sorted index vectors, in lexicographic order
pub struct IndexCombinations {
    n: usize,
    indices: Vec<usize>,
    exhausted: bool,
}

pub fn index_combinations(n: usize, k: usize) -> IndexCombinations {
    IndexCombinations {
        n,
        indices: (0..k).collect(),
        exhausted: k == 0 || k > n,
    }
}

impl IndexCombinations {
    fn advance(&mut self) {
        let k = self.indices.len();
        // Bump the rightmost index that still has room, then reset the tail
        for i in (0..k).rev() {
            if self.indices[i] < self.n - (k - i) {
                self.indices[i] += 1;
                for j in (i + 1)..k {
                    self.indices[j] = self.indices[j - 1] + 1;
                }
                return;
            }
        }
        self.exhausted = true;
    }
}

impl Iterator for IndexCombinations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let current = self.indices.clone();
        self.advance();
        Some(current)
    }
}

/// C(n, k); 0 when k > n
pub fn binomial(n: usize, k: usize) -> u128 {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut numerator = 1u128;
    let mut denominator = 1u128;
    for i in 0..k {
        numerator *= (n - i) as u128;
        denominator *= (i + 1) as u128;
    }
    numerator / denominator
}
