//! Wallet profile lookup, restricted per market to the wallets that traded it

use std::collections::{BTreeSet, HashMap};

use crate::types::{Action, HistoricalRecord, ParticipantProfile};

/// Profiles for every wallet appearing in a loaded dataset
#[derive(Debug, Clone, Default)]
pub struct ProfileBook {
    profiles: HashMap<String, ParticipantProfile>,
}

impl ProfileBook {
    pub fn new(profiles: impl IntoIterator<Item = ParticipantProfile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|p| (p.address.clone(), p))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn get(&self, address: &str) -> Option<&ParticipantProfile> {
        self.profiles.get(address)
    }

    /// View limited to the wallets present in `actions`.
    ///
    /// Signal functions only ever receive a view, never the whole book.
    pub fn restrict<'a>(&'a self, actions: &[Action]) -> ProfileView<'a> {
        let mut view = HashMap::new();
        for action in actions {
            if let Some(profile) = self.profiles.get(action.wallet.as_str()) {
                view.entry(action.wallet.clone()).or_insert(profile);
            }
        }
        ProfileView { profiles: view }
    }
}

/// Every distinct wallet that acted in any of `records`
pub fn participants<'a>(records: impl IntoIterator<Item = &'a HistoricalRecord>) -> BTreeSet<String> {
    records
        .into_iter()
        .flat_map(|r| r.actions.iter().map(|a| a.wallet.clone()))
        .collect()
}

/// Borrowed, per-market subset of a [`ProfileBook`]
#[derive(Debug, Clone, Default)]
pub struct ProfileView<'a> {
    profiles: HashMap<String, &'a ParticipantProfile>,
}

impl<'a> ProfileView<'a> {
    pub fn get(&self, address: &str) -> Option<&'a ParticipantProfile> {
        self.profiles.get(address).copied()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a ParticipantProfile> + '_ {
        self.profiles.values().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use rust_decimal_macros::dec;

    fn profile(address: &str) -> ParticipantProfile {
        ParticipantProfile {
            address: address.to_string(),
            total_bets: 10,
            ..Default::default()
        }
    }

    fn action(wallet: &str) -> Action {
        Action {
            wallet: wallet.to_string(),
            side: Side::Yes,
            amount: dec!(10),
            price: dec!(0.5),
            timestamp: 0,
        }
    }

    #[test]
    fn test_restrict_only_includes_acting_wallets() {
        let book = ProfileBook::new(["0xa", "0xb", "0xc"].map(profile));
        let view = book.restrict(&[action("0xa"), action("0xa"), action("0xz")]);

        assert_eq!(view.len(), 1);
        assert!(view.get("0xa").is_some());
        assert!(view.get("0xb").is_none());
        assert!(view.get("0xz").is_none());
    }

    #[test]
    fn test_participants_dedupes() {
        let record = HistoricalRecord {
            id: "m".into(),
            title: String::new(),
            created_at: 0,
            end_at: 10,
            outcome: None,
            actions: vec![action("0xb"), action("0xa"), action("0xb")],
        };
        let ids: Vec<String> = participants([&record]).into_iter().collect();
        assert_eq!(ids, vec!["0xa".to_string(), "0xb".to_string()]);
    }
}
