//! Provider status code table
//!
//! The provider reports progress through numeric status ids. What each id
//! means is data: a built-in table that configuration can override or extend.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCategory {
    Accepted,
    Completed,
    NeedsReview,
    CredentialError,
    ProviderError,
}

impl fmt::Display for StatusCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Accepted => "Accepted",
            Self::Completed => "Completed",
            Self::NeedsReview => "NeedsReview",
            Self::CredentialError => "CredentialError",
            Self::ProviderError => "ProviderError",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCodeEntry {
    pub code: i64,
    pub description: String,
    pub is_final: bool,
    pub category: StatusCategory,
}

impl StatusCodeEntry {
    fn new(code: i64, description: &str, is_final: bool, category: StatusCategory) -> Self {
        Self {
            code,
            description: description.to_string(),
            is_final,
            category,
        }
    }
}

/// Lookup table from status id to meaning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCodeTable {
    entries: BTreeMap<i64, StatusCodeEntry>,
}

impl Default for StatusCodeTable {
    fn default() -> Self {
        use StatusCategory::{Accepted, Completed, CredentialError, NeedsReview, ProviderError};

        let builtin = [
            StatusCodeEntry::new(1, "Request received", false, Accepted),
            StatusCodeEntry::new(2, "Queued", false, Accepted),
            StatusCodeEntry::new(3, "Processing", false, Accepted),
            StatusCodeEntry::new(4, "Login verified", false, Accepted),
            StatusCodeEntry::new(5, "Completed - invoice retrieved", true, Completed),
            StatusCodeEntry::new(6, "Completed - no new invoice", true, Completed),
            StatusCodeEntry::new(7, "Needs review", true, NeedsReview),
            StatusCodeEntry::new(8, "Invalid credentials", true, CredentialError),
            StatusCodeEntry::new(9, "Multi-factor authentication required", true, NeedsReview),
            StatusCodeEntry::new(10, "Account locked", true, CredentialError),
            StatusCodeEntry::new(11, "Vendor site unavailable", false, ProviderError),
            StatusCodeEntry::new(12, "Vendor site not supported", true, ProviderError),
            StatusCodeEntry::new(13, "Provider timeout", false, ProviderError),
            StatusCodeEntry::new(14, "Duplicate request", false, Accepted),
            StatusCodeEntry::new(15, "Cancelled by provider", true, ProviderError),
        ];

        Self {
            entries: builtin.into_iter().map(|e| (e.code, e)).collect(),
        }
    }
}

impl StatusCodeTable {
    /// Built-in table with `overrides` replacing or adding entries.
    pub fn with_overrides(overrides: &[StatusCodeEntry]) -> Self {
        let mut table = Self::default();
        for entry in overrides {
            table.entries.insert(entry.code, entry.clone());
        }
        table
    }

    pub fn get(&self, code: i64) -> Option<&StatusCodeEntry> {
        self.entries.get(&code)
    }

    /// Unknown codes are treated as non-final.
    pub fn is_final(&self, code: i64) -> bool {
        self.get(code).is_some_and(|entry| entry.is_final)
    }

    /// Looks up `code`, logging when the provider sent an id we don't know.
    pub fn classify(&self, code: i64) -> Option<&StatusCodeEntry> {
        let entry = self.get(code);
        if entry.is_none() {
            warn!(status_id = code, "Unknown provider status id, treating as non-final");
        }
        entry
    }

    pub fn describe(&self, code: i64) -> String {
        self.get(code)
            .map_or_else(|| format!("Unknown status {code}"), |e| e.description.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &StatusCodeEntry> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_covers_fifteen_codes() {
        let table = StatusCodeTable::default();
        assert_eq!(table.len(), 15);
        assert!(table.is_final(5));
        assert!(!table.is_final(3));
        assert_eq!(table.get(8).unwrap().category, StatusCategory::CredentialError);
        assert_eq!(table.get(9).unwrap().category, StatusCategory::NeedsReview);
    }

    #[test]
    fn unknown_codes_are_not_final() {
        let table = StatusCodeTable::default();
        assert!(!table.is_final(999));
        assert!(table.classify(999).is_none());
        assert_eq!(table.describe(999), "Unknown status 999");
    }

    #[test]
    fn overrides_replace_and_extend() {
        let table = StatusCodeTable::with_overrides(&[
            StatusCodeEntry::new(13, "Provider timeout (final)", true, StatusCategory::ProviderError),
            StatusCodeEntry::new(42, "Vendor portal redesign", true, StatusCategory::NeedsReview),
        ]);
        assert_eq!(table.len(), 16);
        assert!(table.is_final(13));
        assert_eq!(table.describe(42), "Vendor portal redesign");
    }

    #[test]
    fn entries_deserialize_from_config_json() {
        let json = r#"{"code": 20, "description": "Paywall", "is_final": true, "category": "NeedsReview"}"#;
        let entry: StatusCodeEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.code, 20);
        assert_eq!(entry.category, StatusCategory::NeedsReview);
    }
}
