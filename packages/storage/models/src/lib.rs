#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Request and response types shared by every storage backend.
//!
//! Backends never see API-specific payloads: the transport layer hands them
//! an [`UpsertRequest`] carrying the raw response body, and each backend
//! decodes it into backend-agnostic [`Record`]s.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// A single backend-agnostic row: a JSON object keyed by column/field name.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// The kind of storage backend behind a connection string.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageType {
    /// `MongoDB` document store
    Mongo,
    /// `PostgreSQL` relational store
    Postgres,
}

impl StorageType {
    /// Every supported backend, in dispatch order.
    pub const ALL: &[Self] = &[Self::Mongo, Self::Postgres];

    /// Returns the scheme token that selects this backend in a connection
    /// string.
    #[must_use]
    pub const fn scheme(self) -> &'static str {
        match self {
            Self::Mongo => "mongodb",
            Self::Postgres => "postgresql",
        }
    }

    /// Picks the backend whose scheme token appears in `dns`.
    ///
    /// This is a substring match, not strict URL scheme parsing, so
    /// `mongodb+srv://...` selects [`Self::Mongo`]. Backends are checked in
    /// [`Self::ALL`] order.
    #[must_use]
    pub fn from_connection_string(dns: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|storage_type| dns.contains(storage_type.scheme()))
    }
}

/// Request to delete every row from a set of tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncateRequest {
    /// Tables (or collections) to truncate, processed in order.
    pub tables: Vec<String>,
}

impl TruncateRequest {
    /// Creates a truncate request for the given tables.
    #[must_use]
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }
}

/// Result of a successful truncate. Carries no data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncateResponse {}

/// Request to insert or update a batch of records in one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertRequest {
    /// Destination table (or collection).
    pub table: String,
    /// Raw JSON payload: an array of objects or a single object.
    pub data: Vec<u8>,
}

impl UpsertRequest {
    /// Creates an upsert request for `table` from a raw JSON payload.
    #[must_use]
    pub fn new(table: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            table: table.into(),
            data,
        }
    }
}

/// Result of an upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertResponse {
    /// Records that matched an existing row and updated it.
    pub matched_count: u64,
    /// Records that did not match and were inserted.
    pub upserted_count: u64,
}

impl UpsertResponse {
    /// Adds another response's counts into this one.
    pub const fn merge(&mut self, other: Self) {
        self.matched_count += other.matched_count;
        self.upserted_count += other.upserted_count;
    }
}

/// Names of every table visible in the connected database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTablesResponse {
    /// Table (or collection) names.
    pub table_set: BTreeSet<String>,
}

/// Primary key columns per table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPrimaryKeysResponse {
    /// Table name to its key columns in key order.
    pub pk_set: BTreeMap<String, Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_backend_by_scheme_token() {
        assert_eq!(
            StorageType::from_connection_string("postgresql://u:p@host/db"),
            Some(StorageType::Postgres)
        );
        assert_eq!(
            StorageType::from_connection_string("mongodb://u:p@host/db"),
            Some(StorageType::Mongo)
        );
        assert_eq!(
            StorageType::from_connection_string("mongodb+srv://cluster.example.net/db"),
            Some(StorageType::Mongo)
        );
        assert_eq!(StorageType::from_connection_string("redis://host"), None);
    }

    #[test]
    fn storage_type_round_trips_through_strum() {
        assert_eq!(StorageType::Postgres.to_string(), "POSTGRES");
        assert_eq!("MONGO".parse::<StorageType>().unwrap(), StorageType::Mongo);
    }

    #[test]
    fn upsert_responses_merge() {
        let mut total = UpsertResponse::default();
        total.merge(UpsertResponse {
            matched_count: 2,
            upserted_count: 3,
        });
        total.merge(UpsertResponse {
            matched_count: 1,
            upserted_count: 0,
        });
        assert_eq!(
            total,
            UpsertResponse {
                matched_count: 3,
                upserted_count: 3,
            }
        );
    }
}
