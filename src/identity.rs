//! Business identity: the cache key.
//!
//! Priority: provider CID, then place id, then a fingerprint hash of
//! name/address/phone. The cache additionally remembers every identifier it
//! has seen for a business (see `cache::CacheStore::resolve_identity`), so a
//! later scrape that only captured a lower-priority identifier still lands on
//! the same entry.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::record::{clean_text, Record};

static CID_PARAM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[?&](?:cid|ludocid)=(\d+)").unwrap());
static FEATURE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"0x[0-9a-fA-F]+:0x([0-9a-fA-F]+)").unwrap());
static PLACE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:[?&](?:query_)?place_id=|place_id:|!19s)(ChI[A-Za-z0-9_-]+)").unwrap());

/// Deduplication key for a business.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum BusinessIdentity {
    Cid(u64),
    PlaceId(String),
    Fingerprint(String),
}

impl BusinessIdentity {
    /// Highest-priority identity derivable from the record alone.
    pub fn from_record(record: &Record) -> Self {
        if let Some(cid) = record.cid {
            BusinessIdentity::Cid(cid)
        } else if let Some(place_id) = &record.place_id {
            BusinessIdentity::PlaceId(place_id.clone())
        } else {
            BusinessIdentity::Fingerprint(fingerprint(record))
        }
    }

    /// Every identity the record can be reached by, in priority order.
    pub fn candidates(record: &Record) -> Vec<Self> {
        let mut out = Vec::with_capacity(3);
        if let Some(cid) = record.cid {
            out.push(BusinessIdentity::Cid(cid));
        }
        if let Some(place_id) = &record.place_id {
            out.push(BusinessIdentity::PlaceId(place_id.clone()));
        }
        out.push(BusinessIdentity::Fingerprint(fingerprint(record)));
        out
    }

    /// Storage key, e.g. `cid:1234`, `place:ChIJ...`, `fp:9f86...`.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for BusinessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusinessIdentity::Cid(cid) => write!(f, "cid:{}", cid),
            BusinessIdentity::PlaceId(id) => write!(f, "place:{}", id),
            BusinessIdentity::Fingerprint(hash) => write!(f, "fp:{}", hash),
        }
    }
}

impl FromStr for BusinessIdentity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| format!("identity key without prefix: {}", s))?;
        if value.is_empty() {
            return Err(format!("empty identity value: {}", s));
        }
        match kind {
            "cid" => value
                .parse()
                .map(BusinessIdentity::Cid)
                .map_err(|e| format!("bad cid '{}': {}", value, e)),
            "place" => Ok(BusinessIdentity::PlaceId(value.to_string())),
            "fp" => Ok(BusinessIdentity::Fingerprint(value.to_string())),
            other => Err(format!("unknown identity kind: {}", other)),
        }
    }
}

impl From<BusinessIdentity> for String {
    fn from(identity: BusinessIdentity) -> Self {
        identity.key()
    }
}

impl TryFrom<String> for BusinessIdentity {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Deterministic hash over normalized name, address, and phone digits.
pub fn fingerprint(record: &Record) -> String {
    let name = clean_text(&record.name).unwrap_or_default().to_lowercase();
    let address = record
        .address
        .as_deref()
        .and_then(clean_text)
        .unwrap_or_default()
        .to_lowercase();
    let phone: String = record
        .phone
        .as_deref()
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"|");
    hasher.update(address.as_bytes());
    hasher.update(b"|");
    hasher.update(phone.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

/// Provider identifiers recoverable from a map URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlIdentifiers {
    pub cid: Option<u64>,
    pub place_id: Option<String>,
}

impl UrlIdentifiers {
    pub fn from_url(url: &str) -> Self {
        let cid = CID_PARAM
            .captures(url)
            .and_then(|c| c[1].parse::<u64>().ok())
            .or_else(|| {
                FEATURE_ID
                    .captures(url)
                    .and_then(|c| u64::from_str_radix(&c[1], 16).ok())
            })
            .filter(|cid| *cid != 0);
        let place_id = PLACE_ID.captures(url).map(|c| c[1].to_string());
        Self { cid, place_id }
    }

    /// Best identity these identifiers give, if any.
    pub fn identity(&self) -> Option<BusinessIdentity> {
        if let Some(cid) = self.cid {
            Some(BusinessIdentity::Cid(cid))
        } else {
            self.place_id.clone().map(BusinessIdentity::PlaceId)
        }
    }
}
