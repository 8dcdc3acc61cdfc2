//! Stratum registry — the cohort key space that partitions safety statistics.
//!
//! `stratum_key` is a pure, deterministic binning of the assessment context:
//!
//!   property_type _ age_bracket _ region _ damage_type
//!
//! e.g. `residential_modern_london_water_damage`.
//!
//! RULE: changing the normalisation or the age brackets changes existing keys
//! and orphans their counters. Treat any edit here as a breaking change that
//! needs a counter migration.

use crate::{
    error::{GateError, GateResult},
    types::StratumKey,
};
use serde::{Deserialize, Serialize};

/// Context fields supplied by the caller for one assessment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StratumContext {
    pub property_type: String,
    /// Year the property was built, if known.
    #[serde(default)]
    pub build_year: Option<i32>,
    #[serde(default)]
    pub region: String,
    pub damage_type: String,
}

impl StratumContext {
    pub fn new(
        property_type: &str,
        build_year: Option<i32>,
        region: &str,
        damage_type: &str,
    ) -> Self {
        Self {
            property_type: property_type.to_string(),
            build_year,
            region: region.to_string(),
            damage_type: damage_type.to_string(),
        }
    }

    /// Property type and damage type are mandatory; region may be unknown.
    pub fn validate(&self) -> GateResult<()> {
        if normalise(&self.property_type).is_empty() {
            return Err(GateError::Validation("property_type must not be empty".into()));
        }
        if normalise(&self.damage_type).is_empty() {
            return Err(GateError::Validation("damage_type must not be empty".into()));
        }
        Ok(())
    }
}

/// Deterministic stratum key for a context.
pub fn stratum_key(ctx: &StratumContext) -> StratumKey {
    [
        part(&ctx.property_type),
        age_bracket(ctx.build_year).to_string(),
        part(&ctx.region),
        part(&ctx.damage_type),
    ]
    .join("_")
}

/// Age bracket for a build year. Bracket edges are part of the key space.
pub fn age_bracket(build_year: Option<i32>) -> &'static str {
    match build_year {
        None => "unknown",
        Some(y) if y < 1919 => "historic",
        Some(y) if y < 1945 => "interwar",
        Some(y) if y < 1980 => "postwar",
        Some(y) if y < 2010 => "modern",
        Some(_) => "new_build",
    }
}

fn part(raw: &str) -> String {
    let n = normalise(raw);
    if n.is_empty() {
        "unknown".to_string()
    } else {
        n
    }
}

/// Lowercase, collapse every run of non-alphanumerics to one `_`, trim `_`.
fn normalise(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}
