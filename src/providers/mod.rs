//! Provider/endpoint catalog (`SPEC_FULL.md` §4, providers module).
//!
//! Recovered from `original_source/app/collectors/*` and
//! `original_source/config/settings.py`: the two external collaborators are
//! the Korea Meteorological Administration (national weather service) and
//! the Korea Tourism Organization (national tourism service).

use serde::{Deserialize, Serialize};

/// An outbound data provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Korea Meteorological Administration — national weather service.
    Kma,
    /// Korea Tourism Organization — national tourism service.
    Kto,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Kma => "kma",
            Provider::Kto => "kto",
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kma" => Ok(Provider::Kma),
            "kto" => Ok(Provider::Kto),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known endpoints, used for storage-policy rule lookup and cache
/// fingerprinting. Additional endpoints may be called with a free-form
/// string; these constants just name the ones seeded in configuration
/// examples and tests.
pub mod endpoints {
    pub const KMA_SHORT_FORECAST: &str = "short_forecast";
    pub const KMA_MID_FORECAST: &str = "mid_forecast";
    pub const KTO_AREA_BASED_LIST: &str = "area_based_list";
    pub const KTO_DETAIL_COMMON: &str = "detail_common";
}
