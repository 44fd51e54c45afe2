//! Fuzzy address/building matching.

use mlsync_core::{Building, MatchMethod, MatchResult};
use strsim::levenshtein;

/// Confidence reported for a street-number fallback hit. It is a fixed value, not a
/// measured similarity.
pub const STREET_NUMBER_FALLBACK_CONFIDENCE: f64 = 0.76;

const UNIT_MARKERS: &[&str] = &["#", "unit", "apt", "apartment", "suite", "ste", "no"];

const STREET_SUFFIXES: &[&str] = &[
    "street", "st", "avenue", "ave", "av", "boulevard", "blvd", "road", "rd", "drive", "dr",
    "lane", "ln", "court", "ct", "place", "pl", "parkway", "pkwy", "highway", "hwy", "way",
    "circle", "cir", "terrace", "ter", "trail", "trl", "square", "sq",
];

const DIRECTIONALS: &[&str] = &[
    "n", "s", "e", "w", "ne", "nw", "se", "sw", "north", "south", "east", "west", "northeast",
    "northwest", "southeast", "southwest",
];

#[derive(Debug, Clone, Copy)]
pub struct MatcherConfig {
    /// Minimum (exclusive) score when the caller supplied a building name.
    pub threshold_with_name: f64,
    /// Minimum (exclusive) score for address-only matching.
    pub threshold_address_only: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            threshold_with_name: 0.75,
            threshold_address_only: 0.85,
        }
    }
}

fn is_street_number(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_digit())
}

fn address_tokens(raw: &str) -> Vec<String> {
    let spaced = raw.to_lowercase().replace('#', " # ");
    let cleaned = spaced
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '#' { c } else { ' ' })
        .collect::<String>();

    let mut tokens = Vec::new();
    for token in cleaned.split_whitespace() {
        if UNIT_MARKERS.contains(&token) {
            break;
        }
        tokens.push(token.to_string());
    }

    // A directional right after the street number is a prefix: "40 N IH 35" drops
    // the N, but "222 West Ave" keeps West as the street name.
    let keep_prefix = tokens.len() > 1
        && is_street_number(&tokens[0])
        && DIRECTIONALS.contains(&tokens[1].as_str())
        && tokens[2..]
            .iter()
            .all(|t| STREET_SUFFIXES.contains(&t.as_str()));

    tokens
        .into_iter()
        .enumerate()
        .filter(|(i, t)| {
            let t = t.as_str();
            if STREET_SUFFIXES.contains(&t) {
                return false;
            }
            !DIRECTIONALS.contains(&t) || (*i == 1 && keep_prefix)
        })
        .map(|(_, t)| t)
        .collect()
}

/// Canonical comparison form of a street address.
pub fn normalize_address(raw: &str) -> String {
    address_tokens(raw).join(" ")
}

pub fn normalize_name(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Edit-distance similarity in `[0, 1]`. Two empty strings score 0.
pub fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 0.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

fn shares_street_number(input: &[String], candidate: &[String]) -> bool {
    let (Some((num_a, rest_a)), Some((num_b, rest_b))) =
        (input.split_first(), candidate.split_first())
    else {
        return false;
    };
    if !is_street_number(num_a) || num_a != num_b {
        return false;
    }
    rest_a
        .iter()
        .filter(|t| t.chars().count() >= 2)
        .any(|t| rest_b.contains(t))
}

#[derive(Debug, Clone, Default)]
pub struct AddressMatcher {
    config: MatcherConfig,
}

impl AddressMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    /// Picks the best-scoring building for an address (and optional building name).
    ///
    /// Ties are broken by candidate order: the first building reaching the top score
    /// wins, and the street-number fallback returns the first qualifying building.
    pub fn match_address(
        &self,
        address: &str,
        name: Option<&str>,
        candidates: &[Building],
    ) -> MatchResult {
        let input_address = normalize_address(address);
        let input_name = name.map(normalize_name).filter(|n| !n.is_empty());

        let mut best: Option<(&Building, f64, MatchMethod)> = None;
        for building in candidates {
            let address_score = std::iter::once(&building.address)
                .chain(building.aliases.iter())
                .map(|candidate| similarity(&input_address, &normalize_address(candidate)))
                .fold(0.0_f64, f64::max);

            let (score, method) = match &input_name {
                Some(input_name) => {
                    let name_score = similarity(input_name, &normalize_name(&building.name));
                    if name_score > address_score {
                        (name_score, MatchMethod::NameMatch)
                    } else {
                        (address_score, MatchMethod::AddressMatch)
                    }
                }
                None => (address_score, MatchMethod::AddressMatch),
            };

            if best.map_or(true, |(_, top, _)| score > top) {
                best = Some((building, score, method));
            }
        }

        let threshold = if input_name.is_some() {
            self.config.threshold_with_name
        } else {
            self.config.threshold_address_only
        };
        if let Some((building, score, method)) = best {
            if score > threshold {
                return MatchResult {
                    partition_key: Some(building.key.clone()),
                    confidence: score,
                    method,
                };
            }
        }

        let input_tokens = address_tokens(address);
        for building in candidates {
            let hit = std::iter::once(&building.address)
                .chain(building.aliases.iter())
                .any(|candidate| shares_street_number(&input_tokens, &address_tokens(candidate)));
            if hit {
                return MatchResult {
                    partition_key: Some(building.key.clone()),
                    confidence: STREET_NUMBER_FALLBACK_CONFIDENCE,
                    method: MatchMethod::StreetNumberFallback,
                };
            }
        }

        MatchResult::none()
    }
}
