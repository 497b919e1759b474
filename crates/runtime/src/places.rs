//! Condensed view of a place-search payload.
//!
//! The maps tool answers with JSON (`{"places": [...]}` for text search,
//! `{"results": [...]}` for nearby search).  Only the fields worth showing
//! a user are kept; identifiers and coordinates are dropped so they cannot
//! leak into the final answer.

use std::fmt::Write as _;

use serde::Deserialize;
use tracing::debug;

pub const TOP_RATED_MIN: f64 = 4.5;
pub const HIGHLY_RATED_MIN: f64 = 4.0;

/// Upper bound on a non-JSON payload embedded in a prompt.
pub const RAW_PAYLOAD_MAX_CHARS: usize = 4000;

/// At most this many places go into a digest.
const MAX_PLACES: usize = 10;

/// Place types that say nothing about a place.
const GENERIC_TYPES: &[&str] = &["point_of_interest", "establishment", "premise"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    TopRated,
    HighlyRated,
    AlsoWorthALook,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::TopRated, Tier::HighlyRated, Tier::AlsoWorthALook];

    pub fn for_rating(rating: Option<f64>) -> Self {
        match rating {
            Some(r) if r >= TOP_RATED_MIN => Tier::TopRated,
            Some(r) if r >= HIGHLY_RATED_MIN => Tier::HighlyRated,
            _ => Tier::AlsoWorthALook,
        }
    }

    pub fn heading(self) -> &'static str {
        match self {
            Tier::TopRated => "Top Rated",
            Tier::HighlyRated => "Highly Rated",
            Tier::AlsoWorthALook => "Also Worth a Look",
        }
    }

    /// Heading with its rating range, as shown in prompts.
    pub fn label(self) -> &'static str {
        match self {
            Tier::TopRated => "Top Rated (4.5+)",
            Tier::HighlyRated => "Highly Rated (4.0-4.4)",
            Tier::AlsoWorthALook => "Also Worth a Look",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "WirePlace")]
pub struct Place {
    pub name: String,
    pub address: Option<String>,
    pub rating: Option<f64>,
    pub ratings_total: Option<u64>,
    pub types: Vec<String>,
}

/// Text search and nearby search name the same fields differently, and a
/// place may carry both spellings.
#[derive(Debug, Deserialize)]
struct WirePlace {
    name: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    formatted_address: Option<String>,
    #[serde(default)]
    vicinity: Option<String>,
    #[serde(default)]
    rating: Option<f64>,
    #[serde(default)]
    ratings_total: Option<u64>,
    #[serde(default)]
    user_ratings_total: Option<u64>,
    #[serde(default)]
    types: Vec<String>,
}

impl From<WirePlace> for Place {
    fn from(wire: WirePlace) -> Self {
        Self {
            name: wire.name,
            address: wire.address.or(wire.formatted_address).or(wire.vicinity),
            rating: wire.rating,
            ratings_total: wire.ratings_total.or(wire.user_ratings_total),
            types: wire.types,
        }
    }
}

impl Place {
    pub fn tier(&self) -> Tier {
        Tier::for_rating(self.rating)
    }

    /// First part of the address, e.g. the street, without city and
    /// country.
    pub fn short_location(&self) -> Option<&str> {
        self.address
            .as_deref()
            .and_then(|address| address.split(',').next())
            .map(str::trim)
            .filter(|part| !part.is_empty())
    }

    /// Up to two descriptive types, readable ("cafe", "book store").
    pub fn features(&self) -> Vec<String> {
        self.types
            .iter()
            .filter(|t| !GENERIC_TYPES.contains(&t.as_str()))
            .take(2)
            .map(|t| t.replace('_', " "))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct SearchPayload {
    #[serde(default)]
    places: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    results: Option<Vec<serde_json::Value>>,
}

/// Parse a search payload.  `None` when the text is not a JSON object with
/// a `places` or `results` array.  Entries that do not look like a place
/// are dropped.
pub fn parse_places(payload: &str) -> Option<Vec<Place>> {
    let parsed: SearchPayload = serde_json::from_str(payload.trim()).ok()?;
    let entries = parsed.places.or(parsed.results)?;
    let total = entries.len();

    let places: Vec<Place> = entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value(entry).ok())
        .collect();
    if places.len() < total {
        debug!(dropped = total - places.len(), kept = places.len(), "skipped malformed place entries");
    }
    Some(places)
}

/// Places grouped by tier, best rated first within a tier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaceDigest {
    groups: Vec<(Tier, Vec<Place>)>,
}

impl PlaceDigest {
    pub fn from_places(mut places: Vec<Place>) -> Self {
        places.sort_by(|a, b| {
            b.rating
                .unwrap_or(0.0)
                .total_cmp(&a.rating.unwrap_or(0.0))
                .then_with(|| b.ratings_total.cmp(&a.ratings_total))
        });
        places.truncate(MAX_PLACES);

        let groups = Tier::ALL
            .into_iter()
            .filter_map(|tier| {
                let members: Vec<Place> = places
                    .iter()
                    .filter(|place| place.tier() == tier)
                    .cloned()
                    .collect();
                (!members.is_empty()).then_some((tier, members))
            })
            .collect();
        Self { groups }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn tiers(&self) -> Vec<Tier> {
        self.groups.iter().map(|(tier, _)| *tier).collect()
    }

    pub fn place_count(&self) -> usize {
        self.groups.iter().map(|(_, places)| places.len()).sum()
    }

    /// Plain-text listing for a prompt.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (tier, places) in &self.groups {
            let _ = writeln!(out, "{}:", tier.label());
            for place in places {
                let _ = write!(out, "- {}", place.name);
                if let Some(location) = place.short_location() {
                    let _ = write!(out, " | {location}");
                }
                match (place.rating, place.ratings_total) {
                    (Some(rating), Some(total)) => {
                        let _ = write!(out, " | rating {rating:.1} ({total} reviews)");
                    }
                    (Some(rating), None) => {
                        let _ = write!(out, " | rating {rating:.1}");
                    }
                    _ => out.push_str(" | unrated"),
                }
                let features = place.features();
                if !features.is_empty() {
                    let _ = write!(out, " | {}", features.join(", "));
                }
                out.push('\n');
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

/// Cut `text` to at most `max_chars` characters, never splitting one.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
