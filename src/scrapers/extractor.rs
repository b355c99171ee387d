//! Listing extraction from marketplace search pages.
//!
//! Cards are found with attribute selectors, never the generated class names
//! the marketplace ships. Inside a card every field is optional and each
//! text fragment is classified by its shape (price, `City, XX` location,
//! mileage). Only the identifier and url are mandatory.

use crate::config::SelectorSettings;
use crate::error::ExtractError;
use crate::models::Listing;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::html::Select;
use scraper::{ElementRef, Html, Selector};
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

static ITEM_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/marketplace/item/([^/?#]+)").expect("valid item id regex"));

// ISO-prefixed prices must be the whole fragment, so "BMW 328i" is not one
static PRICE_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:[Ff]ree|FREE|(?:[A-Z]{2,3}\s?)?[$€£¥]\s?\d|(?:CAD|USD|EUR|GBP|AUD|NZD|MXN|CHF)\s?\d[\d,.\u{00A0} ]*$)",
    )
    .expect("valid price hint regex")
});

static PRICE_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{1,3}(?:[,\u{00A0} ]\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?")
        .expect("valid price number regex")
});

static LOCATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Z][a-zA-Z'.]*(?:[ -][A-Z][a-zA-Z'.]*)*, [A-Z]{2}$")
        .expect("valid location regex")
});

static MILEAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\d+(?:[.,]\d+)?\s?k?\s?(?:km|mi|miles)$").expect("valid mileage regex")
});

static MODEL_YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(19[5-9]\d|20\d\d)\b").expect("valid model year regex"));

static IMAGE: Lazy<Selector> = Lazy::new(|| Selector::parse("img").expect("valid img selector"));

/// Parse a locale-formatted price into a number.
///
/// Currency symbols, ISO codes and thousands separators are ignored;
/// anything without digits ("Free", "Contact seller") is `None`.
pub fn parse_price(text: &str) -> Option<f64> {
    let number = PRICE_NUMBER.find(text)?;
    let digits: String = number
        .as_str()
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    digits.parse().ok()
}

/// What one card offered up. Every field may be missing.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CardFields {
    pub external_id: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub price: Option<f64>,
    pub location: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl CardFields {
    pub fn has_identifier(&self) -> bool {
        self.external_id.is_some()
    }

    pub fn has_url(&self) -> bool {
        self.url.is_some()
    }

    pub fn has_price(&self) -> bool {
        self.price.is_some()
    }

    pub fn has_location(&self) -> bool {
        self.location.is_some()
    }

    /// Turn the card into a listing, `None` if it can't be deduplicated
    pub fn into_listing(self, seen_at: DateTime<Utc>) -> Option<Listing> {
        Some(Listing {
            external_id: self.external_id?,
            url: self.url?,
            title: self.title,
            price: self.price,
            location: self.location,
            first_seen: seen_at,
            last_seen: seen_at,
            raw_attributes: self.attributes,
        })
    }
}

/// Parses search pages into listings
pub struct ListingExtractor {
    base_url: Url,
    card: Selector,
    title: Selector,
}

impl ListingExtractor {
    pub fn new(base_url: Url, selectors: &SelectorSettings) -> Result<Self, ExtractError> {
        Ok(Self {
            base_url,
            card: parse_selector(&selectors.card)?,
            title: parse_selector(&selectors.title)?,
        })
    }

    pub fn with_default_selectors(base_url: Url) -> Result<Self, ExtractError> {
        Self::new(base_url, &SelectorSettings::default())
    }

    /// Parse a page. Listings are produced lazily from the returned page.
    pub fn extract(&self, html: &str) -> Result<ExtractedPage<'_>, ExtractError> {
        if html.contains('\0') {
            return Err(ExtractError::MalformedDocument {
                reason: "body contains NUL bytes, not an HTML text document".to_string(),
            });
        }

        Ok(ExtractedPage {
            document: Html::parse_document(html),
            extractor: self,
            extracted_at: Utc::now(),
        })
    }

    /// Extract everything eagerly: the listings plus the parse-miss count
    pub fn extract_all(&self, html: &str) -> Result<(Vec<Listing>, usize), ExtractError> {
        let page = self.extract(html)?;
        let mut listings = page.listings();
        let found: Vec<Listing> = listings.by_ref().collect();
        Ok((found, listings.misses()))
    }

    /// Read the fields of a single card
    pub fn read_card(&self, card: ElementRef<'_>) -> CardFields {
        let mut fields = CardFields::default();

        let href = card.value().attr("href").or_else(|| {
            card.select(&ANCHOR)
                .next()
                .and_then(|a| a.value().attr("href"))
        });

        if let Some(href) = href {
            fields.external_id = ITEM_ID
                .captures(href)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string());
            fields.url = self.resolve(href);
        }
        if fields.external_id.is_none() {
            fields.external_id = card
                .value()
                .attr("data-listing-id")
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string);
        }

        let image = card.select(&IMAGE).next();
        let title_el = card.select(&self.title).next();
        let title_fragments: Vec<&str> = title_el
            .map(|el| el.text().map(str::trim).filter(|t| !t.is_empty()).collect())
            .unwrap_or_default();
        fields.title = title_el
            .map(|el| collapse_whitespace(&el.text().collect::<String>()))
            .filter(|t| !t.is_empty())
            .or_else(|| {
                image
                    .and_then(|img| img.value().attr("alt"))
                    .map(collapse_whitespace)
                    .filter(|t| !t.is_empty())
            });

        if let Some(src) = image.and_then(|img| img.value().attr("src")) {
            fields.attributes.insert("image".to_string(), src.to_string());
        }

        let mut price_text = None;
        for text in card
            .text()
            .map(str::trim)
            .filter(|t| !t.is_empty() && !title_fragments.contains(t))
        {
            if price_text.is_none() && PRICE_HINT.is_match(text) {
                price_text = Some(text);
            } else if fields.location.is_none() && LOCATION.is_match(text) {
                fields.location = Some(text.to_string());
            } else if !fields.attributes.contains_key("mileage") && MILEAGE.is_match(text) {
                fields.attributes.insert("mileage".to_string(), text.to_string());
            }
        }

        if let Some(text) = price_text {
            fields.price = parse_price(text);
            if fields.price.is_none() {
                fields.attributes.insert("price_text".to_string(), text.to_string());
            }
        }

        if let Some(year) = fields
            .title
            .as_deref()
            .and_then(|t| MODEL_YEAR.captures(t))
            .and_then(|c| c.get(1))
        {
            fields.attributes.insert("year".to_string(), year.as_str().to_string());
        }

        fields
    }

    fn resolve(&self, href: &str) -> Option<String> {
        let mut url = self.base_url.join(href.trim()).ok()?;
        url.set_query(None);
        url.set_fragment(None);
        Some(url.to_string())
    }
}

static ANCHOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("valid anchor selector"));

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::InvalidSelector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A parsed document, ready to yield listings
pub struct ExtractedPage<'e> {
    document: Html,
    extractor: &'e ListingExtractor,
    extracted_at: DateTime<Utc>,
}

impl<'e> ExtractedPage<'e> {
    /// Single pass over the cards of this document
    pub fn listings(&self) -> Listings<'_> {
        Listings {
            cards: self.document.select(&self.extractor.card),
            extractor: self.extractor,
            extracted_at: self.extracted_at,
            misses: 0,
        }
    }

    pub fn card_count(&self) -> usize {
        self.document.select(&self.extractor.card).count()
    }
}

/// Lazy sequence of listings; cards without id or url are skipped and counted
pub struct Listings<'a> {
    cards: Select<'a, 'a>,
    extractor: &'a ListingExtractor,
    extracted_at: DateTime<Utc>,
    misses: usize,
}

impl Listings<'_> {
    /// Cards skipped so far
    pub fn misses(&self) -> usize {
        self.misses
    }
}

impl Iterator for Listings<'_> {
    type Item = Listing;

    fn next(&mut self) -> Option<Listing> {
        for card in self.cards.by_ref() {
            let fields = self.extractor.read_card(card);
            let (has_id, has_url) = (fields.has_identifier(), fields.has_url());
            let (has_price, has_location) = (fields.has_price(), fields.has_location());
            match fields.into_listing(self.extracted_at) {
                Some(listing) => return Some(listing),
                None => {
                    self.misses += 1;
                    debug!(has_id, has_url, has_price, has_location, "Skipping listing card");
                }
            }
        }
        None
    }
}
