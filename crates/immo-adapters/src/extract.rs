//! Selector-driven listing extraction from heterogeneous agency markup.

use std::collections::HashSet;

use immo_core::{Coordinates, RawListing};
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Price,
    Surface,
    Rooms,
    Description,
    Images,
    Address,
    Contact,
}

/// Per-field patterns, tried in order inside each listing element.
const FIELD_PATTERNS: &[(Field, &[&str])] = &[
    (
        Field::Title,
        &["h1", "h2", ".title", ".name", ".heading", "[data-title]", "[data-name]", "[itemprop='name']"],
    ),
    (
        Field::Price,
        &[".price", ".montant", ".cost", ".amount", "[data-price]", "[itemprop='price']"],
    ),
    (
        Field::Surface,
        &[".surface", ".m2", ".sqm", ".area", "[data-surface]", "[itemprop='floorSize']"],
    ),
    (
        Field::Rooms,
        &[".rooms", ".pieces", ".bedrooms", ".beds", "[data-rooms]", "[itemprop='numberOfRooms']"],
    ),
    (
        Field::Description,
        &[".description", ".details", ".content", "p", "[data-description]", "[itemprop='description']"],
    ),
    (
        Field::Images,
        &["img", ".image", ".photo", ".gallery", "[data-image]", "[itemprop='image']"],
    ),
    (
        Field::Address,
        &[".address", ".location", ".place", "[data-address]", "[itemprop='address']"],
    ),
    (
        Field::Contact,
        &[".contact", ".agent", ".phone", "[data-contact]", "[data-agent]"],
    ),
];

const IMAGE_ATTRIBUTES: &[&str] = &["src", "data-src", "data-image"];
const LATITUDE_ATTRIBUTES: &[&str] = &["data-lat", "data-latitude"];
const LONGITUDE_ATTRIBUTES: &[&str] = &["data-lng", "data-lon", "data-longitude"];

/// Turns a page and a selector set into raw listings. Field patterns are
/// compiled once at construction.
#[derive(Debug)]
pub struct ListingExtractor {
    fields: Vec<(Field, Vec<Selector>)>,
    link: Selector,
}

impl Default for ListingExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ListingExtractor {
    pub fn new() -> Self {
        let fields = FIELD_PATTERNS
            .iter()
            .map(|(field, patterns)| {
                let selectors = patterns
                    .iter()
                    .filter_map(|p| Selector::parse(p).ok())
                    .collect();
                (*field, selectors)
            })
            .collect();
        Self {
            fields,
            link: Selector::parse("a[href]").expect("static link selector parses"),
        }
    }

    /// Elements lacking a title or a price are dropped silently. Relative
    /// links and image URLs are resolved against `page_url`.
    pub fn extract(&self, html: &str, page_url: &str, selectors: &[String]) -> Vec<RawListing> {
        let document = Html::parse_document(html);
        let base = Url::parse(page_url).ok();

        let mut seen = HashSet::new();
        let mut elements: Vec<ElementRef<'_>> = Vec::new();
        for css in selectors {
            let selector = match Selector::parse(css) {
                Ok(selector) => selector,
                Err(err) => {
                    debug!(selector = %css, error = %err, "skipping unparsable selector");
                    continue;
                }
            };
            for element in document.select(&selector) {
                if seen.insert(element.id()) {
                    elements.push(element);
                }
            }
        }

        let listings: Vec<RawListing> = elements
            .into_iter()
            .filter_map(|element| self.extract_one(element, base.as_ref()))
            .collect();
        debug!(url = page_url, listings = listings.len(), "extraction finished");
        listings
    }

    fn extract_one(&self, element: ElementRef<'_>, base: Option<&Url>) -> Option<RawListing> {
        let title = self.first_text(element, Field::Title)?;
        let price = self
            .first_text(element, Field::Price)
            .and_then(|text| first_digit_run(&strip_whitespace(&text)))?;

        Some(RawListing {
            title,
            price,
            surface: self
                .first_text(element, Field::Surface)
                .and_then(|t| first_digit_run(&t)),
            rooms: self
                .first_text(element, Field::Rooms)
                .and_then(|t| first_digit_run(&t)),
            description: self.first_text(element, Field::Description),
            images: self.images(element, base),
            address: self.first_text(element, Field::Address),
            contact: self.first_text(element, Field::Contact),
            link: self.link(element, base),
            coordinates: coordinates(element),
        })
    }

    fn patterns(&self, field: Field) -> &[Selector] {
        self.fields
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, selectors)| selectors.as_slice())
            .unwrap_or_default()
    }

    fn first_text(&self, element: ElementRef<'_>, field: Field) -> Option<String> {
        self.patterns(field).iter().find_map(|selector| {
            element
                .select(selector)
                .map(|m| collapse_whitespace(&m.text().collect::<String>()))
                .find(|text| !text.is_empty())
        })
    }

    fn images(&self, element: ElementRef<'_>, base: Option<&Url>) -> Vec<String> {
        let mut images = Vec::new();
        for selector in self.patterns(Field::Images) {
            for matched in element.select(selector) {
                let value = IMAGE_ATTRIBUTES
                    .iter()
                    .filter_map(|attr| matched.value().attr(attr))
                    .map(str::trim)
                    .find(|v| !v.is_empty() && !v.starts_with("data:"));
                if let Some(url) = value.and_then(|v| resolve(base, v)) {
                    if !images.contains(&url) {
                        images.push(url);
                    }
                }
            }
        }
        images
    }

    /// First anchor that resolves to a web page. Phone, mail and script links
    /// are skipped.
    fn link(&self, element: ElementRef<'_>, base: Option<&Url>) -> Option<String> {
        let own = (element.value().name() == "a")
            .then(|| element.value().attr("href"))
            .flatten();
        own.into_iter()
            .chain(element.select(&self.link).filter_map(|a| a.value().attr("href")))
            .map(str::trim)
            .filter(|h| !h.is_empty() && !h.starts_with('#'))
            .find_map(|h| resolve(base, h))
    }
}

/// Resolves `href` against `base`, keeping only http and https URLs.
fn resolve(base: Option<&Url>, href: &str) -> Option<String> {
    let url = match base {
        Some(base) => base.join(href).ok()?,
        None => Url::parse(href).ok()?,
    };
    matches!(url.scheme(), "http" | "https").then(|| String::from(url))
}

fn coordinates(element: ElementRef<'_>) -> Option<Coordinates> {
    let read = |names: &[&str]| {
        names
            .iter()
            .filter_map(|n| element.value().attr(n))
            .find_map(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
    };
    Some(Coordinates {
        latitude: read(LATITUDE_ATTRIBUTES)?,
        longitude: read(LONGITUDE_ATTRIBUTES)?,
    })
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Removes every whitespace character, including the no-break spaces used as
/// French thousands separators.
fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

fn first_digit_run(text: &str) -> Option<String> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    (!digits.is_empty()).then_some(digits)
}
