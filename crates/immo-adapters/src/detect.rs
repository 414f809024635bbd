//! Publishing-platform detection and candidate selector generation.

use scraper::{Html, Selector};
use tracing::debug;

pub const CUSTOM_PLATFORM: &str = "custom";

const PLATFORM_CONFIDENCE: f64 = 0.9;
const CUSTOM_CONFIDENCE: f64 = 0.5;

/// Indicator strings for one platform and the selectors that usually wrap a
/// listing on it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformSignature {
    pub name: &'static str,
    pub indicators: &'static [&'static str],
    pub selectors: &'static [&'static str],
}

impl PlatformSignature {
    fn matches(&self, url: &str, html: &str) -> bool {
        self.indicators
            .iter()
            .any(|needle| url.contains(needle) || html.contains(needle))
    }
}

/// Evaluated in order; the first match wins.
const KNOWN_PLATFORMS: &[PlatformSignature] = &[
    PlatformSignature {
        name: "wordpress",
        indicators: &["wp-content", "wp-includes", "wp-json"],
        selectors: &[".post", ".property", ".listing", ".product", "[data-post-id]"],
    },
    PlatformSignature {
        name: "wix",
        indicators: &["wix.com", "wixstatic.com", "wix-data"],
        selectors: &["[data-mesh-id]", ".wixui", "[data-testid]"],
    },
    PlatformSignature {
        name: "shopify",
        indicators: &["shopify.com", "cdn.shopify.com", "myshopify"],
        selectors: &[".product", ".listing", "[data-product-id]"],
    },
    PlatformSignature {
        name: "joomla",
        indicators: &["joomla", "component_", "Joomla"],
        selectors: &[".item", ".article", "[data-item-id]"],
    },
    PlatformSignature {
        name: "drupal",
        indicators: &["drupal", "sites/default", "sites/all"],
        selectors: &[".node", ".entity", "[data-entity-id]"],
    },
];

const CUSTOM_SELECTORS: &[&str] = &[".bien", ".annonce", ".property", ".listing", "[data-listing]"];

const MICRODATA_SELECTORS: &[&str] = &[
    "[itemtype*='Offer']",
    "[itemtype*='Product']",
    "[itemtype*='Residence']",
    "[itemtype*='House']",
    "[itemtype*='Apartment']",
];

const LISTING_KEYWORDS: &[&str] = &[
    "annonce",
    "bien",
    "property",
    "listing",
    "offer",
    "immobilier",
    "immo",
    "logement",
    "appartement",
    "maison",
    "item",
    "product",
    "card",
    "article",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StructureHints {
    pub has_data_attributes: bool,
    pub has_microdata: bool,
    pub has_json_ld: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub platform: String,
    pub selectors: Vec<String>,
    pub confidence: f64,
    pub structure: StructureHints,
}

impl Detection {
    pub fn is_custom(&self) -> bool {
        self.platform == CUSTOM_PLATFORM
    }
}

/// Classifies a page. Holds only the signature table; `detect` is a pure
/// function of its inputs.
#[derive(Debug, Clone)]
pub struct FormatDetector {
    signatures: Vec<PlatformSignature>,
}

impl Default for FormatDetector {
    fn default() -> Self {
        Self {
            signatures: KNOWN_PLATFORMS.to_vec(),
        }
    }
}

impl FormatDetector {
    /// Appends a platform to the end of the table.
    pub fn with_signature(mut self, signature: PlatformSignature) -> Self {
        self.signatures.push(signature);
        self
    }

    pub fn signatures(&self) -> &[PlatformSignature] {
        &self.signatures
    }

    pub fn detect(&self, url: &str, html: &str) -> Detection {
        let document = Html::parse_document(html);
        let structure = analyze_structure(&document);

        if let Some(signature) = self.signatures.iter().find(|s| s.matches(url, html)) {
            debug!(url, platform = signature.name, "platform signature matched");
            return Detection {
                platform: signature.name.to_string(),
                selectors: signature.selectors.iter().map(|s| s.to_string()).collect(),
                confidence: PLATFORM_CONFIDENCE,
                structure,
            };
        }

        let mut selectors: Vec<String> = CUSTOM_SELECTORS.iter().map(|s| s.to_string()).collect();
        if structure.has_microdata {
            selectors.extend(MICRODATA_SELECTORS.iter().map(|s| s.to_string()));
        }
        selectors.extend(keyword_selectors());
        let mut seen = std::collections::HashSet::new();
        selectors.retain(|s| seen.insert(s.clone()));

        debug!(
            url,
            selectors = selectors.len(),
            data_attributes = structure.has_data_attributes,
            microdata = structure.has_microdata,
            json_ld = structure.has_json_ld,
            "no platform matched, using generated selectors"
        );
        Detection {
            platform: CUSTOM_PLATFORM.to_string(),
            selectors,
            confidence: CUSTOM_CONFIDENCE,
            structure,
        }
    }
}

fn keyword_selectors() -> impl Iterator<Item = String> {
    LISTING_KEYWORDS.iter().flat_map(|kw| {
        [
            format!(".{kw}"),
            format!("[class*='{kw}']"),
            format!("#{kw}"),
            format!("[id*='{kw}']"),
            format!("[data-{kw}]"),
        ]
    })
}

fn analyze_structure(document: &Html) -> StructureHints {
    let has = |css: &str| {
        Selector::parse(css)
            .map(|sel| document.select(&sel).next().is_some())
            .unwrap_or(false)
    };
    let has_data_attributes = document.root_element().descendants().any(|node| {
        node.value()
            .as_element()
            .is_some_and(|el| el.attrs().any(|(name, _)| name.starts_with("data-")))
    });
    StructureHints {
        has_data_attributes,
        has_microdata: has("[itemtype]"),
        has_json_ld: has("script[type='application/ld+json']"),
    }
}
