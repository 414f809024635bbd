//! Page understanding and source discovery: platform detection, listing
//! extraction, the marketplace registry and discovery feeds.

use immo_storage::StoreError;
use thiserror::Error;

pub mod detect;
pub mod discovery;
pub mod extract;
pub mod registry;

pub use detect::{Detection, FormatDetector, PlatformSignature, StructureHints, CUSTOM_PLATFORM};
pub use discovery::{admit_candidates, normalize_website_url, AdmissionReport, DiscoverySource, StaticDiscovery};
pub use extract::ListingExtractor;
pub use registry::{marketplace, LegalInfo, Marketplace, MarketplaceDiscovery, MARKETPLACES};

pub const CRATE_NAME: &str = "immo-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unknown marketplace {0}")]
    UnknownMarketplace(String),
    #[error("invalid postal code {0:?}")]
    InvalidPostalCode(String),
    #[error("invalid website url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
