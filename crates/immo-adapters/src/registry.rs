//! National listing portals, as a lookup table keyed by a short name.

use std::collections::BTreeSet;

use async_trait::async_trait;
use immo_core::SourceCandidate;

use crate::discovery::DiscoverySource;
use crate::AdapterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegalInfo {
    pub legal_name: &'static str,
    pub siren: Option<&'static str>,
    pub siret: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marketplace {
    pub key: &'static str,
    pub name: &'static str,
    pub base_url: &'static str,
    /// `{cp}` is replaced by the postal code.
    pub search_url_template: &'static str,
    pub legal: LegalInfo,
}

impl Marketplace {
    pub fn build_search_url(&self, postal_code: &str) -> Result<String, AdapterError> {
        let postal_code = postal_code.trim();
        if postal_code.len() != 5 || !postal_code.chars().all(|c| c.is_ascii_digit()) {
            return Err(AdapterError::InvalidPostalCode(postal_code.to_string()));
        }
        Ok(self.search_url_template.replace("{cp}", postal_code))
    }
}

pub const MARKETPLACES: &[Marketplace] = &[
    Marketplace {
        key: "seloger",
        name: "SeLoger",
        base_url: "https://www.seloger.com",
        search_url_template: "https://www.seloger.com/list.htm?cp={cp}",
        legal: LegalInfo {
            legal_name: "SeLoger",
            siren: Some("433043841"),
            siret: Some("43304384100019"),
        },
    },
    Marketplace {
        key: "leboncoin",
        name: "LeBonCoin",
        base_url: "https://www.leboncoin.fr",
        search_url_template: "https://www.leboncoin.fr/search?category=9&locations={cp}",
        legal: LegalInfo {
            legal_name: "LeBonCoin",
            siren: Some("799022127"),
            siret: None,
        },
    },
    Marketplace {
        key: "immobilier.com",
        name: "Immobilier.com",
        base_url: "https://www.immobilier.com",
        search_url_template: "https://www.immobilier.com/recherche/vente?cp={cp}",
        legal: LegalInfo {
            legal_name: "Immobilier.com",
            siren: Some("424667969"),
            siret: None,
        },
    },
    Marketplace {
        key: "orpi",
        name: "Orpi",
        base_url: "https://www.orpi.com",
        search_url_template: "https://www.orpi.com/recherche/annonces/achat/immobilier?cp={cp}",
        legal: LegalInfo {
            legal_name: "Orpi",
            siren: Some("352044693"),
            siret: None,
        },
    },
    Marketplace {
        key: "century21",
        name: "Century21",
        base_url: "https://www.century21.fr",
        search_url_template: "https://www.century21.fr/immobilier/achat/annonces/{cp}",
        legal: LegalInfo {
            legal_name: "Century21",
            siren: None,
            siret: None,
        },
    },
    Marketplace {
        key: "foncia",
        name: "Foncia",
        base_url: "https://www.foncia.com",
        search_url_template: "https://www.foncia.com/recherche/achat?cp={cp}",
        legal: LegalInfo {
            legal_name: "Foncia",
            siren: None,
            siret: None,
        },
    },
];

/// Case-insensitive lookup by key.
pub fn marketplace(key: &str) -> Result<&'static Marketplace, AdapterError> {
    let key = key.trim().to_ascii_lowercase();
    MARKETPLACES
        .iter()
        .find(|m| m.key == key)
        .ok_or(AdapterError::UnknownMarketplace(key))
}

/// Yields one candidate source per (portal, postal code): the portal's search
/// results page for that locality.
#[derive(Debug, Clone)]
pub struct MarketplaceDiscovery {
    marketplaces: Vec<&'static Marketplace>,
    postal_codes: Vec<String>,
}

impl MarketplaceDiscovery {
    pub fn all(postal_codes: Vec<String>) -> Self {
        Self {
            marketplaces: MARKETPLACES.iter().collect(),
            postal_codes,
        }
    }

    pub fn only(keys: &[&str], postal_codes: Vec<String>) -> Result<Self, AdapterError> {
        let marketplaces = keys
            .iter()
            .map(|k| marketplace(k))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            marketplaces,
            postal_codes,
        })
    }
}

#[async_trait]
impl DiscoverySource for MarketplaceDiscovery {
    fn tag(&self) -> &str {
        "marketplace"
    }

    async fn discover(&self) -> Result<Vec<SourceCandidate>, AdapterError> {
        let mut candidates = Vec::new();
        for market in &self.marketplaces {
            for postal_code in &self.postal_codes {
                candidates.push(SourceCandidate {
                    name: format!("{} {}", market.name, postal_code.trim()),
                    website_url: market.build_search_url(postal_code)?,
                    address: None,
                    phone: None,
                    coordinates: None,
                    discovered_from: BTreeSet::from([format!("marketplace:{}", market.key)]),
                });
            }
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_urls_follow_each_portal_template() {
        assert_eq!(
            marketplace("SeLoger").unwrap().build_search_url("75015").unwrap(),
            "https://www.seloger.com/list.htm?cp=75015"
        );
        assert_eq!(
            marketplace("century21").unwrap().build_search_url(" 69003 ").unwrap(),
            "https://www.century21.fr/immobilier/achat/annonces/69003"
        );
        assert_eq!(
            marketplace("leboncoin").unwrap().legal.siren,
            Some("799022127")
        );
    }

    #[test]
    fn unknown_keys_and_bad_postal_codes_are_rejected() {
        assert!(matches!(
            marketplace("pap"),
            Err(AdapterError::UnknownMarketplace(key)) if key == "pap"
        ));
        assert!(matches!(
            marketplace("orpi").unwrap().build_search_url("7501"),
            Err(AdapterError::InvalidPostalCode(_))
        ));
    }

    #[tokio::test]
    async fn discovery_yields_one_candidate_per_portal_and_locality() {
        let feed = MarketplaceDiscovery::only(&["seloger", "foncia"], vec!["75015".into(), "33000".into()])
            .unwrap();
        let candidates = feed.discover().await.unwrap();
        assert_eq!(candidates.len(), 4);
        assert_eq!(candidates[0].name, "SeLoger 75015");
        assert_eq!(candidates[3].website_url, "https://www.foncia.com/recherche/achat?cp=33000");
        assert!(candidates[3].discovered_from.contains("marketplace:foncia"));
        assert_eq!(MarketplaceDiscovery::all(vec![]).marketplaces.len(), MARKETPLACES.len());
    }
}
