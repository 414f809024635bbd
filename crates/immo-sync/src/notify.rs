//! Alert matching for newly created listings. Delivery (email, SMS) is an
//! external concern behind [`AlertDelivery`].

use std::sync::Arc;

use async_trait::async_trait;
use immo_core::{ListingContent, ListingRecord, PropertyType};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Invoked once per created listing.
#[async_trait]
pub trait NotificationService: Send + Sync {
    /// Returns how many alerts matched.
    async fn notify_matching_alerts(&self, listing: &ListingRecord) -> anyhow::Result<usize>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchAlert {
    pub id: String,
    pub recipient: String,
    #[serde(default)]
    pub postal_codes: Vec<String>,
    #[serde(default)]
    pub property_type: Option<PropertyType>,
    #[serde(default)]
    pub price_min: Option<u64>,
    #[serde(default)]
    pub price_max: Option<u64>,
    #[serde(default)]
    pub surface_min: Option<u32>,
    #[serde(default)]
    pub surface_max: Option<u32>,
    #[serde(default)]
    pub rooms_min: Option<u32>,
    #[serde(default)]
    pub rooms_max: Option<u32>,
}

fn within<T: PartialOrd + Copy>(value: Option<T>, min: Option<T>, max: Option<T>) -> bool {
    if min.is_none() && max.is_none() {
        return true;
    }
    // a bounded criterion never matches a listing that lacks the value
    let Some(value) = value else {
        return false;
    };
    min.map_or(true, |m| value >= m) && max.map_or(true, |m| value <= m)
}

impl SearchAlert {
    pub fn matches(&self, listing: &ListingContent) -> bool {
        let locality = self.postal_codes.is_empty()
            || listing
                .postal_code
                .as_ref()
                .is_some_and(|pc| self.postal_codes.contains(pc));
        let kind = self
            .property_type
            .map_or(true, |wanted| listing.property_type == Some(wanted));
        locality
            && kind
            && within(listing.price, self.price_min, self.price_max)
            && within(listing.surface, self.surface_min, self.surface_max)
            && within(listing.rooms, self.rooms_min, self.rooms_max)
    }
}

#[async_trait]
pub trait AlertDelivery: Send + Sync {
    async fn deliver(&self, alert: &SearchAlert, listing: &ListingRecord) -> anyhow::Result<()>;
}

/// Writes matches to the log instead of sending them anywhere.
#[derive(Debug, Clone, Default)]
pub struct LogDelivery;

#[async_trait]
impl AlertDelivery for LogDelivery {
    async fn deliver(&self, alert: &SearchAlert, listing: &ListingRecord) -> anyhow::Result<()> {
        info!(
            alert = %alert.id,
            recipient = %alert.recipient,
            listing = %listing.id,
            title = %listing.content.title,
            price = ?listing.content.price,
            url = %listing.source_url,
            "alert matched"
        );
        Ok(())
    }
}

pub struct AlertNotifier {
    alerts: Vec<SearchAlert>,
    delivery: Arc<dyn AlertDelivery>,
}

impl AlertNotifier {
    pub fn new(alerts: Vec<SearchAlert>, delivery: Arc<dyn AlertDelivery>) -> Self {
        Self { alerts, delivery }
    }

    pub fn alerts(&self) -> &[SearchAlert] {
        &self.alerts
    }
}

#[async_trait]
impl NotificationService for AlertNotifier {
    async fn notify_matching_alerts(&self, listing: &ListingRecord) -> anyhow::Result<usize> {
        let mut matched = 0;
        for alert in self.alerts.iter().filter(|a| a.matches(&listing.content)) {
            matched += 1;
            if let Err(err) = self.delivery.deliver(alert, listing).await {
                warn!(alert = %alert.id, listing = %listing.id, error = %err, "alert delivery failed");
            }
        }
        Ok(matched)
    }
}
