//! Client for the external pricing API and the reduction of an offer list
//! into a [`CompetitiveSummary`].

use std::cmp::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppError, Result};
use crate::types::{CompetitiveSummary, ItemKey};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    pub seller_id: String,
    pub price: f64,
    #[serde(default)]
    pub shipping: f64,
    #[serde(default)]
    pub is_buy_box_winner: bool,
    #[serde(default)]
    pub is_prime: bool,
    #[serde(default)]
    pub is_own: bool,
}

impl Offer {
    /// Price the buyer actually pays.
    pub fn landed(&self) -> f64 {
        self.price + self.shipping
    }
}

#[derive(Debug, Deserialize)]
struct OffersResponse {
    offers: Vec<Offer>,
}

#[async_trait]
pub trait PricingClient: Send + Sync {
    /// Current offer list for one item on one marketplace.
    async fn fetch_offers(&self, key: &ItemKey) -> Result<Vec<Offer>>;
}

pub struct HttpPricingClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpPricingClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl PricingClient for HttpPricingClient {
    async fn fetch_offers(&self, key: &ItemKey) -> Result<Vec<Offer>> {
        let url = format!("{}/items/{}/offers", self.base_url, key.item_id);
        let mut req = self
            .client
            .get(&url)
            .query(&[("marketplace", key.marketplace.as_str())]);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            debug!(%key, status = status.as_u16(), "pricing API error response");
            return Err(classify_status(status.as_u16(), body));
        }

        let parsed: OffersResponse = resp.json().await?;
        Ok(parsed.offers)
    }
}

/// Map a non-2xx pricing API response onto the error taxonomy.
pub fn classify_status(status: u16, body: String) -> AppError {
    match status {
        429 if body.to_ascii_lowercase().contains("quotaexceeded") => AppError::QuotaExhausted(body),
        429 => AppError::Throttled(body),
        401 | 403 => AppError::Auth(body),
        404 => AppError::NotFound(body),
        _ => AppError::Upstream { status, body },
    }
}

/// Reduce an offer list to our competitive position.
///
/// Prices compare on landed cost. Position is 1 plus the number of competitors
/// strictly cheaper than our offer; `None` when we have no offer listed.
pub fn summarize_offers(offers: &[Offer]) -> CompetitiveSummary {
    let own = offers.iter().find(|o| o.is_own);
    let competitors = offers.iter().filter(|o| !o.is_own);

    let market_low = min_landed(competitors.clone());
    let prime_low = min_landed(competitors.clone().filter(|o| o.is_prime));

    let your_price = own.map(Offer::landed);
    let position = your_price.map(|mine| {
        let cheaper = competitors.clone().filter(|o| o.landed() < mine).count();
        cheaper as u32 + 1
    });

    CompetitiveSummary {
        your_price,
        market_low,
        prime_low,
        position,
        total_offers: offers.len() as u32,
        is_buy_box_winner: own.map(|o| o.is_buy_box_winner).unwrap_or(false),
    }
}

fn min_landed<'a>(offers: impl Iterator<Item = &'a Offer>) -> Option<f64> {
    offers
        .map(Offer::landed)
        .min_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
}

/// Offers other than ours, as stored alongside a scan result.
pub fn competitor_offers(offers: &[Offer]) -> Vec<&Offer> {
    offers.iter().filter(|o| !o.is_own).collect()
}
