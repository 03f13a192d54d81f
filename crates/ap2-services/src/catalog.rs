//! Product catalog and intent matching.
//!
//! Search is deliberately simple and deterministic: lowercase token match
//! over name/description/category/brand, then constraint filters. Ranking
//! for the "popular" strategy is the catalog's own popularity key.

use ap2_common::Amount;
use serde::{Deserialize, Serialize};

use ap2_mandate::IntentConstraints;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub description: String,
    pub price: Amount,
    pub category: String,
    pub brand: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    /// Ranking key for the popular strategy; higher sells better.
    pub popularity: u32,
}

/// In-memory catalog, seeded at startup.
#[derive(Debug, Clone, Default)]
pub struct ProductCatalog {
    products: Vec<Product>,
}

impl ProductCatalog {
    pub fn new(products: Vec<Product>) -> Self {
        Self { products }
    }

    /// The demo seed: running gear across the price spectrum.
    pub fn seeded() -> Self {
        let product = |id: &str, name: &str, description: &str, price: &str, category: &str, brand: &str, popularity: u32| {
            Product {
                id: id.to_string(),
                name: name.to_string(),
                description: description.to_string(),
                price: ap2_common::money::amount(price, "USD"),
                category: category.to_string(),
                brand: brand.to_string(),
                sku: Some(format!("sku-{id}")),
                popularity,
            }
        };

        Self::new(vec![
            product("prod_001", "Trail Runner 40", "lightweight trail running shoes", "89.99", "shoes", "Zephyr", 95),
            product("prod_002", "Road Glide 2", "cushioned road running shoes", "74.50", "shoes", "Cloudline", 88),
            product("prod_003", "Sprint Elite", "carbon-plated racing shoes", "189.00", "shoes", "Zephyr", 80),
            product("prod_004", "Daily Trainer", "durable everyday running shoes", "59.99", "shoes", "Stride", 76),
            product("prod_005", "Marathon Pro", "long-distance running shoes", "139.00", "shoes", "Cloudline", 71),
            product("prod_006", "Recovery Slide", "post-run recovery sandals", "34.99", "shoes", "Stride", 60),
            product("prod_007", "Tempo Short", "split running shorts", "38.00", "apparel", "Zephyr", 55),
            product("prod_008", "Thermal Layer", "winter running top", "64.00", "apparel", "Stride", 41),
            product("prod_009", "Hydration Vest", "5L race vest", "99.00", "accessories", "Cloudline", 38),
            product("prod_010", "GPS Watch S", "entry GPS running watch", "149.00", "accessories", "Pulse", 67),
        ])
    }

    pub fn all(&self) -> &[Product] {
        &self.products
    }

    pub fn get(&self, id: &str) -> Option<&Product> {
        self.products.iter().find(|p| p.id == id)
    }

    /// Products matching the intent text and constraints.
    ///
    /// A product matches the text when any query token appears in its
    /// name, description, category, or brand; an empty query matches
    /// everything. Constraint filters then drop products outside the
    /// intent's categories/brands/SKUs or above its `max_amount`.
    pub fn search(&self, query: &str, constraints: &IntentConstraints) -> Vec<&Product> {
        let tokens: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        self.products
            .iter()
            .filter(|p| {
                if tokens.is_empty() {
                    return true;
                }
                let haystack = format!(
                    "{} {} {} {}",
                    p.name.to_lowercase(),
                    p.description.to_lowercase(),
                    p.category.to_lowercase(),
                    p.brand.to_lowercase()
                );
                tokens.iter().any(|t| haystack.contains(t))
            })
            .filter(|p| match &constraints.categories {
                Some(allowed) => allowed.contains(&p.category),
                None => true,
            })
            .filter(|p| match &constraints.brands {
                Some(allowed) => allowed.contains(&p.brand),
                None => true,
            })
            .filter(|p| match &constraints.skus {
                Some(allowed) => p.sku.as_ref().map(|s| allowed.contains(s)).unwrap_or(false),
                None => true,
            })
            .filter(|p| match &constraints.max_amount {
                Some(max) => p.price.gt(max).map(|over| !over).unwrap_or(false),
                None => true,
            })
            .collect()
    }
}
