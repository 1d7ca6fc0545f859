//! Pure pricing helpers: percent deltas and repricing suggestions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Competitor, Product};

/// Signed percent change from `old_price` to `new_price`.
///
/// Returns `0.0` when either side is unknown or the old price is zero, so a
/// zero result does not imply both prices were observed.
pub fn percent_change(old_price: Option<f64>, new_price: Option<f64>) -> f64 {
    match (old_price, new_price) {
        (Some(old), Some(new)) if old != 0.0 => (new - old) / old.abs() * 100.0,
        _ => 0.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepriceStrategy {
    NoAction,
    MatchLowest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepriceSuggestion {
    pub strategy: RepriceStrategy,
    pub suggestion_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lowest_competitor_id: Option<Uuid>,
}

/// Propose a listing price that matches the cheapest known competitor without
/// going below `my_current_price - profit_margin` (clamped at zero).
pub fn suggest_reprice(product: &Product, competitors: &[Competitor]) -> RepriceSuggestion {
    let mut lowest: Option<(&Competitor, f64)> = None;
    for competitor in competitors {
        let Some(price) = competitor.current_price else {
            continue;
        };
        match lowest {
            Some((_, best)) if best <= price => {}
            _ => lowest = Some((competitor, price)),
        }
    }

    let Some((competitor, lowest_price)) = lowest else {
        return RepriceSuggestion {
            strategy: RepriceStrategy::NoAction,
            suggestion_price: product.my_current_price,
            lowest_competitor_id: None,
        };
    };

    let floor = match (product.my_current_price, product.profit_margin) {
        (Some(mine), Some(margin)) => Some((mine - margin).max(0.0)),
        _ => None,
    };
    let suggestion = floor.map_or(lowest_price, |floor| floor.max(lowest_price));

    RepriceSuggestion {
        strategy: RepriceStrategy::MatchLowest,
        suggestion_price: Some(suggestion),
        lowest_competitor_id: Some(competitor.id),
    }
}
