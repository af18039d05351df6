//! Bid pricing
//!
//! Chooses the maximum spot bid from the bidding policy, the observed spot
//! price, and the type's premium.

use crate::config::BiddingPolicy;
use tracing::debug;

/// Maximum price to bid for a spot replacement.
///
/// Normal policy bids the effective on-demand price. Aggressive policy bids
/// a buffer over the current spot price (premium excluded from the buffer),
/// capped at the on-demand price.
pub fn price_to_bid(
    base_on_demand_price: f64,
    current_spot_price: f64,
    spot_premium: f64,
    policy: BiddingPolicy,
    buffer_percentage: f64,
) -> f64 {
    if policy == BiddingPolicy::Normal {
        debug!(
            "Bidding base on-demand price {} under the normal policy",
            base_on_demand_price
        );
        return base_on_demand_price;
    }

    let buffered = (current_spot_price - spot_premium) * (1.0 + buffer_percentage / 100.0)
        + spot_premium;
    let bid = base_on_demand_price.min(buffered);
    debug!(
        "Bidding buffer-based price {} from spot price {} and buffer {}%",
        bid, current_spot_price, buffer_percentage
    );
    bid
}

/// Serialize a bid for the launch request, keeping up to 10 significant
/// digits.
pub fn format_max_price(price: f64) -> String {
    if price == 0.0 || !price.is_finite() {
        return "0".to_string();
    }
    let magnitude = price.abs().log10().floor() as i32;
    let factor = 10f64.powi(9 - magnitude);
    let rounded = (price * factor).round() / factor;
    format!("{}", rounded)
}
