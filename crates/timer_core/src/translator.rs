//! Maps a feed notification to a time credit. Pure, and total over its
//! input: anything it cannot read contributes zero seconds.

use serde_json::Value;
use shared::domain::{EventCategory, IncrementSettings};

#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub delta_seconds: f64,
    pub reason: String,
}

impl Translation {
    fn zero(reason: impl Into<String>) -> Self {
        Self {
            delta_seconds: 0.0,
            reason: reason.into(),
        }
    }

    pub fn is_credit(&self) -> bool {
        self.delta_seconds != 0.0
    }
}

pub fn translate(category: &str, event: &Value, settings: &IncrementSettings) -> Translation {
    match EventCategory::from_type(category) {
        Some(EventCategory::Subscribe) => subscribe(event, settings),
        Some(EventCategory::SubscriptionGift) => gift(event, settings),
        Some(EventCategory::Cheer) => cheer(event, settings),
        None => Translation::zero(format!("Unhandled event: {category}")),
    }
}

fn subscribe(event: &Value, settings: &IncrementSettings) -> Translation {
    let user = user_name(event);
    let Some((tier, seconds)) = tier_value(event, settings) else {
        return Translation::zero(format!(
            "Subscription: {user} (unknown tier {})",
            raw_tier(event)
        ));
    };

    // The matching gift event credits gifted subs.
    if flag(event, "is_gift") {
        return Translation::zero(format!("Gifted sub: {user} (Tier {tier})"));
    }

    let months = event
        .get("cumulative_months")
        .and_then(Value::as_u64)
        .filter(|months| *months > 0)
        .unwrap_or(1);
    let kind = if has_message(event) {
        "Resub"
    } else {
        "Subscription"
    };
    Translation {
        delta_seconds: round_millis(seconds),
        reason: format!(
            "{kind}: {user} (Tier {tier}) - {months} month{}",
            if months > 1 { "s" } else { "" }
        ),
    }
}

fn gift(event: &Value, settings: &IncrementSettings) -> Translation {
    let user = if flag(event, "is_anonymous") {
        "Anonymous".to_string()
    } else {
        user_name(event)
    };
    let total = event.get("total").and_then(Value::as_u64).unwrap_or(0);
    let Some((tier, seconds)) = tier_value(event, settings) else {
        return Translation::zero(format!(
            "Gift Subs: {user} ({total}x unknown tier {})",
            raw_tier(event)
        ));
    };
    Translation {
        delta_seconds: round_millis(seconds * total as f64),
        reason: format!("Gift Subs: {user} ({total}x Tier {tier})"),
    }
}

fn cheer(event: &Value, settings: &IncrementSettings) -> Translation {
    let user = if flag(event, "is_anonymous") {
        "Anonymous".to_string()
    } else {
        user_name(event)
    };
    let bits = event.get("bits").and_then(Value::as_u64).unwrap_or(0);
    Translation {
        delta_seconds: round_millis(settings.bits_time_increment * bits as f64),
        reason: format!("Bits: {user} ({bits} bits)"),
    }
}

fn tier_value(event: &Value, settings: &IncrementSettings) -> Option<(u8, f64)> {
    match event.get("tier").and_then(Value::as_str)? {
        "1000" => Some((1, settings.tier1_sub_time)),
        "2000" => Some((2, settings.tier2_sub_time)),
        "3000" => Some((3, settings.tier3_sub_time)),
        _ => None,
    }
}

fn raw_tier(event: &Value) -> String {
    match event.get("tier") {
        Some(Value::String(tier)) => format!("\"{tier}\""),
        Some(other) => other.to_string(),
        None => "(missing)".to_string(),
    }
}

fn user_name(event: &Value) -> String {
    ["user_name", "user_login"]
        .into_iter()
        .filter_map(|key| event.get(key).and_then(Value::as_str))
        .find(|name| !name.is_empty())
        .unwrap_or("Anonymous")
        .to_string()
}

fn flag(event: &Value, key: &str) -> bool {
    event.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn has_message(event: &Value) -> bool {
    match event.get("message") {
        Some(Value::String(text)) => !text.is_empty(),
        Some(Value::Object(body)) => body
            .get("text")
            .and_then(Value::as_str)
            .is_some_and(|text| !text.is_empty()),
        _ => false,
    }
}

fn round_millis(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

#[cfg(test)]
#[path = "tests/translator_tests.rs"]
mod tests;
