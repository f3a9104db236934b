//! Content digests for synchronization delta-resume.
//!
//! The server skips re-sending collections whose MD5 digest matches the
//! client's. Digests are computed over a canonical form: volatile fields
//! stripped, deterministic ordering, and for `cloud-g1` accounts a fixed
//! eight-decimal number rendering (except designated integer keys, which
//! emit bare).

use serde_json::Value;

use crate::models::{Order, Position, SymbolSpecification};

/// Account type whose servers hash the g1 canonical form.
const ACCOUNT_TYPE_G1: &str = "cloud-g1";

/// Position fields excluded from hashing on every account type.
const POSITION_VOLATILE_FIELDS: &[&str] = &[
    "profit",
    "unrealizedProfit",
    "realizedProfit",
    "currentPrice",
    "currentTickValue",
    "updateSequenceNumber",
    "accountCurrencyExchangeRate",
    "comment",
    "brokerComment",
    "clientId",
];

/// Position fields additionally excluded for g1 accounts.
const POSITION_G1_FIELDS: &[&str] = &["time", "updateTime"];

/// Order fields excluded from hashing on every account type.
const ORDER_VOLATILE_FIELDS: &[&str] = &[
    "currentPrice",
    "updateSequenceNumber",
    "accountCurrencyExchangeRate",
    "comment",
    "brokerComment",
    "clientId",
];

/// Order fields additionally excluded for g1 accounts.
const ORDER_G1_FIELDS: &[&str] = &["time"];

/// Specification fields excluded for g1 accounts.
const SPECIFICATION_G1_FIELDS: &[&str] = &["description"];

/// Keys whose numeric values always serialize as bare integers in the g1
/// form.
const INTEGER_KEYS: &[&str] = &["digits", "magic"];

/// The three collection digests carried by a synchronize request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateHashes {
    /// Digest of the specifications collection, `None` when uninitialized.
    pub specifications_hash: Option<String>,
    /// Digest of the positions collection, `None` before position sync.
    pub positions_hash: Option<String>,
    /// Digest of the pending orders collection, `None` before order sync.
    pub orders_hash: Option<String>,
}

/// Digest of a specifications collection.
#[must_use]
pub fn specifications_hash(specifications: &[SymbolSpecification], account_type: &str) -> String {
    let g1 = account_type == ACCOUNT_TYPE_G1;
    let mut sorted: Vec<&SymbolSpecification> = specifications.iter().collect();
    sorted.sort_by(|a, b| a.symbol.cmp(&b.symbol));

    let strip: &[&str] = if g1 { SPECIFICATION_G1_FIELDS } else { &[] };
    md5_hex(&canonical_json(to_values(&sorted), strip, g1))
}

/// Digest of a positions collection.
#[must_use]
pub fn positions_hash(positions: &[Position], account_type: &str) -> String {
    let g1 = account_type == ACCOUNT_TYPE_G1;
    let mut sorted: Vec<&Position> = positions.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut strip: Vec<&str> = POSITION_VOLATILE_FIELDS.to_vec();
    if g1 {
        strip.extend_from_slice(POSITION_G1_FIELDS);
    }
    md5_hex(&canonical_json(to_values(&sorted), &strip, g1))
}

/// Digest of a pending orders collection.
#[must_use]
pub fn orders_hash(orders: &[Order], account_type: &str) -> String {
    let g1 = account_type == ACCOUNT_TYPE_G1;
    let mut sorted: Vec<&Order> = orders.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut strip: Vec<&str> = ORDER_VOLATILE_FIELDS.to_vec();
    if g1 {
        strip.extend_from_slice(ORDER_G1_FIELDS);
    }
    md5_hex(&canonical_json(to_values(&sorted), &strip, g1))
}

fn to_values<T: serde::Serialize>(items: &[&T]) -> Vec<Value> {
    items
        .iter()
        .map(|item| serde_json::to_value(item).unwrap_or(Value::Null))
        .collect()
}

/// Serialize items to the canonical textual form. Object keys render in
/// sorted order, which also makes the digest invariant under input arrival
/// order once collections are sorted.
fn canonical_json(items: Vec<Value>, strip: &[&str], g1: bool) -> String {
    let mut cleaned = Vec::with_capacity(items.len());
    for mut item in items {
        if let Value::Object(map) = &mut item {
            for field in strip {
                map.remove(*field);
            }
        }
        cleaned.push(item);
    }

    let value = Value::Array(cleaned);
    if g1 {
        let mut out = String::new();
        write_g1(&mut out, &value, None);
        out
    } else {
        value.to_string()
    }
}

/// Render a value in the g1 form: numbers as `{:.8}` except under integer
/// keys. Array elements inherit the enclosing key.
fn write_g1(out: &mut String, value: &Value, key: Option<&str>) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            let integer = key.is_some_and(|k| INTEGER_KEYS.contains(&k));
            if integer {
                #[allow(clippy::cast_possible_truncation)]
                let i = n.as_i64().unwrap_or_else(|| n.as_f64().unwrap_or(0.0) as i64);
                out.push_str(&i.to_string());
            } else {
                let f = n.as_f64().unwrap_or(0.0);
                out.push_str(&format!("{f:.8}"));
            }
        }
        Value::String(s) => {
            out.push_str(&serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string()));
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_g1(out, item, key);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            for (i, (k, v)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k).unwrap_or_else(|_| "\"\"".to_string()));
                out.push(':');
                write_g1(out, v, Some(k));
            }
            out.push('}');
        }
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderType, PositionType};
    use chrono::{TimeZone, Utc};

    fn specification(description: Option<&str>) -> SymbolSpecification {
        SymbolSpecification {
            symbol: "EURUSD".to_string(),
            digits: 5,
            tick_size: 0.000_01,
            execution_mode: None,
            filling_modes: None,
            description: description.map(ToString::to_string),
        }
    }

    fn position(id: &str) -> Position {
        Position {
            id: id.to_string(),
            position_type: PositionType::Buy,
            symbol: "EURUSD".to_string(),
            magic: 1000,
            time: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            update_time: None,
            open_price: 1.261_01,
            current_price: None,
            current_tick_value: None,
            stop_loss: None,
            take_profit: None,
            volume: 0.07,
            swap: 0.0,
            commission: None,
            realized_profit: None,
            unrealized_profit: None,
            profit: None,
            comment: None,
            client_id: None,
            broker_comment: None,
            update_sequence_number: None,
            account_currency_exchange_rate: None,
        }
    }

    fn order(id: &str) -> Order {
        Order {
            id: id.to_string(),
            order_type: OrderType::BuyLimit,
            state: "ORDER_STATE_PLACED".to_string(),
            symbol: "EURUSD".to_string(),
            magic: 0,
            time: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            done_time: None,
            open_price: 1.25,
            current_price: Some(1.26),
            volume: 0.01,
            current_volume: 0.01,
            position_id: None,
            platform: None,
            comment: None,
            client_id: None,
            broker_comment: None,
            update_sequence_number: None,
            account_currency_exchange_rate: None,
        }
    }

    #[test]
    fn g1_specification_canonical_form() {
        let specs = vec![specification(Some("Euro vs US Dollar"))];
        let sorted: Vec<&SymbolSpecification> = specs.iter().collect();
        let canonical = canonical_json(to_values(&sorted), SPECIFICATION_G1_FIELDS, true);

        // description stripped, digits bare, tickSize fixed-8.
        assert_eq!(
            canonical,
            r#"[{"digits":5,"symbol":"EURUSD","tickSize":0.00001000}]"#
        );

        let hash = specifications_hash(&specs, "cloud-g1");
        assert_eq!(hash, md5_hex(canonical.as_str()));
        assert_eq!(hash.len(), 32);
    }

    #[test]
    fn g2_keeps_description_and_natural_numbers() {
        let with = specifications_hash(&[specification(Some("Euro vs US Dollar"))], "cloud-g2");
        let without = specifications_hash(&[specification(None)], "cloud-g2");
        assert_ne!(with, without);

        // On g1 the description is invisible to the digest.
        let g1_with = specifications_hash(&[specification(Some("Euro vs US Dollar"))], "cloud-g1");
        let g1_without = specifications_hash(&[specification(None)], "cloud-g1");
        assert_eq!(g1_with, g1_without);
    }

    #[test]
    fn hashes_are_deterministic() {
        let positions = vec![position("2"), position("1")];
        let first = positions_hash(&positions, "cloud-g2");
        let second = positions_hash(&positions, "cloud-g2");
        assert_eq!(first, second);
    }

    #[test]
    fn hashes_are_order_invariant() {
        let forward = vec![position("1"), position("2"), position("3")];
        let mut backward = forward.clone();
        backward.reverse();
        assert_eq!(
            positions_hash(&forward, "cloud-g1"),
            positions_hash(&backward, "cloud-g1")
        );

        let orders_fwd = vec![order("10"), order("11")];
        let orders_rev = vec![order("11"), order("10")];
        assert_eq!(
            orders_hash(&orders_fwd, "cloud-g2"),
            orders_hash(&orders_rev, "cloud-g2")
        );
    }

    #[test]
    fn volatile_position_fields_do_not_affect_digest() {
        let clean = position("1");
        let mut noisy = position("1");
        noisy.profit = Some(12.34);
        noisy.unrealized_profit = Some(12.0);
        noisy.realized_profit = Some(0.34);
        noisy.current_price = Some(1.3);
        noisy.current_tick_value = Some(1.0);
        noisy.comment = Some("hedge".to_string());
        noisy.client_id = Some("TE_1".to_string());
        noisy.update_sequence_number = Some(42);

        assert_eq!(
            positions_hash(&[clean.clone()], "cloud-g2"),
            positions_hash(&[noisy.clone()], "cloud-g2")
        );
        assert_eq!(
            positions_hash(&[clean], "cloud-g1"),
            positions_hash(&[noisy], "cloud-g1")
        );
    }

    #[test]
    fn g1_ignores_position_times_g2_does_not() {
        let base = position("1");
        let mut shifted = position("1");
        shifted.time = Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap();

        assert_eq!(
            positions_hash(&[base.clone()], "cloud-g1"),
            positions_hash(&[shifted.clone()], "cloud-g1")
        );
        assert_ne!(
            positions_hash(&[base], "cloud-g2"),
            positions_hash(&[shifted], "cloud-g2")
        );
    }

    #[test]
    fn magic_emits_as_bare_integer_on_g1() {
        let sorted = vec![position("1")];
        let refs: Vec<&Position> = sorted.iter().collect();
        let mut strip: Vec<&str> = POSITION_VOLATILE_FIELDS.to_vec();
        strip.extend_from_slice(POSITION_G1_FIELDS);
        let canonical = canonical_json(to_values(&refs), &strip, true);
        assert!(canonical.contains(r#""magic":1000,"#), "got {canonical}");
        assert!(canonical.contains(r#""volume":0.07000000"#), "got {canonical}");
    }

    #[test]
    fn order_current_price_is_volatile() {
        let mut a = order("10");
        a.current_price = Some(1.1);
        let mut b = order("10");
        b.current_price = Some(2.2);
        assert_eq!(orders_hash(&[a], "cloud-g2"), orders_hash(&[b], "cloud-g2"));
    }
}
