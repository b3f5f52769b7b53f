//! Chat-id normalization and idempotency-key derivation for the enqueue path.

use sha2::{Digest, Sha256};

/// Normalize a caller-supplied chat id to the shape the driver expects: if
/// it already carries a provider suffix (`@c.us`, `@g.us`, ...) it's left
/// untouched — stripping non-digits would mangle a group id's `-` and its
/// suffix. Otherwise strip everything but digits and append `@c.us`.
pub fn normalize_chat_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.contains('@') {
        return trimmed.to_string();
    }
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("{digits}@c.us")
}

/// Structured order-action params, when the caller's payload carries them.
pub struct OrderParams<'a> {
    pub shop: &'a str,
    pub order_id: &'a str,
    pub action: &'a str,
}

/// Derive an idempotency key: `order:{shop}:{orderId}:{action}:v1`
/// when structured params are present, otherwise a hash of
/// `(kind, instance_name, normalized payload)`.
pub fn derive_idempotency_key(
    order: Option<OrderParams<'_>>,
    kind: &str,
    instance_name: &str,
    normalized_payload: &str,
) -> String {
    if let Some(order) = order {
        return format!(
            "order:{}:{}:{}:v1",
            order.shop, order.order_id, order.action
        );
    }

    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(b"\0");
    hasher.update(instance_name.as_bytes());
    hasher.update(b"\0");
    hasher.update(normalized_payload.as_bytes());
    format!("hash:{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_punctuation_out_of_a_phone_number_and_appends_suffix() {
        assert_eq!(normalize_chat_id("+1 (555) 123-4567"), "15551234567@c.us");
    }

    #[test]
    fn leaves_an_already_suffixed_group_id_untouched() {
        assert_eq!(normalize_chat_id("123-456@g.us"), "123-456@g.us");
    }

    #[test]
    fn leaves_an_already_suffixed_individual_id_untouched() {
        assert_eq!(normalize_chat_id("15551234567@c.us"), "15551234567@c.us");
    }

    #[test]
    fn order_params_take_precedence_over_hashing() {
        let key = derive_idempotency_key(
            Some(OrderParams {
                shop: "shop1",
                order_id: "42",
                action: "confirm",
            }),
            "message",
            "inst",
            "hi",
        );
        assert_eq!(key, "order:shop1:42:confirm:v1");
    }

    #[test]
    fn identical_inputs_hash_identically() {
        let a = derive_idempotency_key(None, "message", "inst", "hi");
        let b = derive_idempotency_key(None, "message", "inst", "hi");
        assert_eq!(a, b);
        let c = derive_idempotency_key(None, "message", "inst", "bye");
        assert_ne!(a, c);
    }
}
