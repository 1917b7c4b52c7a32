//! Masking of sensitive column values.
//!
//! The strategy is picked from the column name: password-like columns are
//! blanked, phone numbers, e-mail addresses and card/account numbers keep
//! a recognisable prefix and suffix, anything else keeps two characters at
//! each end. `NULL` stays `NULL`.

use binwatch_core::types::{ChangeEvent, RowImage};
use serde_json::Value;

const BLANK: &str = "***";

/// Mask `value` according to the name of the column it came from.
pub fn mask_value(column: &str, value: &Value) -> Value {
    let text = match value {
        Value::Null => return Value::Null,
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let column = column.to_lowercase();
    let masked = if column.contains("password") {
        BLANK.to_owned()
    } else if column.contains("phone") {
        mask_phone(&text)
    } else if column.contains("email") {
        mask_email(&text)
    } else if column.contains("card") || column.contains("account") {
        mask_card(&text)
    } else {
        mask_default(&text)
    };
    Value::String(masked)
}

/// Mask `columns` in both images, the key projection and the UPDATE diff.
pub fn mask_event(event: &mut ChangeEvent, columns: &[String]) {
    if columns.is_empty() {
        return;
    }
    for image in [event.before.as_mut(), event.after.as_mut()]
        .into_iter()
        .flatten()
    {
        mask_image(image, columns);
    }
    mask_image(&mut event.primary_key, columns);
    for column in columns {
        if let Some(change) = event.changes.get_mut(column) {
            change.old = mask_value(column, &change.old);
            change.new = mask_value(column, &change.new);
        }
    }
}

fn mask_image(image: &mut RowImage, columns: &[String]) {
    for column in columns {
        if let Some(value) = image.get_mut(column) {
            *value = mask_value(column, value);
        }
    }
}

fn head(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

fn tail(s: &str, n: usize) -> String {
    let len = s.chars().count();
    s.chars().skip(len.saturating_sub(n)).collect()
}

fn mask_phone(phone: &str) -> String {
    if phone.chars().count() >= 7 {
        format!("{}****{}", head(phone, 3), tail(phone, 4))
    } else {
        BLANK.to_owned()
    }
}

fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) if local.chars().count() > 2 => {
            format!("{}***@{domain}", head(local, 2))
        }
        Some((_, domain)) => format!("***@{domain}"),
        None => BLANK.to_owned(),
    }
}

fn mask_card(card: &str) -> String {
    if card.chars().count() > 8 {
        format!("{}****{}", head(card, 4), tail(card, 4))
    } else {
        "****".to_owned()
    }
}

fn mask_default(value: &str) -> String {
    if value.chars().count() > 6 {
        format!("{}***{}", head(value, 2), tail(value, 2))
    } else {
        BLANK.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn passwords_are_blanked() {
        assert_eq!(mask_value("password_hash", &json!("$2b$12$abc")), json!("***"));
        assert_eq!(mask_value("PASSWORD", &json!(12345678)), json!("***"));
    }

    #[test]
    fn phone_keeps_prefix_and_suffix() {
        assert_eq!(mask_value("phone", &json!("13812345678")), json!("138****5678"));
        assert_eq!(mask_value("mobile_phone", &json!("12345")), json!("***"));
    }

    #[test]
    fn email_keeps_domain() {
        assert_eq!(
            mask_value("email", &json!("alice@example.com")),
            json!("al***@example.com")
        );
        assert_eq!(mask_value("email", &json!("al@example.com")), json!("***@example.com"));
        assert_eq!(mask_value("email", &json!("not-an-address")), json!("***"));
    }

    #[test]
    fn card_and_account_numbers() {
        assert_eq!(
            mask_value("card_no", &json!("6222021234567890")),
            json!("6222****7890")
        );
        assert_eq!(mask_value("account", &json!(12345678)), json!("****"));
    }

    #[test]
    fn default_masking() {
        assert_eq!(mask_value("id_number", &json!("110101199001011234")), json!("11***34"));
        assert_eq!(mask_value("nickname", &json!("bob")), json!("***"));
    }

    #[test]
    fn null_stays_null() {
        assert_eq!(mask_value("email", &Value::Null), Value::Null);
    }

    #[test]
    fn multibyte_values_do_not_split_characters() {
        assert_eq!(mask_value("address", &json!("北京市海淀区中关村")), json!("北京***关村"));
    }
}
