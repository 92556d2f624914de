//! Rendering of outbound notification text.
//!
//! Jobs store the finished subject and HTML body, so the queue never needs the
//! catalog or settings again at delivery time.

use crate::model::{EntryKind, WaitlistEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub subject: String,
    pub body: String,
}

/// Substitute `{product_name}` and `{site_name}` in a subject template.
pub fn fill_template(template: &str, product_name: &str, site_name: &str) -> String {
    template
        .replace("{product_name}", product_name)
        .replace("{site_name}", site_name)
}

pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn wrap(site_name: &str, paragraphs: &[String]) -> String {
    let mut body = String::from("<html><body>");
    for p in paragraphs {
        body.push_str("<p>");
        body.push_str(p);
        body.push_str("</p>");
    }
    body.push_str(&format!("<p>{}</p></body></html>", escape_html(site_name)));
    body
}

pub fn join_confirmed(
    subject_template: &str,
    site_name: &str,
    product_name: &str,
    entry: &WaitlistEntry,
) -> Rendered {
    let name = escape_html(product_name);
    Rendered {
        subject: fill_template(subject_template, product_name, site_name),
        body: wrap(
            site_name,
            &[
                format!("You're on the waitlist for <strong>{name}</strong>."),
                format!(
                    "You joined as number {} in line. We'll email you as soon as it's back in stock.",
                    entry.position
                ),
            ],
        ),
    }
}

pub fn product_available(
    subject_template: &str,
    site_name: &str,
    product_name: &str,
    purchase_url: &str,
    entry: &WaitlistEntry,
) -> Rendered {
    let name = escape_html(product_name);
    let mut paragraphs = vec![format!("<strong>{name}</strong> is back in stock.")];
    if purchase_url.is_empty() {
        paragraphs.push(format!(
            "Visit {} to buy it before it sells out again.",
            escape_html(site_name)
        ));
    } else {
        paragraphs.push(format!(
            "<a href=\"{}\">Buy it now</a> before it sells out again.",
            escape_html(purchase_url)
        ));
    }
    if entry.kind == EntryKind::Deposit {
        paragraphs.push(format!(
            "Your deposit of {} will be applied to your purchase.",
            format_cents(entry.deposit_amount_cents)
        ));
    }
    Rendered {
        subject: fill_template(subject_template, product_name, site_name),
        body: wrap(site_name, &paragraphs),
    }
}

pub fn deposit_confirmed(site_name: &str, product_name: &str, entry: &WaitlistEntry) -> Rendered {
    Rendered {
        subject: format!("Your deposit for {product_name} is confirmed"),
        body: wrap(
            site_name,
            &[
                format!(
                    "We received your deposit of {} for <strong>{}</strong>.",
                    format_cents(entry.deposit_amount_cents),
                    escape_html(product_name)
                ),
                "You now have priority on the waitlist and will be notified first.".to_string(),
            ],
        ),
    }
}

pub fn deposit_refunded(site_name: &str, product_name: &str, entry: &WaitlistEntry) -> Rendered {
    Rendered {
        subject: format!("Your waitlist deposit for {product_name} has been refunded"),
        body: wrap(
            site_name,
            &[
                format!(
                    "Your waitlist for <strong>{}</strong> expired before it came back in stock.",
                    escape_html(product_name)
                ),
                format!(
                    "We've refunded your deposit of {}.",
                    format_cents(entry.deposit_amount_cents)
                ),
            ],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntryStatus;
    use chrono::Utc;

    fn entry(kind: EntryKind, amount: i64) -> WaitlistEntry {
        WaitlistEntry {
            id: 1,
            product_id: 42,
            variation_id: None,
            email: "a@x.com".into(),
            account_id: None,
            kind,
            priority_score: 0,
            position: 3,
            deposit_amount_cents: amount,
            deposit_order_ref: None,
            deposit_confirmed_at: None,
            refund_status: None,
            status: EntryStatus::Active,
            source: None,
            metadata: None,
            conversion_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            expires_at: None,
        }
    }

    #[test]
    fn templates_fill_placeholders() {
        assert_eq!(
            fill_template("{product_name} at {site_name}", "Mug", "Shop"),
            "Mug at Shop"
        );
        assert_eq!(fill_template("no placeholders", "Mug", "Shop"), "no placeholders");
    }

    #[test]
    fn cents_format() {
        assert_eq!(format_cents(0), "0.00");
        assert_eq!(format_cents(1), "0.01");
        assert_eq!(format_cents(2599), "25.99");
        assert_eq!(format_cents(-150), "-1.50");
    }

    #[test]
    fn availability_mentions_deposit_only_for_deposit_entries() {
        let free = product_available("{product_name} is back", "Shop", "Mug", "https://s/p/42", &entry(EntryKind::Free, 0));
        assert_eq!(free.subject, "Mug is back");
        assert!(free.body.contains("https://s/p/42"));
        assert!(!free.body.contains("deposit"));

        let paid = product_available("x", "Shop", "Mug", "https://s/p/42", &entry(EntryKind::Deposit, 1250));
        assert!(paid.body.contains("12.50"));
    }

    #[test]
    fn availability_without_url_has_no_link() {
        let r = product_available("x", "Shop", "product #42", "", &entry(EntryKind::Free, 0));
        assert!(r.body.contains("product #42"));
        assert!(!r.body.contains("href"));
        assert!(r.body.contains("Visit Shop"));
    }

    #[test]
    fn product_names_are_escaped_in_bodies() {
        let r = join_confirmed("{product_name}", "Shop", "<b>Mug</b>", &entry(EntryKind::Free, 0));
        assert!(r.body.contains("&lt;b&gt;Mug&lt;/b&gt;"));
        assert!(r.body.contains("number 3"));
    }
}
