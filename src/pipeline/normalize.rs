//! Normalisation: raw model text → [`ExtractedDocument`].
//!
//! The model is asked for a fixed JSON schema but nothing guarantees it
//! complies, so every field is checked explicitly instead of deserialising
//! straight into the schema types:
//!
//! - `{ "value": …, "confidence": … }` objects are the expected shape.
//! - Bare scalars are accepted with a synthesised confidence of `0.0`.
//! - `null`, empty strings and `{ "value": null }` count as absent.
//! - Absent **required** fields become [`FieldValue::missing`] so the
//!   confidence policy can reject on them; absent optional fields stay unset.
//!
//! Only a payload that is not JSON, or whose top level / sections have the
//! wrong shape, is an error. Normalisation never loops or retries.

use crate::error::NormalizationError;
use crate::schema::{
    Customer, ExtractedDocument, FieldValue, InvoiceSummary, LineItem, Supplier,
    DEFAULT_CURRENCY, MAX_LINE_ITEMS,
};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

type Object = Map<String, Value>;

/// Maps raw model output onto the canonical schema.
#[derive(Debug, Clone)]
pub struct ResponseNormalizer {
    max_line_items: usize,
}

impl Default for ResponseNormalizer {
    fn default() -> Self {
        Self {
            max_line_items: MAX_LINE_ITEMS,
        }
    }
}

impl ResponseNormalizer {
    pub fn new(max_line_items: usize) -> Self {
        Self { max_line_items }
    }

    pub fn normalize(&self, raw: &str) -> Result<ExtractedDocument, NormalizationError> {
        let root = parse_payload(raw)?;
        let root = match root {
            Value::Object(map) => map,
            other => {
                return Err(NormalizationError::WrongShape(format!(
                    "expected a JSON object at the top level, got {}",
                    kind_of(&other)
                )))
            }
        };

        let empty = Object::new();
        let supplier = section(&root, &["supplier"])?.unwrap_or(&empty);
        let customer = section(&root, &["customer"])?.unwrap_or(&empty);
        let invoice = section(&root, &["invoice", "invoice_summary", "invoiceSummary"])?
            .unwrap_or(&empty);

        let document = ExtractedDocument {
            supplier: Supplier {
                name: required(text(supplier, &["name"])),
                address: text(supplier, &["address"]),
                phone: text(supplier, &["phone"]),
                email: text(supplier, &["email"]),
                tax_id: text(supplier, &["tax_id", "taxId", "vat_id"]),
            },
            customer: Customer {
                name: required(text(customer, &["name"])),
                address: text(customer, &["address"]),
                account_id: text(customer, &["account_id", "accountId"]),
            },
            invoice: InvoiceSummary {
                number: required(text(invoice, &["number", "invoice_number"])),
                issue_date: required(date(invoice, &["issue_date", "issueDate"])),
                due_date: required(date(invoice, &["due_date", "dueDate"])),
                currency: currency(invoice),
                subtotal: number(invoice, &["subtotal"]),
                tax_amount: number(invoice, &["tax_amount", "tax"]),
                total: number(invoice, &["total", "total_amount", "totalAmount"]),
                payment_terms: text(invoice, &["payment_terms", "paymentTerms"]),
                po_number: text(invoice, &["po_number", "poNumber"]),
            },
            line_items: self.line_items(&root)?,
        };

        Ok(document)
    }

    fn line_items(&self, root: &Object) -> Result<Vec<LineItem>, NormalizationError> {
        let raw = match ["line_items", "lineItems", "items"]
            .iter()
            .find_map(|k| root.get(*k).filter(|v| !v.is_null()))
        {
            None => return Ok(Vec::new()),
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(NormalizationError::WrongShape(format!(
                    "line_items must be an array, got {}",
                    kind_of(other)
                )))
            }
        };

        let objects: Vec<&Object> = raw.iter().filter_map(Value::as_object).collect();
        if objects.len() < raw.len() {
            debug!("Skipped {} non-object line item(s)", raw.len() - objects.len());
        }
        if objects.len() > self.max_line_items {
            debug!(
                "Truncating {} line items to {}",
                objects.len(),
                self.max_line_items
            );
        }

        Ok(objects
            .into_iter()
            .take(self.max_line_items)
            .map(|item| LineItem {
                sku: text(item, &["sku"]),
                description: required(text(item, &["description"])),
                quantity: number(item, &["quantity", "qty"]),
                unit_price: number(item, &["unit_price", "unitPrice"]),
                discount: number(item, &["discount"]),
                tax_rate: number(item, &["tax_rate", "taxRate"]),
                total: number(item, &["total", "amount"]),
            })
            .collect())
    }
}

// ── Payload parsing ──────────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:json|JSON)?[ \t]*\n(.*)\n```\s*$").unwrap());

/// Parse the payload, tolerating a Markdown fence or prose around the object.
fn parse_payload(raw: &str) -> Result<Value, NormalizationError> {
    let trimmed = raw.trim();
    let body = RE_OUTER_FENCES
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map_or(trimmed, |m| m.as_str());

    match serde_json::from_str::<Value>(body) {
        Ok(v) => Ok(v),
        Err(first_err) => {
            let sliced = match (body.find('{'), body.rfind('}')) {
                (Some(start), Some(end)) if start < end => &body[start..=end],
                _ => return Err(NormalizationError::InvalidSyntax(first_err.to_string())),
            };
            serde_json::from_str::<Value>(sliced)
                .map_err(|_| NormalizationError::InvalidSyntax(first_err.to_string()))
        }
    }
}

fn section<'a>(root: &'a Object, keys: &[&str]) -> Result<Option<&'a Object>, NormalizationError> {
    let found = keys
        .iter()
        .find_map(|k| root.get(*k).filter(|v| !v.is_null()).map(|v| (*k, v)));
    match found {
        None => Ok(None),
        Some((_, Value::Object(map))) => Ok(Some(map)),
        Some((key, other)) => Err(NormalizationError::WrongShape(format!(
            "section '{key}' must be an object, got {}",
            kind_of(other)
        ))),
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── Field readers ────────────────────────────────────────────────────────────

/// Locate a field and split it into `(value, confidence)`.
fn locate<'a>(obj: &'a Object, keys: &[&str]) -> Option<(&'a Value, f64)> {
    let raw = keys
        .iter()
        .find_map(|k| obj.get(*k).filter(|v| !v.is_null()))?;

    let (value, confidence) = match raw {
        Value::Object(field) => (field.get("value")?, read_confidence(field.get("confidence"))),
        Value::Array(_) => return None,
        scalar => (scalar, 0.0),
    };

    if value.is_null() {
        return None;
    }
    Some((value, confidence))
}

fn read_confidence(raw: Option<&Value>) -> f64 {
    let c = match raw {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    if c.is_nan() {
        0.0
    } else {
        c.clamp(0.0, 1.0)
    }
}

fn required<T: Default>(field: Option<FieldValue<T>>) -> FieldValue<T> {
    field.unwrap_or_else(FieldValue::missing)
}

fn text(obj: &Object, keys: &[&str]) -> Option<FieldValue<String>> {
    let (value, confidence) = locate(obj, keys)?;
    let s = scalar_to_string(value)?;
    if s.is_empty() {
        return None;
    }
    Some(FieldValue::new(s, confidence))
}

fn number(obj: &Object, keys: &[&str]) -> Option<FieldValue<f64>> {
    let (value, confidence) = locate(obj, keys)?;
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_amount(s),
        _ => None,
    };
    match n {
        Some(n) if n.is_finite() => Some(FieldValue::new(n, confidence)),
        _ => {
            debug!("Dropping non-numeric value for '{}'", keys[0]);
            None
        }
    }
}

fn date(obj: &Object, keys: &[&str]) -> Option<FieldValue<String>> {
    let field = text(obj, keys)?;
    let value = normalize_date(&field.value).unwrap_or(field.value);
    Some(FieldValue::new(value, field.confidence))
}

fn currency(invoice: &Object) -> FieldValue<String> {
    match locate(invoice, &["currency"]) {
        Some((value, confidence)) => {
            let code = scalar_to_string(value).unwrap_or_default().to_ascii_uppercase();
            if code.is_empty() {
                FieldValue::new(DEFAULT_CURRENCY.to_string(), confidence)
            } else {
                FieldValue::new(code, confidence)
            }
        }
        None => FieldValue::new(DEFAULT_CURRENCY.to_string(), 1.0),
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ── Coercion rules ───────────────────────────────────────────────────────────

static RE_AMOUNT_JUNK: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9.,\-]").unwrap());

/// Parse a human-formatted amount: `"$1,234.50"`, `"1.234,50 €"`, `"(12.00)"`.
pub fn parse_amount(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    let negative = trimmed.starts_with('(') && trimmed.ends_with(')');
    let cleaned = RE_AMOUNT_JUNK.replace_all(trimmed, "");
    if cleaned.is_empty() {
        return None;
    }

    let canonical = match (cleaned.rfind('.'), cleaned.rfind(',')) {
        // Whichever separator comes last is the decimal point.
        (Some(dot), Some(comma)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        // A lone comma followed by exactly two digits is a decimal comma.
        (None, Some(comma)) if cleaned.len() - comma - 1 == 2 && cleaned.matches(',').count() == 1 => {
            cleaned.replace(',', ".")
        }
        _ => cleaned.replace(',', ""),
    };

    let n = canonical.parse::<f64>().ok()?;
    Some(if negative { -n.abs() } else { n })
}

static RE_YMD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})[-/.](\d{1,2})[-/.](\d{1,2})(?:[T ].*)?$").unwrap());
static RE_AB_YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2})[-/.](\d{1,2})[-/.](\d{4}|\d{2})$").unwrap());
static RE_COMPACT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{4})(\d{2})(\d{2})$").unwrap());
static RE_ORDINAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d)(?:st|nd|rd|th)\b").unwrap());

const LONG_FORMATS: [&str; 6] = [
    "%B %d, %Y",
    "%B %d %Y",
    "%d %B %Y",
    "%b %d, %Y",
    "%b %d %Y",
    "%d %b %Y",
];

/// Normalise a date to `YYYY-MM-DD`.
///
/// Numeric dates with an ambiguous order are read month-first; day-first is
/// used only when month-first is impossible (e.g. `31/01/2024`).
pub fn normalize_date(s: &str) -> Option<String> {
    let s = s.trim();

    let parsed = if let Some(c) = RE_YMD.captures(s).or_else(|| RE_COMPACT.captures(s)) {
        ymd(c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?)
    } else if let Some(c) = RE_AB_YEAR.captures(s) {
        let a: u32 = c[1].parse().ok()?;
        let b: u32 = c[2].parse().ok()?;
        let year = expand_year(&c[3])?;
        ymd(year, a, b).or_else(|| ymd(year, b, a))
    } else {
        let cleaned = RE_ORDINAL.replace_all(s, "$1").replace('.', "");
        LONG_FORMATS
            .iter()
            .find_map(|f| NaiveDate::parse_from_str(&cleaned, f).ok())
    };

    parsed.map(|d| d.format("%Y-%m-%d").to_string())
}

fn ymd(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Two-digit years: 00–50 → 2000s, 51–99 → 1900s.
fn expand_year(s: &str) -> Option<i32> {
    let year: i32 = s.parse().ok()?;
    Some(match (s.len(), year) {
        (2, y) if y <= 50 => 2000 + y,
        (2, y) => 1900 + y,
        (_, y) => y,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalize(v: Value) -> ExtractedDocument {
        ResponseNormalizer::default()
            .normalize(&v.to_string())
            .expect("normalisation should succeed")
    }

    fn full_payload() -> Value {
        json!({
            "supplier": {
                "name": {"value": "Acme Corp", "confidence": 0.98},
                "email": {"value": "billing@acme.test", "confidence": 0.91}
            },
            "customer": {"name": {"value": "Globex Ltd", "confidence": 0.97}},
            "invoice": {
                "number": {"value": "INV-001", "confidence": 0.99},
                "issue_date": {"value": "2024-01-15", "confidence": 0.95},
                "due_date": {"value": "02/14/2024", "confidence": 0.94},
                "currency": {"value": "eur", "confidence": 0.92},
                "total_amount": {"value": "1,250.00", "confidence": 0.96}
            },
            "line_items": [
                {
                    "description": {"value": "Consulting", "confidence": 0.93},
                    "quantity": {"value": 10, "confidence": 0.95},
                    "unit_price": {"value": 125, "confidence": 0.95}
                }
            ]
        })
    }

    #[test]
    fn well_formed_payload_maps_every_field() {
        let doc = normalize(full_payload());
        assert_eq!(doc.supplier.name, FieldValue::new("Acme Corp".into(), 0.98));
        assert_eq!(doc.supplier.email.as_ref().unwrap().value, "billing@acme.test");
        assert!(doc.supplier.phone.is_none());
        assert_eq!(doc.invoice.due_date.value, "2024-02-14");
        assert_eq!(doc.invoice.currency, FieldValue::new("EUR".into(), 0.92));
        assert_eq!(doc.invoice.total, Some(FieldValue::new(1250.0, 0.96)));
        assert_eq!(doc.line_items.len(), 1);
        assert_eq!(doc.line_items[0].quantity, Some(FieldValue::new(10.0, 0.95)));
    }

    #[test]
    fn bare_scalars_get_zero_confidence() {
        let doc = normalize(json!({
            "supplier": {"name": "Acme"},
            "invoice": {"total": 42.5}
        }));
        assert_eq!(doc.supplier.name, FieldValue::new("Acme".into(), 0.0));
        assert_eq!(doc.invoice.total, Some(FieldValue::new(42.5, 0.0)));
    }

    #[test]
    fn missing_required_fields_are_synthesised() {
        let doc = normalize(json!({}));
        assert_eq!(doc.customer.name, FieldValue::missing());
        assert_eq!(doc.invoice.number, FieldValue::missing());
        assert!(doc.invoice.total.is_none());
        assert!(doc.line_items.is_empty());
    }

    #[test]
    fn null_and_empty_values_are_absent() {
        let doc = normalize(json!({
            "supplier": {
                "name": {"value": "", "confidence": 0.9},
                "phone": null,
                "address": {"value": null, "confidence": 0.8}
            }
        }));
        assert_eq!(doc.supplier.name.confidence, 0.0);
        assert!(doc.supplier.phone.is_none());
        assert!(doc.supplier.address.is_none());
    }

    #[test]
    fn null_section_falls_through_to_alias() {
        let doc = normalize(json!({
            "invoice": null,
            "invoice_summary": {"number": {"value": "INV-7", "confidence": 0.9}}
        }));
        assert_eq!(doc.invoice.number, FieldValue::new("INV-7".into(), 0.9));
    }

    #[test]
    fn currency_defaults_to_usd() {
        let absent = normalize(json!({"invoice": {}}));
        assert_eq!(absent.invoice.currency, FieldValue::new("USD".into(), 1.0));

        let empty = normalize(json!({"invoice": {"currency": {"value": "", "confidence": 0.4}}}));
        assert_eq!(empty.invoice.currency, FieldValue::new("USD".into(), 0.4));
    }

    #[test]
    fn confidence_is_clamped_and_defaulted() {
        let doc = normalize(json!({
            "supplier": {"name": {"value": "A", "confidence": 7}},
            "customer": {"name": {"value": "B", "confidence": "0.75"}},
            "invoice": {"number": {"value": "C"}}
        }));
        assert_eq!(doc.supplier.name.confidence, 1.0);
        assert_eq!(doc.customer.name.confidence, 0.75);
        assert_eq!(doc.invoice.number.confidence, 0.0);
    }

    #[test]
    fn numeric_invoice_number_becomes_text() {
        let doc = normalize(json!({"invoice": {"number": {"value": 10042, "confidence": 0.9}}}));
        assert_eq!(doc.invoice.number.value, "10042");
    }

    #[test]
    fn unparseable_amount_is_absent() {
        let doc = normalize(json!({"invoice": {"total": {"value": "see attached", "confidence": 0.9}}}));
        assert!(doc.invoice.total.is_none());
    }

    #[test]
    fn line_items_are_capped_at_fifty() {
        let items: Vec<Value> = (0..75)
            .map(|i| json!({"description": {"value": format!("item {i}"), "confidence": 0.9}}))
            .collect();
        let doc = normalize(json!({ "line_items": items }));
        assert_eq!(doc.line_items.len(), 50);
        assert_eq!(doc.line_items[49].description.value, "item 49");
    }

    #[test]
    fn non_object_line_items_are_skipped() {
        let doc = normalize(json!({"line_items": ["junk", {"description": "Widget"}, 3]}));
        assert_eq!(doc.line_items.len(), 1);
        assert_eq!(doc.line_items[0].description.value, "Widget");
    }

    #[test]
    fn fenced_json_is_accepted() {
        let raw = format!("```json\n{}\n```", full_payload());
        let doc = ResponseNormalizer::default().normalize(&raw).unwrap();
        assert_eq!(doc.invoice.number.value, "INV-001");
    }

    #[test]
    fn prose_around_object_is_tolerated() {
        let raw = format!("Here is the extracted data:\n{}\nLet me know!", full_payload());
        assert!(ResponseNormalizer::default().normalize(&raw).is_ok());
    }

    #[test]
    fn invalid_json_is_malformed() {
        let err = ResponseNormalizer::default()
            .normalize("I could not read this invoice.")
            .unwrap_err();
        assert!(matches!(err, NormalizationError::InvalidSyntax(_)));
    }

    #[test]
    fn wrong_top_level_shape_is_malformed() {
        let err = ResponseNormalizer::default().normalize("[1, 2, 3]").unwrap_err();
        assert!(matches!(err, NormalizationError::WrongShape(_)));
    }

    #[test]
    fn wrong_section_shape_is_malformed() {
        let err = ResponseNormalizer::default()
            .normalize(r#"{"supplier": "Acme"}"#)
            .unwrap_err();
        assert!(matches!(err, NormalizationError::WrongShape(ref m) if m.contains("supplier")));

        let err = ResponseNormalizer::default()
            .normalize(r#"{"line_items": {"description": "x"}}"#)
            .unwrap_err();
        assert!(matches!(err, NormalizationError::WrongShape(_)));
    }

    #[test]
    fn normalisation_is_idempotent() {
        let raw = full_payload().to_string();
        let n = ResponseNormalizer::default();
        assert_eq!(n.normalize(&raw).unwrap(), n.normalize(&raw).unwrap());
    }

    #[test]
    fn amounts_in_common_formats() {
        assert_eq!(parse_amount("$1,234.50"), Some(1234.5));
        assert_eq!(parse_amount("1.234,50 €"), Some(1234.5));
        assert_eq!(parse_amount("12,50"), Some(12.5));
        assert_eq!(parse_amount("1,250"), Some(1250.0));
        assert_eq!(parse_amount("(12.00)"), Some(-12.0));
        assert_eq!(parse_amount("n/a"), None);
    }

    #[test]
    fn dates_in_common_formats() {
        assert_eq!(normalize_date("2024-01-15").as_deref(), Some("2024-01-15"));
        assert_eq!(normalize_date("2024/1/5").as_deref(), Some("2024-01-05"));
        assert_eq!(normalize_date("2024-01-15T00:00:00Z").as_deref(), Some("2024-01-15"));
        assert_eq!(normalize_date("20240115").as_deref(), Some("2024-01-15"));
        assert_eq!(normalize_date("January 5, 2024").as_deref(), Some("2024-01-05"));
        assert_eq!(normalize_date("5 Jan 2024").as_deref(), Some("2024-01-05"));
        assert_eq!(normalize_date("March 3rd, 2024").as_deref(), Some("2024-03-03"));
        assert_eq!(normalize_date("someday"), None);
    }

    #[test]
    fn ambiguous_dates_are_month_first() {
        assert_eq!(normalize_date("03/04/2024").as_deref(), Some("2024-03-04"));
        assert_eq!(normalize_date("31/01/2024").as_deref(), Some("2024-01-31"));
        assert_eq!(normalize_date("12-25-99").as_deref(), Some("1999-12-25"));
        assert_eq!(normalize_date("1.2.24").as_deref(), Some("2024-01-02"));
    }

    #[test]
    fn unparseable_date_keeps_original_text() {
        let doc = normalize(json!({"invoice": {"issue_date": {"value": "Q3 2024", "confidence": 0.6}}}));
        assert_eq!(doc.invoice.issue_date, FieldValue::new("Q3 2024".into(), 0.6));
    }
}
