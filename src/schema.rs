//! Canonical invoice schema produced by normalisation.
//!
//! Every extracted datum is a [`FieldValue`]: the value plus the model's
//! self-reported confidence. Required fields are always present (a missing
//! one is synthesised with an empty value and confidence `0.0`); optional
//! fields are `Option`s and are omitted from serialised output when unset.

use serde::{Deserialize, Serialize};

/// Upper bound on line items kept per document.
pub const MAX_LINE_ITEMS: usize = 50;

/// Currency assumed when the document does not state one.
pub const DEFAULT_CURRENCY: &str = "USD";

/// One extracted value and the confidence attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue<T> {
    pub value: T,
    /// Self-reported certainty in `[0.0, 1.0]`.
    pub confidence: f64,
}

impl<T> FieldValue<T> {
    pub fn new(value: T, confidence: f64) -> Self {
        Self { value, confidence }
    }
}

impl<T: Default> FieldValue<T> {
    /// Placeholder for a required field the model did not return.
    pub fn missing() -> Self {
        Self {
            value: T::default(),
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Supplier {
    pub name: FieldValue<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<FieldValue<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<FieldValue<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<FieldValue<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_id: Option<FieldValue<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub name: FieldValue<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<FieldValue<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<FieldValue<String>>,
}

/// Invoice header and totals.
///
/// Dates are normalised to `YYYY-MM-DD` when they can be parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceSummary {
    pub number: FieldValue<String>,
    pub issue_date: FieldValue<String>,
    pub due_date: FieldValue<String>,
    /// Always set; defaults to [`DEFAULT_CURRENCY`].
    pub currency: FieldValue<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtotal: Option<FieldValue<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_amount: Option<FieldValue<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<FieldValue<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_terms: Option<FieldValue<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub po_number: Option<FieldValue<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<FieldValue<String>>,
    pub description: FieldValue<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<FieldValue<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<FieldValue<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount: Option<FieldValue<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_rate: Option<FieldValue<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<FieldValue<f64>>,
}

/// The normalised result of one extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub supplier: Supplier,
    pub customer: Customer,
    pub invoice: InvoiceSummary,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

impl ExtractedDocument {
    /// Confidence of the field at a dotted path such as `"invoice.total"`.
    ///
    /// Returns `None` when the path names an optional field that is unset, or
    /// a path this schema does not know. Line items are addressed as
    /// `line_items[3].quantity`.
    pub fn confidence_of(&self, path: &str) -> Option<f64> {
        self.present_fields()
            .into_iter()
            .find(|(p, _)| p == path)
            .map(|(_, c)| c)
    }

    /// Every field that carries a value, with its path and confidence, in
    /// schema order.
    pub fn present_fields(&self) -> Vec<(String, f64)> {
        let mut out = Vec::new();
        let mut push = |path: String, field: Option<f64>| {
            if let Some(c) = field {
                out.push((path, c));
            }
        };

        let s = &self.supplier;
        push("supplier.name".into(), Some(s.name.confidence));
        push("supplier.address".into(), conf(&s.address));
        push("supplier.phone".into(), conf(&s.phone));
        push("supplier.email".into(), conf(&s.email));
        push("supplier.tax_id".into(), conf(&s.tax_id));

        let c = &self.customer;
        push("customer.name".into(), Some(c.name.confidence));
        push("customer.address".into(), conf(&c.address));
        push("customer.account_id".into(), conf(&c.account_id));

        let i = &self.invoice;
        push("invoice.number".into(), Some(i.number.confidence));
        push("invoice.issue_date".into(), Some(i.issue_date.confidence));
        push("invoice.due_date".into(), Some(i.due_date.confidence));
        push("invoice.currency".into(), Some(i.currency.confidence));
        push("invoice.subtotal".into(), conf(&i.subtotal));
        push("invoice.tax_amount".into(), conf(&i.tax_amount));
        push("invoice.total".into(), conf(&i.total));
        push("invoice.payment_terms".into(), conf(&i.payment_terms));
        push("invoice.po_number".into(), conf(&i.po_number));

        for (n, item) in self.line_items.iter().enumerate() {
            let p = |f: &str| format!("line_items[{n}].{f}");
            push(p("sku"), conf(&item.sku));
            push(p("description"), Some(item.description.confidence));
            push(p("quantity"), conf(&item.quantity));
            push(p("unit_price"), conf(&item.unit_price));
            push(p("discount"), conf(&item.discount));
            push(p("tax_rate"), conf(&item.tax_rate));
            push(p("total"), conf(&item.total));
        }

        out
    }
}

fn conf<T>(field: &Option<FieldValue<T>>) -> Option<f64> {
    field.as_ref().map(|f| f.confidence)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A document with every critical field at the given confidence and no
    /// optional fields.
    pub fn document(confidence: f64) -> ExtractedDocument {
        let text = |v: &str| FieldValue::new(v.to_string(), confidence);
        ExtractedDocument {
            supplier: Supplier {
                name: text("Acme Corp"),
                address: None,
                phone: None,
                email: None,
                tax_id: None,
            },
            customer: Customer {
                name: text("Globex Ltd"),
                address: None,
                account_id: None,
            },
            invoice: InvoiceSummary {
                number: text("INV-2024-001"),
                issue_date: text("2024-01-15"),
                due_date: text("2024-02-14"),
                currency: FieldValue::new(DEFAULT_CURRENCY.to_string(), 1.0),
                subtotal: None,
                tax_amount: None,
                total: Some(FieldValue::new(1250.0, confidence)),
                payment_terms: None,
                po_number: None,
            },
            line_items: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::document;
    use super::*;

    #[test]
    fn confidence_of_resolves_nested_paths() {
        let doc = document(0.93);
        assert_eq!(doc.confidence_of("supplier.name"), Some(0.93));
        assert_eq!(doc.confidence_of("invoice.total"), Some(0.93));
        assert_eq!(doc.confidence_of("invoice.currency"), Some(1.0));
    }

    #[test]
    fn unset_optional_and_unknown_paths_are_absent() {
        let doc = document(0.93);
        assert_eq!(doc.confidence_of("supplier.tax_id"), None);
        assert_eq!(doc.confidence_of("invoice.colour"), None);
    }

    #[test]
    fn line_item_fields_are_indexed() {
        let mut doc = document(0.95);
        doc.line_items.push(LineItem {
            sku: None,
            description: FieldValue::new("Widget".into(), 0.8),
            quantity: Some(FieldValue::new(3.0, 0.7)),
            unit_price: None,
            discount: None,
            tax_rate: None,
            total: None,
        });
        assert_eq!(doc.confidence_of("line_items[0].description"), Some(0.8));
        assert_eq!(doc.confidence_of("line_items[0].quantity"), Some(0.7));
        assert_eq!(doc.confidence_of("line_items[0].sku"), None);
    }

    #[test]
    fn optional_fields_are_omitted_from_json() {
        let json = serde_json::to_value(document(0.9)).unwrap();
        assert!(json["supplier"].get("tax_id").is_none());
        assert_eq!(json["invoice"]["number"]["value"], "INV-2024-001");
        assert_eq!(json["invoice"]["total"]["confidence"], 0.9);
        assert_eq!(json["line_items"], serde_json::json!([]));
    }

    #[test]
    fn missing_placeholder_has_zero_confidence() {
        let f: FieldValue<String> = FieldValue::missing();
        assert_eq!(f.value, "");
        assert_eq!(f.confidence, 0.0);
    }
}
