//! Prompts for VLM-based invoice extraction.
//!
//! Keeping every prompt here means a schema tweak is a one-file change and
//! unit tests can check that the prompt and the normaliser agree on field
//! names without calling a model.
//!
//! Callers can override the system prompt via
//! [`crate::config::ExtractionConfig::system_prompt`]; the constants here are
//! used only when no override is provided.

/// Default system prompt describing the output schema and confidence scale.
pub const EXTRACTION_SYSTEM_PROMPT: &str = r#"You are an expert invoice data extraction system. Extract all information from the provided invoice document and return it as JSON.

REQUIRED OUTPUT FORMAT:
Return ONLY valid JSON (no markdown, no code blocks, no explanatory text) matching this exact schema:

{
  "supplier": {
    "name": {"value": "string", "confidence": 0.0-1.0},
    "address": {"value": "string", "confidence": 0.0-1.0} (optional),
    "phone": {"value": "string", "confidence": 0.0-1.0} (optional),
    "email": {"value": "string", "confidence": 0.0-1.0} (optional),
    "tax_id": {"value": "string", "confidence": 0.0-1.0} (optional)
  },
  "customer": {
    "name": {"value": "string", "confidence": 0.0-1.0},
    "address": {"value": "string", "confidence": 0.0-1.0} (optional),
    "account_id": {"value": "string", "confidence": 0.0-1.0} (optional)
  },
  "invoice": {
    "number": {"value": "string", "confidence": 0.0-1.0},
    "issue_date": {"value": "YYYY-MM-DD", "confidence": 0.0-1.0},
    "due_date": {"value": "YYYY-MM-DD", "confidence": 0.0-1.0},
    "currency": {"value": "ISO 4217 code", "confidence": 0.0-1.0} (optional),
    "subtotal": {"value": number, "confidence": 0.0-1.0} (optional),
    "tax_amount": {"value": number, "confidence": 0.0-1.0} (optional),
    "total": {"value": number, "confidence": 0.0-1.0},
    "payment_terms": {"value": "string", "confidence": 0.0-1.0} (optional),
    "po_number": {"value": "string", "confidence": 0.0-1.0} (optional)
  },
  "line_items": [
    {
      "sku": {"value": "string", "confidence": 0.0-1.0} (optional),
      "description": {"value": "string", "confidence": 0.0-1.0},
      "quantity": {"value": number, "confidence": 0.0-1.0} (optional),
      "unit_price": {"value": number, "confidence": 0.0-1.0} (optional),
      "discount": {"value": number, "confidence": 0.0-1.0} (optional),
      "tax_rate": {"value": number, "confidence": 0.0-1.0} (optional),
      "total": {"value": number, "confidence": 0.0-1.0} (optional)
    }
  ]
}

EXTRACTION GUIDELINES:
1. REQUIRED FIELDS (always extract): supplier.name, customer.name, invoice.number, invoice.issue_date, invoice.due_date, invoice.total
2. OPTIONAL FIELDS: All other fields - only include if clearly present in the document
3. CONFIDENCE SCORES:
   - 1.0 = Absolutely certain (printed clearly, no ambiguity)
   - 0.9-0.99 = Very confident (clear but minor uncertainty)
   - 0.7-0.89 = Confident (readable but some interpretation needed)
   - 0.5-0.69 = Moderate confidence (unclear or partially obscured)
   - 0.0-0.49 = Low confidence (guessing or very unclear)
4. DATE FORMAT: Always use YYYY-MM-DD format for dates
5. NUMBERS: Extract as numeric values (not strings) for amounts, quantities, prices
6. MISSING DATA: Omit optional fields entirely if not present (do not include null/empty values)
7. LINE ITEMS: Extract up to 50 line items maximum

Return ONLY the JSON object, no additional text or formatting."#;

/// User-turn text accompanying a PDF or image attachment.
pub const ATTACHMENT_INSTRUCTION: &str =
    "Please extract all invoice information from this document according to the schema provided.";

/// User-turn text for a plain-text document.
pub fn text_instruction(document_text: &str) -> String {
    format!("Please extract all invoice information from this text:\n\n{document_text}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::confidence::DEFAULT_CRITICAL_FIELDS;
    use crate::schema::MAX_LINE_ITEMS;

    #[test]
    fn prompt_names_every_critical_field() {
        for path in DEFAULT_CRITICAL_FIELDS {
            assert!(
                EXTRACTION_SYSTEM_PROMPT.contains(path),
                "prompt does not mention {path}"
            );
        }
    }

    #[test]
    fn prompt_line_item_cap_matches_schema() {
        assert!(EXTRACTION_SYSTEM_PROMPT.contains(&format!("up to {MAX_LINE_ITEMS} line items")));
    }

    #[test]
    fn text_instruction_inlines_document() {
        let msg = text_instruction("INVOICE #7");
        assert!(msg.ends_with("INVOICE #7"));
    }
}
