// src/verification/prompt.rs
use serde_json::{json, Value as JsonValue};

use crate::models::{Business, BusinessField};
use crate::verification::PairContext;

fn push_business(prompt: &mut String, label: &str, business: &Business) {
    prompt.push_str(&format!("{}:\n", label));
    prompt.push_str(&format!("- ID: {}\n", business.id));
    prompt.push_str(&format!("- Name: {}\n", business.name));
    for field in [
        BusinessField::Phone,
        BusinessField::Address,
        BusinessField::Email,
        BusinessField::Website,
        BusinessField::Category,
    ] {
        if let Some(value) = business.populated(field) {
            prompt.push_str(&format!("- {}: {}\n", capitalize(field.as_str()), value));
        }
    }
    let attribute_keys = business.populated_attribute_keys();
    if !attribute_keys.is_empty() {
        prompt.push_str("- Scraped attributes:\n");
        for key in attribute_keys {
            if let Some(value) = business.attributes.get(&key) {
                prompt.push_str(&format!("    {}: {}\n", key, compact(value)));
            }
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Attribute values can be large scraped blobs; keep the prompt bounded.
fn compact(value: &JsonValue) -> String {
    const MAX_CHARS: usize = 200;
    let text = match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() > MAX_CHARS {
        let truncated: String = text.chars().take(MAX_CHARS).collect();
        format!("{}...", truncated)
    } else {
        text
    }
}

fn push_score(prompt: &mut String, label: &str, score: Option<f64>) {
    match score {
        Some(s) => prompt.push_str(&format!("- {}: {:.3}\n", label, s)),
        None => prompt.push_str(&format!("- {}: not compared (missing on one side)\n", label)),
    }
}

/// Structured prompt describing both listings and the similarity breakdown.
pub fn build_prompt(context: &PairContext<'_>) -> String {
    let mut prompt = String::new();

    prompt.push_str("You are an expert at deduplicating local business listings scraped from directories and maps. ");
    prompt.push_str("Decide whether the two listings below describe the same real-world business.\n\n");

    push_business(&mut prompt, "LISTING 1", context.first);
    prompt.push('\n');
    push_business(&mut prompt, "LISTING 2", context.second);

    let breakdown = &context.candidate.breakdown;
    prompt.push_str(&format!(
        "\nSIMILARITY (0 = different, 1 = identical), overall {:.3}:\n",
        context.candidate.score
    ));
    push_score(&mut prompt, "Name", breakdown.name);
    push_score(&mut prompt, "Phone", breakdown.phone);
    push_score(&mut prompt, "Address", breakdown.address);

    prompt.push_str("\nBranches of a chain in different cities are NOT the same business. ");
    prompt.push_str("Different legal suffixes (Inc, LLC) or punctuation alone do not make them different.\n");
    prompt.push_str("\nYou must respond with ONLY a valid JSON object. Do not include any text before or after the JSON.\n\n");
    prompt.push_str("Example response format:\n");
    prompt.push_str("{\n");
    prompt.push_str("  \"decision\": \"duplicate\",\n");
    prompt.push_str("  \"confidence\": 0.9,\n");
    prompt.push_str("  \"rationale\": \"Same phone number and the names differ only by a legal suffix\"\n");
    prompt.push_str("}\n\n");
    prompt.push_str("\"decision\" must be one of \"duplicate\", \"not_duplicate\", \"uncertain\"; \"confidence\" is between 0 and 1.\n");
    prompt.push_str("Now analyze the listings above and respond with JSON only:");

    prompt
}

/// JSON schema passed to backends that support structured output.
pub fn response_schema() -> JsonValue {
    json!({
        "type": "object",
        "properties": {
            "decision": {
                "type": "string",
                "enum": ["duplicate", "not_duplicate", "uncertain"],
                "description": "Whether the two listings are the same business"
            },
            "confidence": {
                "type": "number",
                "minimum": 0.0,
                "maximum": 1.0,
                "description": "Confidence in the decision"
            },
            "rationale": {
                "type": "string",
                "description": "Short explanation of the decision"
            }
        },
        "required": ["decision", "confidence", "rationale"]
    })
}
