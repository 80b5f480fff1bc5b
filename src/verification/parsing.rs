// src/verification/parsing.rs
use anyhow::{bail, Context, Result};
use log::debug;
use serde::Deserialize;

use crate::models::VerificationDecision;

/// The backend's answer before confidence thresholds are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct RawVerdict {
    pub decision: VerificationDecision,
    pub confidence: f64,
    pub rationale: String,
}

#[derive(Debug, Deserialize)]
struct VerdictPayload {
    decision: Option<String>,
    #[serde(alias = "is_same_entity", alias = "is_duplicate")]
    same_business: Option<bool>,
    #[serde(alias = "confidence_score")]
    confidence: f64,
    #[serde(alias = "reasoning", default)]
    rationale: String,
}

fn parse_decision(label: &str) -> Result<VerificationDecision> {
    let folded = label.trim().to_lowercase().replace(['-', ' '], "_");
    match folded.as_str() {
        "duplicate" | "same" | "same_business" | "match" => Ok(VerificationDecision::Duplicate),
        "not_duplicate" | "distinct" | "different" | "no_match" => {
            Ok(VerificationDecision::NotDuplicate)
        }
        "uncertain" | "unsure" | "unknown" => Ok(VerificationDecision::Uncertain),
        other => bail!("unknown decision label '{}'", other),
    }
}

/// Percent-style confidences (e.g. 85) are scaled down; anything else
/// outside [0,1] is malformed.
fn parse_confidence(raw: f64) -> Result<f64> {
    if !raw.is_finite() || raw < 0.0 {
        bail!("confidence {} is not a valid probability", raw);
    }
    if raw <= 1.0 {
        Ok(raw)
    } else if raw <= 100.0 {
        Ok(raw / 100.0)
    } else {
        bail!("confidence {} is out of range", raw)
    }
}

fn into_verdict(payload: VerdictPayload) -> Result<RawVerdict> {
    let decision = match (&payload.decision, payload.same_business) {
        (Some(label), _) => parse_decision(label)?,
        (None, Some(true)) => VerificationDecision::Duplicate,
        (None, Some(false)) => VerificationDecision::NotDuplicate,
        (None, None) => bail!("response has neither 'decision' nor 'is_same_entity'"),
    };
    Ok(RawVerdict {
        decision,
        confidence: parse_confidence(payload.confidence)?,
        rationale: payload.rationale.trim().to_string(),
    })
}

/// Extract JSON object from text that might have extra content
fn extract_json_from_text(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Clean common JSON formatting issues
fn clean_json_response(response: &str) -> String {
    response
        .trim()
        .replace("```json", "")
        .replace("```", "")
        .replace(",\n}", "\n}")
        .replace(",}", "}")
        .replace(",\n]", "\n]")
        .replace(",]", "]")
}

fn parse_payload(response: &str) -> Result<VerdictPayload> {
    let direct_error = match serde_json::from_str::<VerdictPayload>(response.trim()) {
        Ok(payload) => return Ok(payload),
        Err(e) => e,
    };
    debug!("Direct JSON parsing failed: {}", direct_error);

    let cleaned = clean_json_response(response);
    match extract_json_from_text(&cleaned) {
        Some(json_str) => serde_json::from_str::<VerdictPayload>(json_str).map_err(|e| {
            debug!("Embedded JSON parsing failed: {}", e);
            e.into()
        }),
        None => Err(direct_error.into()),
    }
}

/// Parses a backend response: plain JSON first, then the first JSON object
/// embedded in surrounding text after cleanup. Anything else is malformed.
pub fn parse_verdict(response: &str) -> Result<RawVerdict> {
    parse_payload(response)
        .and_then(into_verdict)
        .context("malformed verifier response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_json() {
        let v = parse_verdict(
            r#"{"decision": "duplicate", "confidence": 0.93, "rationale": "same phone"}"#,
        )
        .unwrap();
        assert_eq!(v.decision, VerificationDecision::Duplicate);
        assert_eq!(v.confidence, 0.93);
        assert_eq!(v.rationale, "same phone");
    }

    #[test]
    fn test_fenced_json_with_trailing_comma() {
        let text = "Sure! Here is my answer:\n```json\n{\"decision\": \"not duplicate\", \"confidence\": 0.9, \"rationale\": \"different cities\",}\n```";
        let v = parse_verdict(text).unwrap();
        assert_eq!(v.decision, VerificationDecision::NotDuplicate);
    }

    #[test]
    fn test_boolean_form_and_percent_confidence() {
        let v = parse_verdict(r#"{"is_same_entity": true, "confidence_score": 88, "reasoning": "x"}"#)
            .unwrap();
        assert_eq!(v.decision, VerificationDecision::Duplicate);
        assert!((v.confidence - 0.88).abs() < 1e-9);
    }

    #[test]
    fn test_braces_inside_strings() {
        let v = parse_verdict(
            r#"note {"decision": "uncertain", "confidence": 0.4, "rationale": "name has {braces}"} end"#,
        )
        .unwrap();
        assert_eq!(v.decision, VerificationDecision::Uncertain);
        assert_eq!(v.rationale, "name has {braces}");
    }

    #[test]
    fn test_malformed_responses_are_errors() {
        assert!(parse_verdict("They look like the same business to me.").is_err());
        assert!(parse_verdict(r#"{"decision": "maybe", "confidence": 0.5}"#).is_err());
        assert!(parse_verdict(r#"{"decision": "duplicate", "confidence": 250}"#).is_err());
        assert!(parse_verdict(r#"{"decision": "duplicate"}"#).is_err());
        assert!(parse_verdict(r#"{"confidence": 0.9}"#).is_err());
    }
}
