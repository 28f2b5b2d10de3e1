//! Raw portal record -> `EventDraft` normalization with stable event ids.

use chrono::NaiveDate;
use sapn_core::{EventDraft, EventType};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;

const DATE_FORMATS: [&str; 3] = ["%d-%m-%Y", "%Y-%m-%d", "%d/%m/%Y"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("malformed {event_type} record: {reason}")]
    MalformedRecord { event_type: EventType, reason: String },
}

impl NormalizeError {
    fn malformed(event_type: EventType, reason: impl Into<String>) -> Self {
        NormalizeError::MalformedRecord {
            event_type,
            reason: reason.into(),
        }
    }
}

/// Map one portal record of the given category to a draft.
///
/// The `event_id` depends only on the category, the parsed date, the rendered
/// description and the category's distinguishing fields, so fetching the same
/// upstream record twice always yields the same id.
pub fn normalize_record(event_type: EventType, raw: &JsonValue) -> Result<EventDraft, NormalizeError> {
    if !raw.is_object() {
        return Err(NormalizeError::malformed(event_type, "record is not a JSON object"));
    }

    let (date_text, description, discriminators) = match event_type {
        EventType::Absence => absence_fields(raw)?,
        EventType::BehaviorAlert => behavior_alert_fields(raw)?,
    };

    let date = parse_portal_date(&date_text).ok_or_else(|| {
        NormalizeError::malformed(event_type, format!("unparseable date `{date_text}`"))
    })?;

    Ok(EventDraft {
        event_id: event_id_for(event_type, date, &description, &discriminators),
        event_type,
        date,
        description,
        raw_payload: raw.to_string(),
    })
}

type Discriminators = Vec<(&'static str, Option<String>)>;

fn absence_fields(raw: &JsonValue) -> Result<(String, String, Discriminators), NormalizeError> {
    let event_type = EventType::Absence;
    let date = required_text(raw, "DataDescricao", event_type)?;
    let subject = required_text(raw, "Disciplina", event_type)?;
    let kind = json_text(raw, "Tipo");
    let time = json_text(raw, "Hora");

    let mut description = match &kind {
        Some(kind) => format!("{kind} - {subject}"),
        None => subject.clone(),
    };
    if let Some(time) = &time {
        description.push_str(&format!(" ({time})"));
    }

    Ok((
        date,
        description,
        vec![("disciplina", Some(subject)), ("tipo", kind), ("hora", time)],
    ))
}

fn behavior_alert_fields(raw: &JsonValue) -> Result<(String, String, Discriminators), NormalizeError> {
    let event_type = EventType::BehaviorAlert;
    let date = required_text(raw, "DataPrettyPrint", event_type)?;
    let text = required_text(raw, "Descricao", event_type)?;
    let grade = json_text(raw, "Grau");
    let professor = json_text(raw, "Professor");
    let period = json_text(raw, "Tempo");

    let mut description = String::new();
    if let Some(grade) = &grade {
        description.push_str(&format!("[Grau {grade}] "));
    }
    if let Some(professor) = &professor {
        description.push_str(&format!("{professor} - "));
    }
    description.push_str(&text);

    Ok((
        date,
        description,
        vec![("grau", grade), ("professor", professor), ("tempo", period)],
    ))
}

fn required_text(raw: &JsonValue, key: &str, event_type: EventType) -> Result<String, NormalizeError> {
    json_text(raw, key).ok_or_else(|| NormalizeError::malformed(event_type, format!("missing `{key}`")))
}

/// Trimmed, non-empty string or number value at `key`.
fn json_text(raw: &JsonValue, key: &str) -> Option<String> {
    let text = match raw.get(key)? {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

pub fn parse_portal_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
}

pub fn event_id_for(
    event_type: EventType,
    date: NaiveDate,
    description: &str,
    discriminators: &[(&str, Option<String>)],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_type.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(date.format("%Y-%m-%d").to_string().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(description.as_bytes());
    for (key, value) in discriminators {
        hasher.update(b"\x1f");
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_deref().unwrap_or_default().as_bytes());
    }
    format!("{}-{}", event_type.as_str(), hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn falta() -> JsonValue {
        json!({
            "DataDescricao": "03-10-2025",
            "DiaDaSemana": "Sexta-feira",
            "Hora": "10:05",
            "Disciplina": "Matemática",
            "Tipo": "Presença"
        })
    }

    fn comportamento() -> JsonValue {
        json!({
            "DataPrettyPrint": "06-10-2025",
            "Tempo": "3",
            "Professor": "Ana Costa",
            "Grau": 2,
            "Descricao": "Sem material"
        })
    }

    #[test]
    fn same_record_yields_same_id() {
        let a = normalize_record(EventType::Absence, &falta()).unwrap();
        let b = normalize_record(EventType::Absence, &falta()).unwrap();
        assert_eq!(a.event_id, b.event_id);
        assert!(a.event_id.starts_with("absence-"));
    }

    #[test]
    fn absence_description_and_date() {
        let draft = normalize_record(EventType::Absence, &falta()).unwrap();
        assert_eq!(draft.description, "Presença - Matemática (10:05)");
        assert_eq!(draft.date, NaiveDate::from_ymd_opt(2025, 10, 3).unwrap());
        assert_eq!(draft.event_type, EventType::Absence);
        let raw: JsonValue = serde_json::from_str(&draft.raw_payload).unwrap();
        assert_eq!(raw, falta());
    }

    #[test]
    fn behavior_alert_description_includes_grade_and_professor() {
        let draft = normalize_record(EventType::BehaviorAlert, &comportamento()).unwrap();
        assert_eq!(draft.description, "[Grau 2] Ana Costa - Sem material");
        assert!(draft.event_id.starts_with("behavior_alert-"));
    }

    #[test]
    fn different_period_same_day_gets_distinct_ids() {
        let mut later = falta();
        later["Hora"] = json!("11:50");
        let a = normalize_record(EventType::Absence, &falta()).unwrap();
        let b = normalize_record(EventType::Absence, &later).unwrap();
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn category_is_part_of_the_id() {
        let date = NaiveDate::from_ymd_opt(2025, 10, 3).unwrap();
        let a = event_id_for(EventType::Absence, date, "x", &[]);
        let b = event_id_for(EventType::BehaviorAlert, date, "x", &[]);
        assert_ne!(a.trim_start_matches("absence-"), b.trim_start_matches("behavior_alert-"));
    }

    #[test]
    fn missing_date_is_malformed() {
        let mut raw = falta();
        raw.as_object_mut().unwrap().remove("DataDescricao");
        let err = normalize_record(EventType::Absence, &raw).unwrap_err();
        assert_eq!(
            err,
            NormalizeError::MalformedRecord {
                event_type: EventType::Absence,
                reason: "missing `DataDescricao`".to_string(),
            }
        );
    }

    #[test]
    fn blank_description_is_malformed() {
        let mut raw = comportamento();
        raw["Descricao"] = json!("   ");
        assert!(normalize_record(EventType::BehaviorAlert, &raw).is_err());
    }

    #[test]
    fn unparseable_date_is_malformed() {
        let mut raw = falta();
        raw["DataDescricao"] = json!("ontem");
        let err = normalize_record(EventType::Absence, &raw).unwrap_err();
        assert!(err.to_string().contains("unparseable date"));
    }

    #[test]
    fn non_object_record_is_malformed() {
        assert!(normalize_record(EventType::Absence, &json!(["a"])).is_err());
    }

    #[test]
    fn accepts_iso_and_slash_dates() {
        let expected = NaiveDate::from_ymd_opt(2025, 10, 3);
        assert_eq!(parse_portal_date("2025-10-03"), expected);
        assert_eq!(parse_portal_date("03/10/2025"), expected);
        assert_eq!(parse_portal_date(" 03-10-2025 "), expected);
        assert_eq!(parse_portal_date("10-2025"), None);
    }
}
