//! Versioned macro codec.
//!
//! Documents are an envelope `{"schema_version": N, "macro": {...}}` encoded as
//! JSON or YAML. Older schema versions are upgraded on load; newer ones are
//! rejected. Loading always validates, so a returned [`Macro`] is runnable.

mod legacy;
pub mod library;

use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use tracing::{debug, instrument};

use crate::document::Macro;
use crate::errors::FormatError;

pub use library::{MacroLibrary, MacroSummary};

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MacroFormat {
    #[default]
    Json,
    Yaml,
}

impl MacroFormat {
    /// Picks the encoding from a file extension, defaulting to JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()) {
            Some(ext) if ext == "yaml" || ext == "yml" => MacroFormat::Yaml,
            _ => MacroFormat::Json,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            MacroFormat::Json => "json",
            MacroFormat::Yaml => "yaml",
        }
    }

    /// Sniffs the encoding of a document: JSON documents start with `{`.
    pub fn detect(bytes: &[u8]) -> Self {
        let first = bytes
            .strip_prefix(b"\xEF\xBB\xBF")
            .unwrap_or(bytes)
            .iter()
            .find(|b| !b.is_ascii_whitespace());
        match first {
            Some(b'{') => MacroFormat::Json,
            _ => MacroFormat::Yaml,
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    schema_version: u32,
    #[serde(rename = "macro")]
    document: &'a Macro,
}

/// Serializes a macro as pretty JSON.
pub fn save(document: &Macro) -> Result<Vec<u8>, FormatError> {
    save_as(document, MacroFormat::Json)
}

#[instrument(level = "debug", skip(document), fields(name = %document.name))]
pub fn save_as(document: &Macro, format: MacroFormat) -> Result<Vec<u8>, FormatError> {
    document.validate()?;
    let envelope = Envelope {
        schema_version: SCHEMA_VERSION,
        document,
    };
    let bytes = match format {
        MacroFormat::Json => {
            serde_json::to_vec_pretty(&envelope).map_err(|e| FormatError::Encode(e.to_string()))?
        }
        MacroFormat::Yaml => serde_yaml::to_string(&envelope)
            .map_err(|e| FormatError::Encode(e.to_string()))?
            .into_bytes(),
    };
    debug!("Encoded macro as {:?} ({} bytes)", format, bytes.len());
    Ok(bytes)
}

/// Decodes, upgrades and validates a macro document.
#[instrument(level = "debug", skip(bytes), fields(len = bytes.len()))]
pub fn load(bytes: &[u8]) -> Result<Macro, FormatError> {
    let format = MacroFormat::detect(bytes);
    let value: Value = match format {
        MacroFormat::Json => {
            serde_json::from_slice(bytes).map_err(|e| FormatError::Corrupt(e.to_string()))?
        }
        MacroFormat::Yaml => {
            serde_yaml::from_slice(bytes).map_err(|e| FormatError::Corrupt(e.to_string()))?
        }
    };

    let Value::Object(mut envelope) = value else {
        return Err(FormatError::Corrupt("document is not an object".to_string()));
    };

    let version = schema_version(envelope.get("schema_version"))?;
    let body = envelope
        .remove("macro")
        .ok_or_else(|| FormatError::Corrupt("missing `macro` object".to_string()))?;

    let body = match version {
        SCHEMA_VERSION => body,
        1 => {
            debug!("Upgrading schema version 1 document");
            legacy::upgrade(body)?
        }
        v if v > SCHEMA_VERSION => {
            return Err(FormatError::UnsupportedVersion {
                found: v.to_string(),
                supported: SCHEMA_VERSION,
            })
        }
        v => {
            return Err(FormatError::Migration {
                from: v,
                reason: "no upgrade path".to_string(),
            })
        }
    };

    let document: Macro =
        serde_json::from_value(body).map_err(|e| FormatError::Corrupt(e.to_string()))?;
    document.validate()?;
    debug!("Loaded macro '{}' ({} steps)", document.name, document.step_count());
    Ok(document)
}

/// Accepts an integer or a semver-like string (major component is the schema version).
fn schema_version(value: Option<&Value>) -> Result<u32, FormatError> {
    let unsupported = |found: String| FormatError::UnsupportedVersion {
        found,
        supported: SCHEMA_VERSION,
    };
    match value {
        None | Some(Value::Null) => Err(FormatError::MissingVersion),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| unsupported(n.to_string())),
        Some(Value::String(s)) => s
            .trim()
            .split('.')
            .next()
            .and_then(|major| major.parse::<u32>().ok())
            .ok_or_else(|| FormatError::Corrupt(format!("unreadable schema version `{s}`"))),
        Some(other) => Err(FormatError::Corrupt(format!("unreadable schema version `{other}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Condition, ConditionOperator};
    use crate::geometry::Rect;
    use crate::step::{ErrorHandling, MacroStep, StepKind};
    use serde_json::json;

    fn rich_macro() -> Macro {
        let mut search = MacroStep::text_search("완료", 2000).with_id("search");
        if let StepKind::TextSearch(t) = &mut search.kind {
            t.region = Some(Rect::new(-100, 5, 640, 480));
            t.confidence_threshold = 0.123456789012345;
            t.output_variable = Some("status".into());
        }
        let mut m = Macro::new("주문 입력")
            .with_variable("customer", "김철수")
            .with_steps(vec![
                MacroStep::click(10, 10).with_id("c1").with_label("focus"),
                search,
                MacroStep::if_condition(
                    Condition::new("${matched_text}", ConditionOperator::Equals, "완료"),
                    vec![MacroStep::type_text("done ${customer}").with_id("t1")],
                    vec![MacroStep::wait(1000).with_id("w1").with_on_error(ErrorHandling::Stop)],
                )
                .with_id("if1"),
                MacroStep::loop_while(
                    Condition::new("${row}", ConditionOperator::LessThan, "10"),
                    25,
                    vec![MacroStep::hotkey(["ctrl", "s"]).with_id("h1").with_retries(2)],
                )
                .with_id("loop1"),
                MacroStep::click("${matched_x}", "${matched_y}").with_id("c2").disabled(),
            ]);
        m.description = "round trip fixture".into();
        m.metadata.insert("author".into(), json!({"team": "ops", "rev": 3}));
        m
    }

    #[test]
    fn json_round_trip_is_lossless() {
        let m = rich_macro();
        let bytes = save(&m).unwrap();
        assert_eq!(load(&bytes).unwrap(), m);
    }

    #[test]
    fn yaml_round_trip_is_lossless() {
        let m = rich_macro();
        let bytes = save_as(&m, MacroFormat::Yaml).unwrap();
        assert_eq!(MacroFormat::detect(&bytes), MacroFormat::Yaml);
        assert_eq!(load(&bytes).unwrap(), m);
    }

    #[test]
    fn envelope_carries_schema_version() {
        let bytes = save(&Macro::new("m")).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["schema_version"], json!(SCHEMA_VERSION));
        assert_eq!(value["macro"]["name"], json!("m"));
    }

    #[test]
    fn newer_schema_is_rejected() {
        let mut value: Value = serde_json::from_slice(&save(&rich_macro()).unwrap()).unwrap();
        value["schema_version"] = json!(SCHEMA_VERSION + 1);
        let err = load(&serde_json::to_vec(&value).unwrap()).unwrap_err();
        assert!(
            matches!(err, FormatError::UnsupportedVersion { supported: SCHEMA_VERSION, .. }),
            "{err}"
        );

        let err = load(br#"{"schema_version": "7.0.1", "macro": {}}"#).unwrap_err();
        assert!(matches!(err, FormatError::UnsupportedVersion { .. }), "{err}");
    }

    #[test]
    fn corrupt_and_unversioned_documents_fail() {
        assert!(matches!(load(b"{not json").unwrap_err(), FormatError::Corrupt(_)));
        assert!(matches!(
            load(br#"{"macro": {"name": "x"}}"#).unwrap_err(),
            FormatError::MissingVersion
        ));
        assert!(matches!(load(br#"{"schema_version": 2}"#).unwrap_err(), FormatError::Corrupt(_)));
    }

    #[test]
    fn unknown_step_tag_fails_whole_load() {
        let mut value: Value = serde_json::from_slice(&save(&rich_macro()).unwrap()).unwrap();
        value["macro"]["steps"][0]["type"] = json!("mouse_drag");
        let err = load(&serde_json::to_vec(&value).unwrap()).unwrap_err();
        assert!(matches!(err, FormatError::Corrupt(_)), "{err}");
    }

    #[test]
    fn invalid_content_is_a_format_error() {
        let mut value: Value = serde_json::from_slice(&save(&rich_macro()).unwrap()).unwrap();
        value["macro"]["steps"][1]["timeout_ms"] = json!(0);
        let err = load(&serde_json::to_vec(&value).unwrap()).unwrap_err();
        assert!(matches!(err, FormatError::Invalid(_)), "{err}");
    }

    #[test]
    fn save_refuses_invalid_macro() {
        let m = Macro::new("bad").with_steps(vec![MacroStep::wait(0)]);
        assert!(matches!(save(&m).unwrap_err(), FormatError::Invalid(_)));
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(MacroFormat::from_path(Path::new("a/b.YML")), MacroFormat::Yaml);
        assert_eq!(MacroFormat::from_path(Path::new("a/b.json")), MacroFormat::Json);
        assert_eq!(MacroFormat::from_path(Path::new("a/b")), MacroFormat::Json);
    }
}
