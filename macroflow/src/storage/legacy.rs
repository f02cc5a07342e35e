//! Upgrade of schema version 1 documents.
//!
//! Version 1 stored `step_id`/`step_type` fields, durations in fractional seconds,
//! `{{name}}` placeholders, regions as `[x, y, w, h]` lists and naive local
//! timestamps. Screen-querying conditions (`image_exists`, `text_exists`) are
//! rewritten into a probe step followed by an EXISTS check on its output.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{json, Map, Value};

use crate::errors::FormatError;
use crate::step::{DEFAULT_IMAGE_CONFIDENCE, DEFAULT_TEXT_CONFIDENCE};
use crate::variables::upgrade_legacy_placeholders;

/// Version 1 text search took a single snapshot.
const SNAPSHOT_TIMEOUT_MS: u64 = 1;

const FROM: u32 = 1;

fn fail(reason: impl Into<String>) -> FormatError {
    FormatError::Migration {
        from: FROM,
        reason: reason.into(),
    }
}

pub(super) fn upgrade(body: Value) -> Result<Value, FormatError> {
    let Value::Object(old) = body else {
        return Err(fail("`macro` is not an object"));
    };

    let mut steps = Vec::new();
    for step in array(&old, "steps")? {
        steps.extend(upgrade_step(step)?);
    }

    let mut variables = Map::new();
    if let Some(Value::Object(vars)) = old.get("variables") {
        for (name, value) in vars {
            variables.insert(name.clone(), Value::String(stringify(value)));
        }
    }

    let mut metadata = match old.get("metadata") {
        Some(Value::Object(m)) => m.clone(),
        _ => Map::new(),
    };
    if let Some(Value::String(version)) = old.get("version") {
        metadata.insert("legacy_version".to_string(), Value::String(version.clone()));
    }

    let mut upgraded = Map::new();
    if let Some(id) = old.get("macro_id").and_then(Value::as_str) {
        upgraded.insert("id".into(), json!(id));
    }
    upgraded.insert("name".into(), json!(str_or(&old, "name", "")));
    upgraded.insert("description".into(), json!(str_or(&old, "description", "")));
    upgraded.insert("created_at".into(), json!(timestamp(old.get("created_at"))?));
    upgraded.insert("updated_at".into(), json!(timestamp(old.get("updated_at"))?));
    upgraded.insert("steps".into(), Value::Array(steps));
    upgraded.insert("variables".into(), Value::Object(variables));
    upgraded.insert("metadata".into(), Value::Object(metadata));
    Ok(Value::Object(upgraded))
}

fn upgrade_step(old: &Value) -> Result<Vec<Value>, FormatError> {
    let Value::Object(old) = old else {
        return Err(fail("step is not an object"));
    };
    let step_type = old
        .get("step_type")
        .and_then(Value::as_str)
        .ok_or_else(|| fail("step without `step_type`"))?;
    let id = str_or(old, "step_id", "").to_string();

    let mut step = common_fields(old, &id);
    match step_type {
        "mouse_click" => {
            screen_relative(old, step_type)?;
            step.insert("type".into(), json!("mouse_click"));
            step.insert("x".into(), json!(int(old, "x")));
            step.insert("y".into(), json!(int(old, "y")));
            step.insert("button".into(), json!(str_or(old, "button", "left")));
            step.insert("click_count".into(), json!(int(old, "clicks").max(1)));
        }
        "mouse_move" => {
            screen_relative(old, step_type)?;
            step.insert("type".into(), json!("mouse_move"));
            step.insert("x".into(), json!(int(old, "x")));
            step.insert("y".into(), json!(int(old, "y")));
            step.insert("duration_ms".into(), json!(seconds_to_ms(old, "duration", 0.0)));
        }
        "keyboard_type" => {
            let text = str_or(old, "text", "");
            let use_variables = old.get("use_variables").and_then(Value::as_bool).unwrap_or(true);
            let text = if use_variables {
                upgrade_legacy_placeholders(text)
            } else {
                text.to_string()
            };
            step.insert("type".into(), json!("keyboard_type"));
            step.insert("text".into(), json!(text));
            step.insert("interval_ms".into(), json!(seconds_to_ms(old, "interval", 0.0)));
        }
        "keyboard_hotkey" => {
            step.insert("type".into(), json!("keyboard_hotkey"));
            step.insert("keys".into(), old.get("keys").cloned().unwrap_or_else(|| json!([])));
        }
        "wait_time" => {
            step.insert("type".into(), json!("wait_time"));
            step.insert("duration_ms".into(), json!(seconds_to_ms(old, "seconds", 1.0)));
        }
        "wait_image" => {
            step.insert("type".into(), json!("wait_image"));
            step.insert("template_ref".into(), json!(str_or(old, "image_path", "")));
            step.insert("timeout_ms".into(), json!(seconds_to_ms(old, "timeout", 10.0)));
            let confidence = float(old, "confidence", DEFAULT_IMAGE_CONFIDENCE);
            step.insert("confidence_threshold".into(), json!(confidence));
            insert_region(&mut step, old.get("region"))?;
        }
        "ocr_text" => {
            let query = match old.get("excel_column").and_then(Value::as_str) {
                Some(column) if !column.is_empty() => format!("${{{column}}}"),
                _ => upgrade_legacy_placeholders(str_or(old, "search_text", "")),
            };
            step.insert("type".into(), json!("text_search"));
            step.insert("query_text".into(), json!(query));
            step.insert("timeout_ms".into(), json!(SNAPSHOT_TIMEOUT_MS));
            step.insert("exact_match".into(), json!(flag(old, "exact_match", false)));
            step.insert("confidence_threshold".into(), json!(float(old, "confidence", 0.5)));
            insert_region(&mut step, old.get("region"))?;
            if flag(old, "click_after_find", true) {
                let offset = match old.get("click_offset") {
                    Some(Value::Array(xy)) if xy.len() == 2 => json!({
                        "x": xy[0].as_i64().unwrap_or(0),
                        "y": xy[1].as_i64().unwrap_or(0),
                    }),
                    _ => json!({"x": 0, "y": 0}),
                };
                step.insert(
                    "click_on_match".into(),
                    json!({"button": "left", "click_count": 1, "offset": offset}),
                );
            }
        }
        "if_condition" => return upgrade_if(old, step, &id),
        "loop" => {
            return Err(fail(format!(
                "loop step {id} references steps by id; rebuild it with a nested body"
            )))
        }
        other => return Err(fail(format!("step type `{other}` has no equivalent"))),
    }
    Ok(vec![Value::Object(step)])
}

fn upgrade_if(
    old: &Map<String, Value>,
    mut step: Map<String, Value>,
    id: &str,
) -> Result<Vec<Value>, FormatError> {
    let condition_type = str_or(old, "condition_type", "image_exists");
    let params = match old.get("condition_value") {
        Some(Value::Object(p)) => p.clone(),
        _ => Map::new(),
    };

    let mut true_branch = Vec::new();
    for s in array(old, "true_steps")? {
        true_branch.extend(upgrade_step(s)?);
    }
    let mut false_branch = Vec::new();
    for s in array(old, "false_steps")? {
        false_branch.extend(upgrade_step(s)?);
    }

    let mut out = Vec::new();
    let condition = match condition_type {
        "variable_equals" | "variable_contains" | "variable_greater" | "variable_less" => {
            let operator = match condition_type {
                "variable_equals" => "equals",
                "variable_contains" => "contains",
                "variable_greater" => "greater_than",
                _ => "less_than",
            };
            let variable = str_or(&params, "variable", "");
            if variable.is_empty() {
                return Err(fail(format!("condition of step {id} names no variable")));
            }
            let right = stringify(params.get("compare_value").unwrap_or(&Value::Null));
            json!({
                "left": format!("${{{variable}}}"),
                "operator": operator,
                "right": upgrade_legacy_placeholders(&right),
            })
        }
        "image_exists" | "text_exists" => {
            let tag: String = id.chars().filter(|c| c.is_ascii_alphanumeric()).take(8).collect();
            let output = format!("probe_{tag}");
            let mut probe = Map::new();
            probe.insert("id".into(), json!(format!("{id}-probe")));
            probe.insert("label".into(), json!(format!("{condition_type} probe")));
            probe.insert("on_error".into(), json!("continue"));
            probe.insert("output_variable".into(), json!(output));
            if condition_type == "image_exists" {
                probe.insert("type".into(), json!("wait_image"));
                probe.insert("template_ref".into(), json!(str_or(&params, "image_path", "")));
                let confidence = float(&params, "confidence", DEFAULT_IMAGE_CONFIDENCE);
                probe.insert("confidence_threshold".into(), json!(confidence));
                probe.insert("timeout_ms".into(), json!(SNAPSHOT_TIMEOUT_MS));
            } else {
                probe.insert("type".into(), json!("text_search"));
                let query = upgrade_legacy_placeholders(str_or(&params, "text", ""));
                let confidence = float(&params, "confidence", DEFAULT_TEXT_CONFIDENCE);
                probe.insert("query_text".into(), json!(query));
                probe.insert("exact_match".into(), json!(flag(&params, "exact_match", false)));
                probe.insert("confidence_threshold".into(), json!(confidence));
                probe.insert("timeout_ms".into(), json!(SNAPSHOT_TIMEOUT_MS));
            }
            insert_region(&mut probe, params.get("region"))?;
            out.push(Value::Object(probe));
            json!({"left": format!("${{{output}}}"), "operator": "exists"})
        }
        other => return Err(fail(format!("condition type `{other}` has no equivalent"))),
    };

    step.insert("type".into(), json!("if_condition"));
    step.insert("condition".into(), condition);
    step.insert("true_branch".into(), Value::Array(true_branch));
    step.insert("false_branch".into(), Value::Array(false_branch));
    out.push(Value::Object(step));
    Ok(out)
}

fn common_fields(old: &Map<String, Value>, id: &str) -> Map<String, Value> {
    let mut step = Map::new();
    if !id.is_empty() {
        step.insert("id".into(), json!(id));
    }
    let name = str_or(old, "name", "");
    if !name.is_empty() {
        step.insert("label".into(), json!(name));
    }
    if let Some(enabled) = old.get("enabled").and_then(Value::as_bool) {
        step.insert("enabled".into(), json!(enabled));
    }
    let mut retry_count = old.get("retry_count").and_then(Value::as_u64).unwrap_or(0);
    match str_or(old, "error_handling", "stop") {
        "continue" => {
            step.insert("on_error".into(), json!("continue"));
        }
        "retry" => {
            retry_count = retry_count.max(1);
            step.insert("on_error".into(), json!("stop"));
        }
        _ => {
            step.insert("on_error".into(), json!("stop"));
        }
    }
    if retry_count > 0 {
        step.insert("retry_count".into(), json!(retry_count));
    }
    step
}

fn insert_region(
    step: &mut Map<String, Value>,
    region: Option<&Value>,
) -> Result<(), FormatError> {
    match region {
        None | Some(Value::Null) => Ok(()),
        Some(Value::Array(r)) if r.len() == 4 => {
            let n: Vec<i64> = r
                .iter()
                .map(|v| v.as_f64().map(|f| f.round() as i64).unwrap_or(0))
                .collect();
            step.insert(
                "region".into(),
                json!({"x": n[0], "y": n[1], "width": n[2].max(0), "height": n[3].max(0)}),
            );
            Ok(())
        }
        Some(other) => Err(fail(format!("unreadable region {other}"))),
    }
}

fn array<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a [Value], FormatError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(_) => Err(fail(format!("`{key}` is not a list"))),
    }
}

/// Version 2 coordinates are absolute; window- or image-relative points cannot be carried over.
fn screen_relative(old: &Map<String, Value>, step_type: &str) -> Result<(), FormatError> {
    match str_or(old, "relative_to", "screen") {
        "screen" => Ok(()),
        other => Err(fail(format!(
            "{step_type} relative to `{other}` has no absolute equivalent"
        ))),
    }
}

fn str_or<'a>(map: &'a Map<String, Value>, key: &str, default: &'a str) -> &'a str {
    map.get(key).and_then(Value::as_str).unwrap_or(default)
}

fn int(map: &Map<String, Value>, key: &str) -> i64 {
    map.get(key).and_then(Value::as_f64).map(|f| f.round() as i64).unwrap_or(0)
}

fn float(map: &Map<String, Value>, key: &str, default: f64) -> f64 {
    map.get(key).and_then(Value::as_f64).unwrap_or(default)
}

fn flag(map: &Map<String, Value>, key: &str, default: bool) -> bool {
    map.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn seconds_to_ms(map: &Map<String, Value>, key: &str, default: f64) -> u64 {
    let secs = float(map, key, default);
    if secs.is_finite() && secs > 0.0 {
        (secs * 1000.0).round() as u64
    } else {
        0
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Version 1 wrote naive ISO timestamps; they are read as UTC.
fn timestamp(value: Option<&Value>) -> Result<String, FormatError> {
    let Some(raw) = value.and_then(Value::as_str) else {
        return Ok(Utc::now().to_rfc3339());
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc).to_rfc3339());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc().to_rfc3339())
        .map_err(|e| fail(format!("unreadable timestamp `{raw}`: {e}")))
}
