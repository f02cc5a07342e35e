//! Macro step model: the tagged union of step variants, its validation rules and
//! the `build(type_tag, params)` factory used by editors and loaders.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::condition::Condition;
use crate::errors::InvalidStepError;
use crate::geometry::Rect;
use crate::variables;

pub const DEFAULT_MAX_ITERATIONS: u32 = 1000;
pub const DEFAULT_MATCH_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_IMAGE_CONFIDENCE: f64 = 0.9;
pub const DEFAULT_TEXT_CONFIDENCE: f64 = 0.7;

/// Wire tag of a step variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    MouseClick,
    MouseMove,
    KeyboardType,
    KeyboardHotkey,
    WaitTime,
    WaitImage,
    TextSearch,
    IfCondition,
    Loop,
}

impl StepType {
    pub const ALL: [StepType; 9] = [
        StepType::MouseClick,
        StepType::MouseMove,
        StepType::KeyboardType,
        StepType::KeyboardHotkey,
        StepType::WaitTime,
        StepType::WaitImage,
        StepType::TextSearch,
        StepType::IfCondition,
        StepType::Loop,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepType::MouseClick => "mouse_click",
            StepType::MouseMove => "mouse_move",
            StepType::KeyboardType => "keyboard_type",
            StepType::KeyboardHotkey => "keyboard_hotkey",
            StepType::WaitTime => "wait_time",
            StepType::WaitImage => "wait_image",
            StepType::TextSearch => "text_search",
            StepType::IfCondition => "if_condition",
            StepType::Loop => "loop",
        }
    }

    /// Short name used in run traces.
    pub fn trace_name(self) -> &'static str {
        match self {
            StepType::MouseClick => "click",
            StepType::MouseMove => "move",
            StepType::KeyboardType => "type",
            StepType::KeyboardHotkey => "hotkey",
            StepType::WaitTime => "wait",
            StepType::WaitImage => "wait_image",
            StepType::TextSearch => "text_search",
            StepType::IfCondition => "if",
            StepType::Loop => "loop",
        }
    }

    /// Fields of this variant that go through `${name}` substitution at execution time.
    pub fn substituted_fields(self) -> &'static [&'static str] {
        match self {
            StepType::MouseClick | StepType::MouseMove => &["x", "y"],
            StepType::KeyboardType => &["text"],
            StepType::KeyboardHotkey => &["keys"],
            StepType::WaitTime => &[],
            StepType::WaitImage => &["template_ref"],
            StepType::TextSearch => &["query_text"],
            StepType::IfCondition => &["condition.left", "condition.right"],
            StepType::Loop => &["condition.left", "condition.right"],
        }
    }

    /// Sensing steps consult the Matching Service.
    pub fn is_sensing(self) -> bool {
        matches!(self, StepType::WaitImage | StepType::TextSearch)
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = InvalidStepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| InvalidStepError::UnknownType(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

impl fmt::Display for MouseButton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MouseButton::Left => write!(f, "left"),
            MouseButton::Right => write!(f, "right"),
            MouseButton::Middle => write!(f, "middle"),
        }
    }
}

/// Per-step override of the run's failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorHandling {
    Stop,
    Continue,
}

/// A screen coordinate: either fixed, or a `${name}` template resolved when the
/// step runs (e.g. `${matched_x}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Coordinate {
    Fixed(i32),
    Template(String),
}

impl From<i32> for Coordinate {
    fn from(value: i32) -> Self {
        Coordinate::Fixed(value)
    }
}

impl From<&str> for Coordinate {
    fn from(value: &str) -> Self {
        Coordinate::Template(value.to_string())
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Coordinate::Fixed(v) => write!(f, "{v}"),
            Coordinate::Template(t) => f.write_str(t),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Offset {
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
}

/// Click performed on the match center (plus offset) after a sensing step succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchClick {
    #[serde(default)]
    pub button: MouseButton,
    #[serde(default = "default_click_count")]
    pub click_count: u32,
    #[serde(default)]
    pub offset: Offset,
}

impl Default for MatchClick {
    fn default() -> Self {
        Self {
            button: MouseButton::Left,
            click_count: 1,
            offset: Offset::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MouseClick {
    pub x: Coordinate,
    pub y: Coordinate,
    #[serde(default)]
    pub button: MouseButton,
    #[serde(default = "default_click_count")]
    pub click_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MouseMove {
    pub x: Coordinate,
    pub y: Coordinate,
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyboardType {
    pub text: String,
    #[serde(default)]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyboardHotkey {
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitTime {
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitImage {
    pub template_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Rect>,
    #[serde(default = "default_image_confidence")]
    pub confidence_threshold: f64,
    #[serde(default = "default_match_timeout")]
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub click_on_match: Option<MatchClick>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSearch {
    pub query_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Rect>,
    #[serde(default = "default_text_confidence")]
    pub confidence_threshold: f64,
    #[serde(default = "default_match_timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub exact_match: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub click_on_match: Option<MatchClick>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfCondition {
    pub condition: Condition,
    #[serde(default)]
    pub true_branch: Vec<MacroStep>,
    #[serde(default)]
    pub false_branch: Vec<MacroStep>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopMode {
    /// Run the body exactly this many times.
    Count(u32),
    /// Re-evaluate before each iteration; stop once false or at `max_iterations`.
    While(Condition),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "LoopRepr", into = "LoopRepr")]
pub struct Loop {
    pub mode: LoopMode,
    pub body: Vec<MacroStep>,
    pub max_iterations: u32,
    /// Bound to the 1-based iteration number while the body runs.
    pub index_variable: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct LoopRepr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    condition: Option<Condition>,
    #[serde(default = "default_max_iterations")]
    max_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    index_variable: Option<String>,
    #[serde(default)]
    body: Vec<MacroStep>,
}

impl TryFrom<LoopRepr> for Loop {
    type Error = String;

    fn try_from(repr: LoopRepr) -> Result<Self, Self::Error> {
        let mode = match (repr.iterations, repr.condition) {
            (Some(n), None) => LoopMode::Count(n),
            (None, Some(c)) => LoopMode::While(c),
            (Some(_), Some(_)) => {
                return Err("loop takes either `iterations` or `condition`, not both".to_string())
            }
            (None, None) => return Err("loop requires `iterations` or `condition`".to_string()),
        };
        Ok(Loop {
            mode,
            body: repr.body,
            max_iterations: repr.max_iterations,
            index_variable: repr.index_variable,
        })
    }
}

impl From<Loop> for LoopRepr {
    fn from(l: Loop) -> Self {
        let (iterations, condition) = match l.mode {
            LoopMode::Count(n) => (Some(n), None),
            LoopMode::While(c) => (None, Some(c)),
        };
        LoopRepr {
            iterations,
            condition,
            max_iterations: l.max_iterations,
            index_variable: l.index_variable,
            body: l.body,
        }
    }
}

/// Variant payload of a step. The serde tag doubles as the persisted wire tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    MouseClick(MouseClick),
    MouseMove(MouseMove),
    KeyboardType(KeyboardType),
    KeyboardHotkey(KeyboardHotkey),
    WaitTime(WaitTime),
    WaitImage(WaitImage),
    TextSearch(TextSearch),
    IfCondition(IfCondition),
    Loop(Loop),
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            StepKind::MouseClick(_) => StepType::MouseClick,
            StepKind::MouseMove(_) => StepType::MouseMove,
            StepKind::KeyboardType(_) => StepType::KeyboardType,
            StepKind::KeyboardHotkey(_) => StepType::KeyboardHotkey,
            StepKind::WaitTime(_) => StepType::WaitTime,
            StepKind::WaitImage(_) => StepType::WaitImage,
            StepKind::TextSearch(_) => StepType::TextSearch,
            StepKind::IfCondition(_) => StepType::IfCondition,
            StepKind::Loop(_) => StepType::Loop,
        }
    }
}

/// One node of a macro's step tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroStep {
    #[serde(default = "new_step_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default = "default_enabled", skip_serializing_if = "is_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<ErrorHandling>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl MacroStep {
    pub fn new(kind: StepKind) -> Self {
        Self {
            id: new_step_id(),
            label: None,
            enabled: true,
            on_error: None,
            retry_count: 0,
            kind,
        }
    }

    pub fn click(x: impl Into<Coordinate>, y: impl Into<Coordinate>) -> Self {
        Self::new(StepKind::MouseClick(MouseClick {
            x: x.into(),
            y: y.into(),
            button: MouseButton::Left,
            click_count: 1,
        }))
    }

    pub fn move_to(x: impl Into<Coordinate>, y: impl Into<Coordinate>, duration_ms: u64) -> Self {
        Self::new(StepKind::MouseMove(MouseMove {
            x: x.into(),
            y: y.into(),
            duration_ms,
        }))
    }

    pub fn type_text(text: impl Into<String>) -> Self {
        Self::new(StepKind::KeyboardType(KeyboardType {
            text: text.into(),
            interval_ms: 0,
        }))
    }

    pub fn hotkey<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(StepKind::KeyboardHotkey(KeyboardHotkey {
            keys: keys.into_iter().map(Into::into).collect(),
        }))
    }

    pub fn wait(duration_ms: u64) -> Self {
        Self::new(StepKind::WaitTime(WaitTime { duration_ms }))
    }

    pub fn wait_image(template_ref: impl Into<String>, timeout_ms: u64) -> Self {
        Self::new(StepKind::WaitImage(WaitImage {
            template_ref: template_ref.into(),
            region: None,
            confidence_threshold: DEFAULT_IMAGE_CONFIDENCE,
            timeout_ms,
            output_variable: None,
            click_on_match: None,
        }))
    }

    pub fn text_search(query_text: impl Into<String>, timeout_ms: u64) -> Self {
        Self::new(StepKind::TextSearch(TextSearch {
            query_text: query_text.into(),
            region: None,
            confidence_threshold: DEFAULT_TEXT_CONFIDENCE,
            timeout_ms,
            exact_match: false,
            output_variable: None,
            click_on_match: None,
        }))
    }

    pub fn if_condition(
        condition: Condition,
        true_branch: Vec<MacroStep>,
        false_branch: Vec<MacroStep>,
    ) -> Self {
        Self::new(StepKind::IfCondition(IfCondition {
            condition,
            true_branch,
            false_branch,
        }))
    }

    pub fn repeat(iterations: u32, body: Vec<MacroStep>) -> Self {
        Self::new(StepKind::Loop(Loop {
            mode: LoopMode::Count(iterations),
            body,
            max_iterations: DEFAULT_MAX_ITERATIONS.max(iterations),
            index_variable: None,
        }))
    }

    pub fn loop_while(condition: Condition, max_iterations: u32, body: Vec<MacroStep>) -> Self {
        Self::new(StepKind::Loop(Loop {
            mode: LoopMode::While(condition),
            body,
            max_iterations,
            index_variable: None,
        }))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_on_error(mut self, handling: ErrorHandling) -> Self {
        self.on_error = Some(handling);
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }

    /// Label if set, otherwise the step type and a short id.
    pub fn display_name(&self) -> String {
        match &self.label {
            Some(label) if !label.is_empty() => label.clone(),
            _ => {
                let short: String = self.id.chars().take(8).collect();
                format!("{} ({short})", self.step_type())
            }
        }
    }

    /// Owned child sequences: both branches of an `IfCondition`, the body of a `Loop`.
    pub fn child_sequences(&self) -> Vec<&[MacroStep]> {
        match &self.kind {
            StepKind::IfCondition(c) => vec![c.true_branch.as_slice(), c.false_branch.as_slice()],
            StepKind::Loop(l) => vec![l.body.as_slice()],
            _ => Vec::new(),
        }
    }

    pub fn child_sequences_mut(&mut self) -> Vec<&mut Vec<MacroStep>> {
        match &mut self.kind {
            StepKind::IfCondition(c) => vec![&mut c.true_branch, &mut c.false_branch],
            StepKind::Loop(l) => vec![&mut l.body],
            _ => Vec::new(),
        }
    }

    /// Depth-first pre-order visit of this step and all of its descendants.
    pub fn visit<'a>(&'a self, depth: usize, f: &mut dyn FnMut(&'a MacroStep, usize)) {
        f(self, depth);
        for seq in self.child_sequences() {
            for child in seq {
                child.visit(depth + 1, f);
            }
        }
    }

    /// Validates this step and its descendants. Total and side-effect free.
    pub fn validate(&self) -> Result<(), InvalidStepError> {
        if self.id.trim().is_empty() {
            return Err(InvalidStepError::Malformed {
                step_type: self.step_type().to_string(),
                reason: "step id is empty".to_string(),
            });
        }

        match &self.kind {
            StepKind::MouseClick(c) => {
                self.check_coordinate("x", &c.x)?;
                self.check_coordinate("y", &c.y)?;
                if c.click_count == 0 {
                    return Err(self.invalid("click_count", "must be at least 1"));
                }
            }
            StepKind::MouseMove(m) => {
                self.check_coordinate("x", &m.x)?;
                self.check_coordinate("y", &m.y)?;
            }
            StepKind::KeyboardType(t) => {
                if t.text.is_empty() {
                    return Err(self.invalid("text", "must not be empty"));
                }
            }
            StepKind::KeyboardHotkey(h) => {
                if h.keys.is_empty() {
                    return Err(self.invalid("keys", "at least one key is required"));
                }
                if h.keys.iter().any(|k| k.trim().is_empty()) {
                    return Err(self.invalid("keys", "key names must not be blank"));
                }
            }
            StepKind::WaitTime(w) => {
                if w.duration_ms == 0 {
                    return Err(self.invalid("duration_ms", "must be positive"));
                }
            }
            StepKind::WaitImage(w) => {
                if w.template_ref.trim().is_empty() {
                    return Err(self.invalid("template_ref", "must not be empty"));
                }
                self.check_sensing(
                    w.region,
                    w.confidence_threshold,
                    w.timeout_ms,
                    &w.output_variable,
                )?;
                self.check_match_click(&w.click_on_match)?;
            }
            StepKind::TextSearch(t) => {
                if t.query_text.trim().is_empty() {
                    return Err(self.invalid("query_text", "must not be empty"));
                }
                self.check_sensing(
                    t.region,
                    t.confidence_threshold,
                    t.timeout_ms,
                    &t.output_variable,
                )?;
                self.check_match_click(&t.click_on_match)?;
            }
            StepKind::IfCondition(c) => {
                self.check_condition(&c.condition)?;
            }
            StepKind::Loop(l) => {
                if l.max_iterations == 0 {
                    return Err(self.invalid("max_iterations", "must be at least 1"));
                }
                match &l.mode {
                    LoopMode::Count(0) => {
                        return Err(self.invalid("iterations", "must be positive"));
                    }
                    LoopMode::Count(n) if *n > l.max_iterations => {
                        return Err(self.invalid(
                            "iterations",
                            format!("{n} exceeds max_iterations {}", l.max_iterations),
                        ));
                    }
                    LoopMode::Count(_) => {}
                    LoopMode::While(c) => self.check_condition(c)?,
                }
                if l.body.is_empty() {
                    return Err(self.invalid("body", "loop body must contain at least one step"));
                }
                if let Some(name) = &l.index_variable {
                    if name.trim().is_empty() {
                        return Err(self.invalid("index_variable", "must not be blank"));
                    }
                }
            }
        }

        for seq in self.child_sequences() {
            for child in seq {
                child.validate()?;
            }
        }
        Ok(())
    }

    fn invalid(&self, field: &'static str, reason: impl Into<String>) -> InvalidStepError {
        InvalidStepError::InvalidField {
            step_id: self.id.clone(),
            field,
            reason: reason.into(),
        }
    }

    fn check_coordinate(
        &self,
        field: &'static str,
        value: &Coordinate,
    ) -> Result<(), InvalidStepError> {
        match value {
            Coordinate::Fixed(_) => Ok(()),
            Coordinate::Template(t) if variables::has_placeholder(t) => Ok(()),
            Coordinate::Template(t) if t.trim().parse::<i32>().is_ok() => Ok(()),
            Coordinate::Template(t) => Err(self.invalid(
                field,
                format!("`{t}` is neither an integer nor a ${{variable}} template"),
            )),
        }
    }

    fn check_sensing(
        &self,
        region: Option<Rect>,
        confidence_threshold: f64,
        timeout_ms: u64,
        output_variable: &Option<String>,
    ) -> Result<(), InvalidStepError> {
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(self.invalid("confidence_threshold", "must be within [0, 1]"));
        }
        if timeout_ms == 0 {
            return Err(self.invalid("timeout_ms", "must be positive"));
        }
        if let Some(r) = region {
            if r.width == 0 || r.height == 0 {
                return Err(self.invalid("region", "width and height must be positive"));
            }
        }
        if let Some(name) = output_variable {
            if name.trim().is_empty() {
                return Err(self.invalid("output_variable", "must not be blank"));
            }
        }
        Ok(())
    }

    fn check_match_click(&self, click: &Option<MatchClick>) -> Result<(), InvalidStepError> {
        match click {
            Some(c) if c.click_count == 0 => {
                Err(self.invalid("click_on_match", "click_count must be at least 1"))
            }
            _ => Ok(()),
        }
    }

    fn check_condition(&self, condition: &Condition) -> Result<(), InvalidStepError> {
        if condition.left.trim().is_empty() {
            return Err(self.invalid("condition", "left operand must not be empty"));
        }
        Ok(())
    }
}

/// Builds and validates a step from its type tag and a JSON object of parameters.
/// Common fields (`id`, `label`, `enabled`, `on_error`, `retry_count`) may be
/// included in `params`; a fresh id is generated when absent.
pub fn build(step_type: StepType, params: Value) -> Result<MacroStep, InvalidStepError> {
    let malformed = |reason: String| InvalidStepError::Malformed {
        step_type: step_type.to_string(),
        reason,
    };

    let mut object = match params {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => return Err(malformed(format!("parameters must be an object, got {other}"))),
    };
    object.insert("type".to_string(), Value::String(step_type.as_str().to_string()));

    let step: MacroStep =
        serde_json::from_value(Value::Object(object)).map_err(|e| malformed(e.to_string()))?;
    step.validate()?;
    Ok(step)
}

/// Like [`build`], taking the wire tag as a string.
pub fn build_tagged(type_tag: &str, params: Value) -> Result<MacroStep, InvalidStepError> {
    build(type_tag.parse()?, params)
}

pub fn new_step_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_enabled() -> bool {
    true
}

fn is_enabled(enabled: &bool) -> bool {
    *enabled
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

fn default_click_count() -> u32 {
    1
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_match_timeout() -> u64 {
    DEFAULT_MATCH_TIMEOUT_MS
}

fn default_image_confidence() -> f64 {
    DEFAULT_IMAGE_CONFIDENCE
}

fn default_text_confidence() -> f64 {
    DEFAULT_TEXT_CONFIDENCE
}
