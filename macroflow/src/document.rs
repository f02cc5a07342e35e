//! The macro document: an ordered, nested step tree plus metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use crate::errors::InvalidStepError;
use crate::step::{self, MacroStep, StepKind, StepType};
use crate::variables;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Macro {
    #[serde(default = "step::new_step_id")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub steps: Vec<MacroStep>,
    /// Declared variable defaults. Run-time bindings start from these.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Macro {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: step::new_step_id(),
            name: name.into(),
            description: String::new(),
            created_at: now,
            updated_at: now,
            steps: Vec::new(),
            variables: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_steps(mut self, steps: Vec<MacroStep>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, default: impl Into<String>) -> Self {
        self.variables.insert(name.into(), default.into());
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn push_step(&mut self, step: MacroStep) {
        self.steps.push(step);
        self.touch();
    }

    /// Inserts at `index` among the top-level steps, clamped to the end.
    pub fn insert_step(&mut self, index: usize, step: MacroStep) {
        let index = index.min(self.steps.len());
        self.steps.insert(index, step);
        self.touch();
    }

    /// Removes the step with `id` wherever it sits in the tree.
    pub fn remove_step(&mut self, id: &str) -> Option<MacroStep> {
        let removed = remove_from(&mut self.steps, id);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    /// Moves a top-level step from one index to another.
    pub fn move_step(&mut self, from: usize, to: usize) -> bool {
        if from >= self.steps.len() || to >= self.steps.len() {
            return false;
        }
        let step = self.steps.remove(from);
        self.steps.insert(to, step);
        self.touch();
        true
    }

    pub fn find_step(&self, id: &str) -> Option<&MacroStep> {
        let mut found = None;
        self.visit(&mut |s, _| {
            if found.is_none() && s.id == id {
                found = Some(s);
            }
        });
        found
    }

    /// Depth-first pre-order visit of every step with its nesting depth.
    pub fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a MacroStep, usize)) {
        for s in &self.steps {
            s.visit(0, f);
        }
    }

    /// Number of steps in the whole tree.
    pub fn step_count(&self) -> usize {
        let mut n = 0;
        self.visit(&mut |_, _| n += 1);
        n
    }

    pub fn max_depth(&self) -> usize {
        let mut depth = 0;
        self.visit(&mut |_, d| depth = depth.max(d + 1));
        depth
    }

    /// Variable names referenced through `${...}` anywhere in the tree.
    pub fn referenced_variables(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let mut add = |template: &str| {
            for name in variables::placeholders(template) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        };
        self.visit(&mut |s, _| match &s.kind {
            StepKind::MouseClick(c) => {
                add(&c.x.to_string());
                add(&c.y.to_string());
            }
            StepKind::MouseMove(m) => {
                add(&m.x.to_string());
                add(&m.y.to_string());
            }
            StepKind::KeyboardType(t) => add(&t.text),
            StepKind::KeyboardHotkey(h) => h.keys.iter().for_each(|k| add(k)),
            StepKind::WaitTime(_) => {}
            StepKind::WaitImage(w) => add(&w.template_ref),
            StepKind::TextSearch(t) => add(&t.query_text),
            StepKind::IfCondition(c) => {
                add(&c.condition.left);
                add(&c.condition.right);
            }
            StepKind::Loop(l) => {
                if let step::LoopMode::While(c) = &l.mode {
                    add(&c.left);
                    add(&c.right);
                }
            }
        });
        names
    }

    pub fn uses_step_type(&self, step_type: StepType) -> bool {
        let mut used = false;
        self.visit(&mut |s, _| used |= s.step_type() == step_type);
        used
    }

    /// Validates every step and checks that step ids are unique across the tree.
    pub fn validate(&self) -> Result<(), InvalidStepError> {
        if self.name.trim().is_empty() {
            return Err(InvalidStepError::InvalidMacro("macro name is empty".to_string()));
        }
        if let Some(name) = self.variables.keys().find(|k| k.trim().is_empty() || k.contains('}')) {
            return Err(InvalidStepError::InvalidMacro(format!(
                "invalid variable name `{name}`"
            )));
        }
        for s in &self.steps {
            s.validate()?;
        }

        let mut seen = HashSet::new();
        let mut duplicate = None;
        self.visit(&mut |s, _| {
            if duplicate.is_none() && !seen.insert(s.id.as_str()) {
                duplicate = Some(s.id.clone());
            }
        });
        match duplicate {
            Some(id) => Err(InvalidStepError::DuplicateId(id)),
            None => Ok(()),
        }
    }
}

fn remove_from(steps: &mut Vec<MacroStep>, id: &str) -> Option<MacroStep> {
    if let Some(pos) = steps.iter().position(|s| s.id == id) {
        return Some(steps.remove(pos));
    }
    for s in steps.iter_mut() {
        for seq in s.child_sequences_mut() {
            if let Some(removed) = remove_from(seq, id) {
                return Some(removed);
            }
        }
    }
    None
}
