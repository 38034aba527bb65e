//! Step scripts: the serde data model, loading, validation and compilation.
//!
//! A [`Script`] is what a user writes (TOML or JSON). [`Script::compile`]
//! checks it and turns it into a [`CompiledScript`], the immutable form the
//! step engine executes.

use crate::action::{Pacing, ScriptAction};
use crate::actions::SendText;
use crate::matcher::{Pattern, PatternSet};
use crate::parser::{duration, parse_actions, substitute};
use crate::retry::{Backoff, RetryPolicy};
use crate::transcript::Encoding;
use anyhow::{Context as _, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// A script as authored.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// First step to run. Defaults to the first declared step.
    #[serde(default)]
    pub start: Option<String>,
    /// Default connection target, used when none is given on the command line.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub pacing: Pacing,
    pub steps: Vec<StepSpec>,
}

/// Values every step inherits unless it sets its own.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Defaults {
    #[serde(with = "duration")]
    pub timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "duration")]
    pub retry_delay: Duration,
    pub backoff: Backoff,
    pub encoding: Encoding,
    /// Appended by `sendline` and `type`.
    pub line_ending: String,
}

impl Default for Defaults {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            timeout: Duration::from_secs(10),
            max_retries: retry.max_retries,
            retry_delay: retry.delay,
            backoff: retry.backoff,
            encoding: Encoding::default(),
            line_ending: "\r".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    pub name: String,
    #[serde(default, with = "duration::option")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default, with = "duration::option")]
    pub retry_delay: Option<Duration>,
    #[serde(default)]
    pub backoff: Option<Backoff>,
    /// Sent before each retry.
    #[serde(default)]
    pub nudge: Option<Nudge>,
    /// `"fail"` (default), `"succeed"`, or the name of a step to jump to once
    /// retries are exhausted.
    #[serde(default)]
    pub on_timeout: Option<String>,
    /// Marks a terminal step.
    #[serde(default)]
    pub finish: Option<Finish>,
    #[serde(default)]
    pub on: Vec<PatternSpec>,
}

/// Either raw text or a list of action lines.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Nudge {
    Text(String),
    Actions(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatternSpec {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub rank: Option<u32>,
    #[serde(default, rename = "do")]
    pub actions: Vec<String>,
    #[serde(default)]
    pub goto: Option<String>,
    #[serde(default)]
    pub finish: Option<Finish>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Finish {
    Success,
    Failure,
}

/// Values supplied at run time that take precedence over the script.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub vars: BTreeMap<String, String>,
    /// Replaces the default step timeout (steps with their own keep theirs).
    pub timeout: Option<Duration>,
}

/// Where a step goes after a pattern matches or it gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Goto(usize),
    Finish(Finish),
}

/// What a step does once its retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnTimeout {
    Fail,
    Succeed,
    Goto(usize),
}

/// The actions and transition bound to one pattern.
pub struct Arm {
    pub actions: Vec<Box<dyn ScriptAction>>,
    pub then: Transition,
}

pub struct Step {
    pub name: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub nudge: Vec<Box<dyn ScriptAction>>,
    pub on_timeout: OnTimeout,
    pub finish: Option<Finish>,
    pub patterns: PatternSet,
    /// Parallel to `patterns`.
    pub arms: Vec<Arm>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("on_timeout", &self.on_timeout)
            .field("finish", &self.finish)
            .field("patterns", &self.patterns)
            .finish_non_exhaustive()
    }
}

/// A validated script, ready to run. Shared read-only between sessions.
#[derive(Debug)]
pub struct CompiledScript {
    pub name: String,
    pub target: Option<String>,
    pub encoding: Encoding,
    pub line_ending: Vec<u8>,
    pub pacing: Pacing,
    pub start: usize,
    pub steps: Vec<Step>,
}

impl Script {
    /// Load a script file. `.json` files are read as JSON, anything else as TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script file: {}", path.display()))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        };
        parsed.with_context(|| format!("Failed to parse script file: {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Validate the script and build its executable form.
    pub fn compile(&self, overrides: &Overrides) -> Result<CompiledScript> {
        if self.steps.is_empty() {
            bail!("Script '{}' has no steps", self.name);
        }

        let mut index = HashMap::new();
        for (i, step) in self.steps.iter().enumerate() {
            if index.insert(step.name.as_str(), i).is_some() {
                bail!("Duplicate step name: {}", step.name);
            }
        }
        let lookup = |name: &str| {
            index
                .get(name)
                .copied()
                .ok_or_else(|| anyhow!("Unknown step: {}", name))
        };

        let start = match &self.start {
            Some(name) => lookup(name).context("Invalid start step")?,
            None => 0,
        };

        let mut vars = self.vars.clone();
        vars.extend(overrides.vars.clone());
        let default_timeout = overrides.timeout.unwrap_or(self.defaults.timeout);

        let steps = self
            .steps
            .iter()
            .map(|spec| {
                self.compile_step(spec, &vars, default_timeout, &lookup)
                    .with_context(|| format!("Invalid step '{}'", spec.name))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(CompiledScript {
            name: self.name.clone(),
            target: self.target.clone(),
            encoding: self.defaults.encoding,
            line_ending: self.defaults.line_ending.clone().into_bytes(),
            pacing: self.pacing,
            start,
            steps,
        })
    }

    fn compile_step(
        &self,
        spec: &StepSpec,
        vars: &BTreeMap<String, String>,
        default_timeout: Duration,
        lookup: &impl Fn(&str) -> Result<usize>,
    ) -> Result<Step> {
        match (spec.finish, spec.on.is_empty()) {
            (Some(_), false) => bail!("A terminal step cannot watch patterns"),
            (None, true) => bail!("Step needs at least one pattern or a 'finish'"),
            _ => {}
        }

        let on_timeout = match spec.on_timeout.as_deref() {
            None | Some("fail") => OnTimeout::Fail,
            Some("succeed") => OnTimeout::Succeed,
            Some(name) => OnTimeout::Goto(lookup(name).context("Invalid on_timeout")?),
        };

        let nudge = match &spec.nudge {
            None => Vec::new(),
            Some(Nudge::Text(text)) => {
                let text = substitute(text, vars, str::to_string).context("Invalid nudge")?;
                vec![Box::new(SendText::new(text)) as Box<dyn ScriptAction>]
            }
            Some(Nudge::Actions(lines)) => parse_actions(lines, vars).context("Invalid nudge")?,
        };

        let mut patterns = PatternSet::default();
        let mut arms = Vec::with_capacity(spec.on.len());
        let self_index = lookup(&spec.name)?;
        for (i, on) in spec.on.iter().enumerate() {
            let (pattern, arm) = compile_arm(on, vars, self_index, lookup)
                .with_context(|| format!("Invalid pattern #{}", i + 1))?;
            patterns.push(pattern);
            arms.push(arm);
        }

        Ok(Step {
            name: spec.name.clone(),
            timeout: spec.timeout.unwrap_or(default_timeout),
            retry: RetryPolicy {
                max_retries: spec.max_retries.unwrap_or(self.defaults.max_retries),
                delay: spec.retry_delay.unwrap_or(self.defaults.retry_delay),
                backoff: spec.backoff.unwrap_or(self.defaults.backoff),
            },
            nudge,
            on_timeout,
            finish: spec.finish,
            patterns,
            arms,
        })
    }
}

fn compile_arm(
    on: &PatternSpec,
    vars: &BTreeMap<String, String>,
    self_index: usize,
    lookup: &impl Fn(&str) -> Result<usize>,
) -> Result<(Pattern, Arm)> {
    let mut pattern = match (&on.text, &on.regex) {
        (Some(text), None) => {
            let text = substitute(text, vars, str::to_string)?;
            if text.is_empty() {
                bail!("'text' must not be empty");
            }
            Pattern::literal(text)
        }
        (None, Some(source)) => {
            let source = substitute(source, vars, regex::escape)?;
            Pattern::regex(&source).with_context(|| format!("Invalid regex: {}", source))?
        }
        (Some(_), Some(_)) => bail!("Set only one of 'text' or 'regex'"),
        (None, None) => bail!("Set one of 'text' or 'regex'"),
    };
    if let Some(label) = &on.label {
        pattern = pattern.with_label(label.clone());
    }
    if let Some(rank) = on.rank {
        pattern = pattern.with_rank(rank);
    }

    let then = match (&on.goto, on.finish) {
        (Some(_), Some(_)) => bail!("Set at most one of 'goto' or 'finish'"),
        (Some(name), None) => Transition::Goto(lookup(name).context("Invalid goto")?),
        (None, Some(finish)) => Transition::Finish(finish),
        (None, None) => Transition::Goto(self_index),
    };

    let actions = parse_actions(&on.actions, vars)?;
    Ok((pattern, Arm { actions, then }))
}
