// src/template.rs

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::Path,
    time::Duration,
};

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Used when a template does not declare its own interval.
pub const DEFAULT_INTERVAL_MS: u64 = 300_000;

/// No instance ever runs more often than this.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// A loaded plugin definition. Immutable once built.
///
/// # Example
/// ```json
/// {
///   "id": "weather",
///   "meta": { "name": "Weather" },
///   "interval": 600000,
///   "inputs": [ { "key": "city", "default": "Berlin" } ],
///   "execution": {
///     "type": "api_json",
///     "url": "https://api.example.com/weather?q={{city}}",
///     "extract": { "temp": "current.temp_c" }
///   },
///   "outputs": [ { "key": "temp", "format": "{{temp}}", "unit": "°C", "label": "{{city}}" } ]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Template {
    pub id: String,
    #[serde(default)]
    pub meta: TemplateMeta,
    /// Tick interval in milliseconds.
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub inputs: Vec<InputDecl>,
    pub execution: Execution,
    #[serde(default)]
    pub outputs: Vec<OutputDecl>,
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_MS
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TemplateMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct InputDecl {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub default: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OutputDecl {
    pub key: String,
    /// Value pattern, e.g. `{{temp}}`.
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// The execution descriptor as written in the definition file. Legacy
/// (`api_json`, `api_text`) plans use the request fields, `chain` uses `steps`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Execution {
    #[serde(rename = "type")]
    pub kind: ExecutionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extract: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    /// Plan-level transforms, applied after the request or the whole chain.
    #[serde(default)]
    pub process: Vec<Transform>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    ApiJson,
    ApiText,
    Chain,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Typed view over [`Execution`]: one request, or an ordered chain of steps.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionPlan<'a> {
    Legacy(LegacyRequest<'a>),
    Chain(&'a [Step]),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LegacyRequest<'a> {
    pub url: &'a str,
    pub method: &'a str,
    pub body: Option<&'a str>,
    pub headers: &'a BTreeMap<String, String>,
    pub encoding: Option<&'a str>,
    pub format: ResponseFormat,
    pub extract: &'a BTreeMap<String, String>,
}

impl LegacyRequest<'_> {
    pub const STEP_ID: &'static str = "legacy";

    /// The synthetic step this request executes as. Transforms stay at plan level.
    pub fn as_step(&self) -> Step {
        Step {
            id: Self::STEP_ID.to_string(),
            method: self.method.to_string(),
            url: self.url.to_string(),
            body: self.body.map(str::to_string),
            headers: self.headers.clone(),
            skip_if_set: None,
            encoding: self.encoding.map(str::to_string),
            response_format: self.format,
            extract: self.extract.clone(),
            process: Vec::new(),
            cache_minutes: 0,
        }
    }
}

impl Execution {
    pub fn plan(&self) -> ExecutionPlan<'_> {
        match self.kind {
            ExecutionKind::Chain => ExecutionPlan::Chain(&self.steps),
            kind => ExecutionPlan::Legacy(LegacyRequest {
                url: self.url.as_deref().unwrap_or_default(),
                method: &self.method,
                body: self.body.as_deref(),
                headers: &self.headers,
                encoding: self.encoding.as_deref(),
                format: if kind == ExecutionKind::ApiText {
                    ResponseFormat::Text
                } else {
                    ResponseFormat::Json
                },
                extract: &self.extract,
            }),
        }
    }
}

/// One stage of a chain.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Step {
    pub id: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Skip this step when the named context key already holds a value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if_set: Option<String>,
    /// Charset label the body is decoded with, regardless of what the server
    /// declares. Unknown labels fall back to the declared charset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default)]
    pub response_format: ResponseFormat,
    /// context var → path
    #[serde(default)]
    pub extract: BTreeMap<String, String>,
    #[serde(default)]
    pub process: Vec<Transform>,
    /// `0` never caches, negative caches forever.
    #[serde(default)]
    pub cache_minutes: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    #[default]
    Json,
    Jsonp,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Transform {
    /// Target variable.
    pub var: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_var: Option<String>,
    pub function: TransformKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub map: BTreeMap<String, String>,
}

impl Transform {
    pub fn source(&self) -> &str {
        self.source_var.as_deref().unwrap_or(&self.var)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    RegexReplace,
    RegexMatch,
    Map,
    ResolveTemplate,
    ThresholdSwitch,
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error in {path}: {message}")]
    Parse { path: String, message: String },

    #[error("unsupported extension `{0}` (expected .json, .yaml or .yml)")]
    UnsupportedExtension(String),

    #[error("template `{id}` is invalid: {reason}")]
    Invalid { id: String, reason: String },
}

/// Extensions the loader picks up from the templates directory.
pub const TEMPLATE_EXTENSIONS: &[&str] = &["json", "yaml", "yml"];

impl Template {
    pub fn load_from_file(path: &Path) -> Result<Template, TemplateError> {
        let display = path.to_string_lossy().to_string();
        let contents = fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: display.clone(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|os| os.to_str())
            .unwrap_or_default()
            .to_lowercase();

        let template: Template = match ext.as_str() {
            "json" => serde_json::from_str(&contents).map_err(|e| TemplateError::Parse {
                path: display.clone(),
                message: e.to_string(),
            })?,
            "yaml" | "yml" => {
                serde_yaml_bw::from_str(&contents).map_err(|e| TemplateError::Parse {
                    path: display.clone(),
                    message: e.to_string(),
                })?
            }
            other => return Err(TemplateError::UnsupportedExtension(other.to_string())),
        };

        template.validate()?;
        Ok(template)
    }

    pub fn validate(&self) -> Result<(), TemplateError> {
        let invalid = |reason: String| TemplateError::Invalid {
            id: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("empty id".into()));
        }

        match self.execution.plan() {
            ExecutionPlan::Chain(steps) => {
                if steps.is_empty() {
                    return Err(invalid("chain execution without steps".into()));
                }
                let mut seen = HashSet::new();
                for step in steps {
                    if !seen.insert(step.id.as_str()) {
                        return Err(invalid(format!("duplicate step id `{}`", step.id)));
                    }
                    check_patterns(&step.process).map_err(invalid)?;
                }
            }
            ExecutionPlan::Legacy(req) => {
                if req.url.trim().is_empty() {
                    return Err(invalid("missing url".into()));
                }
            }
        }
        check_patterns(&self.execution.process).map_err(invalid)?;

        let mut keys = HashSet::new();
        for output in &self.outputs {
            if !keys.insert(output.key.as_str()) {
                return Err(invalid(format!("duplicate output key `{}`", output.key)));
            }
        }
        Ok(())
    }

    /// Effective tick period for an instance with the given override.
    pub fn effective_interval(&self, custom_interval_ms: i64) -> Duration {
        let ms = if custom_interval_ms > 0 {
            custom_interval_ms as u64
        } else {
            self.interval
        };
        Duration::from_millis(ms).max(MIN_INTERVAL)
    }

    pub fn display_name(&self) -> &str {
        if self.meta.name.is_empty() {
            &self.id
        } else {
            &self.meta.name
        }
    }
}

fn check_patterns(transforms: &[Transform]) -> Result<(), String> {
    for t in transforms {
        if matches!(t.function, TransformKind::RegexReplace | TransformKind::RegexMatch) {
            let pattern = t.pattern.as_deref().unwrap_or_default();
            Regex::new(pattern)
                .map_err(|e| format!("transform `{}` has invalid pattern: {e}", t.var))?;
        }
    }
    Ok(())
}
