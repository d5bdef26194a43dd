use serde::{Deserialize, Serialize};

/// Lowest priority the classification library accepts for user-defined types.
pub const MIN_CUSTOM_PRIORITY: u32 = 2000;
/// Priority assigned when an added definition carries none.
pub const DEFAULT_PRIORITY: u32 = 2500;
pub const DEFAULT_MATCH_THRESHOLD: u8 = 95;
const DEFAULT_HEADER_CONFIDENCE: u8 = 90;

/// A named pattern/value matcher used to classify table columns.
///
/// Persisted as a camelCase JSON object. Unknown fields are ignored on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticTypeDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(flatten)]
    pub plugin: Plugin,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,

    #[serde(default = "default_match_threshold")]
    pub match_threshold: u8,

    #[serde(default)]
    pub locale_rules: Vec<LocaleRule>,

    /// Epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,

    /// Derived by the catalog, never stored.
    #[serde(skip)]
    pub is_built_in: bool,
}

fn default_match_threshold() -> u8 {
    DEFAULT_MATCH_THRESHOLD
}

fn default_header_confidence() -> u8 {
    DEFAULT_HEADER_CONFIDENCE
}

/// Plugin-specific content, keyed by `pluginKind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pluginKind", rename_all = "lowercase")]
pub enum Plugin {
    Regex,
    List {
        #[serde(rename = "contentValues", default)]
        content_values: Vec<String>,
    },
}

impl Plugin {
    pub fn kind(&self) -> &'static str {
        match self {
            Plugin::Regex => "regex",
            Plugin::List { .. } => "list",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocaleRule {
    pub locale_tag: String,
    #[serde(default)]
    pub header_patterns: Vec<HeaderPattern>,
    #[serde(default)]
    pub value_matchers: Vec<ValueMatcher>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderPattern {
    pub pattern: String,
    #[serde(default = "default_header_confidence")]
    pub confidence: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueMatcher {
    pub pattern: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid semantic type: {0}")]
pub struct ValidationError(pub String);

impl SemanticTypeDefinition {
    /// Builds a list-kind definition.
    pub fn list(name: &str, description: &str, values: &[&str]) -> Self {
        SemanticTypeDefinition {
            name: name.to_string(),
            description: description.to_string(),
            plugin: Plugin::List {
                content_values: values.iter().map(|v| v.to_string()).collect(),
            },
            priority: None,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            locale_rules: vec![],
            created_at: None,
            is_built_in: false,
        }
    }

    /// Builds a regex-kind definition with a single universal locale rule.
    pub fn regex(name: &str, description: &str, pattern: &str) -> Self {
        SemanticTypeDefinition {
            name: name.to_string(),
            description: description.to_string(),
            plugin: Plugin::Regex,
            priority: None,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            locale_rules: vec![LocaleRule {
                locale_tag: "*".to_string(),
                header_patterns: vec![],
                value_matchers: vec![ValueMatcher {
                    pattern: pattern.to_string(),
                    description: String::new(),
                }],
            }],
            created_at: None,
            is_built_in: false,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError("name cannot be empty".into()));
        }
        if self.description.trim().is_empty() {
            return Err(ValidationError(format!(
                "{}: description cannot be empty",
                self.name
            )));
        }
        if self.match_threshold > 100 {
            return Err(ValidationError(format!(
                "{}: match threshold must be within 0..=100, got {}",
                self.name, self.match_threshold
            )));
        }

        match &self.plugin {
            Plugin::Regex => {
                if self.locale_rules.is_empty() {
                    return Err(ValidationError(format!(
                        "{}: regex type needs at least one locale rule",
                        self.name
                    )));
                }
                let mut matcher_count = 0;
                for rule in &self.locale_rules {
                    for matcher in &rule.value_matchers {
                        matcher_count += 1;
                        check_pattern(&self.name, &matcher.pattern)?;
                    }
                    for header in &rule.header_patterns {
                        check_pattern(&self.name, &header.pattern)?;
                    }
                }
                if matcher_count == 0 {
                    return Err(ValidationError(format!(
                        "{}: regex type needs at least one value matcher",
                        self.name
                    )));
                }
            }
            Plugin::List { content_values } => {
                if content_values.is_empty() {
                    return Err(ValidationError(format!(
                        "{}: list type needs content values",
                        self.name
                    )));
                }
                if content_values.iter().any(|v| v.trim().is_empty()) {
                    return Err(ValidationError(format!(
                        "{}: list values cannot be blank",
                        self.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Applies the defaults every stored user definition must carry.
    pub fn normalize(&mut self, now_millis: i64) {
        match self.priority {
            None => self.priority = Some(DEFAULT_PRIORITY),
            Some(priority) if !self.is_built_in && priority < MIN_CUSTOM_PRIORITY => {
                log::warn!(
                    "priority {priority} is below the minimum {MIN_CUSTOM_PRIORITY} for {}, using {MIN_CUSTOM_PRIORITY}",
                    self.name
                );
                self.priority = Some(MIN_CUSTOM_PRIORITY);
            }
            Some(_) => {}
        }

        if let Plugin::List { content_values } = &mut self.plugin {
            for value in content_values.iter_mut() {
                *value = value.to_uppercase();
            }
        }

        if self.created_at.is_none() {
            self.created_at = Some(now_millis);
        }
    }

    /// Sample values describing this type: up to 10 literal values followed
    /// by up to 5 value-matcher descriptions of the first locale rule.
    pub fn examples(&self) -> Vec<String> {
        let mut examples: Vec<String> = match &self.plugin {
            Plugin::List { content_values } => content_values.iter().take(10).cloned().collect(),
            Plugin::Regex => vec![],
        };

        if let Some(rule) = self.locale_rules.first() {
            examples.extend(
                rule.value_matchers
                    .iter()
                    .take(5)
                    .filter(|m| !m.description.is_empty())
                    .map(|m| m.description.clone()),
            );
        }

        examples
    }

    /// Header patterns across every locale rule, in declaration order.
    pub fn header_examples(&self) -> Vec<String> {
        self.locale_rules
            .iter()
            .flat_map(|rule| rule.header_patterns.iter().map(|h| h.pattern.clone()))
            .collect()
    }
}

fn check_pattern(name: &str, pattern: &str) -> Result<(), ValidationError> {
    if pattern.trim().is_empty() {
        return Err(ValidationError(format!("{name}: pattern cannot be empty")));
    }
    regex::Regex::new(pattern)
        .map(|_| ())
        .map_err(|err| ValidationError(format!("{name}: invalid pattern {pattern:?}: {err}")))
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
