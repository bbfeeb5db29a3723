//! Variable interpolation for pipeline configurations.
//!
//! Supports variables like:
//! - `${source.commit}` - Commit that triggered the execution
//! - `${source.short_commit}` - First 7 characters of the commit
//! - `${source.branch}` - Branch of the triggering change
//! - `${source.repository}` - Repository of the triggering change
//! - `${pipeline.name}` - Pipeline name
//! - `${pipeline.id}` - Pipeline ID
//! - `${execution.id}` - Execution ID
//! - `${execution.number}` - Execution number
//! - `${execution.trigger}` - What started the execution
//! - `${stage.name}` - Current stage name
//! - `${stage.index}` - Current stage position (zero based)
//! - `${env.VAR_NAME}` - Pipeline environment variable
//! - `${timestamp}` - Unix timestamp
//! - `${date}` - ISO date (YYYY-MM-DD)
//! - `${datetime}` - ISO datetime
//!
//! Secrets are not interpolated: they reach actions as environment
//! variables, by name.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    /// Source-change variables
    pub source: SourceContext,
    /// Pipeline-related variables
    pub pipeline: PipelineContext,
    /// Execution-related variables
    pub execution: ExecutionContext,
    /// Stage-related variables
    pub stage: StageContext,
    /// Pipeline environment
    pub env: BTreeMap<String, String>,
    /// Custom variables defined by the caller
    pub custom: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct SourceContext {
    pub repository: String,
    pub branch: String,
    pub commit: String,
    pub short_commit: String,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub id: String,
    pub number: u64,
    pub trigger: String,
}

#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub name: String,
    pub index: usize,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}")
        .expect("variable pattern is valid")
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch the stage the context describes.
    pub fn enter_stage(&mut self, name: &str, index: usize) {
        self.stage.name = name.to_string();
        self.stage.index = index;
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["source", "repository"] => Some(self.source.repository.clone()),
            ["source", "branch"] => Some(self.source.branch.clone()),
            ["source", "commit"] => Some(self.source.commit.clone()),
            ["source", "short_commit"] => Some(self.source.short_commit.clone()),

            ["pipeline", "id"] => Some(self.pipeline.id.clone()),
            ["pipeline", "name"] => Some(self.pipeline.name.clone()),

            ["execution", "id"] => Some(self.execution.id.clone()),
            ["execution", "number"] => Some(self.execution.number.to_string()),
            ["execution", "trigger"] => Some(self.execution.trigger.clone()),

            ["stage", "name"] => Some(self.stage.name.clone()),
            ["stage", "index"] => Some(self.stage.index.to_string()),

            ["env", name] => self.env.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            ["datetime"] => Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),

            [name] => self.custom.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate all variables in a string. Unknown variables are left as written.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    pub fn interpolate_map(&self, map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }
}

/// `${secrets.*}` references in a string. Configuration rejects these.
pub fn find_secret_references(input: &str) -> Vec<String> {
    VAR_REGEX
        .captures_iter(input)
        .filter_map(|caps| {
            let var_name = &caps[1];
            var_name
                .starts_with("secrets.")
                .then(|| var_name.to_string())
        })
        .collect()
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_source(
        mut self,
        repository: impl Into<String>,
        branch: impl Into<String>,
        commit: impl Into<String>,
    ) -> Self {
        let commit = commit.into();
        self.ctx.source.short_commit = commit.chars().take(7).collect();
        self.ctx.source.commit = commit;
        self.ctx.source.repository = repository.into();
        self.ctx.source.branch = branch.into();
        self
    }

    pub fn with_pipeline(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.ctx.pipeline.id = id.into();
        self.ctx.pipeline.name = name.into();
        self
    }

    pub fn with_execution(
        mut self,
        id: impl Into<String>,
        number: u64,
        trigger: impl Into<String>,
    ) -> Self {
        self.ctx.execution.id = id.into();
        self.ctx.execution.number = number;
        self.ctx.execution.trigger = trigger.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.custom.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_interpolation() {
        let ctx = VariableContextBuilder::new()
            .with_source("app", "main", "abc1234567890")
            .build();

        let result = ctx.interpolate("app:${source.short_commit} from ${source.branch}");
        assert_eq!(result, "app:abc1234 from main");
    }

    #[test]
    fn test_env_variables() {
        let ctx = VariableContextBuilder::new()
            .with_env("REGION", "eu-west-1")
            .build();

        assert_eq!(ctx.interpolate("deploy to ${env.REGION}"), "deploy to eu-west-1");
    }

    #[test]
    fn test_unknown_variable_preserved() {
        let ctx = VariableContext::new();
        assert_eq!(
            ctx.interpolate("Unknown: ${unknown.var}"),
            "Unknown: ${unknown.var}"
        );
    }

    #[test]
    fn test_secrets_are_not_interpolated() {
        let ctx = VariableContext::new();
        assert_eq!(
            ctx.interpolate("token=${secrets.NPM_TOKEN}"),
            "token=${secrets.NPM_TOKEN}"
        );
        assert_eq!(
            find_secret_references("a ${secrets.A} b ${source.commit}"),
            vec!["secrets.A".to_string()]
        );
    }

    #[test]
    fn test_pipeline_execution_and_stage_context() {
        let mut ctx = VariableContextBuilder::new()
            .with_pipeline("pipeline-123", "web")
            .with_execution("exec-456", 42, "manual")
            .build();
        ctx.enter_stage("Build", 2);

        let result = ctx.interpolate(
            "${pipeline.name} #${execution.number} (${execution.trigger}) ${stage.name}/${stage.index}",
        );
        assert_eq!(result, "web #42 (manual) Build/2");
    }

    #[test]
    fn test_custom_variables_and_maps() {
        let ctx = VariableContextBuilder::new()
            .with_custom("version", "1.2.3")
            .build();
        let mut map = BTreeMap::new();
        map.insert("TAG".to_string(), "v${version}".to_string());
        assert_eq!(ctx.interpolate_map(&map)["TAG"], "v1.2.3");
    }

    #[test]
    fn test_nested_braces() {
        let ctx = VariableContextBuilder::new()
            .with_source("app", "main", "abc123")
            .build();

        let result = ctx.interpolate(r#"{"commit": "${source.commit}"}"#);
        assert_eq!(result, r#"{"commit": "abc123"}"#);
    }
}
