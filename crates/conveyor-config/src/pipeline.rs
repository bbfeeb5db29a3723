//! Pipeline configuration parsing.
//!
//! ```kdl
//! pipeline "web-service"
//!
//! on "source-change" branches="main"
//!
//! stage "Source" {
//!     action "checkout" {
//!         source repository="./app" branch="main"
//!         output "SourceOutput"
//!     }
//! }
//!
//! stage "Test" {
//!     action "unit-tests" {
//!         input "SourceOutput"
//!         run "make test"
//!         timeout-secs 600
//!         secret "NPM_TOKEN" "npm-token"
//!     }
//! }
//! ```

use conveyor_core::pipeline::{Action, Operation, Pipeline, PipelineBuilder, Stage, Trigger};
use kdl::{KdlDocument, KdlNode};
use std::collections::BTreeMap;
use std::path::Path;

use crate::nodes::{
    first_string_arg, secs_arg, string_args, string_list_prop, string_map, string_prop,
};
use crate::service::{ServiceConfig, parse_service};
use crate::system::{SystemConfig, parse_engine};
use crate::variables::find_secret_references;
use crate::{ConfigError, ConfigResult};

/// Everything a `conveyor.kdl` file declares.
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub pipeline: Pipeline,
    pub services: Vec<ServiceConfig>,
    pub system: SystemConfig,
}

impl ProjectConfig {
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.target.name == name)
    }
}

/// Read and parse a project file.
pub fn load_project(path: impl AsRef<Path>) -> ConfigResult<ProjectConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_project(&content)
}

/// Parse a project: pipeline, services and engine settings.
pub fn parse_project(kdl: &str) -> ConfigResult<ProjectConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let pipeline = pipeline_from_document(&doc)?;

    let mut services: Vec<ServiceConfig> = Vec::new();
    for node in doc.nodes() {
        if node.name().value() == "service" {
            let service = parse_service(node)?;
            if services.iter().any(|s| s.target.name == service.target.name) {
                return Err(ConfigError::Duplicate(format!(
                    "service '{}'",
                    service.target.name
                )));
            }
            services.push(service);
        }
    }

    for action in pipeline.actions() {
        if let Operation::Deploy { service, .. } = &action.operation {
            if !services.iter().any(|s| &s.target.name == service) {
                return Err(ConfigError::InvalidReference(format!(
                    "action '{}' deploys unknown service '{}'",
                    action.name, service
                )));
            }
        }
    }

    let system = match doc.nodes().iter().find(|n| n.name().value() == "engine") {
        Some(node) => parse_engine(node)?,
        None => SystemConfig::default(),
    };

    Ok(ProjectConfig {
        pipeline,
        services,
        system,
    })
}

/// Parse a pipeline configuration from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<Pipeline> {
    let doc: KdlDocument = kdl.parse()?;
    pipeline_from_document(&doc)
}

fn pipeline_from_document(doc: &KdlDocument) -> ConfigResult<Pipeline> {
    let mut name = String::new();
    let mut triggers = Vec::new();
    let mut stages = Vec::new();
    let mut env = BTreeMap::new();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            "on" => {
                triggers.push(parse_trigger(node)?);
            }
            "stage" => {
                stages.push(parse_stage(node)?);
            }
            "env" => {
                env.extend(string_map(node));
            }
            _ => {} // services, engine and unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }

    let mut builder = PipelineBuilder::new(name);
    for trigger in triggers {
        builder = builder.trigger(trigger);
    }
    for (key, value) in env {
        builder = builder.env(key, value);
    }
    for stage in stages {
        builder = builder.stage(stage);
    }

    Ok(builder.build()?)
}

fn parse_trigger(node: &KdlNode) -> ConfigResult<Trigger> {
    let trigger_type = first_string_arg(node).unwrap_or_default();

    match trigger_type.as_str() {
        "source-change" | "push" => Ok(Trigger::SourceChange {
            repository: string_prop(node, "repository"),
            branches: string_list_prop(node, "branches"),
        }),
        "manual" | "" => Ok(Trigger::Manual),
        _ => Err(ConfigError::invalid(
            "trigger type",
            format!("unknown trigger type: {}", trigger_type),
        )),
    }
}

fn parse_stage(node: &KdlNode) -> ConfigResult<Stage> {
    let name = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("stage name".to_string()))?;

    let mut stage = Stage::new(name);
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "action" {
                let action = parse_action(&stage.name, child)?;
                stage = stage.action(action);
            }
        }
    }
    Ok(stage)
}

fn parse_action(stage: &str, node: &KdlNode) -> ConfigResult<Action> {
    let name = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("action name in stage '{}'", stage)))?;
    let field = |what: &str| format!("{} of action '{}'", what, name);

    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    let mut commands = Vec::new();
    let mut operation: Option<Operation> = None;
    let mut env = BTreeMap::new();
    let mut secrets = BTreeMap::new();
    let mut timeout = None;

    let mut set_operation = |op: Operation| -> ConfigResult<()> {
        if operation.replace(op).is_some() {
            return Err(ConfigError::Duplicate(field("operation")));
        }
        Ok(())
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "input" => inputs.extend(string_args(child)),
                "output" => outputs.extend(string_args(child)),
                "run" => {
                    if let Some(cmd) = first_string_arg(child) {
                        commands.push(cmd);
                    }
                }
                "source" => {
                    let repository = string_prop(child, "repository")
                        .ok_or_else(|| ConfigError::MissingField(field("source repository")))?;
                    let branch = string_prop(child, "branch").unwrap_or_else(|| "main".to_string());
                    set_operation(Operation::SourceFetch { repository, branch })?;
                }
                "image-build" => {
                    let repository = string_prop(child, "repository")
                        .ok_or_else(|| ConfigError::MissingField(field("image repository")))?;
                    let tag = string_prop(child, "tag").unwrap_or_else(|| "latest".to_string());
                    let container =
                        string_prop(child, "container").unwrap_or_else(|| name.clone());
                    set_operation(Operation::ImageBuild {
                        repository,
                        tag,
                        container,
                    })?;
                }
                "provision" => {
                    let stack = first_string_arg(child)
                        .or_else(|| string_prop(child, "stack"))
                        .ok_or_else(|| ConfigError::MissingField(field("provision stack")))?;
                    let mut parameters = BTreeMap::new();
                    if let Some(params) = child.children() {
                        for param in params.nodes() {
                            if param.name().value() == "param" {
                                if let [key, value] = string_args(param).as_slice() {
                                    parameters.insert(key.clone(), value.clone());
                                }
                            }
                        }
                    }
                    set_operation(Operation::Provision { stack, parameters })?;
                }
                "deploy" => {
                    let service = string_prop(child, "service")
                        .ok_or_else(|| ConfigError::MissingField(field("deploy service")))?;
                    let container = string_prop(child, "container");
                    set_operation(Operation::Deploy { service, container })?;
                }
                "env" => env.extend(string_map(child)),
                "secret" => match string_args(child).as_slice() {
                    [var, secret_name] => {
                        secrets.insert(var.clone(), secret_name.clone());
                    }
                    [same] => {
                        secrets.insert(same.clone(), same.clone());
                    }
                    _ => {
                        return Err(ConfigError::invalid(
                            field("secret"),
                            "expected `secret \"ENV_VAR\" \"secret-name\"`",
                        ));
                    }
                },
                "timeout-secs" => timeout = Some(secs_arg(child, &field("timeout-secs"))?),
                _ => {}
            }
        }
    }

    if !commands.is_empty() {
        set_operation(Operation::Run {
            commands: commands.clone(),
        })?;
    }

    let operation = operation.ok_or_else(|| ConfigError::MissingField(field("operation")))?;

    for text in commands.iter().chain(env.values()) {
        if let Some(reference) = find_secret_references(text).into_iter().next() {
            return Err(ConfigError::invalid(
                field("environment"),
                format!(
                    "${{{}}} is not interpolated; declare it with a `secret` node",
                    reference
                ),
            ));
        }
    }

    let mut action = Action::new(name, operation);
    action.inputs = inputs;
    action.outputs = outputs;
    action.env = env;
    action.secrets = secrets;
    action.timeout = timeout;
    Ok(action)
}
