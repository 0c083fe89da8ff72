//! dbt project scaffolding around converted models.
//!
//! Everything here renders text; [`ProjectFile::write_to`] is the only
//! function that touches the filesystem.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Captures;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::classifier::ConversionPattern;
use crate::engine::ConversionArtifact;
use crate::error::ConvertResult;
use crate::platform::Platform;
use crate::rewriter::{ValidationGuard, param_reference};

/// Name of the helper macro rendering a Jinja value as a SQL literal.
pub const LITERAL_MACRO: &str = "sql_literal";

/// `[project]` settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSettings {
    /// Project name; defaults to `mssql_conversion_<platform>`.
    pub name: Option<String>,
    /// dbt profile the project runs under.
    pub profile: String,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            name: None,
            profile: "default".to_string(),
        }
    }
}

impl ProjectSettings {
    pub fn project_name(&self, platform: Platform) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("mssql_conversion_{}", platform.key()))
    }
}

/// One generated file, relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectFile {
    pub path: PathBuf,
    pub contents: String,
}

impl ProjectFile {
    fn new(path: impl Into<PathBuf>, contents: String) -> Self {
        Self {
            path: path.into(),
            contents,
        }
    }

    /// Write below `root`, creating parent directories.
    pub fn write_to(&self, root: &Path) -> ConvertResult<PathBuf> {
        let path = root.join(&self.path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &self.contents)?;
        Ok(path)
    }
}

/// Accessor macro `get_<model>_sql()` selecting from the model.
pub fn model_macro(model: &str) -> String {
    format!(
        "{{% macro get_{model}_sql() %}}\n    select * from {{{{ ref('{model}') }}}}\n{{% endmacro %}}\n"
    )
}

/// Macro turning a Jinja value into a SQL literal for guard queries.
pub fn literal_macro() -> String {
    format!(
        "{{% macro {LITERAL_MACRO}(value) -%}}\n\
         {{%- if value is none -%}}null\n\
         {{%- elif value is number -%}}{{{{ value }}}}\n\
         {{%- else -%}}'{{{{ value | replace(\"'\", \"''\") }}}}'\n\
         {{%- endif -%}}\n\
         {{%- endmacro %}}\n"
    )
}

/// Validation macro: evaluates the guard condition at run time and raises
/// a compiler error with the guard's message when it holds.
pub fn validation_macro(guard: &ValidationGuard) -> String {
    let mut condition = guard.condition.clone();
    for param in &guard.params {
        let reference = param_reference(param);
        condition = reference
            .replace_all(&condition, |c: &Captures<'_>| {
                let prefix_len = c[0].len() - c[1].len();
                format!("{}{{{{ {LITERAL_MACRO}({param}) }}}}", &c[0][..prefix_len])
            })
            .into_owned();
    }
    let message = guard.message.replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        "{{% macro {name}({args}) %}}\n\
         {{% if execute %}}\n\
         \x20   {{% set check %}}\n\
         \x20       select case when {condition} then 1 else 0 end as failed\n\
         \x20   {{% endset %}}\n\
         \x20   {{% if run_query(check).columns[0].values()[0] == 1 %}}\n\
         \x20       {{{{ exceptions.raise_compiler_error(\"{message}\") }}}}\n\
         \x20   {{% endif %}}\n\
         {{% endif %}}\n\
         {{% endmacro %}}\n",
        name = guard.macro_name,
        args = guard.params.join(", "),
    )
}

#[derive(Debug, Serialize)]
struct SchemaFile {
    version: u8,
    models: Vec<ModelEntry>,
}

#[derive(Debug, Serialize)]
struct ModelEntry {
    name: String,
    description: String,
    meta: ModelMeta,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    columns: Vec<ColumnEntry>,
}

#[derive(Debug, Serialize)]
struct ModelMeta {
    pattern: ConversionPattern,
    platform: Platform,
    automation_score: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_table: Option<String>,
}

#[derive(Debug, Serialize)]
struct ColumnEntry {
    name: String,
    tests: Vec<&'static str>,
}

/// `schema.yml` with one entry per model.
pub fn schema_yaml(artifacts: &[ConversionArtifact]) -> ConvertResult<String> {
    let models = artifacts
        .iter()
        .map(|a| {
            let key = &a.config.unique_key;
            let tests: &[&'static str] = if key.len() == 1 {
                &["unique", "not_null"]
            } else {
                &["not_null"]
            };
            ModelEntry {
                name: a.name.clone(),
                description: format!(
                    "Converted from {}",
                    a.procedure_name.as_deref().unwrap_or(&a.name)
                ),
                meta: ModelMeta {
                    pattern: a.pattern,
                    platform: a.platform,
                    automation_score: a.score,
                    target_table: a.target_table.clone(),
                },
                columns: key
                    .iter()
                    .map(|column| ColumnEntry {
                        name: column.clone(),
                        tests: tests.to_vec(),
                    })
                    .collect(),
            }
        })
        .collect();
    Ok(serde_yaml::to_string(&SchemaFile { version: 2, models })?)
}

#[derive(Debug, Serialize)]
struct SourcesFile {
    version: u8,
    sources: Vec<SourceEntry>,
}

#[derive(Debug, Serialize)]
struct SourceEntry {
    name: String,
    tables: Vec<TableEntry>,
}

#[derive(Debug, Serialize)]
struct TableEntry {
    name: String,
}

/// `sources.yml` grouping every referenced source table by schema, or
/// `None` when no model reads from a source.
pub fn sources_yaml(artifacts: &[ConversionArtifact]) -> ConvertResult<Option<String>> {
    let mut by_schema: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for source in artifacts.iter().flat_map(|a| &a.sources) {
        let tables = by_schema.entry(source.schema.as_str()).or_default();
        if !tables.contains(&source.name.as_str()) {
            tables.push(&source.name);
        }
    }
    if by_schema.is_empty() {
        return Ok(None);
    }
    let sources = by_schema
        .into_iter()
        .map(|(schema, mut tables)| {
            tables.sort_unstable();
            SourceEntry {
                name: schema.to_string(),
                tables: tables
                    .into_iter()
                    .map(|name| TableEntry {
                        name: name.to_string(),
                    })
                    .collect(),
            }
        })
        .collect();
    Ok(Some(serde_yaml::to_string(&SourcesFile { version: 2, sources })?))
}

#[derive(Debug, Serialize)]
struct DbtProject {
    name: String,
    version: &'static str,
    #[serde(rename = "config-version")]
    config_version: u8,
    profile: String,
    #[serde(rename = "model-paths")]
    model_paths: Vec<&'static str>,
    #[serde(rename = "macro-paths")]
    macro_paths: Vec<&'static str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    vars: BTreeMap<String, String>,
}

/// Variables of all models; the first value seen for a name wins.
pub fn merged_vars(artifacts: &[ConversionArtifact]) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for artifact in artifacts {
        for (name, value) in &artifact.vars {
            match vars.get(name) {
                Some(existing) if existing != value => {
                    warn!(var = %name, model = %artifact.name, "conflicting variable value ignored");
                }
                Some(_) => {}
                None => {
                    vars.insert(name.clone(), value.clone());
                }
            }
        }
    }
    vars
}

/// `dbt_project.yml`.
pub fn project_yaml(
    artifacts: &[ConversionArtifact],
    platform: Platform,
    settings: &ProjectSettings,
    extra_vars: &BTreeMap<String, String>,
) -> ConvertResult<String> {
    let mut vars = merged_vars(artifacts);
    for (name, value) in extra_vars {
        vars.entry(name.clone()).or_insert_with(|| value.clone());
    }
    let project = DbtProject {
        name: settings.project_name(platform),
        version: "1.0.0",
        config_version: 2,
        profile: settings.profile.clone(),
        model_paths: vec!["models"],
        macro_paths: vec!["macros"],
        vars,
    };
    Ok(serde_yaml::to_string(&project)?)
}

/// Every file of a project holding `artifacts`.
pub fn scaffold(
    artifacts: &[ConversionArtifact],
    platform: Platform,
    settings: &ProjectSettings,
    extra_vars: &BTreeMap<String, String>,
) -> ConvertResult<Vec<ProjectFile>> {
    let mut files = Vec::new();
    let mut guards: BTreeMap<&str, &ValidationGuard> = BTreeMap::new();

    for artifact in artifacts {
        files.push(ProjectFile::new(
            format!("models/{}.sql", artifact.name),
            artifact.text.clone(),
        ));
        files.push(ProjectFile::new(
            format!("macros/get_{}_sql.sql", artifact.name),
            model_macro(&artifact.name),
        ));
        for guard in &artifact.validations {
            match guards.get(guard.macro_name.as_str()) {
                Some(existing) if existing.condition != guard.condition => {
                    warn!(macro_name = %guard.macro_name, model = %artifact.name, "validation macro already defined with another condition");
                }
                Some(_) => {}
                None => {
                    guards.insert(&guard.macro_name, guard);
                }
            }
        }
    }

    if !guards.is_empty() {
        files.push(ProjectFile::new(
            format!("macros/{LITERAL_MACRO}.sql"),
            literal_macro(),
        ));
    }
    for (name, guard) in guards {
        files.push(ProjectFile::new(
            format!("macros/{name}.sql"),
            validation_macro(guard),
        ));
    }

    files.push(ProjectFile::new("models/schema.yml", schema_yaml(artifacts)?));
    if let Some(sources) = sources_yaml(artifacts)? {
        files.push(ProjectFile::new("models/sources.yml", sources));
    }
    files.push(ProjectFile::new(
        "dbt_project.yml",
        project_yaml(artifacts, platform, settings, extra_vars)?,
    ));
    Ok(files)
}
