// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Plugins and Functions
//!
//! A plugin is a named set of functions a host offers to its agents. The
//! serializable descriptor (`Plugin`, `Function`, `Parameter`) travels in
//! `host_connect` / `host_welcome`; the executable body (`PluginBody`) is
//! attached locally at registration time and never leaves the host.
//!
//! Identity is owned by the Authority, shape by the Host:
//! [`reconcile_plugins`] copies Authority-issued ids onto the local
//! descriptors without touching the local function set.
//!
//! # Architecture
//!
//! - **Layer:** Domain
//! - **Purpose:** Plugin registration records and welcome reconciliation

use futures::future::BoxFuture;
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::data::Data;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginProvider {
    #[default]
    Prompt,
    SkPlugin,
    Collection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginSource {
    UserDefined,
    #[default]
    HostDefined,
    UploadPackage,
    PublicRepository,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub parameter_type: Option<String>,
}

impl Parameter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameter_type: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default)]
    pub inputs: Vec<Parameter>,
    #[serde(default)]
    pub outputs: Vec<Parameter>,
    /// Name of the credential this function may request, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_connection: Option<String>,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: None,
            instruction: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            required_connection: None,
        }
    }

    pub fn requiring_connection(mut self, connection: impl Into<String>) -> Self {
        self.required_connection = Some(connection.into());
        self
    }
}

/// Capability attached to a function's registration: the one named
/// credential the function is allowed to request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionConnection {
    pub function_id: String,
    pub required_connection_name: String,
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Plugin '{0}' has no executable body on this host")]
    NoBody(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Function failed: {0}")]
    Execution(String),
}

pub type NativeFunction = Arc<dyn Fn(Data) -> BoxFuture<'static, Result<Data, PluginError>> + Send + Sync>;

/// Executable part of a plugin, built once at registration.
#[derive(Clone)]
pub enum PluginBody {
    HostDefined(HashMap<String, NativeFunction>),
    PromptDefined {
        template: String,
        parameters: Vec<Parameter>,
    },
}

impl fmt::Debug for PluginBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostDefined(table) => {
                let mut names: Vec<&String> = table.keys().collect();
                names.sort();
                f.debug_tuple("HostDefined").field(&names).finish()
            }
            Self::PromptDefined { template, parameters } => f
                .debug_struct("PromptDefined")
                .field("template", template)
                .field("parameters", parameters)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plugin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub provider: PluginProvider,
    #[serde(default)]
    pub source: PluginSource,
    #[serde(default)]
    pub functions: Vec<Function>,
    /// Local only; `None` for descriptors received over the bus.
    #[serde(skip)]
    pub body: Option<PluginBody>,
}

impl PartialEq for Plugin {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.unique_name == other.unique_name
            && self.description == other.description
            && self.provider == other.provider
            && self.source == other.source
            && self.functions == other.functions
    }
}

impl Plugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            unique_name: None,
            description: None,
            provider: PluginProvider::default(),
            source: PluginSource::default(),
            functions: Vec::new(),
            body: None,
        }
    }

    /// Host-defined plugin backed by native functions. One descriptor
    /// function is registered per table entry.
    pub fn host_defined(name: impl Into<String>, table: HashMap<String, NativeFunction>) -> Self {
        let mut plugin = Self::new(name);
        plugin.provider = PluginProvider::SkPlugin;
        plugin.source = PluginSource::HostDefined;
        let mut names: Vec<&String> = table.keys().collect();
        names.sort();
        plugin.functions = names.into_iter().map(|n| Function::new(n.clone())).collect();
        plugin.body = Some(PluginBody::HostDefined(table));
        plugin
    }

    pub fn prompt_defined(
        name: impl Into<String>,
        template: impl Into<String>,
        parameters: Vec<Parameter>,
    ) -> Self {
        let mut plugin = Self::new(name);
        plugin.provider = PluginProvider::Prompt;
        plugin.body = Some(PluginBody::PromptDefined {
            template: template.into(),
            parameters,
        });
        plugin
    }

    pub fn with_unique_name(mut self, unique_name: impl Into<String>) -> Self {
        self.unique_name = Some(unique_name.into());
        self
    }

    pub fn with_function(mut self, function: Function) -> Self {
        self.functions.push(function);
        self
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Capability descriptors for functions that have both an id and a
    /// required connection.
    pub fn connections(&self) -> Vec<FunctionConnection> {
        self.functions
            .iter()
            .filter_map(|f| {
                Some(FunctionConnection {
                    function_id: f.id.clone()?,
                    required_connection_name: f.required_connection.clone()?,
                })
            })
            .collect()
    }

    /// Run `function` with `input`.
    ///
    /// Prompt-defined plugins render their template with the input fields and
    /// return it under `prompt`.
    pub async fn invoke(&self, function: &str, input: Data) -> Result<Data, PluginError> {
        match &self.body {
            Some(PluginBody::HostDefined(table)) => {
                let native = table
                    .get(function)
                    .ok_or_else(|| PluginError::FunctionNotFound(function.to_string()))?
                    .clone();
                native(input).await
            }
            Some(PluginBody::PromptDefined { template, .. }) => {
                if self.function(function).is_none() && function != self.name {
                    return Err(PluginError::FunctionNotFound(function.to_string()));
                }
                let mut handlebars = Handlebars::new();
                handlebars.set_strict_mode(false);
                let context: HashMap<&str, &str> = input.iter().collect();
                let prompt = handlebars
                    .render_template(template, &context)
                    .map_err(|e| PluginError::Template(e.to_string()))?;
                Ok(Data::new().with("prompt", prompt))
            }
            None => Err(PluginError::NoBody(self.name.clone())),
        }
    }
}

/// Copy Authority-issued ids onto `local`.
///
/// Plugins match by unique name, falling back to name. A matched plugin
/// takes only the Authority's plugin id and, for functions matched by name,
/// only the function id; local functions are never added or removed.
/// Unmatched Authority plugins are appended as-is.
pub fn reconcile_plugins(local: &mut Vec<Plugin>, authority: Vec<Plugin>) {
    for remote in authority {
        let matched = local.iter_mut().find(|candidate| match (&candidate.unique_name, &remote.unique_name) {
            (Some(a), Some(b)) => a == b,
            _ => candidate.name == remote.name,
        });

        match matched {
            Some(plugin) => {
                plugin.id = remote.id.clone();
                for function in plugin.functions.iter_mut() {
                    if let Some(remote_fn) = remote.functions.iter().find(|f| f.name == function.name) {
                        function.id = remote_fn.id.clone();
                    }
                }
            }
            None => local.push(remote),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function_with_id(name: &str, id: &str) -> Function {
        let mut f = Function::new(name);
        f.id = Some(id.to_string());
        f
    }

    #[test]
    fn test_reconcile_preserves_local_shape() {
        let mut local = vec![Plugin::new("search")
            .with_unique_name("acme/search")
            .with_function(function_with_id("f1", "old-1"))
            .with_function(function_with_id("f2", "old-2"))];

        let mut remote = Plugin::new("search").with_unique_name("acme/search");
        remote.id = Some("p-100".to_string());
        remote = remote.with_function(function_with_id("f1", "new-1"));

        reconcile_plugins(&mut local, vec![remote]);

        assert_eq!(local.len(), 1);
        let plugin = &local[0];
        assert_eq!(plugin.id.as_deref(), Some("p-100"));
        let names: Vec<&str> = plugin.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["f1", "f2"]);
        assert_eq!(plugin.function("f1").unwrap().id.as_deref(), Some("new-1"));
        assert_eq!(plugin.function("f2").unwrap().id.as_deref(), Some("old-2"));
    }

    #[test]
    fn test_reconcile_falls_back_to_name_and_appends_unmatched() {
        let mut local = vec![Plugin::new("mail")];
        let mut remote_mail = Plugin::new("mail");
        remote_mail.id = Some("p-1".to_string());
        let mut remote_new = Plugin::new("calendar");
        remote_new.id = Some("p-2".to_string());

        reconcile_plugins(&mut local, vec![remote_mail, remote_new]);

        assert_eq!(local.len(), 2);
        assert_eq!(local[0].id.as_deref(), Some("p-1"));
        assert_eq!(local[1].name, "calendar");
    }

    #[test]
    fn test_reconcile_unique_name_mismatch_does_not_match_on_name() {
        let mut local = vec![Plugin::new("search").with_unique_name("acme/search")];
        let mut remote = Plugin::new("search").with_unique_name("other/search");
        remote.id = Some("p-9".to_string());

        reconcile_plugins(&mut local, vec![remote]);

        assert_eq!(local.len(), 2);
        assert_eq!(local[0].id, None);
    }

    #[test]
    fn test_body_is_not_serialized() {
        let plugin = Plugin::prompt_defined("greet", "Hello {{name}}", vec![Parameter::new("name")]);
        let json = serde_json::to_string(&plugin).unwrap();
        let back: Plugin = serde_json::from_str(&json).unwrap();
        assert!(back.body.is_none());
        assert_eq!(back, plugin);
    }

    #[test]
    fn test_connections_require_id_and_connection() {
        let mut with_id = Function::new("chat").requiring_connection("OpenAI");
        with_id.id = Some("fn-1".to_string());
        let plugin = Plugin::new("llm")
            .with_function(with_id)
            .with_function(Function::new("draft").requiring_connection("OpenAI"));

        assert_eq!(
            plugin.connections(),
            vec![FunctionConnection {
                function_id: "fn-1".to_string(),
                required_connection_name: "OpenAI".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_invoke_host_defined() {
        let echo: NativeFunction = Arc::new(|input: Data| -> BoxFuture<'static, Result<Data, PluginError>> {
            Box::pin(async move { Ok(input) })
        });
        let plugin = Plugin::host_defined("util", HashMap::from([("echo".to_string(), echo)]));

        assert_eq!(plugin.functions.len(), 1);
        let out = plugin.invoke("echo", Data::new().with("x", "1")).await.unwrap();
        assert_eq!(out.get("x"), Some("1"));
        assert!(matches!(
            plugin.invoke("missing", Data::new()).await,
            Err(PluginError::FunctionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invoke_prompt_defined() {
        let plugin = Plugin::prompt_defined("greet", "Hello {{name}}", vec![Parameter::new("name")]);
        let out = plugin.invoke("greet", Data::new().with("name", "Ada")).await.unwrap();
        assert_eq!(out.get("prompt"), Some("Hello Ada"));

        let descriptor = Plugin::new("remote");
        assert!(matches!(descriptor.invoke("remote", Data::new()).await, Err(PluginError::NoBody(_))));
    }
}
