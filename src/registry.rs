//! Server proxy kinds and the catalogue they are registered in
//!
//! A kind knows how to build the command line for one of its instances and,
//! optionally, how to adjust the proxy behaviour in front of it. The
//! [`Registry`] is assembled once at startup and is read-only afterwards.

use crate::config::{Config, KindConfig, LifecycleTimings, PathMode};
use crate::error::SupervisorError;
use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::{HeaderMap, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Kind-specific launch parameters, e.g. `{"workspace": "/home/me/project"}`.
///
/// Serialization is deterministic (object keys are sorted), so the serialized
/// form doubles as the dedup key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LaunchContext(pub Value);

impl LaunchContext {
    pub fn empty() -> Self {
        LaunchContext(Value::Object(Default::default()))
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn dedup_key(&self) -> String {
        self.0.to_string()
    }
}

impl From<Value> for LaunchContext {
    fn from(value: Value) -> Self {
        LaunchContext(value)
    }
}

/// Everything a kind may use to build an instance's command
#[derive(Debug, Clone, Copy)]
pub struct CommandContext<'a> {
    pub instance_id: &'a str,
    pub kind: &'a str,
    /// Port allocated for the instance
    pub port: u16,
    /// Internal instance path (no home prefix), with a trailing slash
    pub base_path: &'a str,
    /// Public instance path (with home prefix), with a trailing slash
    pub public_path: &'a str,
    pub context: &'a LaunchContext,
}

/// Command produced by a kind for one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    /// Program followed by its arguments
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    /// Port the tool will listen on, usually the allocated one echoed back
    pub port: u16,
    /// Health check path, overriding the one derived from the path mode
    pub validation_path: Option<String>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchCommand {
    pub fn new(command: Vec<String>, port: u16) -> Self {
        Self {
            command,
            env: HashMap::new(),
            port,
            validation_path: None,
            working_dir: None,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_validation_path(mut self, path: impl Into<String>) -> Self {
        self.validation_path = Some(path.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Instance a proxied request is being forwarded to
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    pub instance_id: String,
    pub kind: String,
    pub port: u16,
    /// Public instance path, with a trailing slash
    pub base_path: String,
}

pub type HookResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Per-kind customization of proxied traffic
pub trait ProxyHook: Send + Sync {
    /// Answer a request locally instead of forwarding it
    fn intercept(
        &self,
        _method: &Method,
        _path: &str,
        _headers: &HeaderMap,
        _target: &ProxyTarget,
    ) -> Option<HookResponse> {
        None
    }

    /// Adjust headers of the request sent upstream
    fn on_proxy_request(&self, _headers: &mut HeaderMap, _target: &ProxyTarget) {}

    /// Adjust headers of the upstream response before it is returned
    fn on_proxy_response(
        &self,
        _status: StatusCode,
        _headers: &mut HeaderMap,
        _target: &ProxyTarget,
    ) {
    }
}

/// Proxy behaviour for a kind
#[derive(Clone)]
pub struct ProxyOptions {
    pub path_mode: PathMode,
    /// Rewrite `Location: http://localhost:<port>/...` to the public path
    pub rewrite_location: bool,
    /// Send the instance address as `Host`/`Origin` upstream
    pub change_origin: bool,
    pub hook: Option<Arc<dyn ProxyHook>>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            path_mode: PathMode::Strip,
            rewrite_location: true,
            change_origin: true,
            hook: None,
        }
    }
}

impl fmt::Debug for ProxyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyOptions")
            .field("path_mode", &self.path_mode)
            .field("rewrite_location", &self.rewrite_location)
            .field("change_origin", &self.change_origin)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

/// A launchable tool type
pub trait ServerProxyKind: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str {
        self.id()
    }

    fn build_command(&self, ctx: &CommandContext<'_>) -> anyhow::Result<LaunchCommand>;

    /// Proxy options for instances of this kind, given the kind mount path
    fn build_middleware(&self, _base_path: &str, base: ProxyOptions) -> ProxyOptions {
        base
    }

    /// Lifecycle timings for instances of this kind
    fn timings(&self, defaults: &LifecycleTimings) -> LifecycleTimings {
        *defaults
    }
}

/// Ordered, immutable catalogue of kinds
#[derive(Clone, Default)]
pub struct Registry {
    kinds: Vec<Arc<dyn ServerProxyKind>>,
    index: HashMap<String, usize>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registry holding every template kind of the configuration
    pub fn from_config(config: &Config) -> Result<Self, SupervisorError> {
        let mut builder = Self::builder();
        for (id, kind) in &config.kinds {
            builder = builder.register(TemplateKind::new(id, kind.clone()))?;
        }
        Ok(builder.build())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn ServerProxyKind>> {
        self.index.get(id).map(|&i| &self.kinds[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Kinds in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ServerProxyKind>> {
        self.kinds.iter()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.kinds.iter().map(|k| k.id())).finish()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    kinds: Vec<Arc<dyn ServerProxyKind>>,
}

impl RegistryBuilder {
    pub fn register<K>(self, kind: K) -> Result<Self, SupervisorError>
    where
        K: ServerProxyKind + 'static,
    {
        self.register_arc(Arc::new(kind))
    }

    pub fn register_arc(mut self, kind: Arc<dyn ServerProxyKind>) -> Result<Self, SupervisorError> {
        if self.kinds.iter().any(|k| k.id() == kind.id()) {
            return Err(SupervisorError::DuplicateKind(kind.id().to_string()));
        }
        self.kinds.push(kind);
        Ok(self)
    }

    pub fn build(self) -> Registry {
        let index = self
            .kinds
            .iter()
            .enumerate()
            .map(|(i, k)| (k.id().to_string(), i))
            .collect();
        Registry {
            kinds: self.kinds,
            index,
        }
    }
}

/// Kind whose command comes from a configuration template.
///
/// Templates may use `{port}`, `{instance_id}`, `{kind}`, `{base_path}`,
/// `{public_path}`, `{context}` (the whole context as JSON) and
/// `{context.<field>}`. `{{` and `}}` produce literal braces.
#[derive(Debug, Clone)]
pub struct TemplateKind {
    id: String,
    name: String,
    config: KindConfig,
}

impl TemplateKind {
    pub fn new(id: &str, config: KindConfig) -> Self {
        let name = config.name.clone().unwrap_or_else(|| id.to_string());
        Self {
            id: id.to_string(),
            name,
            config,
        }
    }
}

impl ServerProxyKind for TemplateKind {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn build_command(&self, ctx: &CommandContext<'_>) -> anyhow::Result<LaunchCommand> {
        let render = |template: &str| render_template(template, ctx).map_err(anyhow::Error::msg);

        let command = self
            .config
            .command
            .to_args()
            .map_err(anyhow::Error::msg)?
            .iter()
            .map(|arg| render(arg))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut launch = LaunchCommand::new(command, ctx.port);
        launch.env.insert("PORT".to_string(), ctx.port.to_string());
        for (key, value) in &self.config.env {
            launch.env.insert(key.clone(), render(value)?);
        }
        if let Some(dir) = &self.config.working_dir {
            launch.working_dir = Some(PathBuf::from(render(dir)?));
        }
        if let Some(path) = &self.config.validation_path {
            launch.validation_path = Some(render(path)?);
        }

        Ok(launch)
    }

    fn build_middleware(&self, _base_path: &str, mut base: ProxyOptions) -> ProxyOptions {
        base.path_mode = self.config.path_mode;
        base.rewrite_location = self.config.rewrite_location;
        base
    }

    fn timings(&self, defaults: &LifecycleTimings) -> LifecycleTimings {
        self.config.timings(defaults)
    }
}

/// Check placeholder syntax and names without rendering
pub fn check_template(template: &str) -> Result<(), String> {
    expand(template, |name| check_placeholder(name).map(|_| String::new())).map(|_| ())
}

/// Substitute placeholders from a command context
pub fn render_template(template: &str, ctx: &CommandContext<'_>) -> Result<String, String> {
    expand(template, |name| {
        check_placeholder(name)?;
        match name {
            "port" => Ok(ctx.port.to_string()),
            "instance_id" => Ok(ctx.instance_id.to_string()),
            "kind" => Ok(ctx.kind.to_string()),
            "base_path" => Ok(ctx.base_path.to_string()),
            "public_path" => Ok(ctx.public_path.to_string()),
            "context" => Ok(ctx.context.0.to_string()),
            _ => {
                let field = name.trim_start_matches("context.");
                match ctx.context.get(field) {
                    Some(Value::String(s)) => Ok(s.clone()),
                    Some(other) => Ok(other.to_string()),
                    None => Err(format!("context has no field '{}'", field)),
                }
            }
        }
    })
}

fn check_placeholder(name: &str) -> Result<(), String> {
    match name {
        "port" | "instance_id" | "kind" | "base_path" | "public_path" | "context" => Ok(()),
        _ if name
            .strip_prefix("context.")
            .is_some_and(|field| !field.is_empty()) =>
        {
            Ok(())
        }
        _ => Err(format!("unknown placeholder '{{{}}}'", name)),
    }
}

fn expand<F>(template: &str, mut resolve: F) -> Result<String, String>
where
    F: FnMut(&str) -> Result<String, String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if let Some(after) = tail.strip_prefix("{{") {
            out.push('{');
            rest = after;
        } else if let Some(after) = tail.strip_prefix("}}") {
            out.push('}');
            rest = after;
        } else if tail.starts_with('}') {
            return Err(format!("unmatched '}}' in '{}'", template));
        } else {
            let end = tail
                .find('}')
                .ok_or_else(|| format!("unterminated placeholder in '{}'", template))?;
            out.push_str(&resolve(&tail[1..end])?);
            rest = &tail[end + 1..];
        }
    }

    out.push_str(rest);
    Ok(out)
}
