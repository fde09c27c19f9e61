//! Versioned registries for orchestrations and activities.
//!
//! Orchestrations can be registered at several semver versions. A new
//! execution resolves its version through the name's [`VersionPolicy`] and
//! pins it in `OrchestrationStarted`; replay always uses the pinned version.
//! Activities live at a single default version.

use super::{ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::_typed_codec::{Codec, Json};
use crate::{ActivityContext, OrchestrationContext};
use semver::Version;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionPolicy {
    Latest,
    Exact(Version),
}

/// Immutable name → version → handler map with per-name version policy.
pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, BTreeMap<Version, Arc<H>>>>,
    pub(crate) policy: Arc<Mutex<HashMap<String, VersionPolicy>>>,
}

impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
            policy: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, BTreeMap<Version, Arc<H>>>,
    policy: HashMap<String, VersionPolicy>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            policy: HashMap::new(),
            errors: Vec::new(),
        }
    }

    fn policies(&self) -> std::sync::MutexGuard<'_, HashMap<String, VersionPolicy>> {
        self.policy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve a handler through the name's version policy.
    pub fn resolve_handler(&self, name: &str) -> Option<(Version, Arc<H>)> {
        let pol = self.policies().get(name).cloned().unwrap_or(VersionPolicy::Latest);
        let versions = self.inner.get(name);
        let result = match &pol {
            VersionPolicy::Latest => versions
                .and_then(|m| m.iter().next_back())
                .map(|(v, h)| (v.clone(), Arc::clone(h))),
            VersionPolicy::Exact(v) => versions
                .and_then(|m| m.get(v))
                .map(|h| (v.clone(), Arc::clone(h))),
        };
        if result.is_none() {
            self.log_registry_miss(name, None, Some(&pol));
        }
        result
    }

    pub fn resolve_handler_exact(&self, name: &str, v: &Version) -> Option<Arc<H>> {
        let result = self.inner.get(name).and_then(|m| m.get(v)).cloned();
        if result.is_none() {
            self.log_registry_miss(name, Some(v), None);
        }
        result
    }

    /// Resolve by an optional version string: exact when given, policy otherwise.
    pub fn resolve(&self, name: &str, version: Option<&str>) -> Option<(Version, Arc<H>)> {
        match version.filter(|v| !v.is_empty()) {
            Some(v) => {
                let parsed = Version::parse(v).ok()?;
                self.resolve_handler_exact(name, &parsed).map(|h| (parsed, h))
            }
            None => self.resolve_handler(name),
        }
    }

    pub fn set_version_policy(&self, name: &str, policy: VersionPolicy) {
        self.policies().insert(name.to_string(), policy);
    }

    pub fn list_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    pub fn list_versions(&self, name: &str) -> Vec<Version> {
        self.inner
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    fn log_registry_miss(&self, name: &str, requested_version: Option<&Version>, policy: Option<&VersionPolicy>) {
        tracing::debug!(
            target: "duroflow::runtime::registry",
            requested_name = %name,
            requested_version = ?requested_version,
            requested_policy = ?policy,
            available_versions = ?self.list_versions(name),
            registered_names = ?self.list_names(),
            "registry lookup miss"
        );
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    /// Build, logging any registration errors.
    pub fn build(self) -> Registry<H> {
        for e in &self.errors {
            tracing::warn!(target: "duroflow::runtime::registry", error = %e, "registration error ignored");
        }
        Registry {
            inner: Arc::new(self.map),
            policy: Arc::new(Mutex::new(self.policy)),
        }
    }

    /// Build, failing on any duplicate or invalid registration.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    pub fn merge_registry(mut self, other: Registry<H>, kind: &str) -> Self {
        for (name, versions) in other.inner.iter() {
            let entry = self.map.entry(name.clone()).or_default();
            for (version, handler) in versions {
                if entry.contains_key(version) {
                    self.errors.push(format!("duplicate {kind} in merge: {name}@{version}"));
                } else {
                    entry.insert(version.clone(), Arc::clone(handler));
                }
            }
        }
        self
    }

    /// Insert `handler` at `version`, recording duplicates and
    /// non-increasing versions as errors.
    fn insert(&mut self, name: String, version: Version, handler: Arc<H>, kind: &str) {
        let entry = self.map.entry(name.clone()).or_default();
        if entry.contains_key(&version) {
            self.errors.push(format!("duplicate {kind} registration: {name}@{version}"));
            return;
        }
        if let Some((latest, _)) = entry.iter().next_back()
            && version <= *latest
        {
            self.errors.push(format!(
                "non-monotonic {kind} version for {name}: {version} is not later than {latest}"
            ));
            return;
        }
        entry.insert(version, handler);
    }

    fn parse_version(&mut self, name: &str, version: &str) -> Option<Version> {
        match Version::parse(version) {
            Ok(v) => Some(v),
            Err(e) => {
                self.errors.push(format!("invalid version '{version}' for {name}: {e}"));
                None
            }
        }
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.register_versioned(name, DEFAULT_VERSION.to_string(), f)
    }

    pub fn register_versioned<F, Fut>(mut self, name: impl Into<String>, version: impl AsRef<str>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        if let Some(v) = self.parse_version(&name, version.as_ref()) {
            self.insert(name, v, Arc::new(FnOrchestration(f)), "orchestration");
        }
        self
    }

    /// Register with JSON-decoded input and JSON-encoded output.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        self.register(name, move |ctx: OrchestrationContext, input: String| {
            let f = f.clone();
            async move {
                let input: In = Json::decode(&input)?;
                let out: Out = f(ctx, input).await?;
                Json::encode(&out)
            }
        })
    }

    pub fn merge(self, other: OrchestrationRegistry) -> Self {
        self.merge_registry(other, "orchestration")
    }

    pub fn set_policy(mut self, name: impl Into<String>, policy: VersionPolicy) -> Self {
        self.policy.insert(name.into(), policy);
        self
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        self.insert(name, DEFAULT_VERSION, Arc::new(FnActivity(f)), "activity");
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |ctx: ActivityContext, input: String| {
            let f = Arc::clone(&f);
            async move {
                let input: In = Json::decode(&input)?;
                let out: Out = f(ctx, input).await?;
                Json::encode(&out)
            }
        })
    }

    pub fn merge(self, other: ActivityRegistry) -> Self {
        self.merge_registry(other, "activity")
    }
}
