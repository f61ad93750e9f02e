//! Fallback handler registration and resolution.
//!
//! Handlers are registered per owner type under a name, a parameter list and
//! a return type. A rejected call looks up the handler named by its spec on
//! the owner type and then on its supertypes. Two parameter lists qualify:
//! exactly the guarded method's parameters, or those parameters followed by
//! one [`FAILURE_PARAM`]. The first form wins when both exist.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{info, warn};

use super::acquire::Rejection;
use super::descriptor::CallSignature;

/// Parameter type name standing for the triggering [`Rejection`].
pub const FAILURE_PARAM: &str = "Rejection";

/// Everything a fallback handler receives.
pub struct FallbackCall {
    /// Instance the handler is invoked on
    pub target: Arc<dyn Any + Send + Sync>,
    /// The guarded call's original arguments
    pub args: Vec<Value>,
    /// Set only for handlers registered with a trailing failure parameter
    pub failure: Option<Rejection>,
}

impl FallbackCall {
    /// Downcast the target instance.
    pub fn target<T: Any>(&self) -> Option<&T> {
        self.target.downcast_ref::<T>()
    }
}

type FallbackFn<R> = Arc<dyn Fn(FallbackCall) -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>;

/// Which parameter list a resolved handler matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackArity {
    /// Same parameters as the guarded method
    Plain,
    /// Guarded method's parameters plus the rejection
    WithFailure,
}

#[derive(Clone)]
struct FallbackMethod {
    name: String,
    params: Vec<String>,
    returns: TypeId,
    handler: Arc<dyn Any + Send + Sync>,
}

#[derive(Default)]
struct TypeEntry {
    parent: Option<String>,
    methods: Vec<FallbackMethod>,
}

/// A resolved fallback handler.
#[derive(Clone)]
pub struct FallbackDescriptor {
    owner: String,
    name: String,
    params: Vec<String>,
    arity: FallbackArity,
    handler: Arc<dyn Any + Send + Sync>,
}

impl std::fmt::Debug for FallbackDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackDescriptor")
            .field("owner", &self.owner)
            .field("name", &self.name)
            .field("params", &self.params)
            .field("arity", &self.arity)
            .finish()
    }
}

impl FallbackDescriptor {
    /// Type the handler was found on (the owner or one of its supertypes).
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn arity(&self) -> FallbackArity {
        self.arity
    }

    /// Render as `owner:name(param1,param2)`.
    pub fn method_name(&self) -> String {
        format!("{}:{}({})", self.owner, self.name, self.params.join(","))
    }

    /// Invoke the handler on `target`.
    ///
    /// Returns `None` if the handler does not produce an `R`.
    pub fn invoke<R: 'static>(
        &self,
        target: Arc<dyn Any + Send + Sync>,
        args: &[Value],
        failure: Rejection,
    ) -> Option<BoxFuture<'static, anyhow::Result<R>>> {
        let handler = self.handler.downcast_ref::<FallbackFn<R>>()?;
        let failure = match self.arity {
            FallbackArity::Plain => None,
            FallbackArity::WithFailure => Some(failure),
        };
        Some(handler(FallbackCall {
            target,
            args: args.to_vec(),
            failure,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FallbackKey {
    owner: String,
    name: String,
}

/// Registry of fallback handlers plus the cache of resolved ones.
pub struct FallbackResolver {
    types: RwLock<HashMap<String, TypeEntry>>,
    cache: DashMap<FallbackKey, Arc<FallbackDescriptor>>,
    /// Serialises first-time resolution across all keys
    resolving: Mutex<()>,
    scans: AtomicUsize,
}

impl FallbackResolver {
    pub fn new() -> Self {
        Self {
            types: RwLock::new(HashMap::new()),
            cache: DashMap::new(),
            resolving: Mutex::new(()),
            scans: AtomicUsize::new(0),
        }
    }

    /// Declare a type and, optionally, the supertype searched after it.
    pub fn declare_type(&self, name: &str, parent: Option<&str>) {
        let mut types = self.types.write();
        types.entry(name.to_string()).or_default().parent = parent.map(str::to_string);
    }

    /// Register a handler taking the guarded method's parameters.
    pub fn register<R, F, Fut>(&self, owner: &str, name: &str, params: &[&str], handler: F)
    where
        R: Send + 'static,
        F: Fn(FallbackCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let params = params.iter().map(|p| p.to_string()).collect();
        self.insert_method::<R, F, Fut>(owner, name, params, handler);
    }

    /// Register a handler taking the guarded method's parameters followed by
    /// the rejection that triggered it.
    pub fn register_with_failure<R, F, Fut>(&self, owner: &str, name: &str, params: &[&str], handler: F)
    where
        R: Send + 'static,
        F: Fn(FallbackCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let params = params
            .iter()
            .map(|p| p.to_string())
            .chain(std::iter::once(FAILURE_PARAM.to_string()))
            .collect();
        self.insert_method::<R, F, Fut>(owner, name, params, handler);
    }

    fn insert_method<R, F, Fut>(&self, owner: &str, name: &str, params: Vec<String>, handler: F)
    where
        R: Send + 'static,
        F: Fn(FallbackCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let handler: FallbackFn<R> = Arc::new(move |call: FallbackCall| handler(call).boxed());
        let method = FallbackMethod {
            name: name.to_string(),
            params,
            returns: TypeId::of::<R>(),
            handler: Arc::new(handler),
        };
        self.types
            .write()
            .entry(owner.to_string())
            .or_default()
            .methods
            .push(method);
    }

    /// Find the fallback called `name` for a call whose target has type
    /// `target_type`.
    ///
    /// `declared_owner`, when set, replaces the target type as the place to
    /// look. Hits are cached per (owner, name); misses are not, so every call
    /// with an unresolvable fallback scans again.
    pub fn resolve(
        &self,
        target_type: &str,
        name: &str,
        declared_owner: Option<&str>,
        original: &CallSignature,
    ) -> Option<Arc<FallbackDescriptor>> {
        if name.trim().is_empty() {
            return None;
        }

        let owner = declared_owner.unwrap_or(target_type);
        let key = FallbackKey {
            owner: owner.to_string(),
            name: name.to_string(),
        };
        if let Some(hit) = self.cache.get(&key) {
            return Some(hit.clone());
        }

        let _resolving = self.resolving.lock();
        if let Some(hit) = self.cache.get(&key) {
            return Some(hit.clone());
        }

        let descriptor = Arc::new(self.scan(owner, name, original)?);
        self.cache.insert(key, descriptor.clone());
        Some(descriptor)
    }

    fn scan(&self, owner: &str, name: &str, original: &CallSignature) -> Option<FallbackDescriptor> {
        self.scans.fetch_add(1, Ordering::Relaxed);
        let types = self.types.read();

        let with_failure: Vec<String> = original
            .params
            .iter()
            .cloned()
            .chain(std::iter::once(FAILURE_PARAM.to_string()))
            .collect();

        let candidates = [
            (FallbackArity::Plain, original.params.as_slice()),
            (FallbackArity::WithFailure, with_failure.as_slice()),
        ];
        for (arity, params) in candidates {
            if let Some((found_on, method)) = find_method(&types, owner, name, original.returns(), params) {
                info!(fallback = %name, owner = %found_on, arity = ?arity, "Resolved fallback method");
                return Some(FallbackDescriptor {
                    owner: found_on.to_string(),
                    name: method.name.clone(),
                    params: method.params.clone(),
                    arity,
                    handler: method.handler.clone(),
                });
            }
        }

        warn!(
            fallback = %name,
            owner = %owner,
            params = ?original.params,
            returns = original.returns_name(),
            "Cannot find fallback method"
        );
        None
    }

    /// Number of full scans performed so far.
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::Relaxed)
    }

    /// Number of cached resolutions.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

impl Default for FallbackResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk `owner` and its supertypes for a method with this exact name,
/// return type and parameter list.
fn find_method<'a>(
    types: &'a HashMap<String, TypeEntry>,
    owner: &'a str,
    name: &str,
    returns: TypeId,
    params: &[String],
) -> Option<(&'a str, &'a FallbackMethod)> {
    let mut visited = HashSet::new();
    let mut current = Some(owner);

    while let Some(type_name) = current {
        if !visited.insert(type_name) {
            break;
        }
        let entry = types.get(type_name)?;
        let found = entry
            .methods
            .iter()
            .find(|m| m.name == name && m.returns == returns && m.params == params);
        if let Some(method) = found {
            return Some((type_name, method));
        }
        current = entry.parent.as_deref();
    }
    None
}

/// Looks up live instances of owner types.
pub trait InstanceProvider: Send + Sync {
    fn instance(&self, type_name: &str) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Instances registered by type name.
#[derive(Default)]
pub struct Instances {
    instances: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Instances {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&self, type_name: &str, instance: Arc<T>) {
        self.instances.insert(type_name.to_string(), instance);
    }
}

impl InstanceProvider for Instances {
    fn instance(&self, type_name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.instances.get(type_name).map(|i| i.value().clone())
    }
}
