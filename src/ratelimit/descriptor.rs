//! Resource identity derivation.
//!
//! A resource identity is the name a budget is addressed by in the shared
//! store. It is the declared name of the call site (or its signature when
//! none is declared) followed by the values of any referenced arguments.

use std::any::TypeId;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

/// Identity of a guarded method: owner, name, parameter and return types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallSignature {
    /// Fully-qualified owning type
    pub owner: String,
    pub method: String,
    /// Parameter type names, in order
    pub params: Vec<String>,
    returns: TypeId,
    returns_name: &'static str,
}

impl CallSignature {
    /// Describe a method returning `R`.
    pub fn new<R: 'static>(owner: impl Into<String>, method: impl Into<String>, params: &[&str]) -> Self {
        Self {
            owner: owner.into(),
            method: method.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
            returns: TypeId::of::<R>(),
            returns_name: std::any::type_name::<R>(),
        }
    }

    pub fn returns(&self) -> TypeId {
        self.returns
    }

    pub fn returns_name(&self) -> &'static str {
        self.returns_name
    }

    /// Render as `owner:method(param1,param2)`.
    pub fn to_signature_string(&self) -> String {
        format!("{}:{}({})", self.owner, self.method, self.params.join(","))
    }
}

impl std::fmt::Display for CallSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_signature_string())
    }
}

/// An argument reference expression failed to resolve.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Cannot resolve argument reference {expression}: {cause}")]
pub struct ParameterResolutionError {
    pub expression: String,
    pub cause: String,
}

impl ParameterResolutionError {
    fn new(expression: &str, cause: impl Into<String>) -> Self {
        Self {
            expression: expression.to_string(),
            cause: cause.into(),
        }
    }
}

/// Parsed form of `#p<index>` or `#p<index>.<property>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgRef {
    pub index: usize,
    pub property: Option<String>,
}

impl ArgRef {
    /// Parse an argument reference expression.
    ///
    /// Only the first property segment is read: `#p0.user.name` reads
    /// property `user` of argument 0.
    pub fn parse(expression: &str) -> Result<Self, ParameterResolutionError> {
        let mut segments = expression.split('.');
        let position = segments.next().unwrap_or_default();
        let property = segments.next();

        let index = position
            .strip_prefix("#p")
            .ok_or_else(|| ParameterResolutionError::new(expression, "expected #p<index>"))?
            .parse::<usize>()
            .map_err(|e| ParameterResolutionError::new(expression, e.to_string()))?;

        let property = match property {
            Some(p) if p.is_empty() => {
                return Err(ParameterResolutionError::new(expression, "empty property name"))
            }
            Some(p) => Some(p.to_string()),
            None => None,
        };

        Ok(Self { index, property })
    }

    /// Resolve against the actual arguments of one invocation.
    ///
    /// With a property, an array argument yields the property of its first
    /// element. A resolved array collapses to its first element.
    pub fn resolve<'a>(&self, expression: &str, args: &'a [Value]) -> Result<&'a Value, ParameterResolutionError> {
        let arg = args.get(self.index).ok_or_else(|| {
            ParameterResolutionError::new(
                expression,
                format!("index {} out of bounds for {} arguments", self.index, args.len()),
            )
        })?;

        let value = match &self.property {
            Some(property) => {
                let holder = match arg {
                    Value::Array(items) => first(expression, items)?,
                    other => other,
                };
                match holder {
                    Value::Object(fields) => fields.get(property).ok_or_else(|| {
                        ParameterResolutionError::new(expression, format!("no property named {}", property))
                    })?,
                    _ => {
                        return Err(ParameterResolutionError::new(
                            expression,
                            format!("cannot read property {} of {}", property, holder),
                        ))
                    }
                }
            }
            None => arg,
        };

        match value {
            Value::Array(items) => first(expression, items),
            other => Ok(other),
        }
    }
}

fn first<'a>(expression: &str, items: &'a [Value]) -> Result<&'a Value, ParameterResolutionError> {
    items
        .first()
        .ok_or_else(|| ParameterResolutionError::new(expression, "sequence is empty"))
}

/// String form appended to a resource name.
fn key_fragment(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Builds resource identities, memoising signature strings and parsed
/// argument references.
#[derive(Debug, Default)]
pub struct ResourceNameResolver {
    signatures: DashMap<CallSignature, Arc<str>>,
    references: DashMap<String, ArgRef>,
}

impl ResourceNameResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical signature string for a method, computed once per signature.
    pub fn method_name(&self, signature: &CallSignature) -> Arc<str> {
        if let Some(name) = self.signatures.get(signature) {
            return name.clone();
        }
        self.signatures
            .entry(signature.clone())
            .or_insert_with(|| Arc::from(signature.to_signature_string()))
            .clone()
    }

    /// Base resource name: the declared name when present, else the signature.
    pub fn base_name(&self, declared: &str, signature: &CallSignature) -> Arc<str> {
        if !declared.trim().is_empty() {
            return Arc::from(declared);
        }
        self.method_name(signature)
    }

    fn arg_ref(&self, expression: &str) -> Result<ArgRef, ParameterResolutionError> {
        if let Some(parsed) = self.references.get(expression) {
            return Ok(parsed.clone());
        }
        let parsed = ArgRef::parse(expression)?;
        self.references.insert(expression.to_string(), parsed.clone());
        Ok(parsed)
    }

    /// Build the resource identity for one invocation.
    pub fn resolve(
        &self,
        declared: &str,
        signature: &CallSignature,
        args: &[Value],
        references: &[String],
    ) -> Result<String, ParameterResolutionError> {
        let mut identity = self.base_name(declared, signature).to_string();
        for expression in references {
            let value = self.arg_ref(expression)?.resolve(expression, args)?;
            identity.push_str(&key_fragment(value));
        }

        trace!(resource = %identity, method = %signature, "Resolved resource identity");
        Ok(identity)
    }

    /// Number of memoised signature strings.
    pub fn cached_signatures(&self) -> usize {
        self.signatures.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn signature() -> CallSignature {
        CallSignature::new::<String>("shop::OrderService", "place", &["Order", "u32"])
    }

    fn refs(exprs: &[&str]) -> Vec<String> {
        exprs.iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn test_signature_string() {
        assert_eq!(signature().to_string(), "shop::OrderService:place(Order,u32)");
        let no_params = CallSignature::new::<()>("shop::Health", "ping", &[]);
        assert_eq!(no_params.to_string(), "shop::Health:ping()");
    }

    #[test]
    fn test_declared_name_used_verbatim() {
        let resolver = ResourceNameResolver::new();
        let identity = resolver.resolve("orders", &signature(), &[], &[]).unwrap();
        assert_eq!(identity, "orders");
        assert_eq!(resolver.cached_signatures(), 0);
    }

    #[test]
    fn test_blank_name_uses_signature() {
        let resolver = ResourceNameResolver::new();
        let identity = resolver.resolve("  ", &signature(), &[], &[]).unwrap();
        assert_eq!(identity, "shop::OrderService:place(Order,u32)");

        resolver.resolve("", &signature(), &[], &[]).unwrap();
        assert_eq!(resolver.cached_signatures(), 1);
    }

    #[test]
    fn test_parse_arg_ref() {
        assert_eq!(
            ArgRef::parse("#p2").unwrap(),
            ArgRef {
                index: 2,
                property: None
            }
        );
        assert_eq!(
            ArgRef::parse("#p0.user_id").unwrap(),
            ArgRef {
                index: 0,
                property: Some("user_id".to_string())
            }
        );
        assert!(ArgRef::parse("p0").is_err());
        assert!(ArgRef::parse("#pX").is_err());
        assert!(ArgRef::parse("#p0.").is_err());
    }

    #[test]
    fn test_nested_property_reads_first_segment() {
        assert_eq!(
            ArgRef::parse("#p0.user_id.name").unwrap(),
            ArgRef {
                index: 0,
                property: Some("user_id".to_string())
            }
        );

        let resolver = ResourceNameResolver::new();
        let args = vec![json!({"user_id": 42})];
        let identity = resolver
            .resolve("orders:", &signature(), &args, &refs(&["#p0.user_id.name"]))
            .unwrap();
        assert_eq!(identity, "orders:42");
    }

    #[test]
    fn test_plain_and_property_references() {
        let resolver = ResourceNameResolver::new();
        let args = vec![json!({"user_id": 42, "sku": "A-1"}), json!(7)];

        let identity = resolver
            .resolve("orders:", &signature(), &args, &refs(&["#p0.user_id", "#p1", "#p0.sku"]))
            .unwrap();
        assert_eq!(identity, "orders:427A-1");
    }

    #[test]
    fn test_sequence_arguments_use_first_element() {
        let resolver = ResourceNameResolver::new();
        let args = vec![
            json!([{"user_id": "alice"}, {"user_id": "bob"}]),
            json!(["x", "y"]),
        ];

        let identity = resolver
            .resolve("batch", &signature(), &args, &refs(&["#p0.user_id", "#p1"]))
            .unwrap();
        assert_eq!(identity, "batchalicex");
    }

    #[test]
    fn test_identity_is_deterministic() {
        let resolver = ResourceNameResolver::new();
        let references = refs(&["#p0.user_id"]);
        let args = vec![json!({"user_id": "alice"})];

        let first = resolver.resolve("", &signature(), &args, &references).unwrap();
        let second = resolver.resolve("", &signature(), &args, &references).unwrap();
        assert_eq!(first, second);

        let other = resolver
            .resolve("", &signature(), &[json!({"user_id": "bob"})], &references)
            .unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn test_resolution_failures() {
        let resolver = ResourceNameResolver::new();
        let args = vec![json!({"user_id": 1}), json!([]), json!("plain")];

        let err = resolver.resolve("r", &signature(), &args, &refs(&["#p5"])).unwrap_err();
        assert_eq!(err.expression, "#p5");

        let err = resolver
            .resolve("r", &signature(), &args, &refs(&["#p0.missing"]))
            .unwrap_err();
        assert!(err.cause.contains("missing"));

        assert!(resolver.resolve("r", &signature(), &args, &refs(&["#p1"])).is_err());
        assert!(resolver.resolve("r", &signature(), &args, &refs(&["#p2.len"])).is_err());
        assert!(resolver.resolve("r", &signature(), &args, &refs(&["#q0"])).is_err());
    }

    #[test]
    fn test_null_property_renders_as_null() {
        let resolver = ResourceNameResolver::new();
        let args = vec![json!({"user_id": null})];

        let identity = resolver
            .resolve("r:", &signature(), &args, &refs(&["#p0.user_id"]))
            .unwrap();
        assert_eq!(identity, "r:null");
    }
}
