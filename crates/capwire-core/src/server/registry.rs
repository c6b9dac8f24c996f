//! Capability registry: the explicit, immutable table of what a handler exposes.
//!
//! A handler lists its remotely reachable members once, at construction, through
//! [`RegistryBuilder`]. Each method is stored as a typed invoker closure that owns
//! its own argument decoding, so dispatch never needs runtime type introspection.
//! Anything not registered here is unreachable from the wire.
//!
//! # Example
//!
//! ```rust,ignore
//! struct AccountApi { accounts: Vec<Account> }
//!
//! impl ApiHandler for AccountApi {
//!     fn scope(&self) -> &str {
//!         "account-api"
//!     }
//!
//!     fn expose(self: Arc<Self>, registry: &mut RegistryBuilder) {
//!         let this = self.clone();
//!         registry.method("getAccounts", move |()| {
//!             let this = this.clone();
//!             async move { Ok::<_, Infallible>(this.accounts.clone()) }
//!         });
//!     }
//! }
//!
//! let registry = CapabilityRegistry::for_handler(Arc::new(api))?;
//! ```

use super::event::EventSource;
use crate::{CapwireError, Result};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// What a capability is; a request channel may only reach its own kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Method,
    Property,
    Event,
}

impl CapabilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Method => "method",
            CapabilityKind::Property => "property",
            CapabilityKind::Event => "event",
        }
    }
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Future produced by invoking a method or reading a property.
pub type InvokeFuture = BoxFuture<'static, Result<Value>>;

type MethodInvoker = Arc<dyn Fn(Vec<Value>) -> InvokeFuture + Send + Sync>;
type PropertyReader = Arc<dyn Fn() -> InvokeFuture + Send + Sync>;

// ============================================================================
// Typed parameter decoding
// ============================================================================

/// Positional argument list decodable from JSON parameters.
///
/// Implemented for tuples of up to six `DeserializeOwned` values; the tuple
/// length is the declared arity.
pub trait FromParameters: Sized + Send + 'static {
    const ARITY: usize;

    /// Decode every parameter or none. Missing trailing parameters decode
    /// from `null`.
    fn from_parameters(method: &str, parameters: Vec<Value>) -> Result<Self>;
}

fn decode_parameter<T: DeserializeOwned>(method: &str, index: usize, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| CapwireError::ArgumentConversion {
        method: method.to_string(),
        index,
        message: e.to_string(),
    })
}

macro_rules! impl_from_parameters {
    ($arity:expr; $($ty:ident => $idx:tt),*) => {
        impl<$($ty: DeserializeOwned + Send + 'static),*> FromParameters for ($($ty,)*) {
            const ARITY: usize = $arity;

            #[allow(unused_variables, unused_mut)]
            fn from_parameters(method: &str, parameters: Vec<Value>) -> Result<Self> {
                let mut parameters = parameters.into_iter();
                Ok(($(
                    decode_parameter::<$ty>(method, $idx, parameters.next().unwrap_or(Value::Null))?,
                )*))
            }
        }
    };
}

impl_from_parameters!(0;);
impl_from_parameters!(1; A => 0);
impl_from_parameters!(2; A => 0, B => 1);
impl_from_parameters!(3; A => 0, B => 1, C => 2);
impl_from_parameters!(4; A => 0, B => 1, C => 2, D => 3);
impl_from_parameters!(5; A => 0, B => 1, C => 2, D => 3, E => 4);
impl_from_parameters!(6; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5);

// ============================================================================
// Descriptors
// ============================================================================

/// An exposed method and its declared parameter counts.
#[derive(Clone)]
pub struct MethodCapability {
    required: usize,
    declared: usize,
    invoker: MethodInvoker,
}

impl MethodCapability {
    pub fn required(&self) -> usize {
        self.required
    }

    pub fn declared(&self) -> usize {
        self.declared
    }

    /// Reject argument counts outside `required..=declared`.
    pub fn check_arity(&self, method: &str, provided: usize) -> Result<()> {
        if provided > self.declared || provided < self.required {
            return Err(CapwireError::Arity {
                method: method.to_string(),
                required: self.required,
                declared: self.declared,
                provided,
            });
        }
        Ok(())
    }

    /// Decode the parameters and run the method.
    pub fn invoke(&self, parameters: Vec<Value>) -> InvokeFuture {
        (self.invoker)(parameters)
    }
}

/// An exposed read-only property.
#[derive(Clone)]
pub struct PropertyCapability {
    reader: PropertyReader,
}

impl PropertyCapability {
    pub fn read(&self) -> InvokeFuture {
        (self.reader)()
    }
}

/// The callable behind a descriptor.
#[derive(Clone)]
pub enum Capability {
    Method(MethodCapability),
    Property(PropertyCapability),
    Event(EventSource),
}

/// One exposed name and what it resolves to.
#[derive(Clone)]
pub struct CapabilityDescriptor {
    name: String,
    capability: Capability,
}

impl CapabilityDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CapabilityKind {
        match self.capability {
            Capability::Method(_) => CapabilityKind::Method,
            Capability::Property(_) => CapabilityKind::Property,
            Capability::Event(_) => CapabilityKind::Event,
        }
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }
}

impl std::fmt::Debug for CapabilityDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// A handler that exposes capabilities under one scope.
///
/// `expose` is called exactly once, when the registry is built, and must
/// register every member that should be reachable remotely.
pub trait ApiHandler: Send + Sync + 'static {
    /// Scope name this handler answers to.
    fn scope(&self) -> &str;

    fn expose(self: Arc<Self>, registry: &mut RegistryBuilder);
}

/// Immutable name → capability table for one scope.
#[derive(Debug)]
pub struct CapabilityRegistry {
    scope: String,
    capabilities: HashMap<String, CapabilityDescriptor>,
}

impl CapabilityRegistry {
    pub fn builder(scope: impl Into<String>) -> RegistryBuilder {
        RegistryBuilder::new(scope)
    }

    /// Build the registry of a handler instance.
    pub fn for_handler<H: ApiHandler>(handler: Arc<H>) -> Result<Self> {
        let mut builder = RegistryBuilder::new(handler.scope());
        handler.expose(&mut builder);
        builder.build()
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Exposed names of one kind, sorted.
    pub fn names(&self, kind: CapabilityKind) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .capabilities
            .values()
            .filter(|d| d.kind() == kind)
            .map(|d| d.name())
            .collect();
        names.sort_unstable();
        names
    }

    /// Exact-name lookup restricted to `kind`.
    pub fn resolve(&self, name: &str, kind: CapabilityKind) -> Result<&CapabilityDescriptor> {
        match self.capabilities.get(name) {
            Some(descriptor) if descriptor.kind() == kind => Ok(descriptor),
            _ => Err(unknown(name, kind)),
        }
    }

    pub fn method(&self, name: &str) -> Result<&MethodCapability> {
        match self.capabilities.get(name).map(|d| &d.capability) {
            Some(Capability::Method(method)) => Ok(method),
            _ => Err(unknown(name, CapabilityKind::Method)),
        }
    }

    pub fn property(&self, name: &str) -> Result<&PropertyCapability> {
        match self.capabilities.get(name).map(|d| &d.capability) {
            Some(Capability::Property(property)) => Ok(property),
            _ => Err(unknown(name, CapabilityKind::Property)),
        }
    }

    pub fn event(&self, name: &str) -> Result<&EventSource> {
        match self.capabilities.get(name).map(|d| &d.capability) {
            Some(Capability::Event(source)) => Ok(source),
            _ => Err(unknown(name, CapabilityKind::Event)),
        }
    }

    /// Resolve and arity-check a call, returning the invocation to run.
    ///
    /// Nothing is decoded or invoked until the returned future is polled.
    pub fn prepare_call(&self, name: &str, parameters: Vec<Value>) -> Result<InvokeFuture> {
        let method = self.method(name)?;
        method.check_arity(name, parameters.len())?;
        Ok(method.invoke(parameters))
    }

    /// Resolve a property, returning the read to run.
    ///
    /// The accessor itself does not run until the returned future is polled.
    pub fn prepare_get(&self, name: &str) -> Result<InvokeFuture> {
        Ok(self.property(name)?.read())
    }
}

fn unknown(name: &str, kind: CapabilityKind) -> CapwireError {
    CapwireError::UnknownCapability {
        name: name.to_string(),
        kind,
    }
}

/// Collects a handler's exposed members; see [`CapabilityRegistry::for_handler`].
pub struct RegistryBuilder {
    scope: String,
    capabilities: HashMap<String, CapabilityDescriptor>,
    duplicates: Vec<String>,
}

impl RegistryBuilder {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            capabilities: HashMap::new(),
            duplicates: Vec::new(),
        }
    }

    fn insert(&mut self, name: &str, capability: Capability) -> &mut Self {
        if self.capabilities.contains_key(name) {
            self.duplicates.push(name.to_string());
            return self;
        }
        self.capabilities.insert(
            name.to_string(),
            CapabilityDescriptor {
                name: name.to_string(),
                capability,
            },
        );
        self
    }

    /// Expose an async method whose parameters are all required.
    pub fn method<P, F, Fut, R, E>(&mut self, name: &str, f: F) -> &mut Self
    where
        P: FromParameters,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        self.method_with_optional(name, 0, f)
    }

    /// Expose an async method whose last `optional` parameters may be omitted.
    ///
    /// Omitted parameters decode from `null`, so they should be `Option<_>`.
    pub fn method_with_optional<P, F, Fut, R, E>(
        &mut self,
        name: &str,
        optional: usize,
        f: F,
    ) -> &mut Self
    where
        P: FromParameters,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let method = name.to_string();
        let f = Arc::new(f);
        let invoker: MethodInvoker = Arc::new(move |parameters: Vec<Value>| -> InvokeFuture {
            let f = f.clone();
            let method = method.clone();
            Box::pin(async move {
                let args = P::from_parameters(&method, parameters)?;
                let output = f(args)
                    .await
                    .map_err(|e| CapwireError::fault(e.to_string()))?;
                to_return_value(&method, output)
            })
        });

        self.insert(
            name,
            Capability::Method(MethodCapability {
                required: P::ARITY.saturating_sub(optional),
                declared: P::ARITY,
                invoker,
            }),
        )
    }

    /// Expose a synchronous method that may block; it runs on the blocking pool.
    pub fn blocking_method<P, F, R, E>(&mut self, name: &str, f: F) -> &mut Self
    where
        P: FromParameters,
        F: Fn(P) -> std::result::Result<R, E> + Send + Sync + 'static,
        R: Serialize + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let method = name.to_string();
        let f = Arc::new(f);
        let invoker: MethodInvoker = Arc::new(move |parameters: Vec<Value>| -> InvokeFuture {
            let f = f.clone();
            let method = method.clone();
            Box::pin(async move {
                let args = P::from_parameters(&method, parameters)?;
                let output = tokio::task::spawn_blocking(move || f(args))
                    .await
                    .map_err(|e| CapwireError::fault(format!("'{}' did not complete: {}", method, e)))?
                    .map_err(|e| CapwireError::fault(e.to_string()))?;
                to_return_value(&method, output)
            })
        });

        self.insert(
            name,
            Capability::Method(MethodCapability {
                required: P::ARITY,
                declared: P::ARITY,
                invoker,
            }),
        )
    }

    /// Expose a read-only property.
    pub fn property<F, Fut, R, E>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let property = name.to_string();
        let f = Arc::new(f);
        let reader: PropertyReader = Arc::new(move || -> InvokeFuture {
            let f = f.clone();
            let property = property.clone();
            Box::pin(async move {
                let output = f().await.map_err(|e| CapwireError::fault(e.to_string()))?;
                to_return_value(&property, output)
            })
        });

        self.insert(name, Capability::Property(PropertyCapability { reader }))
    }

    /// Expose an event under its source's name.
    pub fn event(&mut self, source: &EventSource) -> &mut Self {
        let name = source.name().to_string();
        self.insert(&name, Capability::Event(source.clone()))
    }

    /// Freeze the table. Fails if any name was registered twice.
    pub fn build(self) -> Result<CapabilityRegistry> {
        if !self.duplicates.is_empty() {
            return Err(CapwireError::Config {
                message: format!(
                    "duplicate capability names in scope '{}': {}",
                    self.scope,
                    self.duplicates.join(", ")
                ),
            });
        }
        Ok(CapabilityRegistry {
            scope: self.scope,
            capabilities: self.capabilities,
        })
    }
}

fn to_return_value<R: Serialize>(name: &str, output: R) -> Result<Value> {
    serde_json::to_value(output).map_err(|e| {
        CapwireError::fault(format!("return value of '{}' could not be serialized: {}", name, e))
    })
}

// ============================================================================
// Services
// ============================================================================

/// Every scope a server exposes.
#[derive(Debug, Default)]
pub struct Services {
    scopes: HashMap<String, Arc<CapabilityRegistry>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a built registry. Fails if its scope is already taken.
    pub fn add(&mut self, registry: CapabilityRegistry) -> Result<()> {
        if self.scopes.contains_key(registry.scope()) {
            return Err(CapwireError::Config {
                message: format!("scope '{}' registered twice", registry.scope()),
            });
        }
        self.scopes
            .insert(registry.scope().to_string(), Arc::new(registry));
        Ok(())
    }

    /// Build and add a handler's registry.
    pub fn add_handler<H: ApiHandler>(&mut self, handler: Arc<H>) -> Result<()> {
        self.add(CapabilityRegistry::for_handler(handler)?)
    }

    pub fn get(&self, scope: &str) -> Result<&Arc<CapabilityRegistry>> {
        self.scopes.get(scope).ok_or_else(|| CapwireError::UnknownScope {
            scope: scope.to_string(),
        })
    }

    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scopes.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use serde_json::json;
    use std::convert::Infallible;

    struct Calculator {
        events: EventSource,
    }

    impl ApiHandler for Calculator {
        fn scope(&self) -> &str {
            "calc-api"
        }

        fn expose(self: Arc<Self>, registry: &mut RegistryBuilder) {
            registry
                .method("add", |(a, b): (i64, i64)| async move {
                    Ok::<_, Infallible>(a + b)
                })
                .method_with_optional("greet", 1, |(name, greeting): (String, Option<String>)| {
                    async move {
                        let greeting = greeting.unwrap_or_else(|| "Hello".to_string());
                        Ok::<_, Infallible>(format!("{}, {}!", greeting, name))
                    }
                })
                .method("divide", |(a, b): (i64, i64)| async move {
                    if b == 0 {
                        return Err("division by zero");
                    }
                    Ok(a / b)
                })
                .blocking_method("sum", |(values,): (Vec<i64>,)| {
                    Ok::<_, Infallible>(values.iter().sum::<i64>())
                })
                .property("version", || async { Ok::<_, Infallible>("1.2.3") })
                .event(&self.events);
        }
    }

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::for_handler(Arc::new(Calculator {
            events: EventSource::new("resultChanged"),
        }))
        .unwrap()
    }

    #[test]
    fn test_registry_lists_exposed_names() {
        let registry = registry();
        assert_eq!(registry.scope(), "calc-api");
        assert_eq!(registry.len(), 6);
        assert_eq!(
            registry.names(CapabilityKind::Method),
            vec!["add", "divide", "greet", "sum"]
        );
        assert_eq!(registry.names(CapabilityKind::Property), vec!["version"]);
        assert_eq!(registry.names(CapabilityKind::Event), vec!["resultChanged"]);
    }

    #[test]
    fn test_resolve_is_kind_restricted() {
        let registry = registry();
        assert!(registry.resolve("version", CapabilityKind::Property).is_ok());

        let err = registry.resolve("version", CapabilityKind::Method).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownCapability);

        let err = registry.resolve("doesNotExist", CapabilityKind::Method).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownCapability);
    }

    #[tokio::test]
    async fn test_call_converts_arguments() {
        let registry = registry();
        let value = registry
            .prepare_call("add", vec![json!(2), json!(40)])
            .unwrap()
            .await
            .unwrap();
        assert_eq!(value, json!(42));
    }

    #[test]
    fn test_too_few_required_parameters_is_arity_error() {
        let registry = registry();
        let err = registry.prepare_call("add", vec![json!(1)]).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ArityError);
    }

    #[test]
    fn test_too_many_parameters_is_arity_error() {
        let registry = registry();
        let err = registry
            .prepare_call("add", vec![json!(1), json!(2), json!(3)])
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::ArityError);
    }

    #[tokio::test]
    async fn test_optional_parameter_may_be_omitted() {
        let registry = registry();
        let method = registry.method("greet").unwrap();
        assert_eq!(method.required(), 1);
        assert_eq!(method.declared(), 2);

        let short = registry
            .prepare_call("greet", vec![json!("Ada")])
            .unwrap()
            .await
            .unwrap();
        assert_eq!(short, json!("Hello, Ada!"));

        let full = registry
            .prepare_call("greet", vec![json!("Ada"), json!("Hi")])
            .unwrap()
            .await
            .unwrap();
        assert_eq!(full, json!("Hi, Ada!"));
    }

    #[tokio::test]
    async fn test_argument_type_mismatch_is_conversion_error() {
        let registry = registry();
        let err = registry
            .prepare_call("add", vec![json!(1), json!("two")])
            .unwrap()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConversionError);
        assert!(err.to_string().contains("Parameter 1"));
    }

    #[tokio::test]
    async fn test_method_error_is_remote_fault() {
        let registry = registry();
        let err = registry
            .prepare_call("divide", vec![json!(1), json!(0)])
            .unwrap()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteFault);
        assert_eq!(err.to_string(), "division by zero");
    }

    #[tokio::test]
    async fn test_blocking_method_runs() {
        let registry = registry();
        let value = registry
            .prepare_call("sum", vec![json!([1, 2, 3])])
            .unwrap()
            .await
            .unwrap();
        assert_eq!(value, json!(6));
    }

    #[tokio::test]
    async fn test_property_read() {
        let registry = registry();
        let value = registry.prepare_get("version").unwrap().await.unwrap();
        assert_eq!(value, json!("1.2.3"));
        assert!(registry.prepare_get("add").is_err());
    }

    #[test]
    fn test_prepare_get_defers_accessor() {
        let reads = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut builder = RegistryBuilder::new("lazy");
        builder.property("count", {
            let reads = reads.clone();
            move || {
                reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Ok::<_, Infallible>(0) }
            }
        });
        let registry = builder.build().unwrap();

        let read = registry.prepare_get("count").unwrap();
        assert_eq!(reads.load(std::sync::atomic::Ordering::SeqCst), 0);
        drop(read);
    }

    #[test]
    fn test_duplicate_names_fail_build() {
        let mut builder = RegistryBuilder::new("dup");
        builder
            .property("x", || async { Ok::<_, Infallible>(1) })
            .method("x", |()| async { Ok::<_, Infallible>(2) });
        let err = builder.build().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_services_reject_duplicate_scope() {
        let mut services = Services::new();
        services.add(registry()).unwrap();
        assert!(services.add(registry()).is_err());
        assert!(services.get("calc-api").is_ok());
        assert_eq!(
            services.get("other").unwrap_err().kind(),
            ErrorKind::UnknownCapability
        );
    }
}
