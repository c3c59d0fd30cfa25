//! Service module - Routes requests to registered handlers
//!
//! A [`Router`] owns named services. Each [`Service`] maps method names to
//! typed async handlers; requests address them as `Service.Method`.
//!
//! ```ignore
//! let mut router = Router::new();
//! router.register(
//!     Service::new("Arith").method("Add", |(a, b): (i64, i64)| async move {
//!         Ok::<_, String>(a + b)
//!     }),
//! )?;
//! ```

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::protocol::Payload;

/// Request dispatcher used by the server.
///
/// Receives the full method name and the undecoded argument. The reply
/// must be encoded with the argument's codec. An `Err` is sent back to the
/// caller as the response error text.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, method: &str, args: Payload) -> Result<Payload, String>;
}

/// Registration errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("rpc: invalid name {0:?}")]
    InvalidName(String),

    #[error("rpc: service {0} has no methods")]
    NoMethods(String),

    #[error("rpc: service already defined: {0}")]
    DuplicateService(String),

    #[error("rpc: method {method} defined twice on service {service}")]
    DuplicateMethod { service: String, method: String },
}

#[async_trait]
trait Handler: Send + Sync {
    async fn call(&self, method: &str, args: Payload) -> Result<Payload, String>;
}

/// Adapts a typed async function to [`Handler`]
struct TypedHandler<A, R, E, F> {
    func: F,
    _marker: PhantomData<fn(A) -> (R, E)>,
}

#[async_trait]
impl<A, R, E, F, Fut> Handler for TypedHandler<A, R, E, F>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Display + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    async fn call(&self, method: &str, args: Payload) -> Result<Payload, String> {
        let codec = args.codec();
        let args: A = args
            .decode()
            .map_err(|e| format!("rpc: invalid argument for {}: {}", method, e))?;

        let reply = (self.func)(args).await.map_err(|e| e.to_string())?;

        Payload::encode(codec, &reply)
            .map_err(|e| format!("rpc: failed to encode reply for {}: {}", method, e))
    }
}

struct MethodEntry {
    handler: Box<dyn Handler>,
    num_calls: AtomicU64,
}

/// A named group of methods
pub struct Service {
    name: String,
    methods: HashMap<String, MethodEntry>,
    duplicate: Option<String>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
            duplicate: None,
        }
    }

    /// Add a method.
    ///
    /// The handler receives the decoded argument and returns the reply or
    /// an error whose text is sent back to the caller.
    pub fn method<A, R, E, F, Fut>(mut self, name: impl Into<String>, func: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let name = name.into();
        let entry = MethodEntry {
            handler: Box::new(TypedHandler {
                func,
                _marker: PhantomData,
            }),
            num_calls: AtomicU64::new(0),
        };

        if self.methods.insert(name.clone(), entry).is_some() && self.duplicate.is_none() {
            self.duplicate = Some(name);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registered method names, sorted
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// How many times a method has been invoked
    pub fn num_calls(&self, method: &str) -> Option<u64> {
        self.methods
            .get(method)
            .map(|entry| entry.num_calls.load(Ordering::Relaxed))
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('.') && !name.chars().any(char::is_whitespace)
}

/// Dispatches `Service.Method` requests to registered services
#[derive(Default)]
pub struct Router {
    services: HashMap<String, Service>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under its name
    pub fn register(&mut self, service: Service) -> Result<(), RegistryError> {
        if !valid_name(&service.name) {
            return Err(RegistryError::InvalidName(service.name));
        }
        if let Some(method) = service.duplicate {
            return Err(RegistryError::DuplicateMethod {
                service: service.name,
                method,
            });
        }
        if let Some(method) = service.methods.keys().find(|m| !valid_name(m)) {
            return Err(RegistryError::InvalidName(method.clone()));
        }
        if service.methods.is_empty() {
            return Err(RegistryError::NoMethods(service.name));
        }
        if self.services.contains_key(&service.name) {
            return Err(RegistryError::DuplicateService(service.name));
        }

        tracing::debug!(
            "Registered service {} ({} methods)",
            service.name,
            service.methods.len()
        );
        self.services.insert(service.name.clone(), service);
        Ok(())
    }

    /// Registered service names, sorted
    pub fn services(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    /// Invocation count for a `Service.Method` name
    pub fn num_calls(&self, method: &str) -> Option<u64> {
        let (service, method) = method.rsplit_once('.')?;
        self.services.get(service)?.num_calls(method)
    }

    fn find(&self, full_name: &str) -> Result<&MethodEntry, String> {
        let (service, method) = full_name
            .rsplit_once('.')
            .ok_or_else(|| format!("rpc: service/method request ill-formed: {}", full_name))?;

        let service = self
            .services
            .get(service)
            .ok_or_else(|| format!("rpc: can't find service {}", service))?;

        service
            .methods
            .get(method)
            .ok_or_else(|| format!("rpc: can't find method {}", method))
    }
}

#[async_trait]
impl Dispatch for Router {
    async fn dispatch(&self, method: &str, args: Payload) -> Result<Payload, String> {
        let entry = self.find(method)?;
        entry.num_calls.fetch_add(1, Ordering::Relaxed);
        entry.handler.call(method, args).await
    }
}
