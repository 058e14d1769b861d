//! Method registry: turns the objects document into bus objects whose
//! methods each carry a pre-resolved [`Route`].

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, info, warn};
use ubusconf::BackendMode;
use ubusproto::{MethodDescriptor, ObjectDescriptor, ParamDescriptor, ServiceCatalog};

use crate::error::RegistryError;
use crate::schema::{MethodSchema, ObjectSchema, ParamSchema};

/// Object of the self-describing bridge call.
pub const INTROSPECTION_OBJECT: &str = "iot-ubusd";

/// Method of the self-describing bridge call.
pub const INTROSPECTION_METHOD: &str = "iot-rpc";

/// Where a method's calls go. Fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    EmbeddedScript,
    RemoteBridge,
    /// Payload names its own target method
    Introspection,
}

impl Route {
    pub fn resolve(object: &str, method: &str, mode: BackendMode) -> Self {
        if object == INTROSPECTION_OBJECT && method == INTROSPECTION_METHOD {
            return Route::Introspection;
        }
        match mode {
            BackendMode::Script => Route::EmbeddedScript,
            BackendMode::Remote => Route::RemoteBridge,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Route::EmbeddedScript => "script",
            Route::RemoteBridge => "remote",
            Route::Introspection => "introspection",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodBinding {
    pub schema: MethodSchema,
    pub route: Route,
}

impl MethodBinding {
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn params(&self) -> &[ParamSchema] {
        &self.schema.params
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusObject {
    pub name: String,
    pub methods: Vec<MethodBinding>,
}

impl BusObject {
    pub fn method(&self, name: &str) -> Option<&MethodBinding> {
        self.methods.iter().find(|m| m.name() == name)
    }
}

/// Registered objects in registration order.
#[derive(Debug, Clone)]
pub struct Registry {
    mode: BackendMode,
    objects: Vec<BusObject>,
    index: HashMap<String, usize>,
}

impl Registry {
    pub fn new(mode: BackendMode) -> Self {
        Self {
            mode,
            objects: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Register every usable object, then make sure the introspection
    /// method exists. Rejected objects are logged and skipped.
    pub fn build(schemas: Vec<ObjectSchema>, mode: BackendMode) -> Self {
        let mut registry = Self::new(mode);
        for schema in schemas {
            let name = schema.name.clone();
            if let Err(e) = registry.register(schema) {
                warn!("skipping object {}: {}", name, e);
            }
        }
        registry.ensure_introspection();
        info!(
            "registered {} objects ({} methods), backend {}",
            registry.objects.len(),
            registry.method_count(),
            mode
        );
        registry
    }

    /// Add one object with all its methods.
    pub fn register(&mut self, schema: ObjectSchema) -> Result<(), RegistryError> {
        if schema.methods.is_empty() {
            return Err(RegistryError::NoMethods(schema.name));
        }
        if self.index.contains_key(&schema.name) {
            return Err(RegistryError::DuplicateObject(schema.name));
        }

        let mut methods: Vec<MethodBinding> = Vec::with_capacity(schema.methods.len());
        for method in schema.methods {
            if methods.iter().any(|m| m.name() == method.name) {
                return Err(RegistryError::DuplicateMethod {
                    object: schema.name,
                    method: method.name,
                });
            }
            let route = Route::resolve(&schema.name, &method.name, self.mode);
            debug!("{}.{} -> {}", schema.name, method.name, route);
            methods.push(MethodBinding {
                schema: method,
                route,
            });
        }

        self.index.insert(schema.name.clone(), self.objects.len());
        self.objects.push(BusObject {
            name: schema.name,
            methods,
        });
        Ok(())
    }

    fn ensure_introspection(&mut self) {
        let binding = MethodBinding {
            schema: MethodSchema {
                object: INTROSPECTION_OBJECT.to_string(),
                name: INTROSPECTION_METHOD.to_string(),
                params: Vec::new(),
            },
            route: Route::Introspection,
        };

        match self.index.get(INTROSPECTION_OBJECT) {
            Some(&idx) => {
                let object = &mut self.objects[idx];
                if object.method(INTROSPECTION_METHOD).is_none() {
                    object.methods.push(binding);
                }
            }
            None => {
                self.index
                    .insert(INTROSPECTION_OBJECT.to_string(), self.objects.len());
                self.objects.push(BusObject {
                    name: INTROSPECTION_OBJECT.to_string(),
                    methods: vec![binding],
                });
            }
        }
    }

    pub fn mode(&self) -> BackendMode {
        self.mode
    }

    pub fn objects(&self) -> &[BusObject] {
        &self.objects
    }

    pub fn object(&self, name: &str) -> Option<&BusObject> {
        self.index.get(name).map(|&idx| &self.objects[idx])
    }

    pub fn lookup(&self, object: &str, method: &str) -> Option<&MethodBinding> {
        self.object(object).and_then(|o| o.method(method))
    }

    pub fn method_count(&self) -> usize {
        self.objects.iter().map(|o| o.methods.len()).sum()
    }

    /// Everything registered, for `list`.
    pub fn catalog(&self, broker: Option<&str>) -> ServiceCatalog {
        ServiceCatalog {
            backend: self.mode.as_str().to_string(),
            broker: broker.map(str::to_string),
            objects: self
                .objects
                .iter()
                .map(|object| ObjectDescriptor {
                    name: object.name.clone(),
                    methods: object
                        .methods
                        .iter()
                        .map(|binding| MethodDescriptor {
                            name: binding.name().to_string(),
                            params: binding
                                .params()
                                .iter()
                                .map(|p| ParamDescriptor {
                                    name: p.name.clone(),
                                    kind: p.kind,
                                })
                                .collect(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}
