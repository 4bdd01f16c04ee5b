// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Processor Discovery
//!
//! Processors register themselves at link time with the [`processor!`](crate::processor!)
//! macro. Each registration is a [`ProcessorDescriptor`]: the identity of the type, its
//! kind and visibility, and the constructors that can build it, each with the typed
//! parameters it needs. The messaging manager walks the descriptors, resolves the
//! parameters through a [`ServiceResolver`] and registers the processors it manages
//! to build.
//!
//! ```ignore
//! // built with Default
//! processor!(AuditProcessor);
//!
//! // built with OrderProcessor::new(Arc<OrderStore>)
//! processor!(OrderProcessor => new(store: OrderStore));
//! ```

use crate::{errors::BoxError, processor::Processor};
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};

/// A resolved constructor argument.
pub type Dependency = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorKind {
    Concrete,
    Abstract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
}

/// A constructor parameter.
pub struct Parameter {
    pub name: &'static str,
    pub type_name: fn() -> &'static str,
    pub type_id: fn() -> TypeId,
    /// Value used when the resolver has none.
    pub default: Option<fn() -> Dependency>,
}

/// One way of building a processor.
pub struct ProcessorConstructor {
    pub parameters: &'static [Parameter],
    /// Receives one dependency per parameter, in order.
    pub invoke: fn(Vec<Dependency>) -> Result<Arc<dyn Processor>, BoxError>,
}

/// A discoverable processor type.
pub struct ProcessorDescriptor {
    pub type_name: fn() -> &'static str,
    pub type_id: fn() -> TypeId,
    pub kind: ProcessorKind,
    pub visibility: Visibility,
    /// Candidates, tried in declaration order.
    pub constructors: &'static [ProcessorConstructor],
}

impl ProcessorDescriptor {
    pub fn name(&self) -> &'static str {
        (self.type_name)()
    }

    /// Only public concrete types can be instantiated.
    pub fn is_instantiable(&self) -> bool {
        self.kind == ProcessorKind::Concrete && self.visibility == Visibility::Public
    }
}

impl fmt::Debug for ProcessorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorDescriptor")
            .field("type_name", &self.name())
            .field("kind", &self.kind)
            .field("visibility", &self.visibility)
            .field("constructors", &self.constructors.len())
            .finish()
    }
}

inventory::collect!(ProcessorDescriptor);

/// Every processor registered with `processor!` in the final binary.
pub fn discovered_processors() -> Vec<&'static ProcessorDescriptor> {
    inventory::iter::<ProcessorDescriptor>().collect()
}

/// Constructor of processors built with `Default`.
pub fn construct_default<P: Processor + Default + 'static>(
    _: Vec<Dependency>,
) -> Result<Arc<dyn Processor>, BoxError> {
    Ok(Arc::new(P::default()))
}

/// Takes the next dependency and downcasts it to `T`.
pub fn take_dependency<T: Any + Send + Sync>(
    deps: &mut impl Iterator<Item = Dependency>,
    name: &str,
) -> Result<Arc<T>, BoxError> {
    deps.next()
        .ok_or_else(|| format!("missing dependency `{}`", name))?
        .downcast::<T>()
        .map_err(|_| {
            format!(
                "dependency `{}` is not a {}",
                name,
                std::any::type_name::<T>()
            )
            .into()
        })
}

/// Registers a processor type for discovery.
///
/// `processor!(T)` builds `T` with `Default`. `processor!(T => new(a: A, b: B))` builds
/// it with `T::new(Arc<A>, Arc<B>)`, `A` and `B` being resolved by type.
#[macro_export]
macro_rules! processor {
    ($ty:ty) => {
        $crate::inventory::submit! {
            $crate::discovery::ProcessorDescriptor {
                type_name: ::std::any::type_name::<$ty>,
                type_id: ::std::any::TypeId::of::<$ty>,
                kind: $crate::discovery::ProcessorKind::Concrete,
                visibility: $crate::discovery::Visibility::Public,
                constructors: &[$crate::discovery::ProcessorConstructor {
                    parameters: &[],
                    invoke: $crate::discovery::construct_default::<$ty>,
                }],
            }
        }
    };
    ($ty:ty => $ctor:ident ( $($arg:ident : $dep:ty),* $(,)? )) => {
        $crate::inventory::submit! {
            $crate::discovery::ProcessorDescriptor {
                type_name: ::std::any::type_name::<$ty>,
                type_id: ::std::any::TypeId::of::<$ty>,
                kind: $crate::discovery::ProcessorKind::Concrete,
                visibility: $crate::discovery::Visibility::Public,
                constructors: &[$crate::discovery::ProcessorConstructor {
                    parameters: &[$($crate::discovery::Parameter {
                        name: stringify!($arg),
                        type_name: ::std::any::type_name::<$dep>,
                        type_id: ::std::any::TypeId::of::<$dep>,
                        default: None,
                    }),*],
                    invoke: |deps| {
                        #[allow(unused_mut, unused_variables)]
                        let mut deps = deps.into_iter();
                        $(let $arg = $crate::discovery::take_dependency::<$dep>(&mut deps, stringify!($arg))?;)*
                        Ok(::std::sync::Arc::new(<$ty>::$ctor($($arg),*))
                            as ::std::sync::Arc<dyn $crate::processor::Processor>)
                    },
                }],
            }
        }
    };
}

/// Provides constructor arguments by type.
pub trait ServiceResolver: Send + Sync {
    fn resolve(&self, type_id: TypeId) -> Option<Dependency>;
}

/// In-memory `ServiceResolver` keyed by type.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    services: HashMap<TypeId, Dependency>,
}

impl ServiceRegistry {
    pub fn new() -> ServiceRegistry {
        ServiceRegistry::default()
    }

    pub fn register<T: Any + Send + Sync>(&mut self, service: Arc<T>) {
        self.services.insert(TypeId::of::<T>(), service);
    }

    pub fn with<T: Any + Send + Sync>(mut self, service: Arc<T>) -> Self {
        self.register(service);
        self
    }
}

impl ServiceResolver for ServiceRegistry {
    fn resolve(&self, type_id: TypeId) -> Option<Dependency> {
        self.services.get(&type_id).cloned()
    }
}

/// Lets the application exclude discovered processors.
pub trait ProcessorIgnorer: Send + Sync {
    fn should_ignore(&self, descriptor: &ProcessorDescriptor) -> bool;
}

impl<F> ProcessorIgnorer for F
where
    F: Fn(&ProcessorDescriptor) -> bool + Send + Sync,
{
    fn should_ignore(&self, descriptor: &ProcessorDescriptor) -> bool {
        self(descriptor)
    }
}
