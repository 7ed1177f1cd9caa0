//! ureflect Engine
//!
//! An in-process reflection runtime over a host application's object and
//! type system. Given the addresses of the host's name and object tables and
//! a [`LayoutProfile`] describing the build, it can:
//! - **Enumerate**: walk the global object table and resolve names (`tables`)
//! - **Inspect**: find types, fields and functions by name or path (`types`)
//! - **Mutate**: read and write fields with per-kind semantics (`props`, `views`)
//! - **Invoke**: call host member functions through the host's own dispatch (`bound`)
//! - **Intercept**: run hooks around the host's dispatch points (`hooks`)
//!
//! # Example
//!
//! ```rust,ignore
//! use ureflect_engine::{Host, HostConfig, LayoutProfile, Value};
//!
//! let profile = LayoutProfile::from_file("profiles/game.toml".as_ref())?;
//! let host = Host::new(profile, HostConfig::new(names_base, objects_base))?;
//!
//! let actor = host.find_type("Actor")?;
//! for obj in host.instances_of(actor) {
//!     let health = host.get_field(obj, "Health")?;
//!     host.set_field(obj, "Health", &Value::Int(100))?;
//! }
//!
//! let ret = host.bind(player, "AddScore")?.call(&[Value::Int(5)])?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::not_unsafe_ptr_arg_deref)]

// ============================================================================
// Foundations
// ============================================================================

/// Error taxonomy
pub mod error;

/// Layout profiles
pub mod layout;

/// Raw memory access, entry point signatures and allocators
pub mod memory;

/// Byte pattern scanning
pub mod scan;

// ============================================================================
// Object and type model
// ============================================================================

/// Name and object tables
pub mod tables;

/// Object handles and object-model queries
pub mod object;

/// Type descriptors and lookup
pub mod types;

// ============================================================================
// Access, calls and hooks
// ============================================================================

/// Property access dispatch
pub mod props;

/// Struct and array views
pub mod views;

/// Bound member functions
pub mod bound;

/// Call-site hooks
pub mod hooks;

/// Host context
pub mod host;

/// Synthetic host for tests
#[cfg(any(test, feature = "test-host"))]
pub mod testing;

// ============================================================================
// Re-exports
// ============================================================================

pub use bound::{BoundMethod, CallOutput};
pub use error::{ReflectError, ReflectResult};
pub use hooks::{HookAction, HookDetails, HookSource, HookType};
pub use host::{Host, HostConfig};
pub use layout::{LayoutProfile, ProfileError};
pub use memory::{HostAllocator, LibcAllocator, VtableAllocator};
pub use object::{ObjectRef, TypeRef};
pub use props::{PropertyType, Value};
pub use scan::{Pattern, PatternError};
pub use tables::{FName, NameEntry, NameTable, ObjectRecord, ObjectTable};
pub use types::{Property, PropertyExtra, PropertyKind};
pub use views::{ArrayView, Owner, StructView};
