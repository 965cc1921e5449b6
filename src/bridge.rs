// Luno Host Bridge
// Seams between the VM and its embedder: resource loading, foreign
// objects, and call interception

use crate::vm::value::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Supplies script sources and other assets to `import` and the CLI.
/// The VM never touches the filesystem on its own.
pub trait ResourceLoader: Send + Sync {
    /// Bytes of the named resource, or `None` when absent.
    fn load(&self, name: &str) -> Option<Vec<u8>>;
}

/// A loader over a base directory.
pub struct DirLoader {
    root: std::path::PathBuf,
}

impl DirLoader {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ResourceLoader for DirLoader {
    fn load(&self, name: &str) -> Option<Vec<u8>> {
        std::fs::read(self.root.join(name)).ok()
    }
}

/// Resolves `import` targets and mediates member access on foreign
/// handles. The embedder decides what class names mean.
pub trait ForeignBridge: Send + Sync {
    /// A value for the fully qualified name, or `None` if unknown.
    /// Returning a table of natives is the usual shape.
    fn load_class(&self, name: &str) -> Option<Value>;

    /// Read a member of a foreign handle.
    fn get_member(&self, obj: &Foreign, key: &Value) -> Result<Value, String> {
        let _ = key;
        Err(format!("{} has no accessible members", obj.type_name()))
    }

    /// Write a member of a foreign handle.
    fn set_member(&self, obj: &Foreign, key: &Value, value: &Value) -> Result<(), String> {
        let _ = (key, value);
        Err(format!("{} members are read-only", obj.type_name()))
    }
}

/// Observes and optionally overrides calls crossing the bridge. Used
/// for sandboxing and instrumentation.
pub trait Interceptor: Send + Sync {
    /// `Some(results)` short-circuits the call; `None` lets it proceed.
    fn before_call(&self, target: &str, args: &[Value]) -> Option<Vec<Value>>;
}

/// An opaque host object held by scripts. The VM only knows its type
/// name and identity; all behavior goes through the bridge.
#[derive(Clone)]
pub struct Foreign {
    type_name: Arc<str>,
    handle: Arc<dyn Any + Send + Sync>,
}

impl Foreign {
    pub fn new(type_name: impl Into<Arc<str>>, handle: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            type_name: type_name.into(),
            handle,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn handle(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.handle
    }

    /// Downcast the held object.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.handle.clone().downcast::<T>().ok()
    }

    /// Identity comparison; foreign values are equal only to themselves.
    pub fn ptr_eq(&self, other: &Foreign) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }
}

impl fmt::Debug for Foreign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<foreign {}>", self.type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcast_recovers_the_handle() {
        let foreign = Foreign::new("Point", Arc::new((3i64, 4i64)));
        let point = foreign.downcast::<(i64, i64)>().unwrap();
        assert_eq!(*point, (3, 4));
        assert!(foreign.downcast::<String>().is_none());
    }

    #[test]
    fn identity_equality() {
        let a = Foreign::new("X", Arc::new(1i64));
        let b = a.clone();
        let c = Foreign::new("X", Arc::new(1i64));
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
    }
}
