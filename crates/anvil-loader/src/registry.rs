//! In-process class host

use crate::hierarchy::HierarchyNode;
use crate::host::{ClassHandle, ClassHost, DefineError};
use anvil_bytecode::{access, verify_class, ClassFile, ClassHeader, OBJECT_CLASS, STRING_CLASS};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A class known to the registry
#[derive(Debug, Clone)]
pub struct RegisteredClass {
    /// Class id
    pub id: usize,
    /// Class header
    pub header: ClassHeader,
    /// Decoded class, `None` for bootstrap classes
    pub class: Option<Arc<ClassFile>>,
    /// Bytes passed to `define_class`, `None` for bootstrap classes
    pub bytes: Option<Arc<[u8]>>,
}

impl RegisteredClass {
    /// Class name
    pub fn name(&self) -> &str {
        &self.header.name
    }

    /// Whether the class belongs to the bootstrap tier
    pub fn is_bootstrap(&self) -> bool {
        self.class.is_none()
    }

    fn handle(&self) -> ClassHandle {
        ClassHandle::new(self.id, &self.header.name)
    }
}

#[derive(Debug, Default)]
struct Classes {
    /// Classes indexed by ID
    classes: Vec<RegisteredClass>,
    /// Class name to ID mapping
    name_to_id: FxHashMap<String, usize>,
}

impl Classes {
    fn register(
        &mut self,
        header: ClassHeader,
        defined: Option<(Arc<ClassFile>, Arc<[u8]>)>,
    ) -> ClassHandle {
        let id = self.classes.len();
        self.name_to_id.insert(header.name.clone(), id);
        let (class, bytes) = defined.unzip();
        let registered = RegisteredClass {
            id,
            header,
            class,
            bytes,
        };
        let handle = registered.handle();
        self.classes.push(registered);
        handle
    }
}

/// Class host that verifies and records definitions
///
/// The bootstrap tier starts with `lang.Object` and `lang.String`.
#[derive(Debug)]
pub struct ClassRegistry {
    classes: RwLock<Classes>,
    define_calls: AtomicUsize,
}

impl ClassRegistry {
    /// Create a registry with the default bootstrap classes
    pub fn new() -> Self {
        let registry = Self {
            classes: RwLock::new(Classes::default()),
            define_calls: AtomicUsize::new(0),
        };
        registry.register_bootstrap(ClassHeader::new(OBJECT_CLASS, None));
        let mut string = ClassHeader::new(STRING_CLASS, Some(OBJECT_CLASS));
        string.access |= access::FINAL;
        registry.register_bootstrap(string);
        registry
    }

    /// Add a class to the bootstrap tier
    pub fn register_bootstrap(&self, header: ClassHeader) -> ClassHandle {
        self.classes.write().register(header, None)
    }

    /// Get class by ID
    pub fn get_class(&self, id: usize) -> Option<RegisteredClass> {
        self.classes.read().classes.get(id).cloned()
    }

    /// Get class by name
    pub fn get_class_by_name(&self, name: &str) -> Option<RegisteredClass> {
        let classes = self.classes.read();
        classes
            .name_to_id
            .get(name)
            .and_then(|id| classes.classes.get(*id))
            .cloned()
    }

    /// Get next available class ID
    pub fn next_class_id(&self) -> usize {
        self.classes.read().classes.len()
    }

    /// Number of `define_class` calls, successful or not
    pub fn define_calls(&self) -> usize {
        self.define_calls.load(Ordering::SeqCst)
    }

    /// Names of the classes defined through `define_class`, in order
    pub fn defined_names(&self) -> Vec<String> {
        self.classes
            .read()
            .classes
            .iter()
            .filter(|c| !c.is_bootstrap())
            .map(|c| c.header.name.clone())
            .collect()
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassHost for ClassRegistry {
    fn define_class(&self, name: &str, bytes: &[u8]) -> Result<ClassHandle, DefineError> {
        self.define_calls.fetch_add(1, Ordering::SeqCst);

        let class = ClassFile::decode(bytes).map_err(|e| DefineError::Malformed(e.to_string()))?;
        if class.name() != name {
            return Err(DefineError::NameMismatch {
                requested: name.to_string(),
                found: class.name().to_string(),
            });
        }
        verify_class(&class).map_err(|e| DefineError::Verify(e.to_string()))?;

        let mut classes = self.classes.write();
        if classes.name_to_id.contains_key(name) {
            return Err(DefineError::Duplicate(name.to_string()));
        }
        let header = class.header.clone();
        Ok(classes.register(header, Some((Arc::new(class), Arc::from(bytes)))))
    }

    fn resolve_bootstrap(&self, name: &str) -> Option<ClassHandle> {
        self.get_class_by_name(name)
            .filter(RegisteredClass::is_bootstrap)
            .map(|c| c.handle())
    }

    fn bootstrap_hierarchy(&self, name: &str) -> Option<HierarchyNode> {
        self.get_class_by_name(name)
            .filter(RegisteredClass::is_bootstrap)
            .map(|c| HierarchyNode::from(c.header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_bytecode::{BytecodeWriter, MethodDef, Opcode};

    fn point() -> ClassFile {
        ClassFile::new("game.Point", Some(OBJECT_CLASS))
    }

    #[test]
    fn test_bootstrap_classes() {
        let registry = ClassRegistry::new();
        assert_eq!(registry.next_class_id(), 2);
        let object = registry.resolve_bootstrap(OBJECT_CLASS).unwrap();
        assert_eq!(object.id, 0);
        assert_eq!(&*object.name, OBJECT_CLASS);

        let string = registry.bootstrap_hierarchy(STRING_CLASS).unwrap();
        assert_eq!(string.super_name.as_deref(), Some(OBJECT_CLASS));
        assert!(registry.resolve_bootstrap("game.Point").is_none());
    }

    #[test]
    fn test_define_class() {
        let registry = ClassRegistry::new();
        let handle = registry.define_class("game.Point", &point().encode()).unwrap();
        assert_eq!(handle.id, 2);

        let retrieved = registry.get_class_by_name("game.Point").unwrap();
        assert_eq!(retrieved.id, 2);
        assert!(!retrieved.is_bootstrap());
        assert_eq!(registry.get_class(2).unwrap().name(), "game.Point");
        assert_eq!(registry.defined_names(), vec!["game.Point"]);
        assert!(registry.resolve_bootstrap("game.Point").is_none());
        assert_eq!(registry.define_calls(), 1);
    }

    #[test]
    fn test_define_class_keeps_received_bytes() {
        let registry = ClassRegistry::new();
        let bytes = point().encode();
        registry.define_class("game.Point", &bytes).unwrap();

        let defined = registry.get_class_by_name("game.Point").unwrap();
        assert_eq!(defined.bytes.as_deref(), Some(bytes.as_slice()));
        assert!(registry.get_class_by_name(OBJECT_CLASS).unwrap().bytes.is_none());
    }

    #[test]
    fn test_duplicate_definition() {
        let registry = ClassRegistry::new();
        let bytes = point().encode();
        registry.define_class("game.Point", &bytes).unwrap();
        let err = registry.define_class("game.Point", &bytes).unwrap_err();
        assert_eq!(err, DefineError::Duplicate("game.Point".to_string()));
        assert_eq!(registry.define_calls(), 2);
    }

    #[test]
    fn test_name_mismatch() {
        let registry = ClassRegistry::new();
        let err = registry.define_class("game.Other", &point().encode()).unwrap_err();
        assert!(matches!(err, DefineError::NameMismatch { .. }));
    }

    #[test]
    fn test_malformed_bytes() {
        let registry = ClassRegistry::new();
        let err = registry.define_class("game.Point", b"garbage").unwrap_err();
        assert!(matches!(err, DefineError::Malformed(_)));
    }

    #[test]
    fn test_verification_failure() {
        let mut class = point();
        let mut w = BytecodeWriter::new();
        w.emit_load_local(1);
        let jump = w.emit_jump(Opcode::JmpIfFalse);
        let target = w.offset();
        w.emit_return_void();
        w.patch_jump(jump, target);
        let mut method = MethodDef::new("check", "(Z)V", w.into_bytes());
        method.max_stack = 1;
        method.max_locals = 2;
        class.methods.push(method);

        let registry = ClassRegistry::new();
        let err = registry.define_class("game.Point", &class.encode()).unwrap_err();
        assert!(matches!(err, DefineError::Verify(_)));
        assert!(registry.get_class_by_name("game.Point").is_none());
    }
}
