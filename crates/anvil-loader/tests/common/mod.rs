//! Shared fixtures for loader integration tests

#![allow(dead_code)]

use anvil_bytecode::{
    access, BytecodeWriter, ClassFile, MethodDef, Opcode, ResolveError, OBJECT_CLASS,
};
use anvil_loader::{
    ClassRegistry, CodeUnit, GameDescriptor, LoaderConfig, LoaderContext, LoaderContextBuilder,
    MemoryContent, NativeAdapter, Transformation, TransformError,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Main class of every test game
pub const MAIN: &str = "game.Main";

fn object_resolver(_: &str, _: &str) -> Result<String, ResolveError> {
    Ok(OBJECT_CLASS.to_string())
}

/// Compute frames so the class verifies as-is
pub fn finished(mut class: ClassFile) -> ClassFile {
    class.compute_frames(&object_resolver).unwrap();
    class
}

/// A class with a single `run()V` method
pub fn plain(name: &str, super_name: &str) -> ClassFile {
    let mut w = BytecodeWriter::new();
    w.emit_return_void();
    let mut class = ClassFile::new(name, Some(super_name));
    class.methods.push(MethodDef::new("run", "()V", w.into_bytes()));
    finished(class)
}

/// An interface with no members
pub fn interface(name: &str, extends: &[&str]) -> ClassFile {
    let mut class = ClassFile::new(name, Some(OBJECT_CLASS));
    class.header.access |= access::INTERFACE | access::ABSTRACT;
    class.header.interfaces = extends.iter().map(|s| s.to_string()).collect();
    class
}

/// `static pick(Z)`: `flag ? new A : new B`, so frames need the common
/// ancestor of `a` and `b`
pub fn picker(name: &str, a: &str, b: &str) -> ClassFile {
    let mut class = ClassFile::new(name, Some(OBJECT_CLASS));
    let a = class.constants.intern_class(a);
    let b = class.constants.intern_class(b);

    let mut w = BytecodeWriter::new();
    w.emit_load_local(0);
    let to_else = w.emit_jump(Opcode::JmpIfFalse);
    w.emit_indexed(Opcode::New, a);
    let to_end = w.emit_jump(Opcode::Jmp);
    let else_offset = w.offset();
    w.emit_indexed(Opcode::New, b);
    let end = w.offset();
    w.emit_return();
    w.patch_jump(to_else, else_offset);
    w.patch_jump(to_end, end);

    let mut method = MethodDef::new("pick", PICK_DESCRIPTOR, w.into_bytes());
    method.access |= access::STATIC;
    class.methods.push(method);
    finished(class)
}

/// Descriptor of the method built by [`picker`]
pub const PICK_DESCRIPTOR: &str = "(Z)Llang.Object;";

/// Transformation appending its name to `log`
pub fn recorder(log: Arc<Mutex<Vec<String>>>, name: &'static str) -> impl Transformation {
    move |_: &mut CodeUnit| -> Result<(), TransformError> {
        log.lock().push(name.to_string());
        Ok(())
    }
}

/// Transformation forcing the tree representation
pub fn touch(unit: &mut CodeUnit) -> Result<(), TransformError> {
    unit.as_tree()?;
    Ok(())
}

/// Game content, adapter and host shared by one test
pub struct Harness {
    pub game: Arc<MemoryContent>,
    pub adapter: Arc<NativeAdapter>,
    pub registry: Arc<ClassRegistry>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            game: Arc::new(MemoryContent::new()),
            adapter: Arc::new(NativeAdapter::new()),
            registry: Arc::new(ClassRegistry::new()),
        }
    }

    /// Add classes to the game
    pub fn add(&self, classes: impl IntoIterator<Item = ClassFile>) {
        for class in classes {
            self.game.insert_class(&class);
        }
    }

    /// Context builder with this harness' game, adapter and host
    pub fn builder(&self, config: LoaderConfig) -> LoaderContextBuilder {
        LoaderContext::builder(config)
            .game(GameDescriptor::new(self.game.clone(), MAIN))
            .adapter(self.adapter.clone())
            .host(self.registry.clone())
    }

    /// The class registered under `name`, decoded
    pub fn defined(&self, name: &str) -> Arc<ClassFile> {
        self.registry
            .get_class_by_name(name)
            .and_then(|c| c.class)
            .unwrap_or_else(|| panic!("{name} was not defined"))
    }
}
