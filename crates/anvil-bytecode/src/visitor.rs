//! Element-level class visitors
//!
//! Visitors are chained: each element is handed to the first visitor, its
//! result to the next one, and so on. Returning `None` removes the element
//! from the output.

use crate::class::{Annotation, ClassHeader, FieldDef, MethodDef};

/// Visitor over the elements of a class
///
/// Every method has a pass-through default, so implementors only override
/// the elements they care about.
pub trait ClassVisitor {
    /// Inspect or rewrite the class header
    fn visit_header(&mut self, header: &mut ClassHeader) {
        let _ = header;
    }

    /// Inspect, rewrite or drop a class annotation
    fn visit_annotation(&mut self, annotation: Annotation) -> Option<Annotation> {
        Some(annotation)
    }

    /// Inspect, rewrite or drop a field
    fn visit_field(&mut self, field: FieldDef) -> Option<FieldDef> {
        Some(field)
    }

    /// Inspect, rewrite or drop a method
    fn visit_method(&mut self, method: MethodDef) -> Option<MethodDef> {
        Some(method)
    }

    /// Called once after the last element
    fn visit_end(&mut self) {}
}

impl<V: ClassVisitor + ?Sized> ClassVisitor for Box<V> {
    fn visit_header(&mut self, header: &mut ClassHeader) {
        (**self).visit_header(header)
    }

    fn visit_annotation(&mut self, annotation: Annotation) -> Option<Annotation> {
        (**self).visit_annotation(annotation)
    }

    fn visit_field(&mut self, field: FieldDef) -> Option<FieldDef> {
        (**self).visit_field(field)
    }

    fn visit_method(&mut self, method: MethodDef) -> Option<MethodDef> {
        (**self).visit_method(method)
    }

    fn visit_end(&mut self) {
        (**self).visit_end()
    }
}
