//! Physical side stripping
//!
//! Classes, fields and methods annotated `anvil.side.OnlyIn(side = ...)` only
//! exist on the named side. On the other side a stripped class is skipped and
//! stripped members are removed.

use crate::pipeline::Transformation;
use crate::unit::{CodeUnit, TransformError};
use anvil_bytecode::{Annotation, AnnotationValue, ClassVisitor, FieldDef, MethodDef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Descriptor of the `OnlyIn` annotation
pub const ONLY_IN_DESCRIPTOR: &str = "Lanvil.side.OnlyIn;";

/// Descriptor of the `Side` enum
pub const SIDE_DESCRIPTOR: &str = "Lanvil.side.Side;";

/// Name the built-in is registered under
pub const SIDE_STRIPPING: &str = "anvil.side.SideStripping";

/// Physical run side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// The game client
    Client,
    /// The dedicated server
    Server,
}

impl Side {
    /// Enum constant name used in annotations
    pub fn constant(self) -> &'static str {
        match self {
            Side::Client => "CLIENT",
            Side::Server => "SERVER",
        }
    }

    /// Parse an enum constant name
    pub fn from_constant(constant: &str) -> Option<Side> {
        match constant {
            "CLIENT" => Some(Side::Client),
            "SERVER" => Some(Side::Server),
            _ => None,
        }
    }

    /// `OnlyIn` annotation restricting an element to this side
    pub fn only_in(self) -> Annotation {
        Annotation::new(ONLY_IN_DESCRIPTOR).with_value(
            "side",
            AnnotationValue::Enum {
                descriptor: SIDE_DESCRIPTOR.to_string(),
                value: self.constant().to_string(),
            },
        )
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Server => write!(f, "server"),
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Side::Client),
            "server" => Ok(Side::Server),
            other => Err(format!("unknown side {other:?}, expected client or server")),
        }
    }
}

/// Finds elements restricted to the other side
struct StripLocator {
    side: Side,
    skip_entire: bool,
    methods: Vec<(String, String)>,
    fields: Vec<String>,
    invalid: Option<String>,
}

impl StripLocator {
    fn new(side: Side) -> Self {
        Self {
            side,
            skip_entire: false,
            methods: Vec::new(),
            fields: Vec::new(),
            invalid: None,
        }
    }

    /// Whether `annotations` restrict their element to the other side
    fn strips(&mut self, annotations: &[Annotation]) -> bool {
        let mut strip = false;
        for annotation in annotations.iter().filter(|a| a.descriptor == ONLY_IN_DESCRIPTOR) {
            match annotation.value("side") {
                Some(AnnotationValue::Enum { descriptor, value }) if descriptor == SIDE_DESCRIPTOR => {
                    match Side::from_constant(value) {
                        Some(side) => strip |= side != self.side,
                        None => self.invalid = Some(value.clone()),
                    }
                }
                other => self.invalid = Some(format!("{other:?}")),
            }
        }
        strip
    }
}

impl ClassVisitor for StripLocator {
    fn visit_annotation(&mut self, annotation: Annotation) -> Option<Annotation> {
        if self.strips(std::slice::from_ref(&annotation)) {
            self.skip_entire = true;
        }
        Some(annotation)
    }

    fn visit_field(&mut self, field: FieldDef) -> Option<FieldDef> {
        if self.strips(&field.annotations) {
            self.fields.push(field.name.clone());
        }
        Some(field)
    }

    fn visit_method(&mut self, method: MethodDef) -> Option<MethodDef> {
        if self.strips(&method.annotations) {
            self.methods
                .push((method.name.clone(), method.descriptor.clone()));
        }
        Some(method)
    }
}

/// Removes the located members
struct ClassStripper {
    methods: Vec<(String, String)>,
    fields: Vec<String>,
}

impl ClassVisitor for ClassStripper {
    fn visit_field(&mut self, field: FieldDef) -> Option<FieldDef> {
        (!self.fields.contains(&field.name)).then_some(field)
    }

    fn visit_method(&mut self, method: MethodDef) -> Option<MethodDef> {
        let stripped = self
            .methods
            .iter()
            .any(|(name, descriptor)| *name == method.name && *descriptor == method.descriptor);
        (!stripped).then_some(method)
    }
}

/// Built-in transformation removing everything restricted to the other side
#[derive(Debug, Clone, Copy)]
pub struct SideStripping {
    side: Side,
}

impl SideStripping {
    /// Strip for a run on `side`
    pub fn new(side: Side) -> Self {
        Self { side }
    }
}

impl Transformation for SideStripping {
    fn transform(&self, unit: &mut CodeUnit) -> Result<(), TransformError> {
        let mut locator = StripLocator::new(self.side);
        unit.walk(&mut locator)?;

        if let Some(value) = locator.invalid {
            return Err(TransformError::Message(format!(
                "invalid side {} in OnlyIn on {}",
                value,
                unit.name()
            )));
        }
        if locator.skip_entire {
            unit.mark_skipped();
            return Ok(());
        }
        if locator.methods.is_empty() && locator.fields.is_empty() {
            return Ok(());
        }
        unit.queue_visitor_wrap(ClassStripper {
            methods: locator.methods,
            fields: locator.fields,
        });
        Ok(())
    }
}
