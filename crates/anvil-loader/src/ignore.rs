//! Names kept out of the transformation pipeline
//!
//! Ignored classes are resolved by the host's bootstrap tier. The loader's
//! own support code is ignored so that resolving a class never requires the
//! loader to load itself.

use parking_lot::RwLock;
use rustc_hash::FxHashSet;

#[derive(Debug, Default)]
struct Rules {
    classes: FxHashSet<String>,
    packages: Vec<String>,
    absolute_packages: FxHashSet<String>,
}

/// Exact class names plus package rules
#[derive(Debug, Default)]
pub struct IgnoreSet {
    rules: RwLock<Rules>,
}

impl IgnoreSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Ignore a package and every package below it
    pub fn ignore_package(&self, package: impl Into<String>) {
        let mut prefix = package.into();
        prefix.push('.');
        let mut rules = self.rules.write();
        if !rules.packages.contains(&prefix) {
            rules.packages.push(prefix);
        }
    }

    /// Ignore the classes directly inside a package, not its subpackages
    pub fn ignore_package_absolute(&self, package: impl Into<String>) {
        self.rules.write().absolute_packages.insert(package.into());
    }

    /// Ignore a single class
    pub fn ignore_class(&self, name: impl Into<String>) {
        self.rules.write().classes.insert(name.into());
    }

    /// Whether `name` bypasses the pipeline
    pub fn is_ignored(&self, name: &str) -> bool {
        let rules = self.rules.read();
        if rules.classes.contains(name) {
            return true;
        }
        if let Some((package, _)) = name.rsplit_once('.') {
            if rules.absolute_packages.contains(package) {
                return true;
            }
        }
        rules.packages.iter().any(|prefix| name.starts_with(prefix.as_str()))
    }
}
