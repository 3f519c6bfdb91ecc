use crate::error::IdentityCollisionError;
use crate::model::EntityKind;
use std::collections::HashMap;
use std::path::Path;

pub fn module_name_from_rel_path(rel_path: &str) -> String {
    let path = Path::new(rel_path);
    let mut parts: Vec<String> = path
        .components()
        .filter_map(|comp| comp.as_os_str().to_str().map(|s| s.to_string()))
        .collect();
    if parts.is_empty() {
        return "__init__".to_string();
    }
    let file = parts.pop().unwrap_or_default();
    let stem = file
        .strip_suffix(".pyi")
        .or_else(|| file.strip_suffix(".py"))
        .unwrap_or(&file)
        .to_string();
    if stem != "__init__" {
        parts.push(stem);
    }
    if parts.is_empty() {
        "__init__".to_string()
    } else {
        parts.join(".")
    }
}

pub fn is_package_path(rel_path: &str) -> bool {
    Path::new(rel_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|stem| stem == "__init__")
}

pub fn qualify(container: &str, name: &str) -> String {
    format!("{container}.{name}")
}

/// Absolute target of a relative import, or `None` when the dots climb past
/// the top of the importing module's package.
///
/// `level` is the number of leading dots; `module` is the dotted text after
/// them, possibly empty (`from . import x`).
pub fn resolve_relative(
    importer: &str,
    is_package: bool,
    level: usize,
    module: &str,
) -> Option<String> {
    if level == 0 {
        return Some(module.to_string());
    }
    // The repository root package has no name of its own.
    let parts: Vec<&str> = if is_package && importer == "__init__" {
        Vec::new()
    } else {
        importer.split('.').collect()
    };
    let strip = if is_package { level - 1 } else { level };
    if strip >= parts.len() && !(is_package && strip == 0) {
        return None;
    }
    let base = &parts[..parts.len() - strip];
    let mut out = base.join(".");
    if !module.is_empty() {
        if !out.is_empty() {
            out.push('.');
        }
        out.push_str(module);
    }
    if out.is_empty() { None } else { Some(out) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityClaim {
    pub file_path: String,
    pub kind: EntityKind,
}

/// Repository-wide registry of identity keys. A key claimed from two
/// different files is a collision.
#[derive(Debug, Default)]
pub struct IdentityIndex {
    claims: HashMap<String, IdentityClaim>,
}

impl IdentityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(
        &mut self,
        key: &str,
        kind: EntityKind,
        file_path: &str,
    ) -> Result<(), IdentityCollisionError> {
        if let Some(existing) = self.claims.get(key) {
            if existing.file_path != file_path {
                let (first, second) = if existing.file_path.as_str() <= file_path {
                    (existing.file_path.clone(), file_path.to_string())
                } else {
                    (file_path.to_string(), existing.file_path.clone())
                };
                return Err(IdentityCollisionError {
                    key: key.to_string(),
                    first_path: first,
                    second_path: second,
                });
            }
            return Ok(());
        }
        self.claims.insert(
            key.to_string(),
            IdentityClaim {
                file_path: file_path.to_string(),
                kind,
            },
        );
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&IdentityClaim> {
        self.claims.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.claims.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}
