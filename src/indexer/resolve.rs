//! Second-pass resolution of call and base-class targets.
//!
//! Runs after every unit of a run is extracted, against a table of all known
//! classes and functions. Bare names are looked up in three passes: the
//! caller's own module (lexically visible bindings only), modules the caller
//! imports, then a globally unique module-level name. Dotted callees resolve
//! only when they name an existing key exactly, optionally after expanding an
//! import alias. Calls through `self`/`cls` are never resolved.

use crate::indexer::extract::ExtractedUnit;
use crate::model::{
    EdgeTarget, EntityKind, ResolutionStats, ResolutionWarning, StoredEntity, WarningKind,
};
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub key: String,
    pub kind: EntityKind,
    pub module: String,
    pub parent_key: String,
    pub name: String,
}

impl Symbol {
    fn is_module_level(&self) -> bool {
        self.parent_key == self.module && self.kind != EntityKind::Method
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(String),
    Unresolved,
    Ambiguous(Vec<String>),
}

#[derive(Debug, Default)]
struct ModuleImports {
    /// Modules imported, plus `X.name` for every `from X import name`.
    targets: HashSet<String>,
    /// Local binding to the dotted name it refers to.
    aliases: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    by_key: HashMap<String, Symbol>,
    by_name: HashMap<String, Vec<String>>,
    imports: HashMap<String, ModuleImports>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table seeded from stored entities, skipping those of `exclude_path`
    /// (the unit about to replace them).
    pub fn from_stored(entities: &[StoredEntity], exclude_path: &str) -> Self {
        let mut table = Self::new();
        for entity in entities {
            if entity.file_path == exclude_path {
                continue;
            }
            if !matches!(
                entity.kind,
                EntityKind::Class | EntityKind::Function | EntityKind::Method
            ) {
                continue;
            }
            table.insert(Symbol {
                key: entity.key.clone(),
                kind: entity.kind,
                module: entity.module.clone(),
                parent_key: entity
                    .parent_key
                    .clone()
                    .unwrap_or_else(|| entity.module.clone()),
                name: entity.name.clone(),
            });
        }
        table
    }

    pub fn add_unit(&mut self, unit: &ExtractedUnit) {
        let module = &unit.module.key;
        for class in &unit.classes {
            self.insert(Symbol {
                key: class.key.clone(),
                kind: EntityKind::Class,
                module: module.clone(),
                parent_key: class.parent_key.clone(),
                name: class.name.clone(),
            });
        }
        for func in &unit.functions {
            self.insert(Symbol {
                key: func.key.clone(),
                kind: func.kind,
                module: module.clone(),
                parent_key: func.parent_key.clone(),
                name: func.name.clone(),
            });
        }

        let imports = self.imports.entry(module.clone()).or_default();
        for edge in &unit.imports {
            if !edge.resolved {
                continue;
            }
            let target = &edge.target_module;
            imports.targets.insert(target.clone());
            if !edge.is_from {
                if let Some(alias) = &edge.alias {
                    imports.aliases.insert(alias.clone(), target.clone());
                }
                continue;
            }
            for imported in &edge.names {
                if imported.name == "*" {
                    continue;
                }
                let full = format!("{target}.{}", imported.name);
                let local = imported.alias.as_ref().unwrap_or(&imported.name);
                imports.aliases.insert(local.clone(), full.clone());
                imports.targets.insert(full);
            }
        }
    }

    fn insert(&mut self, symbol: Symbol) {
        if let Some(previous) = self.by_key.get(&symbol.key) {
            if let Some(keys) = self.by_name.get_mut(&previous.name) {
                keys.retain(|key| key != &symbol.key);
            }
        }
        self.by_name
            .entry(symbol.name.clone())
            .or_default()
            .push(symbol.key.clone());
        self.by_key.insert(symbol.key.clone(), symbol);
    }

    pub fn get(&self, key: &str) -> Option<&Symbol> {
        self.by_key.get(key)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Resolve a callee as written inside `scope` of `module`.
    pub fn resolve_call(&self, module: &str, scope: &str, callee: &str) -> Resolution {
        self.resolve(module, scope, callee, |_| true)
    }

    /// Resolve a base-class expression; only classes are candidates.
    pub fn resolve_base(&self, module: &str, scope: &str, base: &str) -> Resolution {
        let base = base.split('[').next().unwrap_or(base).trim();
        self.resolve(module, scope, base, |symbol| symbol.kind == EntityKind::Class)
    }

    fn resolve<F>(&self, module: &str, scope: &str, name: &str, accept: F) -> Resolution
    where
        F: Fn(&Symbol) -> bool,
    {
        if name.is_empty() || name.starts_with("self.") || name.starts_with("cls.") {
            return Resolution::Unresolved;
        }
        let imports = self.imports.get(module);

        if name.contains('.') {
            if self.by_key.get(name).is_some_and(&accept) {
                return Resolution::Resolved(name.to_string());
            }
            let (head, rest) = name.split_once('.').unwrap_or((name, ""));
            if let Some(expanded) = imports.and_then(|i| i.aliases.get(head)) {
                let candidate = format!("{expanded}.{rest}");
                if self.by_key.get(&candidate).is_some_and(&accept) {
                    return Resolution::Resolved(candidate);
                }
            }
            return Resolution::Unresolved;
        }

        let Some(keys) = self.by_name.get(name) else {
            return self.resolve_alias(imports, name, &accept);
        };
        let candidates: Vec<&Symbol> = keys
            .iter()
            .filter_map(|key| self.by_key.get(key))
            .filter(|symbol| accept(symbol))
            .collect();

        // Pass 1: lexically visible binding in the same module, innermost wins.
        let visible = candidates
            .iter()
            .filter(|symbol| symbol.module == module && symbol.kind != EntityKind::Method)
            .filter(|symbol| {
                symbol.parent_key == module
                    || scope == symbol.parent_key
                    || scope.starts_with(&format!("{}.", symbol.parent_key))
            })
            .max_by_key(|symbol| symbol.parent_key.len());
        if let Some(symbol) = visible {
            return Resolution::Resolved(symbol.key.clone());
        }

        // Pass 2: imported modules and imported names.
        if let Resolution::Resolved(key) = self.resolve_alias(imports, name, &accept) {
            return Resolution::Resolved(key);
        }
        if let Some(imports) = imports {
            let imported: Vec<&&Symbol> = candidates
                .iter()
                .filter(|symbol| symbol.is_module_level())
                .filter(|symbol| {
                    imports.targets.contains(&symbol.module) || imports.targets.contains(&symbol.key)
                })
                .collect();
            match imported.len() {
                1 => return Resolution::Resolved(imported[0].key.clone()),
                0 => {}
                _ => {
                    return Resolution::Ambiguous(
                        imported.iter().map(|symbol| symbol.key.clone()).collect(),
                    );
                }
            }
        }

        // Pass 3: globally unique module-level binding.
        let global: Vec<&&Symbol> = candidates
            .iter()
            .filter(|symbol| symbol.is_module_level())
            .collect();
        match global.len() {
            1 => Resolution::Resolved(global[0].key.clone()),
            0 => Resolution::Unresolved,
            _ => Resolution::Ambiguous(global.iter().map(|symbol| symbol.key.clone()).collect()),
        }
    }

    fn resolve_alias<F>(&self, imports: Option<&ModuleImports>, name: &str, accept: &F) -> Resolution
    where
        F: Fn(&Symbol) -> bool,
    {
        let Some(full) = imports.and_then(|i| i.aliases.get(name)) else {
            return Resolution::Unresolved;
        };
        if self.by_key.get(full).is_some_and(accept) {
            Resolution::Resolved(full.clone())
        } else {
            Resolution::Unresolved
        }
    }

    /// Fill in call and base targets of `unit` and record a warning for every
    /// name left unresolved. Calls through `self`/`cls` stay unresolved
    /// without a warning.
    pub fn resolve_unit(&self, unit: &mut ExtractedUnit) -> ResolutionStats {
        let mut stats = ResolutionStats::default();
        let module = unit.module.key.clone();
        let mut warnings = Vec::new();

        for call in unit.calls.iter_mut() {
            match self.resolve_call(&module, &call.scope, &call.callee) {
                Resolution::Resolved(key) => {
                    call.target = EdgeTarget::Resolved { key };
                    stats.calls_resolved += 1;
                }
                outcome => {
                    call.target = EdgeTarget::unresolved(call.callee.clone());
                    stats.calls_unresolved += 1;
                    if is_dynamic(&call.callee) {
                        continue;
                    }
                    warnings.push(unresolved_warning(
                        &unit.path,
                        &call.scope,
                        &call.callee,
                        outcome,
                        WarningKind::UnresolvedCall,
                    ));
                }
            }
        }

        for class in unit.classes.iter_mut() {
            for base in class.bases.iter_mut() {
                match self.resolve_base(&module, &class.parent_key, &base.name) {
                    Resolution::Resolved(key) => {
                        base.target = EdgeTarget::Resolved { key };
                        stats.bases_resolved += 1;
                    }
                    outcome => {
                        base.target = EdgeTarget::unresolved(base.name.clone());
                        stats.bases_unresolved += 1;
                        warnings.push(unresolved_warning(
                            &unit.path,
                            &class.key,
                            &base.name,
                            outcome,
                            WarningKind::UnresolvedBase,
                        ));
                    }
                }
            }
        }

        unit.warnings.retain(|warning| {
            !matches!(
                warning.kind,
                WarningKind::UnresolvedCall | WarningKind::UnresolvedBase | WarningKind::AmbiguousCall
            )
        });
        unit.warnings.extend(warnings);
        stats
    }
}

fn is_dynamic(callee: &str) -> bool {
    callee.starts_with("self.") || callee.starts_with("cls.")
}

fn unresolved_warning(
    path: &str,
    scope: &str,
    name: &str,
    outcome: Resolution,
    kind: WarningKind,
) -> ResolutionWarning {
    match outcome {
        Resolution::Ambiguous(keys) => {
            let keys: BTreeSet<String> = keys.into_iter().collect();
            ResolutionWarning::new(
                WarningKind::AmbiguousCall,
                path,
                scope,
                format!(
                    "`{name}` matches {}",
                    keys.into_iter().collect::<Vec<_>>().join(", ")
                ),
            )
        }
        _ => ResolutionWarning::new(kind, path, scope, format!("`{name}` is not resolvable")),
    }
}
