//! Conversion of extracted units into store records and enrichment requests.

use crate::enrich::EnrichmentRequest;
use crate::indexer::extract::{
    CallEdge, ClassEntity, Decorator, ExtractedUnit, FunctionEntity, Span,
};
use crate::model::{EdgeKind, EdgeRecord, EdgeTarget, EntityKind, EntityRecord};
use serde_json::{Value, json};
use std::collections::HashSet;

/// Store records for every tracked entity of the unit, module first, then
/// classes and functions in document order.
pub fn unit_records(unit: &ExtractedUnit) -> Vec<EntityRecord> {
    let mut out = Vec::with_capacity(1 + unit.classes.len() + unit.functions.len());
    out.push(module_record(unit));
    for class in &unit.classes {
        out.push(class_record(unit, class));
    }
    for func in &unit.functions {
        out.push(function_record(unit, func));
    }
    out.sort_by_key(|record| record_start(unit, &record.key));
    out
}

fn record_start(unit: &ExtractedUnit, key: &str) -> usize {
    if key == unit.module.key {
        return 0;
    }
    unit.class(key)
        .map(|class| class.span.start_byte + 1)
        .or_else(|| unit.function(key).map(|func| func.span.start_byte + 1))
        .unwrap_or(usize::MAX)
}

pub fn record_for(unit: &ExtractedUnit, key: &str) -> Option<EntityRecord> {
    if key == unit.module.key {
        return Some(module_record(unit));
    }
    if let Some(class) = unit.class(key) {
        return Some(class_record(unit, class));
    }
    unit.function(key).map(|func| function_record(unit, func))
}

pub fn module_record(unit: &ExtractedUnit) -> EntityRecord {
    let module = &unit.module;
    let mut edges = Vec::new();
    for import in &unit.imports {
        edges.push(EdgeRecord {
            kind: EdgeKind::Imports,
            source_key: module.key.clone(),
            target: EdgeTarget::unresolved(import.target_module.clone()),
            target_name: import.target_module.clone(),
            position: import.position as i64,
            detail: serde_json::to_value(import).ok(),
        });
    }
    let orphaned: Vec<&CallEdge> = unit.orphaned_calls().collect();
    edges.extend(call_edges(&orphaned));

    let mut seen = HashSet::new();
    let mut children = Vec::new();
    let decorators = unit
        .classes
        .iter()
        .flat_map(|class| class.decorators.iter())
        .chain(unit.functions.iter().flat_map(|func| func.decorators.iter()));
    let mut decorators: Vec<&Decorator> = decorators.collect();
    decorators.sort_by_key(|decorator| decorator.line);
    for decorator in decorators {
        if !seen.insert(decorator.key.clone()) {
            continue;
        }
        children.push(EntityRecord {
            key: decorator.key.clone(),
            kind: EntityKind::Decorator,
            name: decorator.name.clone(),
            module: module.key.clone(),
            file_path: unit.path.clone(),
            parent_key: Some(module.key.clone()),
            fingerprint: None,
            attributes: json!({
                "arguments": decorator.arguments,
                "line": decorator.line,
            }),
            edges: Vec::new(),
            children: Vec::new(),
        });
    }

    EntityRecord {
        key: module.key.clone(),
        kind: EntityKind::Module,
        name: module.name.clone(),
        module: module.key.clone(),
        file_path: unit.path.clone(),
        parent_key: None,
        fingerprint: Some(module.fingerprint.clone()),
        attributes: json!({
            "docstring": module.docstring,
            "is_package": module.is_package,
            "file_hash": unit.file_hash,
        }),
        edges,
        children,
    }
}

pub fn class_record(unit: &ExtractedUnit, class: &ClassEntity) -> EntityRecord {
    let mut edges = Vec::new();
    for (position, base) in class.bases.iter().enumerate() {
        edges.push(EdgeRecord {
            kind: EdgeKind::InheritsFrom,
            source_key: class.key.clone(),
            target: base.target.clone(),
            target_name: base.name.clone(),
            position: position as i64,
            detail: None,
        });
    }
    edges.extend(decorator_edges(&class.key, &class.decorators));
    let calls: Vec<&CallEdge> = unit.calls_from(&class.key).collect();
    edges.extend(call_edges(&calls));

    let children = class
        .attributes
        .iter()
        .map(|attr| EntityRecord {
            key: attr.key.clone(),
            kind: EntityKind::Attribute,
            name: attr.name.clone(),
            module: unit.module.key.clone(),
            file_path: unit.path.clone(),
            parent_key: Some(class.key.clone()),
            fingerprint: None,
            attributes: json!({
                "annotation": attr.annotation,
                "default": attr.default,
                "line": attr.line,
            }),
            edges: Vec::new(),
            children: Vec::new(),
        })
        .collect();

    EntityRecord {
        key: class.key.clone(),
        kind: EntityKind::Class,
        name: class.name.clone(),
        module: unit.module.key.clone(),
        file_path: unit.path.clone(),
        parent_key: Some(class.parent_key.clone()),
        fingerprint: Some(class.fingerprint.clone()),
        attributes: json!({
            "docstring": class.docstring,
            "bases": class.bases.iter().map(|b| b.name.as_str()).collect::<Vec<_>>(),
            "decorators": decorator_names(&class.decorators),
            "span": span_json(&class.span),
        }),
        edges,
        children,
    }
}

pub fn function_record(unit: &ExtractedUnit, func: &FunctionEntity) -> EntityRecord {
    let mut edges = decorator_edges(&func.key, &func.decorators);
    let calls: Vec<&CallEdge> = unit.calls_from(&func.key).collect();
    edges.extend(call_edges(&calls));

    let children = func
        .parameters
        .iter()
        .map(|param| EntityRecord {
            key: param.key.clone(),
            kind: EntityKind::Parameter,
            name: param.name.clone(),
            module: unit.module.key.clone(),
            file_path: unit.path.clone(),
            parent_key: Some(func.key.clone()),
            fingerprint: None,
            attributes: json!({
                "annotation": param.annotation,
                "default": param.default,
                "kind": param.kind,
                "position": param.position,
            }),
            edges: Vec::new(),
            children: Vec::new(),
        })
        .collect();

    EntityRecord {
        key: func.key.clone(),
        kind: func.kind,
        name: func.name.clone(),
        module: unit.module.key.clone(),
        file_path: unit.path.clone(),
        parent_key: Some(func.parent_key.clone()),
        fingerprint: Some(func.fingerprint.clone()),
        attributes: json!({
            "docstring": func.docstring,
            "is_async": func.is_async,
            "return_annotation": func.return_annotation,
            "class_key": func.class_key,
            "is_staticmethod": func.is_staticmethod,
            "is_classmethod": func.is_classmethod,
            "is_property": func.is_property,
            "decorators": decorator_names(&func.decorators),
            "span": span_json(&func.span),
        }),
        edges,
        children,
    }
}

fn call_edges(calls: &[&CallEdge]) -> Vec<EdgeRecord> {
    calls
        .iter()
        .enumerate()
        .map(|(position, call)| EdgeRecord {
            kind: EdgeKind::Calls,
            source_key: call.caller.clone().unwrap_or_else(|| call.scope.clone()),
            target: call.target.clone(),
            target_name: call.callee.clone(),
            position: position as i64,
            detail: Some(json!({ "line": call.line, "scope": call.scope })),
        })
        .collect()
}

fn decorator_edges(source_key: &str, decorators: &[Decorator]) -> Vec<EdgeRecord> {
    decorators
        .iter()
        .enumerate()
        .map(|(position, decorator)| EdgeRecord {
            kind: EdgeKind::DecoratedBy,
            source_key: source_key.to_string(),
            target: EdgeTarget::Resolved {
                key: decorator.key.clone(),
            },
            target_name: decorator.name.clone(),
            position: position as i64,
            detail: decorator
                .arguments
                .as_ref()
                .map(|arguments| json!({ "arguments": arguments })),
        })
        .collect()
}

fn decorator_names(decorators: &[Decorator]) -> Vec<&str> {
    decorators.iter().map(|d| d.name.as_str()).collect()
}

fn span_json(span: &Span) -> Value {
    json!({ "start_line": span.start_line, "end_line": span.end_line })
}

/// Request for the external enricher, or `None` for keys that are not
/// classes, functions or methods of this unit.
pub fn enrichment_request(unit: &ExtractedUnit, key: &str) -> Option<EnrichmentRequest> {
    if let Some(class) = unit.class(key) {
        let callees: Vec<String> = unit.calls_from(key).map(|c| c.callee.clone()).collect();
        return Some(EnrichmentRequest {
            key: class.key.clone(),
            kind: EntityKind::Class,
            name: class.name.clone(),
            source: unit.span_text(&class.span),
            docstring: class.docstring.clone(),
            parameters: Vec::new(),
            parent: Some(class.parent_key.clone()),
            callees,
            bases: class.bases.iter().map(|b| b.name.clone()).collect(),
            decorators: decorator_names(&class.decorators)
                .into_iter()
                .map(str::to_string)
                .collect(),
            fingerprint: class.fingerprint.clone(),
        });
    }
    let func = unit.function(key)?;
    Some(EnrichmentRequest {
        key: func.key.clone(),
        kind: func.kind,
        name: func.name.clone(),
        source: unit.span_text(&func.span),
        docstring: func.docstring.clone(),
        parameters: func.parameters.iter().map(|p| p.name.clone()).collect(),
        parent: Some(func.parent_key.clone()),
        callees: unit.calls_from(key).map(|c| c.callee.clone()).collect(),
        bases: Vec::new(),
        decorators: decorator_names(&func.decorators)
            .into_iter()
            .map(str::to_string)
            .collect(),
        fingerprint: func.fingerprint.clone(),
    })
}
