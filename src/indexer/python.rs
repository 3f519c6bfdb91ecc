use crate::error::{IndexError, IndexResult, ParseError};
use crate::indexer::extract::{
    BaseClass, CallEdge, ClassAttribute, ClassEntity, Decorator, ExtractedUnit, FunctionEntity,
    ImportEdge, ImportGuard, ImportedName, ModuleEntity, Parameter, ParameterKind, Span,
};
use crate::indexer::hasher;
use crate::indexer::identity::{self, is_package_path, module_name_from_rel_path, qualify};
use crate::model::{EdgeTarget, EntityKind, ResolutionWarning, WarningKind};
use crate::util;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use tree_sitter::{Node, Parser};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerKind {
    Module,
    Class,
    Function,
}

/// Traversal state carried with every node on the worklist.
#[derive(Debug, Clone)]
struct Scope {
    container: String,
    container_kind: ContainerKind,
    /// Key calls are attributed to (`<enclosing>.<lambda>` inside lambdas).
    call_scope: String,
    /// Entity owning calls in this scope; `None` at module level and in lambdas.
    caller: Option<String>,
    caller_start_byte: usize,
    guard: ImportGuard,
}

impl Scope {
    fn module(module: &str) -> Self {
        Self {
            container: module.to_string(),
            container_kind: ContainerKind::Module,
            call_scope: module.to_string(),
            caller: None,
            caller_start_byte: 0,
            guard: ImportGuard::default(),
        }
    }

    /// Fresh scope for the body of a class or function. Import guards do not
    /// cross definition boundaries.
    fn definition(key: &str, kind: ContainerKind, start_byte: usize) -> Self {
        Self {
            container: key.to_string(),
            container_kind: kind,
            call_scope: key.to_string(),
            caller: Some(key.to_string()),
            caller_start_byte: start_byte,
            guard: ImportGuard::default(),
        }
    }

    fn with_guard(&self, guard: ImportGuard) -> Self {
        Self {
            guard,
            ..self.clone()
        }
    }
}

pub struct PythonExtractor {
    parser: Parser,
}

impl PythonExtractor {
    pub fn new() -> IndexResult<Self> {
        let mut parser = Parser::new();
        let language = tree_sitter_python::LANGUAGE;
        parser
            .set_language(&language.into())
            .map_err(|err| IndexError::Setup(format!("load python grammar: {err}")))?;
        Ok(Self { parser })
    }

    /// Parse one source unit into entities and relationships.
    ///
    /// Keys come from the repository-relative path alone, so re-extracting
    /// unchanged text yields identical keys and fingerprints.
    pub fn extract(&mut self, rel_path: &str, source: &str) -> Result<ExtractedUnit, ParseError> {
        let tree = self
            .parser
            .parse(source, None)
            .ok_or_else(|| ParseError::new(rel_path, "parser returned no tree"))?;
        let root = tree.root_node();
        if root.has_error() {
            let mut err = ParseError::new(rel_path, "syntax error");
            if let Some(line) = first_error_line(root) {
                err = err.at_line(line);
            }
            return Err(err);
        }

        let module_key = module_name_from_rel_path(rel_path);
        let module = ModuleEntity {
            name: module_key
                .rsplit('.')
                .next()
                .unwrap_or(&module_key)
                .to_string(),
            key: module_key.clone(),
            docstring: extract_docstring(root, source),
            fingerprint: hasher::fingerprint(source),
            is_package: is_package_path(rel_path),
        };

        let mut collector = Collector {
            path: rel_path,
            module: &module_key,
            is_package: module.is_package,
            source,
            classes: Vec::new(),
            functions: Vec::new(),
            imports: Vec::new(),
            calls: Vec::new(),
            seen_calls: HashSet::new(),
            warnings: Vec::new(),
        };
        collector.walk(root);
        Ok(collector.finish(module))
    }
}

thread_local! {
    static EXTRACTOR: RefCell<Option<PythonExtractor>> = const { RefCell::new(None) };
}

/// Extract with a parser owned by the calling thread.
pub fn extract_source(rel_path: &str, source: &str) -> Result<ExtractedUnit, ParseError> {
    EXTRACTOR.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            let extractor =
                PythonExtractor::new().map_err(|err| ParseError::new(rel_path, err.to_string()))?;
            *slot = Some(extractor);
        }
        match slot.as_mut() {
            Some(extractor) => extractor.extract(rel_path, source),
            None => Err(ParseError::new(rel_path, "python parser unavailable")),
        }
    })
}

struct Collector<'a> {
    path: &'a str,
    module: &'a str,
    is_package: bool,
    source: &'a str,
    classes: Vec<ClassEntity>,
    functions: Vec<FunctionEntity>,
    imports: Vec<(usize, ImportEdge)>,
    calls: Vec<(usize, CallEdge)>,
    seen_calls: HashSet<(String, usize, String)>,
    warnings: Vec<ResolutionWarning>,
}

impl<'a> Collector<'a> {
    fn walk(&mut self, root: Node<'_>) {
        let mut stack: Vec<(Node<'_>, Scope)> = Vec::new();
        push_children(&mut stack, root, &Scope::module(self.module));

        while let Some((node, scope)) = stack.pop() {
            match node.kind() {
                "decorated_definition" => {
                    let Some(definition) = node.child_by_field_name("definition") else {
                        push_children(&mut stack, node, &scope);
                        continue;
                    };
                    let decorators = named_children_of_kind(node, "decorator");
                    self.visit_definition(definition, node, &decorators, &scope, &mut stack);
                }
                "class_definition" | "function_definition" | "async_function_definition" => {
                    self.visit_definition(node, node, &[], &scope, &mut stack);
                }
                "lambda" => {
                    let lambda_scope = Scope {
                        call_scope: format!("{}.<lambda>", scope.call_scope),
                        caller: None,
                        ..scope.clone()
                    };
                    if let Some(body) = node.child_by_field_name("body") {
                        stack.push((body, lambda_scope));
                    }
                    if let Some(params) = node.child_by_field_name("parameters") {
                        stack.push((params, scope));
                    }
                }
                "call" => {
                    self.visit_call(node, &scope);
                    push_children(&mut stack, node, &scope);
                }
                "import_statement" => self.visit_import(node, &scope),
                "import_from_statement" | "future_import_statement" => {
                    self.visit_from_import(node, &scope)
                }
                "if_statement" => push_if_branches(&mut stack, node, &scope, self.source),
                "try_statement" => push_try_branches(&mut stack, node, &scope),
                _ => push_children(&mut stack, node, &scope),
            }
        }
    }

    fn visit_definition<'t>(
        &mut self,
        node: Node<'t>,
        outer: Node<'t>,
        decorator_nodes: &[Node<'t>],
        scope: &Scope,
        stack: &mut Vec<(Node<'t>, Scope)>,
    ) {
        let Some(name_node) = node.child_by_field_name("name") else {
            push_children(stack, node, scope);
            return;
        };
        let name = node_text(name_node, self.source);
        let key = qualify(&scope.container, &name);
        let span = Span {
            start_line: outer.start_position().row + 1,
            end_line: node.end_position().row + 1,
            start_byte: outer.start_byte(),
            end_byte: node.end_byte(),
        };
        let fingerprint = hasher::fingerprint(&util::slice_lines(
            self.source,
            span.start_line,
            span.end_line,
        ));
        let decorators: Vec<Decorator> = decorator_nodes
            .iter()
            .filter_map(|decorator| self.decorator(*decorator))
            .collect();
        let body = node.child_by_field_name("body");
        let docstring = body.and_then(|body| extract_docstring(body, self.source));

        // Reverse document order: body, then signature parts, then decorators.
        if node.kind() == "class_definition" {
            if let Some(body) = body {
                let inner = Scope::definition(&key, ContainerKind::Class, span.start_byte);
                stack.push((body, inner));
            }
            let superclasses = node.child_by_field_name("superclasses");
            if let Some(args) = superclasses {
                stack.push((args, scope.clone()));
            }
            let class = ClassEntity {
                bases: superclasses
                    .map(|args| base_names(args, self.source))
                    .unwrap_or_default()
                    .into_iter()
                    .map(|name| BaseClass {
                        target: EdgeTarget::unresolved(name.clone()),
                        name,
                    })
                    .collect(),
                attributes: body
                    .map(|body| class_attributes(body, &key, self.source))
                    .unwrap_or_default(),
                key,
                name,
                parent_key: scope.container.clone(),
                docstring,
                decorators,
                fingerprint,
                span,
            };
            self.classes.push(class);
        } else {
            if let Some(body) = body {
                let inner = Scope::definition(&key, ContainerKind::Function, span.start_byte);
                stack.push((body, inner));
            }
            let return_type = node.child_by_field_name("return_type");
            if let Some(ret) = return_type {
                stack.push((ret, scope.clone()));
            }
            if let Some(params) = node.child_by_field_name("parameters") {
                stack.push((params, scope.clone()));
            }

            let is_method = scope.container_kind == ContainerKind::Class;
            let mut func = FunctionEntity {
                parameters: node
                    .child_by_field_name("parameters")
                    .map(|params| parse_parameters(params, &key, self.source))
                    .unwrap_or_default(),
                key,
                name,
                kind: if is_method {
                    EntityKind::Method
                } else {
                    EntityKind::Function
                },
                parent_key: scope.container.clone(),
                class_key: is_method.then(|| scope.container.clone()),
                is_async: is_async(node),
                return_annotation: return_type.map(|ret| node_text(ret, self.source)),
                docstring,
                decorators,
                is_staticmethod: false,
                is_classmethod: false,
                is_property: false,
                fingerprint,
                span,
            };
            if is_method {
                for decorator in &func.decorators {
                    match decorator.name.as_str() {
                        "staticmethod" => func.is_staticmethod = true,
                        "classmethod" => func.is_classmethod = true,
                        name if is_property_decorator(name) => func.is_property = true,
                        _ => {}
                    }
                }
            }
            self.functions.push(func);
        }

        for decorator in decorator_nodes.iter().rev() {
            stack.push((*decorator, scope.clone()));
        }
    }

    fn decorator(&self, node: Node<'_>) -> Option<Decorator> {
        let expr = node.named_child(0)?;
        let (name, arguments) = if expr.kind() == "call" {
            let function = expr.child_by_field_name("function")?;
            let args = expr
                .child_by_field_name("arguments")
                .map(|args| strip_parens(&node_text(args, self.source)));
            (node_text(function, self.source), args)
        } else {
            (node_text(expr, self.source), None)
        };
        Some(Decorator {
            key: format!("{name}@{}", self.module),
            name,
            arguments,
            line: node.start_position().row + 1,
        })
    }

    fn visit_call(&mut self, node: Node<'_>, scope: &Scope) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        let Some(callee) = callee_name(function, self.source) else {
            return;
        };
        let owner = scope
            .caller
            .clone()
            .unwrap_or_else(|| self.module.to_string());
        let dedup = (owner, scope.caller_start_byte, callee.clone());
        if !self.seen_calls.insert(dedup) {
            return;
        }
        self.calls.push((
            node.start_byte(),
            CallEdge {
                caller: scope.caller.clone(),
                scope: scope.call_scope.clone(),
                target: EdgeTarget::unresolved(callee.clone()),
                callee,
                line: node.start_position().row + 1,
                caller_start_byte: scope.caller_start_byte,
            },
        ));
    }

    fn visit_import(&mut self, node: Node<'_>, scope: &Scope) {
        let mut cursor = node.walk();
        for name in node.children_by_field_name("name", &mut cursor) {
            let (target, alias) = match name.kind() {
                "aliased_import" => (
                    name.child_by_field_name("name")
                        .map(|n| node_text(n, self.source))
                        .unwrap_or_default(),
                    name.child_by_field_name("alias")
                        .map(|n| node_text(n, self.source)),
                ),
                _ => (node_text(name, self.source), None),
            };
            if target.is_empty() {
                continue;
            }
            self.imports.push((
                name.start_byte(),
                ImportEdge {
                    source_module: self.module.to_string(),
                    target_module: target,
                    names: Vec::new(),
                    alias,
                    is_from: false,
                    is_relative: false,
                    level: 0,
                    is_wildcard: false,
                    resolved: true,
                    guard: scope.guard.clone(),
                    position: 0,
                    line: name.start_position().row + 1,
                },
            ));
        }
    }

    fn visit_from_import(&mut self, node: Node<'_>, scope: &Scope) {
        let (level, module_text) = match node.child_by_field_name("module_name") {
            Some(module) if module.kind() == "relative_import" => {
                let mut level = 0;
                let mut dotted = String::new();
                let mut cursor = module.walk();
                for part in module.named_children(&mut cursor) {
                    match part.kind() {
                        "import_prefix" => {
                            level = node_text(part, self.source)
                                .chars()
                                .filter(|c| *c == '.')
                                .count()
                        }
                        "dotted_name" => dotted = node_text(part, self.source),
                        _ => {}
                    }
                }
                (level, dotted)
            }
            Some(module) => (0, node_text(module, self.source)),
            None if node.kind() == "future_import_statement" => (0, "__future__".to_string()),
            None => return,
        };

        let mut names = Vec::new();
        let mut cursor = node.walk();
        for name in node.children_by_field_name("name", &mut cursor) {
            match name.kind() {
                "aliased_import" => names.push(ImportedName {
                    name: name
                        .child_by_field_name("name")
                        .map(|n| node_text(n, self.source))
                        .unwrap_or_default(),
                    alias: name
                        .child_by_field_name("alias")
                        .map(|n| node_text(n, self.source)),
                }),
                _ => names.push(ImportedName {
                    name: node_text(name, self.source),
                    alias: None,
                }),
            }
        }
        let is_wildcard = !named_children_of_kind(node, "wildcard_import").is_empty();
        if is_wildcard {
            names.push(ImportedName {
                name: "*".to_string(),
                alias: None,
            });
        }

        let (target, resolved) = if level == 0 {
            (module_text.clone(), true)
        } else {
            match identity::resolve_relative(self.module, self.is_package, level, &module_text) {
                Some(target) => (target, true),
                None => {
                    let written = format!("{}{}", ".".repeat(level), module_text);
                    self.warnings.push(ResolutionWarning::new(
                        WarningKind::UnresolvedRelativeImport,
                        self.path,
                        self.module,
                        format!("relative import `{written}` climbs past the top-level package"),
                    ));
                    (written, false)
                }
            }
        };
        if is_wildcard {
            self.warnings.push(ResolutionWarning::new(
                WarningKind::WildcardImport,
                self.path,
                self.module,
                format!("wildcard import from `{target}` is not expanded"),
            ));
        }

        self.imports.push((
            node.start_byte(),
            ImportEdge {
                source_module: self.module.to_string(),
                target_module: target,
                names,
                alias: None,
                is_from: true,
                is_relative: level > 0,
                level,
                is_wildcard,
                resolved,
                guard: scope.guard.clone(),
                position: 0,
                line: node.start_position().row + 1,
            },
        ));
    }

    fn finish(mut self, module: ModuleEntity) -> ExtractedUnit {
        self.apply_shadowing();
        self.drop_owned_collisions();

        self.classes.sort_by_key(|class| class.span.start_byte);
        self.functions.sort_by_key(|func| func.span.start_byte);
        self.imports.sort_by_key(|(byte, _)| *byte);
        self.calls.sort_by_key(|(byte, _)| *byte);

        let imports = self
            .imports
            .into_iter()
            .enumerate()
            .map(|(position, (_, mut edge))| {
                edge.position = position;
                edge
            })
            .collect();

        ExtractedUnit {
            path: self.path.to_string(),
            file_hash: hasher::hash_bytes(self.source.as_bytes()),
            module,
            classes: self.classes,
            functions: self.functions,
            imports,
            calls: self.calls.into_iter().map(|(_, call)| call).collect(),
            warnings: self.warnings,
            source: self.source.to_string(),
        }
    }

    /// A name bound twice in one unit keeps its last binding. Earlier
    /// bindings are dropped together with everything nested in them.
    fn apply_shadowing(&mut self) {
        let mut bindings: HashMap<&str, Vec<(usize, usize)>> = HashMap::new();
        for class in &self.classes {
            bindings
                .entry(class.key.as_str())
                .or_default()
                .push((class.span.start_byte, class.span.end_byte));
        }
        for func in &self.functions {
            bindings
                .entry(func.key.as_str())
                .or_default()
                .push((func.span.start_byte, func.span.end_byte));
        }

        let mut dropped: Vec<(usize, usize)> = Vec::new();
        let mut warnings = Vec::new();
        for (key, mut spans) in bindings {
            if spans.len() < 2 {
                continue;
            }
            spans.sort_unstable();
            let kept = spans.pop();
            for span in &spans {
                dropped.push(*span);
            }
            if let Some((start, _)) = kept {
                let line = self.source[..start.min(self.source.len())]
                    .matches('\n')
                    .count()
                    + 1;
                warnings.push(ResolutionWarning::new(
                    WarningKind::Shadowed,
                    self.path,
                    key,
                    format!(
                        "{} earlier definition(s) shadowed by the one at line {line}",
                        spans.len()
                    ),
                ));
            }
        }
        if dropped.is_empty() {
            return;
        }
        warnings.sort_by(|a, b| a.key.cmp(&b.key));
        self.warnings.extend(warnings);

        let inside = |start: usize, end: usize| {
            dropped
                .iter()
                .any(|(d_start, d_end)| start >= *d_start && end <= *d_end)
        };
        let mut removed_callers: HashSet<(String, usize)> = HashSet::new();
        self.classes.retain(|class| {
            let drop = inside(class.span.start_byte, class.span.end_byte);
            if drop {
                removed_callers.insert((class.key.clone(), class.span.start_byte));
            }
            !drop
        });
        self.functions.retain(|func| {
            let drop = inside(func.span.start_byte, func.span.end_byte);
            if drop {
                removed_callers.insert((func.key.clone(), func.span.start_byte));
            }
            !drop
        });
        self.calls.retain(|(_, call)| match &call.caller {
            Some(caller) => !removed_callers.contains(&(caller.clone(), call.caller_start_byte)),
            None => true,
        });
    }

    /// Attributes and parameters never share a key with a class or function;
    /// the definition keeps the key.
    fn drop_owned_collisions(&mut self) {
        let defined: HashSet<String> = self
            .classes
            .iter()
            .map(|class| class.key.clone())
            .chain(self.functions.iter().map(|func| func.key.clone()))
            .collect();
        let mut shadowed: Vec<String> = Vec::new();
        for class in &mut self.classes {
            class.attributes.retain(|attr| {
                let clash = defined.contains(&attr.key);
                if clash {
                    shadowed.push(attr.key.clone());
                }
                !clash
            });
        }
        for func in &mut self.functions {
            func.parameters.retain(|param| !defined.contains(&param.key));
        }
        for key in shadowed {
            self.warnings.push(ResolutionWarning::new(
                WarningKind::Shadowed,
                self.path,
                &key,
                "class attribute shadowed by a definition of the same name",
            ));
        }
    }
}

fn push_children<'t>(stack: &mut Vec<(Node<'t>, Scope)>, node: Node<'t>, scope: &Scope) {
    let mut cursor = node.walk();
    let children: Vec<Node<'t>> = node.named_children(&mut cursor).collect();
    for child in children.into_iter().rev() {
        stack.push((child, scope.clone()));
    }
}

fn push_if_branches<'t>(
    stack: &mut Vec<(Node<'t>, Scope)>,
    node: Node<'t>,
    scope: &Scope,
    source: &str,
) {
    let condition = node
        .child_by_field_name("condition")
        .map(|cond| node_text(cond, source))
        .unwrap_or_default();
    let mut branches: Vec<(Node<'t>, Scope)> = Vec::new();
    if let Some(cond) = node.child_by_field_name("condition") {
        branches.push((cond, scope.clone()));
    }
    if let Some(consequence) = node.child_by_field_name("consequence") {
        branches.push((consequence, scope.with_guard(branch_guard(&scope.guard, &condition))));
    }
    let mut cursor = node.walk();
    for alternative in node.children_by_field_name("alternative", &mut cursor) {
        match alternative.kind() {
            "elif_clause" => {
                let elif_condition = alternative
                    .child_by_field_name("condition")
                    .map(|cond| node_text(cond, source))
                    .unwrap_or_default();
                if let Some(cond) = alternative.child_by_field_name("condition") {
                    branches.push((cond, scope.clone()));
                }
                if let Some(consequence) = alternative.child_by_field_name("consequence") {
                    let guard = branch_guard(&scope.guard, &elif_condition);
                    branches.push((consequence, scope.with_guard(guard)));
                }
            }
            "else_clause" => {
                if let Some(body) = alternative.child_by_field_name("body") {
                    let negated = format!("not ({condition})");
                    let guard = conditional_guard(&scope.guard, &negated);
                    branches.push((body, scope.with_guard(guard)));
                }
            }
            _ => branches.push((alternative, scope.clone())),
        }
    }
    for branch in branches.into_iter().rev() {
        stack.push(branch);
    }
}

fn push_try_branches<'t>(stack: &mut Vec<(Node<'t>, Scope)>, node: Node<'t>, scope: &Scope) {
    let mut branches: Vec<(Node<'t>, Scope)> = Vec::new();
    let body_id = node.child_by_field_name("body").map(|body| body.id());
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if Some(child.id()) == body_id {
            let guard = ImportGuard {
                is_try_except: true,
                ..scope.guard.clone()
            };
            branches.push((child, scope.with_guard(guard)));
        } else if matches!(child.kind(), "except_clause" | "except_group_clause") {
            let guard = ImportGuard {
                is_try_except: true,
                is_fallback: true,
                ..scope.guard.clone()
            };
            branches.push((child, scope.with_guard(guard)));
        } else {
            branches.push((child, scope.clone()));
        }
    }
    for branch in branches.into_iter().rev() {
        stack.push(branch);
    }
}

fn is_type_checking(condition: &str) -> bool {
    condition == "TYPE_CHECKING" || condition.ends_with(".TYPE_CHECKING")
}

fn branch_guard(outer: &ImportGuard, condition: &str) -> ImportGuard {
    if is_type_checking(condition) {
        ImportGuard {
            is_type_checking: true,
            ..outer.clone()
        }
    } else {
        conditional_guard(outer, condition)
    }
}

fn conditional_guard(outer: &ImportGuard, condition: &str) -> ImportGuard {
    let condition = match &outer.condition {
        Some(existing) => format!("{existing} and {condition}"),
        None => condition.to_string(),
    };
    ImportGuard {
        is_conditional: true,
        condition: Some(condition),
        ..outer.clone()
    }
}

fn named_children_of_kind<'t>(node: Node<'t>, kind: &str) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor)
        .filter(|child| child.kind() == kind)
        .collect()
}

fn is_async(node: Node<'_>) -> bool {
    if node.kind() == "async_function_definition" {
        return true;
    }
    let mut cursor = node.walk();
    let found = node.children(&mut cursor).any(|child| child.kind() == "async");
    found
}

fn is_property_decorator(name: &str) -> bool {
    matches!(name, "property" | "cached_property" | "functools.cached_property")
        || name.ends_with(".setter")
        || name.ends_with(".getter")
        || name.ends_with(".deleter")
}

/// Dotted text of a Name/Attribute chain, or `None` for anything else.
fn dotted_chain(node: Node<'_>, source: &str) -> Option<String> {
    match node.kind() {
        "identifier" => Some(node_text(node, source)),
        "attribute" => {
            let object = node.child_by_field_name("object")?;
            let attr = node.child_by_field_name("attribute")?;
            let base = dotted_chain(object, source)?;
            Some(format!("{base}.{}", node_text(attr, source)))
        }
        _ => None,
    }
}

fn callee_name(function: Node<'_>, source: &str) -> Option<String> {
    if let Some(chain) = dotted_chain(function, source) {
        return Some(chain);
    }
    if function.kind() == "attribute" {
        return function
            .child_by_field_name("attribute")
            .map(|attr| node_text(attr, source));
    }
    None
}

fn base_names(args: Node<'_>, source: &str) -> Vec<String> {
    let mut cursor = args.walk();
    args.named_children(&mut cursor)
        .filter(|child| {
            !matches!(
                child.kind(),
                "keyword_argument" | "list_splat" | "dictionary_splat" | "comment"
            )
        })
        .map(|child| node_text(child, source))
        .filter(|name| !name.is_empty())
        .collect()
}

fn class_attributes(body: Node<'_>, class_key: &str, source: &str) -> Vec<ClassAttribute> {
    let mut out: Vec<ClassAttribute> = Vec::new();
    let mut cursor = body.walk();
    for stmt in body.named_children(&mut cursor) {
        if stmt.kind() != "expression_statement" {
            continue;
        }
        let Some(assignment) = stmt.named_child(0) else {
            continue;
        };
        if assignment.kind() != "assignment" {
            continue;
        }
        let annotation = assignment
            .child_by_field_name("type")
            .map(|ty| node_text(ty, source));

        // `a = b = 1` nests the second target inside `right`.
        let mut targets = Vec::new();
        let mut current = assignment;
        let default = loop {
            if let Some(left) = current.child_by_field_name("left") {
                if left.kind() == "identifier" {
                    targets.push(node_text(left, source));
                }
            }
            match current.child_by_field_name("right") {
                Some(right) if right.kind() == "assignment" => current = right,
                Some(right) => break Some(node_text(right, source)),
                None => break None,
            }
        };

        for name in targets {
            out.retain(|attr| attr.name != name);
            out.push(ClassAttribute {
                key: qualify(class_key, &name),
                name,
                annotation: annotation.clone(),
                default: default.clone(),
                line: stmt.start_position().row + 1,
            });
        }
    }
    out
}

fn parse_parameters(params: Node<'_>, func_key: &str, source: &str) -> Vec<Parameter> {
    let mut out: Vec<Parameter> = Vec::new();
    let mut keyword_only = false;
    let mut cursor = params.walk();
    for child in params.named_children(&mut cursor) {
        let (raw, annotation, default) = match child.kind() {
            "identifier" | "list_splat_pattern" | "dictionary_splat_pattern" => {
                (child, None, None)
            }
            "typed_parameter" => {
                let mut inner_cursor = child.walk();
                let target = child
                    .named_children(&mut inner_cursor)
                    .find(|inner| {
                        matches!(
                            inner.kind(),
                            "identifier" | "list_splat_pattern" | "dictionary_splat_pattern"
                        )
                    });
                let Some(target) = target else {
                    continue;
                };
                let annotation = child
                    .child_by_field_name("type")
                    .map(|ty| node_text(ty, source));
                (target, annotation, None)
            }
            "default_parameter" | "typed_default_parameter" => {
                let Some(name) = child.child_by_field_name("name") else {
                    continue;
                };
                let annotation = child
                    .child_by_field_name("type")
                    .map(|ty| node_text(ty, source));
                let default = child
                    .child_by_field_name("value")
                    .map(|value| node_text(value, source));
                (name, annotation, default)
            }
            "positional_separator" => {
                for param in out.iter_mut() {
                    if param.kind == ParameterKind::PositionalOrKeyword {
                        param.kind = ParameterKind::PositionalOnly;
                    }
                }
                continue;
            }
            "keyword_separator" => {
                keyword_only = true;
                continue;
            }
            _ => continue,
        };

        let (name, bare, kind) = match raw.kind() {
            "list_splat_pattern" => {
                keyword_only = true;
                let bare = splat_name(raw, source);
                (format!("*{bare}"), bare, ParameterKind::VarPositional)
            }
            "dictionary_splat_pattern" => {
                let bare = splat_name(raw, source);
                (format!("**{bare}"), bare, ParameterKind::VarKeyword)
            }
            _ => {
                let bare = node_text(raw, source);
                let kind = if keyword_only {
                    ParameterKind::KeywordOnly
                } else {
                    ParameterKind::PositionalOrKeyword
                };
                (bare.clone(), bare, kind)
            }
        };
        if bare == "self" || bare == "cls" {
            continue;
        }
        out.push(Parameter {
            key: qualify(func_key, &bare),
            position: out.len(),
            name,
            annotation,
            default,
            kind,
        });
    }
    out
}

fn splat_name(node: Node<'_>, source: &str) -> String {
    node_text(node, source)
        .trim_start_matches('*')
        .trim()
        .to_string()
}

fn strip_parens(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}

fn first_error_line(root: Node<'_>) -> Option<usize> {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_error() || node.is_missing() {
            return Some(node.start_position().row + 1);
        }
        if !node.has_error() {
            continue;
        }
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        for child in children.into_iter().rev() {
            stack.push(child);
        }
    }
    None
}

fn node_text(node: Node<'_>, source: &str) -> String {
    let start = node.start_byte();
    let end = node.end_byte();
    source.get(start..end).unwrap_or("").trim().to_string()
}

fn extract_docstring(node: Node<'_>, source: &str) -> Option<String> {
    let mut cursor = node.walk();
    let mut children = node.named_children(&mut cursor);
    let first = children.next()?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let string_node = first.named_child(0)?;
    if string_node.kind() != "string" {
        return None;
    }
    let raw = node_text(string_node, source);
    let text = unquote_string_literal(&raw).unwrap_or(raw);
    Some(hasher::dedent(&text).trim().to_string())
}

fn unquote_string_literal(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let prefix_len = trimmed
        .char_indices()
        .find(|(_, ch)| !ch.is_ascii_alphabetic())
        .map(|(offset, _)| offset)
        .unwrap_or(trimmed.len());
    let rest = &trimmed[prefix_len..];
    for quote in ["'''", "\"\"\"", "\"", "'"] {
        if rest.len() >= quote.len() * 2 && rest.starts_with(quote) && rest.ends_with(quote) {
            return Some(rest[quote.len()..rest.len() - quote.len()].to_string());
        }
    }
    None
}
