use crate::model::{EdgeTarget, EntityKind, ResolutionWarning};
use serde::Serialize;

/// 1-based inclusive line range plus byte offsets into the unit source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Span {
    pub start_line: usize,
    pub end_line: usize,
    pub start_byte: usize,
    pub end_byte: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleEntity {
    pub key: String,
    pub name: String,
    pub docstring: Option<String>,
    pub fingerprint: String,
    pub is_package: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decorator {
    pub name: String,
    /// `name@module`
    pub key: String,
    pub arguments: Option<String>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaseClass {
    pub name: String,
    pub target: EdgeTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassAttribute {
    pub key: String,
    pub name: String,
    pub annotation: Option<String>,
    pub default: Option<String>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassEntity {
    pub key: String,
    pub name: String,
    pub parent_key: String,
    pub bases: Vec<BaseClass>,
    pub docstring: Option<String>,
    pub decorators: Vec<Decorator>,
    pub attributes: Vec<ClassAttribute>,
    pub fingerprint: String,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    PositionalOnly,
    PositionalOrKeyword,
    VarPositional,
    KeywordOnly,
    VarKeyword,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
    pub key: String,
    pub name: String,
    pub annotation: Option<String>,
    pub default: Option<String>,
    pub kind: ParameterKind,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionEntity {
    pub key: String,
    pub name: String,
    pub kind: EntityKind,
    /// Enclosing container: module, class or outer function.
    pub parent_key: String,
    /// Owning class for methods.
    pub class_key: Option<String>,
    pub is_async: bool,
    pub parameters: Vec<Parameter>,
    pub return_annotation: Option<String>,
    pub docstring: Option<String>,
    pub decorators: Vec<Decorator>,
    pub is_staticmethod: bool,
    pub is_classmethod: bool,
    pub is_property: bool,
    pub fingerprint: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportedName {
    pub name: String,
    pub alias: Option<String>,
}

/// Guard context an import statement was found under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportGuard {
    pub is_type_checking: bool,
    pub is_conditional: bool,
    pub condition: Option<String>,
    pub is_try_except: bool,
    pub is_fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportEdge {
    pub source_module: String,
    /// Absolute module name when resolvable, else the text as written.
    pub target_module: String,
    pub names: Vec<ImportedName>,
    /// Alias for `import a.b as c`.
    pub alias: Option<String>,
    pub is_from: bool,
    pub is_relative: bool,
    pub level: usize,
    pub is_wildcard: bool,
    pub resolved: bool,
    #[serde(flatten)]
    pub guard: ImportGuard,
    pub position: usize,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallEdge {
    /// Innermost enclosing function, method or class; `None` for calls made
    /// at module level or inside a lambda.
    pub caller: Option<String>,
    /// Attribution scope; differs from `caller` for lambdas.
    pub scope: String,
    pub callee: String,
    pub target: EdgeTarget,
    pub line: usize,
    #[serde(skip)]
    pub caller_start_byte: usize,
}

impl CallEdge {
    pub fn is_orphaned(&self) -> bool {
        self.caller.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractedUnit {
    pub path: String,
    pub file_hash: String,
    pub module: ModuleEntity,
    pub classes: Vec<ClassEntity>,
    pub functions: Vec<FunctionEntity>,
    pub imports: Vec<ImportEdge>,
    pub calls: Vec<CallEdge>,
    pub warnings: Vec<ResolutionWarning>,
    #[serde(skip)]
    pub source: String,
}

impl ExtractedUnit {
    /// Every tracked entity as `(key, kind, fingerprint)`, module first.
    pub fn tracked(&self) -> Vec<(&str, EntityKind, &str)> {
        let mut out = Vec::with_capacity(1 + self.classes.len() + self.functions.len());
        out.push((
            self.module.key.as_str(),
            EntityKind::Module,
            self.module.fingerprint.as_str(),
        ));
        for class in &self.classes {
            out.push((class.key.as_str(), EntityKind::Class, class.fingerprint.as_str()));
        }
        for func in &self.functions {
            out.push((func.key.as_str(), func.kind, func.fingerprint.as_str()));
        }
        out
    }

    /// Every key this unit claims, owned children included.
    pub fn claimed_keys(&self) -> Vec<(&str, EntityKind)> {
        let mut out: Vec<(&str, EntityKind)> = self
            .tracked()
            .into_iter()
            .map(|(key, kind, _)| (key, kind))
            .collect();
        for class in &self.classes {
            for attr in &class.attributes {
                out.push((attr.key.as_str(), EntityKind::Attribute));
            }
        }
        for func in &self.functions {
            for param in &func.parameters {
                out.push((param.key.as_str(), EntityKind::Parameter));
            }
        }
        out
    }

    pub fn class(&self, key: &str) -> Option<&ClassEntity> {
        self.classes.iter().find(|class| class.key == key)
    }

    pub fn function(&self, key: &str) -> Option<&FunctionEntity> {
        self.functions.iter().find(|func| func.key == key)
    }

    pub fn calls_from<'a>(&'a self, caller: &'a str) -> impl Iterator<Item = &'a CallEdge> + 'a {
        self.calls
            .iter()
            .filter(move |call| call.caller.as_deref() == Some(caller))
    }

    pub fn orphaned_calls(&self) -> impl Iterator<Item = &CallEdge> {
        self.calls.iter().filter(|call| call.is_orphaned())
    }

    /// Source text of a span, whole lines from `start_line` to `end_line`.
    pub fn span_text(&self, span: &Span) -> String {
        crate::util::slice_lines(&self.source, span.start_line, span.end_line)
    }
}
