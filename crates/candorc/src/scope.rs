//! Lexical scope analysis.
//!
//! Candor has function-level scoping: any name assigned anywhere in a
//! function body is a local of that function. Locals referenced from
//! nested functions are promoted to context slots; everything else
//! lives on the stack as a plain SSA value. Names that resolve to no
//! enclosing function become locals of the module scope, and `global`
//! names the global object (context depth `-1`).
//!
//! Scopes are keyed by the span of their function node, which is
//! unique per AST.

use std::collections::HashMap;

use candor_ast::{Expr, Module, Stmt};

/// Where a resolved name lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A plain stack-renamed local of the current function.
    Stack,
    /// A captured variable: `depth` parent hops, then `index`.
    Context { depth: u32, index: usize },
    /// The global object.
    Global,
}

/// Key identifying a function scope: the byte span of its node.
pub type ScopeKey = (usize, usize);

#[derive(Debug, Default)]
struct ScopeData {
    parent: Option<usize>,
    /// name -> context slot index, for captured locals only.
    captured: HashMap<String, usize>,
    /// All locals (assigned names and parameters).
    locals: Vec<String>,
    context_slots: usize,
}

/// Result of the analysis, queried by the HIR builder.
#[derive(Debug, Default)]
pub struct ScopeAnalysis {
    scopes: Vec<ScopeData>,
    by_key: HashMap<ScopeKey, usize>,
}

impl ScopeAnalysis {
    pub fn analyze(module: &Module) -> ScopeAnalysis {
        let mut analysis = ScopeAnalysis::default();
        let root_key = (module.span.start, module.span.end);
        let root = analysis.push_scope(root_key, None);
        collect_stmts(&mut analysis, root, &module.body);
        resolve_stmts(&mut analysis, root, &module.body);
        analysis
    }

    fn push_scope(&mut self, key: ScopeKey, parent: Option<usize>) -> usize {
        let id = self.scopes.len();
        self.scopes.push(ScopeData {
            parent,
            ..ScopeData::default()
        });
        self.by_key.insert(key, id);
        id
    }

    pub fn scope_id(&self, key: ScopeKey) -> Option<usize> {
        self.by_key.get(&key).copied()
    }

    /// Number of context slots a function must allocate in its
    /// prologue.
    pub fn context_slots(&self, scope: usize) -> usize {
        self.scopes[scope].context_slots
    }

    fn declare(&mut self, scope: usize, name: &str) {
        if !self.scopes[scope].locals.iter().any(|l| l == name) {
            self.scopes[scope].locals.push(name.to_string());
        }
    }

    fn is_local(&self, scope: usize, name: &str) -> bool {
        self.scopes[scope].locals.iter().any(|l| l == name)
    }

    /// Mark `name` in `scope` as captured, assigning a context index
    /// on first capture.
    fn capture(&mut self, scope: usize, name: &str) -> usize {
        if let Some(&index) = self.scopes[scope].captured.get(name) {
            return index;
        }
        let index = self.scopes[scope].context_slots;
        self.scopes[scope].context_slots += 1;
        self.scopes[scope].captured.insert(name.to_string(), index);
        index
    }

    /// Resolve a name from `scope`. Declares unknown names in the
    /// module scope, matching the language's implicit-global model.
    pub fn resolve(&mut self, scope: usize, name: &str) -> Resolution {
        if name == "global" {
            return Resolution::Global;
        }

        let mut depth = 0u32;
        let mut current = Some(scope);
        while let Some(id) = current {
            if self.is_local(id, name) {
                if depth == 0 {
                    // Even at depth zero a captured local addresses
                    // its context slot, so closures observe writes.
                    if let Some(&index) = self.scopes[id].captured.get(name) {
                        return Resolution::Context { depth: 0, index };
                    }
                    return Resolution::Stack;
                }
                let index = self.capture(id, name);
                return Resolution::Context { depth, index };
            }
            depth += 1;
            current = self.scopes[id].parent;
        }

        // Unknown everywhere: it becomes a module-scope local.
        let mut root = scope;
        let mut depth = 0u32;
        while let Some(parent) = self.scopes[root].parent {
            root = parent;
            depth += 1;
        }
        self.declare(root, name);
        if depth == 0 {
            return Resolution::Stack;
        }
        let index = self.capture(root, name);
        Resolution::Context { depth, index }
    }
}

// --- Pass A: collect declared names per function ---

fn collect_stmts(analysis: &mut ScopeAnalysis, scope: usize, stmts: &[Stmt]) {
    for stmt in stmts {
        match stmt {
            Stmt::Expr(e) => collect_expr(analysis, scope, e),
            Stmt::If(s) => {
                collect_expr(analysis, scope, &s.cond);
                collect_stmts(analysis, scope, &s.then_body);
                if let Some(else_body) = &s.else_body {
                    collect_stmts(analysis, scope, else_body);
                }
            }
            Stmt::While(s) => {
                collect_expr(analysis, scope, &s.cond);
                collect_stmts(analysis, scope, &s.body);
            }
            Stmt::Return(s) => {
                if let Some(v) = &s.value {
                    collect_expr(analysis, scope, v);
                }
            }
            Stmt::Break(_) | Stmt::Continue(_) => {}
        }
    }
}

fn collect_expr(analysis: &mut ScopeAnalysis, scope: usize, expr: &Expr) {
    match expr {
        Expr::Assign { target, value, .. } => {
            if let Expr::Ident { sym, .. } = target.as_ref() {
                analysis.declare(scope, sym);
            } else {
                collect_expr(analysis, scope, target);
            }
            collect_expr(analysis, scope, value);
        }
        Expr::Function {
            name, params, body, span,
        } => {
            if let Some(name) = name {
                analysis.declare(scope, name);
            }
            let child = analysis.push_scope((span.start, span.end), Some(scope));
            for p in params {
                analysis.declare(child, &p.name);
            }
            collect_stmts(analysis, child, body);
        }
        Expr::Binary { lhs, rhs, .. } => {
            collect_expr(analysis, scope, lhs);
            collect_expr(analysis, scope, rhs);
        }
        Expr::Unary { expr, .. }
        | Expr::VarArg { expr, .. }
        | Expr::Typeof { expr, .. }
        | Expr::Sizeof { expr, .. }
        | Expr::Keysof { expr, .. }
        | Expr::Clone { expr, .. } => collect_expr(analysis, scope, expr),
        Expr::Delete { member, .. } => collect_expr(analysis, scope, member),
        Expr::Member { obj, prop, computed, .. } => {
            collect_expr(analysis, scope, obj);
            if *computed {
                collect_expr(analysis, scope, prop);
            }
        }
        Expr::Call { callee, args, .. } => {
            collect_expr(analysis, scope, callee);
            for a in args {
                collect_expr(analysis, scope, a);
            }
        }
        Expr::ObjectLit { entries, .. } => {
            for (_, v) in entries {
                collect_expr(analysis, scope, v);
            }
        }
        Expr::ArrayLit { elements, .. } => {
            for e in elements {
                collect_expr(analysis, scope, e);
            }
        }
        _ => {}
    }
}

// --- Pass B: resolve uses so captures get context slots ---

fn resolve_stmts(analysis: &mut ScopeAnalysis, scope: usize, stmts: &[Stmt]) {
    for stmt in stmts {
        match stmt {
            Stmt::Expr(e) => resolve_expr(analysis, scope, e),
            Stmt::If(s) => {
                resolve_expr(analysis, scope, &s.cond);
                resolve_stmts(analysis, scope, &s.then_body);
                if let Some(else_body) = &s.else_body {
                    resolve_stmts(analysis, scope, else_body);
                }
            }
            Stmt::While(s) => {
                resolve_expr(analysis, scope, &s.cond);
                resolve_stmts(analysis, scope, &s.body);
            }
            Stmt::Return(s) => {
                if let Some(v) = &s.value {
                    resolve_expr(analysis, scope, v);
                }
            }
            Stmt::Break(_) | Stmt::Continue(_) => {}
        }
    }
}

fn resolve_expr(analysis: &mut ScopeAnalysis, scope: usize, expr: &Expr) {
    match expr {
        Expr::Ident { sym, .. } => {
            let _ = analysis.resolve(scope, sym);
        }
        Expr::Assign { target, value, .. } => {
            resolve_expr(analysis, scope, target);
            resolve_expr(analysis, scope, value);
        }
        Expr::Function { span, body, .. } => {
            let child = analysis
                .scope_id((span.start, span.end))
                .expect("scope collected in pass A");
            resolve_stmts(analysis, child, body);
        }
        Expr::Binary { lhs, rhs, .. } => {
            resolve_expr(analysis, scope, lhs);
            resolve_expr(analysis, scope, rhs);
        }
        Expr::Unary { expr, .. }
        | Expr::VarArg { expr, .. }
        | Expr::Typeof { expr, .. }
        | Expr::Sizeof { expr, .. }
        | Expr::Keysof { expr, .. }
        | Expr::Clone { expr, .. } => resolve_expr(analysis, scope, expr),
        Expr::Delete { member, .. } => resolve_expr(analysis, scope, member),
        Expr::Member { obj, prop, computed, .. } => {
            resolve_expr(analysis, scope, obj);
            if *computed {
                resolve_expr(analysis, scope, prop);
            }
        }
        Expr::Call { callee, args, .. } => {
            resolve_expr(analysis, scope, callee);
            for a in args {
                resolve_expr(analysis, scope, a);
            }
        }
        Expr::ObjectLit { entries, .. } => {
            for (_, v) in entries {
                resolve_expr(analysis, scope, v);
            }
        }
        Expr::ArrayLit { elements, .. } => {
            for e in elements {
                resolve_expr(analysis, scope, e);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candor_parser::parse_module;

    fn analyze(src: &str) -> (ScopeAnalysis, Module) {
        let module = parse_module(src).expect("parse");
        let analysis = ScopeAnalysis::analyze(&module);
        (analysis, module)
    }

    #[test]
    fn plain_locals_stay_on_stack() {
        let (mut analysis, module) = analyze("a = 1\nreturn a");
        let root = analysis
            .scope_id((module.span.start, module.span.end))
            .unwrap();
        assert_eq!(analysis.resolve(root, "a"), Resolution::Stack);
        assert_eq!(analysis.context_slots(root), 0);
    }

    #[test]
    fn captured_local_gets_context_slot() {
        let src = "a = 1\nf(x) { return a + x }\nreturn f(2)";
        let (mut analysis, module) = analyze(src);
        let root = analysis
            .scope_id((module.span.start, module.span.end))
            .unwrap();
        // `a` was captured by `f` during analysis, so from the root
        // it now addresses a context slot at depth 0.
        assert_eq!(
            analysis.resolve(root, "a"),
            Resolution::Context { depth: 0, index: 0 }
        );
        assert_eq!(analysis.context_slots(root), 1);
        // `x` stays a stack local of `f`.
        let f_scope = 1;
        assert_eq!(analysis.resolve(f_scope, "x"), Resolution::Stack);
    }

    #[test]
    fn global_is_special() {
        let (mut analysis, module) = analyze("a = global\nreturn a");
        let root = analysis
            .scope_id((module.span.start, module.span.end))
            .unwrap();
        assert_eq!(analysis.resolve(root, "global"), Resolution::Global);
    }

    #[test]
    fn unknown_names_land_in_module_scope() {
        let (mut analysis, module) = analyze("f() { return mystery }\nreturn f()");
        let root = analysis
            .scope_id((module.span.start, module.span.end))
            .unwrap();
        // Resolution from the nested function created a module-level
        // context slot.
        assert_eq!(analysis.context_slots(root), 1);
        assert_eq!(
            analysis.resolve(root, "mystery"),
            Resolution::Context { depth: 0, index: 0 }
        );
    }
}
