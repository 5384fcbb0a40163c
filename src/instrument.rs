//! Instrumentation engine.
//!
//! Rewrites a parsed script so every function (declarations, expressions,
//! methods, accessors and constructors, but never arrows) appends a call record
//! to the shared trace buffer on entry and balances the shared depth counter on
//! every exit:
//!
//! ```js
//! function add(a, b) {
//!     window.__estrace.push(["http://host/app.js", ++window.__estrace_call_depth,
//!         "add", { start: [1, 0], end: [1, 32] }, ["a", a], ["b", b]]);
//!     {
//!         let __estrace_ret = a + b;
//!         --window.__estrace_call_depth;
//!         return __estrace_ret;
//!     }
//!     --window.__estrace_call_depth;
//! }
//! ```
//!
//! The rewritten statements are then moved into a guarded bootstrap wrapper
//! that creates the two globals only if they do not exist yet.

use std::collections::HashSet;

use swc_core::{
    common::{sync::Lrc, BytePos, SourceMap, Span, SyntaxContext, DUMMY_SP},
    ecma::{
        ast::*,
        visit::{VisitMut, VisitMutWith},
    },
};

use crate::config::TraceConfig;

// -----------------------------------------------------------------------------
// Visited markers
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum NodeKind {
    Function,
    Return,
}

/// Side-table of original nodes already rewritten in this run, keyed by kind
/// and source span. Synthesized nodes carry `DUMMY_SP` and are never recorded.
#[derive(Default)]
struct Visited {
    seen: HashSet<(NodeKind, BytePos, BytePos)>,
}

impl Visited {
    /// Returns `false` if the node was already marked.
    fn mark(&mut self, kind: NodeKind, span: Span) -> bool {
        if span.is_dummy() {
            return true;
        }
        self.seen.insert((kind, span.lo(), span.hi()))
    }
}

// -----------------------------------------------------------------------------
// Name inference
// -----------------------------------------------------------------------------

/// Syntactic slot a function expression is about to be visited in.
///
/// Set by the parent visitor right before it descends into the child
/// expression and consumed by the first expression visited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum NameSite {
    #[default]
    Anonymous,
    /// `x = function(){}` / `a.x = function(){}`
    Assignment(String),
    /// `{ x: function(){} }`, `{ x() {} }`, `{ get x() {} }`
    Property(String),
    /// `var x = function(){}`
    Declarator(String),
}

/// Own identifier first, then whatever the parent slot provides.
fn infer_name(own: Option<&Ident>, site: &NameSite) -> Option<String> {
    if let Some(id) = own {
        return Some(id.sym.to_string());
    }
    match site {
        NameSite::Assignment(n) | NameSite::Property(n) | NameSite::Declarator(n) => Some(n.clone()),
        NameSite::Anonymous => None,
    }
}

fn assignment_site(op: AssignOp, left: &AssignTarget) -> NameSite {
    if op != AssignOp::Assign {
        return NameSite::Anonymous;
    }
    match left {
        AssignTarget::Simple(SimpleAssignTarget::Ident(b)) => NameSite::Assignment(b.id.sym.to_string()),
        AssignTarget::Simple(SimpleAssignTarget::Member(m)) => match &m.prop {
            MemberProp::Ident(p) => NameSite::Assignment(p.sym.to_string()),
            _ => NameSite::Anonymous,
        },
        _ => NameSite::Anonymous,
    }
}

/// Name of a non-computed property key.
fn prop_key_name(key: &PropName) -> Option<String> {
    match key {
        PropName::Ident(i) => Some(i.sym.to_string()),
        PropName::Str(s) => Some(s.value.to_string()),
        PropName::Num(n) => Some(n.value.to_string()),
        _ => None,
    }
}

fn simple_param_names<'a>(pats: impl Iterator<Item = &'a Pat>) -> Vec<String> {
    pats.filter_map(|p| match p {
        Pat::Ident(b) => Some(b.id.sym.to_string()),
        _ => None,
    })
    .collect()
}

/// Return values that cannot run instrumented code when evaluated.
fn is_settled(e: &Expr) -> bool {
    matches!(e, Expr::Lit(_) | Expr::Ident(_) | Expr::This(_))
}

/// Number of leading `"use strict"`-style directives.
fn directive_prologue_len(stmts: &[Stmt]) -> usize {
    stmts
        .iter()
        .take_while(|s| matches!(s, Stmt::Expr(e) if matches!(&*e.expr, Expr::Lit(Lit::Str(_)))))
        .count()
}

// -----------------------------------------------------------------------------
// Transform state
// -----------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InstrumentStats {
    pub functions: usize,
    pub returns: usize,
}

pub struct TraceTransform<'a> {
    url: String,
    config: &'a TraceConfig,
    source_map: Option<Lrc<SourceMap>>,

    visited: Visited,
    site: NameSite,
    // Whether the nearest enclosing function gets entry/exit bookkeeping.
    in_traced_fn: bool,

    pub stats: InstrumentStats,
}

impl<'a> TraceTransform<'a> {
    pub fn new(url: &str, config: &'a TraceConfig, source_map: Option<Lrc<SourceMap>>) -> Self {
        Self {
            url: url.to_string(),
            config,
            source_map,
            visited: Visited::default(),
            site: NameSite::Anonymous,
            in_traced_fn: false,
            stats: InstrumentStats::default(),
        }
    }

    // ---------- AST builders ----------

    fn ident(sym: &str) -> Ident {
        Ident::new(sym.into(), DUMMY_SP, SyntaxContext::empty())
    }

    fn str_lit(value: &str) -> Expr {
        Expr::Lit(Lit::Str(Str {
            span: DUMMY_SP,
            value: value.into(),
            raw: None,
        }))
    }

    fn num_lit(value: f64) -> Expr {
        Expr::Lit(Lit::Num(Number {
            span: DUMMY_SP,
            value,
            raw: None,
        }))
    }

    fn null_lit() -> Expr {
        Expr::Lit(Lit::Null(Null { span: DUMMY_SP }))
    }

    fn array(elems: Vec<Expr>) -> Expr {
        Expr::Array(ArrayLit {
            span: DUMMY_SP,
            elems: elems
                .into_iter()
                .map(|e| {
                    Some(ExprOrSpread {
                        spread: None,
                        expr: Box::new(e),
                    })
                })
                .collect(),
        })
    }

    fn expr_stmt(expr: Expr) -> Stmt {
        Stmt::Expr(ExprStmt {
            span: DUMMY_SP,
            expr: Box::new(expr),
        })
    }

    fn block(stmts: Vec<Stmt>) -> BlockStmt {
        BlockStmt {
            span: DUMMY_SP,
            ctxt: SyntaxContext::empty(),
            stmts,
        }
    }

    /// `window.<prop>`
    fn global_member(&self, prop: &str) -> MemberExpr {
        MemberExpr {
            span: DUMMY_SP,
            obj: Box::new(Expr::Ident(Self::ident(&self.config.global_object))),
            prop: MemberProp::Ident(IdentName::new(prop.into(), DUMMY_SP)),
        }
    }

    /// `++window.__estrace_call_depth` / `--window.__estrace_call_depth`
    fn depth_update(&self, op: UpdateOp) -> Expr {
        Expr::Update(UpdateExpr {
            span: DUMMY_SP,
            op,
            prefix: true,
            arg: Box::new(Expr::Member(self.global_member(&self.config.depth_name))),
        })
    }

    fn let_decl(name: Ident, init: Box<Expr>) -> Stmt {
        Stmt::Decl(Decl::Var(Box::new(VarDecl {
            span: DUMMY_SP,
            ctxt: SyntaxContext::empty(),
            kind: VarDeclKind::Let,
            declare: false,
            decls: vec![VarDeclarator {
                span: DUMMY_SP,
                name: Pat::Ident(BindingIdent {
                    id: name,
                    type_ann: None,
                }),
                init: Some(init),
                definite: false,
            }],
        })))
    }

    /// Block-local holding a return value across the decrement.
    fn return_slot(&self) -> String {
        format!("{}_ret", self.config.buffer_name)
    }

    fn depth_decrement(&self) -> Stmt {
        Self::expr_stmt(self.depth_update(UpdateOp::MinusMinus))
    }

    /// `{ start: [line, col], end: [line, col] }`, or `null` without positions.
    fn location(&self, span: Span) -> Expr {
        if span.is_dummy() {
            return Self::null_lit();
        }
        let Some(ref cm) = self.source_map else {
            return Self::null_lit();
        };
        let lo = cm.lookup_char_pos(span.lo());
        let hi = cm.lookup_char_pos(span.hi());
        let point = |line: usize, col: usize| Self::array(vec![Self::num_lit(line as f64), Self::num_lit(col as f64)]);
        Expr::Object(ObjectLit {
            span: DUMMY_SP,
            props: vec![
                PropOrSpread::Prop(Box::new(Prop::KeyValue(KeyValueProp {
                    key: PropName::Ident(IdentName::new("start".into(), DUMMY_SP)),
                    value: Box::new(point(lo.line, lo.col.0)),
                }))),
                PropOrSpread::Prop(Box::new(Prop::KeyValue(KeyValueProp {
                    key: PropName::Ident(IdentName::new("end".into(), DUMMY_SP)),
                    value: Box::new(point(hi.line, hi.col.0)),
                }))),
            ],
        })
    }

    /// `window.__estrace.push([url, ++depth, name, loc, ["a", a], ...]);`
    fn entry_record(&self, name: Option<&str>, span: Span, params: &[String]) -> Stmt {
        let mut record = vec![
            Self::str_lit(&self.url),
            self.depth_update(UpdateOp::PlusPlus),
            name.map(Self::str_lit).unwrap_or_else(Self::null_lit),
            self.location(span),
        ];
        record.extend(
            params
                .iter()
                .map(|p| Self::array(vec![Self::str_lit(p), Expr::Ident(Self::ident(p))])),
        );

        Self::expr_stmt(Expr::Call(CallExpr {
            span: DUMMY_SP,
            callee: Callee::Expr(Box::new(Expr::Member(MemberExpr {
                span: DUMMY_SP,
                obj: Box::new(Expr::Member(self.global_member(&self.config.buffer_name))),
                prop: MemberProp::Ident(IdentName::new("push".into(), DUMMY_SP)),
            }))),
            args: vec![ExprOrSpread {
                spread: None,
                expr: Box::new(Self::array(record)),
            }],
            type_args: None,
            ctxt: SyntaxContext::empty(),
        }))
    }

    /// `if (!("<prop>" in window)) { window.<prop> = <init>; }`
    fn lazy_global(&self, prop: &str, init: Expr) -> Stmt {
        let exists = Expr::Bin(BinExpr {
            span: DUMMY_SP,
            op: BinaryOp::In,
            left: Box::new(Self::str_lit(prop)),
            right: Box::new(Expr::Ident(Self::ident(&self.config.global_object))),
        });
        let assign = Expr::Assign(AssignExpr {
            span: DUMMY_SP,
            op: AssignOp::Assign,
            left: AssignTarget::Simple(SimpleAssignTarget::Member(self.global_member(prop))),
            right: Box::new(init),
        });
        Stmt::If(IfStmt {
            span: DUMMY_SP,
            test: Box::new(Expr::Unary(UnaryExpr {
                span: DUMMY_SP,
                op: UnaryOp::Bang,
                arg: Box::new(Expr::Paren(ParenExpr {
                    span: DUMMY_SP,
                    expr: Box::new(exists),
                })),
            })),
            cons: Box::new(Stmt::Block(Self::block(vec![Self::expr_stmt(assign)]))),
            alt: None,
        })
    }

    // ---------- function instrumentation ----------

    fn instrument_function(&mut self, f: &mut Function, name: Option<String>) {
        if !self.visited.mark(NodeKind::Function, f.span) {
            return;
        }
        let params = simple_param_names(f.params.iter().map(|p| &p.pat));
        self.site = NameSite::Anonymous;
        f.params.visit_mut_with(self);
        if let Some(body) = &mut f.body {
            self.instrument_body(body, name.as_deref(), f.span, &params);
        }
    }

    /// Walk the body with returns enabled, then add entry and fallthrough exit.
    fn instrument_body(&mut self, body: &mut BlockStmt, name: Option<&str>, span: Span, params: &[String]) {
        let outer = std::mem::replace(&mut self.in_traced_fn, true);
        body.visit_mut_children_with(self);
        self.in_traced_fn = outer;

        let at = directive_prologue_len(&body.stmts);
        body.stmts.insert(at, self.entry_record(name, span, params));
        body.stmts.push(self.depth_decrement());
        self.stats.functions += 1;
    }

    // ---------- bootstrap ----------

    /// Move the (already rewritten) top-level statements into the bootstrap
    /// wrapper. Leading directives stay leading so they keep applying.
    pub fn wrap_program(&self, mut script: Script) -> Script {
        let mut directives = std::mem::take(&mut script.body);
        let rest = directives.split_off(directive_prologue_len(&directives));

        let mut stmts = directives;
        stmts.push(self.lazy_global(&self.config.buffer_name, Self::array(vec![])));
        stmts.push(self.lazy_global(&self.config.depth_name, Self::num_lit(0.0)));
        stmts.extend(rest);

        let wrapper = Expr::Fn(FnExpr {
            ident: None,
            function: Box::new(Function {
                params: vec![],
                decorators: vec![],
                span: DUMMY_SP,
                body: Some(Self::block(stmts)),
                is_generator: false,
                is_async: false,
                type_params: None,
                return_type: None,
                ctxt: SyntaxContext::empty(),
            }),
        });
        // `.call(this)`: top-level `this` is the global object even in strict code.
        let callee = MemberExpr {
            span: DUMMY_SP,
            obj: Box::new(Expr::Paren(ParenExpr {
                span: DUMMY_SP,
                expr: Box::new(wrapper),
            })),
            prop: MemberProp::Ident(IdentName::new("call".into(), DUMMY_SP)),
        };
        script.body = vec![Self::expr_stmt(Expr::Call(CallExpr {
            span: DUMMY_SP,
            callee: Callee::Expr(Box::new(Expr::Member(callee))),
            args: vec![ExprOrSpread {
                spread: None,
                expr: Box::new(Expr::This(ThisExpr { span: DUMMY_SP })),
            }],
            type_args: None,
            ctxt: SyntaxContext::empty(),
        }))];
        script
    }
}

// -----------------------------------------------------------------------------
// Traversal
// -----------------------------------------------------------------------------

impl VisitMut for TraceTransform<'_> {
    fn visit_mut_stmt(&mut self, s: &mut Stmt) {
        let Stmt::Return(ret) = s else {
            s.visit_mut_children_with(self);
            return;
        };
        if !self.in_traced_fn {
            ret.visit_mut_children_with(self);
            return;
        }
        if !self.visited.mark(NodeKind::Return, ret.span) {
            return;
        }
        self.site = NameSite::Anonymous;
        ret.arg.visit_mut_with(self);
        self.stats.returns += 1;

        // The value is computed while this frame still counts as live.
        let mut stmts = Vec::with_capacity(3);
        if let Some(arg) = ret.arg.as_mut().filter(|a| !is_settled(a)) {
            let slot = Self::ident(&self.return_slot());
            let value = std::mem::replace(arg, Box::new(Expr::Ident(slot.clone())));
            stmts.push(Self::let_decl(slot, value));
        }
        stmts.push(self.depth_decrement());
        stmts.push(std::mem::replace(s, Stmt::Empty(EmptyStmt { span: DUMMY_SP })));
        *s = Stmt::Block(Self::block(stmts));
    }

    fn visit_mut_expr(&mut self, e: &mut Expr) {
        match e {
            // the slot name passes through parentheses and reaches the function
            Expr::Paren(_) | Expr::Fn(_) => {}
            _ => self.site = NameSite::Anonymous,
        }
        e.visit_mut_children_with(self);
    }

    fn visit_mut_fn_expr(&mut self, n: &mut FnExpr) {
        let site = std::mem::take(&mut self.site);
        let name = infer_name(n.ident.as_ref(), &site);
        self.instrument_function(&mut n.function, name);
    }

    fn visit_mut_fn_decl(&mut self, n: &mut FnDecl) {
        self.site = NameSite::Anonymous;
        let name = Some(n.ident.sym.to_string());
        self.instrument_function(&mut n.function, name);
    }

    fn visit_mut_arrow_expr(&mut self, n: &mut ArrowExpr) {
        self.site = NameSite::Anonymous;
        let outer = std::mem::replace(&mut self.in_traced_fn, false);
        n.visit_mut_children_with(self);
        self.in_traced_fn = outer;
    }

    fn visit_mut_var_declarator(&mut self, d: &mut VarDeclarator) {
        d.name.visit_mut_with(self);
        if let Some(init) = &mut d.init {
            self.site = match &d.name {
                Pat::Ident(b) => NameSite::Declarator(b.id.sym.to_string()),
                _ => NameSite::Anonymous,
            };
            self.visit_mut_expr(init);
        }
    }

    fn visit_mut_assign_expr(&mut self, n: &mut AssignExpr) {
        n.left.visit_mut_with(self);
        self.site = assignment_site(n.op, &n.left);
        self.visit_mut_expr(&mut n.right);
    }

    fn visit_mut_key_value_prop(&mut self, n: &mut KeyValueProp) {
        n.key.visit_mut_with(self);
        self.site = prop_key_name(&n.key)
            .map(NameSite::Property)
            .unwrap_or_default();
        self.visit_mut_expr(&mut n.value);
    }

    fn visit_mut_method_prop(&mut self, n: &mut MethodProp) {
        n.key.visit_mut_with(self);
        let name = prop_key_name(&n.key);
        self.instrument_function(&mut n.function, name);
    }

    fn visit_mut_getter_prop(&mut self, n: &mut GetterProp) {
        n.key.visit_mut_with(self);
        if !self.visited.mark(NodeKind::Function, n.span) {
            return;
        }
        let name = prop_key_name(&n.key);
        if let Some(body) = &mut n.body {
            self.instrument_body(body, name.as_deref(), n.span, &[]);
        }
    }

    fn visit_mut_setter_prop(&mut self, n: &mut SetterProp) {
        n.key.visit_mut_with(self);
        if !self.visited.mark(NodeKind::Function, n.span) {
            return;
        }
        let name = prop_key_name(&n.key);
        let params = simple_param_names(std::iter::once(&*n.param));
        self.site = NameSite::Anonymous;
        n.param.visit_mut_with(self);
        if let Some(body) = &mut n.body {
            self.instrument_body(body, name.as_deref(), n.span, &params);
        }
    }

    // Class members are not object properties: no inferred name.

    fn visit_mut_class_method(&mut self, n: &mut ClassMethod) {
        n.key.visit_mut_with(self);
        self.instrument_function(&mut n.function, None);
    }

    fn visit_mut_private_method(&mut self, n: &mut PrivateMethod) {
        self.instrument_function(&mut n.function, None);
    }

    fn visit_mut_constructor(&mut self, n: &mut Constructor) {
        if !self.visited.mark(NodeKind::Function, n.span) {
            return;
        }
        let params = simple_param_names(n.params.iter().filter_map(|p| match p {
            ParamOrTsParamProp::Param(p) => Some(&p.pat),
            _ => None,
        }));
        self.site = NameSite::Anonymous;
        n.params.visit_mut_with(self);
        if let Some(body) = &mut n.body {
            self.instrument_body(body, None, n.span, &params);
        }
    }
}

// -----------------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------------

pub struct Instrumented {
    pub script: Script,
    pub stats: InstrumentStats,
}

/// Instrument every function in `script` and wrap it in the bootstrap.
///
/// `source_map` supplies line/column locations; without it every record
/// carries a `null` location.
pub fn instrument_script(
    mut script: Script,
    url: &str,
    source_map: Option<Lrc<SourceMap>>,
    config: &TraceConfig,
) -> Instrumented {
    let mut transform = TraceTransform::new(url, config, source_map);
    script.visit_mut_with(&mut transform);
    let script = transform.wrap_program(script);
    Instrumented {
        script,
        stats: transform.stats,
    }
}
