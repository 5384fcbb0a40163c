use boa_engine::{Context, Source};
use estrace::{instrument_source, TraceConfig};

const URL: &str = "http://localhost:3000/app.js";

struct Page {
    ctx: Context,
}

impl Page {
    fn new() -> Self {
        let mut page = Self {
            ctx: Context::default(),
        };
        page.run("var window = globalThis;");
        page
    }

    fn run(&mut self, code: &str) {
        if let Err(e) = self.ctx.eval(Source::from_bytes(code)) {
            panic!("script failed: {e}\n{code}");
        }
    }

    fn load(&mut self, src: &str) {
        let (code, _) = instrument_source(URL, src, &TraceConfig::default()).unwrap();
        self.run(&code);
    }

    /// `JSON.stringify(expr)`
    fn json(&mut self, expr: &str) -> String {
        let value = self
            .ctx
            .eval(Source::from_bytes(&format!("JSON.stringify({expr})")))
            .unwrap();
        value.to_string(&mut self.ctx).unwrap().to_std_string_escaped()
    }
}

#[test]
fn add_records_one_call_and_restores_depth() {
    let mut page = Page::new();
    page.load("function add(a,b){ return a+b; } window.result = add(2,3);");

    assert_eq!(page.json("window.result"), "5");
    assert_eq!(page.json("window.__estrace.length"), "1");
    assert_eq!(page.json("window.__estrace[0][0]"), format!("\"{URL}\""));
    assert_eq!(page.json("window.__estrace[0][1]"), "1");
    assert_eq!(page.json("window.__estrace[0][2]"), "\"add\"");
    assert_eq!(page.json("window.__estrace[0].slice(4)"), r#"[["a",2],["b",3]]"#);
    assert_eq!(page.json("window.__estrace[0][3].start"), "[1,0]");
    assert_eq!(page.json("window.__estrace_call_depth"), "0");
}

#[test]
fn recursion_records_increasing_depth() {
    let mut page = Page::new();
    page.load("function fact(n) { if (n <= 1) return 1; return n * fact(n - 1); } window.r = fact(4);");

    assert_eq!(page.json("window.r"), "24");
    assert_eq!(page.json("window.__estrace.map(function (c) { return c[1]; })"), "[1,2,3,4]");
    assert_eq!(page.json("window.__estrace_call_depth"), "0");
}

#[test]
fn nested_calls_and_multiple_returns_balance() {
    let mut page = Page::new();
    page.load(
        "function pick(x) { if (x > 10) { return 'big'; } if (x > 5) return 'mid'; }\n\
         function outer(x) { var a = pick(x); inner(); return a; function inner() {} }\n\
         window.out = [outer(20), outer(7), outer(1)];",
    );

    assert_eq!(page.json("window.out"), r#"["big","mid",null]"#);
    assert_eq!(
        page.json("window.__estrace.map(function (c) { return [c[2], c[1]]; })"),
        r#"[["outer",1],["pick",2],["inner",2],["outer",1],["pick",2],["inner",2],["outer",1],["pick",2],["inner",2]]"#
    );
    assert_eq!(page.json("window.__estrace_call_depth"), "0");
}

#[test]
fn second_script_keeps_existing_state() {
    let mut page = Page::new();
    page.load("function first() {} first();");
    page.load("function second() {} second();");

    assert_eq!(
        page.json("window.__estrace.map(function (c) { return c[2]; })"),
        r#"["first","second"]"#
    );
}

#[test]
fn bootstrap_respects_preexisting_globals() {
    let mut page = Page::new();
    page.run("window.__estrace = ['marker']; window.__estrace_call_depth = 2;");
    page.load("function f() {} f();");

    assert_eq!(page.json("window.__estrace[0]"), "\"marker\"");
    assert_eq!(page.json("window.__estrace[1][1]"), "3");
    assert_eq!(page.json("window.__estrace_call_depth"), "2");
}

#[test]
fn runtime_names_follow_the_binding_site() {
    let mut page = Page::new();
    page.load(
        "var foo = function () {};\n\
         var obj = {};\n\
         obj.bar = function () {};\n\
         var o = { baz: function () {} };\n\
         foo(); obj.bar(); o.baz(); (function () {})();",
    );

    assert_eq!(
        page.json("window.__estrace.map(function (c) { return c[2]; })"),
        r#"["foo","bar","baz",null]"#
    );
}

#[test]
fn arrows_leave_no_records() {
    let mut page = Page::new();
    page.load("var f = (x) => { return x + 1; }; window.r = f(1);");

    assert_eq!(page.json("window.r"), "2");
    assert_eq!(page.json("window.__estrace.length"), "0");
    assert_eq!(page.json("window.__estrace_call_depth"), "0");
}

#[test]
fn use_strict_still_applies() {
    let mut page = Page::new();
    page.load("'use strict'; window.strict = (function () { return this === undefined; })();");

    assert_eq!(page.json("window.strict"), "true");
}

#[test]
fn strict_top_level_this_is_still_the_global_object() {
    let mut page = Page::new();
    page.load("'use strict'; (function (root) { root.umd = 1; })(this);");

    assert_eq!(page.json("window.umd"), "1");
}

#[test]
fn methods_and_accessors_are_traced() {
    let mut page = Page::new();
    page.load(
        "var o = { m(x) { return x; }, get g() { return 1; }, set s(v) { this._s = v; } };\n\
         class K { constructor(y) { this.y = y; } run() { return this.y; } }\n\
         o.m(4); o.g; o.s = 5; new K(6).run();",
    );

    assert_eq!(
        page.json("window.__estrace.map(function (c) { return [c[2]].concat(c.slice(4)); })"),
        r#"[["m",["x",4]],["g"],["s",["v",5]],[null,["y",6]],[null]]"#
    );
    assert_eq!(page.json("window.__estrace_call_depth"), "0");
}
