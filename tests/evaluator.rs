//! Module evaluator + linker behaviour, exercised through a real isolate.

use std::collections::BTreeMap;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use static_render::evaluator::{EvaluatorOptions, RenderValue};
use static_render::{
    ExternalModule, GlobalBindings, HostModules, ModuleEvaluator, RenderError, SourceMap,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn evaluator() -> ModuleEvaluator {
    ModuleEvaluator::new(EvaluatorOptions::default()).expect("Failed to start evaluator")
}

fn evaluator_with(externals: HostModules) -> ModuleEvaluator {
    ModuleEvaluator::new(EvaluatorOptions {
        externals: Arc::new(externals),
        ..Default::default()
    })
    .expect("Failed to start evaluator")
}

fn files(entries: &[(&str, &str)]) -> SourceMap {
    SourceMap::from_files(entries.iter().copied())
}

fn html(value: &str) -> RenderValue {
    RenderValue {
        kind: "string".into(),
        value: Some(value.into()),
    }
}

// ---------------------------------------------------------------------------
// Snapshot isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lazy_require_sees_its_own_snapshot() {
    let mut evaluator = evaluator();
    let main = "module.exports = () => require('./data.js');";
    let first = files(&[("main.js", main), ("data.js", "module.exports = 'one';")]);
    let second = files(&[("main.js", main), ("data.js", "module.exports = 'two';")]);

    let old = evaluator.evaluate("main.js", &first, &GlobalBindings::new()).unwrap();
    let new = evaluator.evaluate("main.js", &second, &GlobalBindings::new()).unwrap();

    // The require runs only now, after the second cycle was evaluated.
    assert_eq!(evaluator.invoke(&old, &json!({})).await.unwrap(), html("one"));
    assert_eq!(evaluator.invoke(&new, &json!({})).await.unwrap(), html("two"));
}

#[tokio::test]
async fn released_tree_cannot_link() {
    let mut evaluator = evaluator();
    let map = files(&[
        ("main.js", "module.exports = () => require('./data.js');"),
        ("data.js", "module.exports = 'data';"),
    ]);
    let handle = evaluator.evaluate("main.js", &map, &GlobalBindings::new()).unwrap();
    assert_eq!(evaluator.live_trees(), 1);

    let clone = handle.clone();
    evaluator.release(handle);
    assert_eq!(evaluator.live_trees(), 0);
    assert!(evaluator.invoke(&clone, &json!({})).await.is_err());
}

// ---------------------------------------------------------------------------
// Linker fallback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn in_memory_first_then_external() {
    let externals = HostModules::new()
        .with_source("left-pad", "module.exports = (s) => '[' + s + ']';")
        .with_value("site-config", json!({ "site": "us" }));
    let mut evaluator = evaluator_with(externals);
    let map = files(&[
        (
            "main.js",
            r#"
            const prefix = require('./chunk.js');
            const pad = require('left-pad');
            const config = require('site-config');
            module.exports = (p) => pad(prefix + config.site + p.route);
            "#,
        ),
        ("chunk.js", "module.exports = 'chunk-';"),
    ]);

    let handle = evaluator.evaluate("./main.js", &map, &GlobalBindings::new()).unwrap();
    assert_eq!(
        evaluator.invoke(&handle, &json!({ "route": "/a" })).await.unwrap(),
        html("[chunk-us/a]")
    );
}

#[tokio::test]
async fn nested_directory_requires_resolve_relative_to_requester() {
    let mut evaluator = evaluator();
    let map = files(&[
        ("main.js", "module.exports = () => require('./pages/home.js');"),
        ("pages/home.js", "module.exports = require('./title.js') + require('../footer.js');"),
        ("pages/title.js", "module.exports = 'Home|';"),
        ("footer.js", "module.exports = 'Footer';"),
    ]);
    let handle = evaluator.evaluate("main.js", &map, &GlobalBindings::new()).unwrap();
    assert_eq!(evaluator.invoke(&handle, &json!({})).await.unwrap(), html("Home|Footer"));
}

#[tokio::test]
async fn source_map_wins_over_external_of_same_name() {
    let externals = HostModules::new().with_value("chunk.js", json!("external"));
    let mut evaluator = evaluator_with(externals);
    let map = files(&[
        ("main.js", "module.exports = () => require('./chunk.js');"),
        ("chunk.js", "module.exports = 'internal';"),
    ]);
    let handle = evaluator.evaluate("main.js", &map, &GlobalBindings::new()).unwrap();
    assert_eq!(evaluator.invoke(&handle, &json!({})).await.unwrap(), html("internal"));
}

#[tokio::test]
async fn closure_resolver_supplies_externals() {
    let resolver = |spec: &str| match spec {
        "react" => Some(ExternalModule::Source("module.exports = { version: '18' };".into())),
        _ => None,
    };
    let mut evaluator = ModuleEvaluator::new(EvaluatorOptions {
        externals: Arc::new(resolver),
        ..Default::default()
    })
    .unwrap();
    let map = files(&[("main.js", "module.exports = () => require('react').version;")]);
    let handle = evaluator.evaluate("main.js", &map, &GlobalBindings::new()).unwrap();
    assert_eq!(evaluator.invoke(&handle, &json!({})).await.unwrap(), html("18"));
}

#[tokio::test]
async fn unresolvable_require_throws_module_not_found() {
    let mut evaluator = evaluator();
    let map = files(&[(
        "main.js",
        r#"
        module.exports = () => {
            try {
                require('not-installed');
                return 'resolved';
            } catch (e) {
                return e.code + ':' + e.name;
            }
        };
        "#,
    )]);
    let handle = evaluator.evaluate("main.js", &map, &GlobalBindings::new()).unwrap();
    assert_eq!(
        evaluator.invoke(&handle, &json!({})).await.unwrap(),
        html("MODULE_NOT_FOUND:ModuleNotFoundError")
    );
}

#[tokio::test]
async fn top_level_missing_require_fails_evaluation() {
    let mut evaluator = evaluator();
    let map = files(&[("main.js", "const x = require('./gone.js'); module.exports = () => x;")]);
    match evaluator.evaluate("main.js", &map, &GlobalBindings::new()) {
        Err(RenderError::Evaluation(message)) => {
            assert!(message.contains("Cannot find module './gone.js' from 'main.js'"), "{message}");
        }
        other => panic!("expected evaluation error, got {other:?}"),
    }
    assert_eq!(evaluator.live_trees(), 0);
}

#[tokio::test]
async fn require_cycle_overflows_without_poisoning_isolate() {
    let mut evaluator = evaluator();
    let cycle = files(&[
        ("a.js", "module.exports = require('./b.js');"),
        ("b.js", "module.exports = require('./a.js');"),
    ]);
    match evaluator.evaluate("a.js", &cycle, &GlobalBindings::new()) {
        Err(RenderError::Evaluation(message)) => {
            assert!(message.contains("RangeError"), "{message}");
        }
        other => panic!("expected evaluation error, got {other:?}"),
    }
    assert_eq!(evaluator.live_trees(), 0);

    let map = files(&[("main.js", "module.exports = () => 'still alive';")]);
    let handle = evaluator.evaluate("main.js", &map, &GlobalBindings::new()).unwrap();
    assert_eq!(evaluator.invoke(&handle, &json!({})).await.unwrap(), html("still alive"));
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn absent_entry_is_module_not_found() {
    let mut evaluator = evaluator();
    let err = evaluator
        .evaluate("missing.js", &files(&[("main.js", "")]), &GlobalBindings::new())
        .unwrap_err();
    assert!(matches!(
        err,
        RenderError::ModuleNotFound { ref specifier, from: None } if specifier == "missing.js"
    ));
}

#[tokio::test]
async fn syntax_error_propagates_unmodified() {
    let mut evaluator = evaluator();
    let err = evaluator
        .evaluate("main.js", &files(&[("main.js", "module.exports = (;")]), &GlobalBindings::new())
        .unwrap_err();
    match err {
        RenderError::Evaluation(message) => assert!(message.contains("SyntaxError"), "{message}"),
        other => panic!("expected evaluation error, got {other:?}"),
    }
}

#[tokio::test]
async fn default_export_is_preferred() {
    let mut evaluator = evaluator();
    let map = files(&[(
        "main.js",
        "exports.default = () => 'from default'; exports.other = () => 'other';",
    )]);
    let handle = evaluator.evaluate("main.js", &map, &GlobalBindings::new()).unwrap();
    assert!(handle.is_callable());
    assert_eq!(evaluator.invoke(&handle, &json!({})).await.unwrap(), html("from default"));
}

#[tokio::test]
async fn non_function_export_is_inspectable() {
    let mut evaluator = evaluator();
    let map = files(&[("main.js", "module.exports = { title: 'x', count: 2 };")]);
    let handle = evaluator.evaluate("main.js", &map, &GlobalBindings::new()).unwrap();
    assert_eq!(handle.kind(), "object");
    assert!(!handle.is_callable());
    assert_eq!(
        evaluator.export_json(&handle).unwrap(),
        json!({ "title": "x", "count": 2 })
    );
}

#[tokio::test]
async fn re_evaluation_is_behaviourally_equivalent_but_distinct() {
    let mut evaluator = evaluator();
    let map = files(&[(
        "main.js",
        "let calls = 0; module.exports = (p) => p.route + '#' + (++calls);",
    )]);
    let first = evaluator.evaluate("main.js", &map, &GlobalBindings::new()).unwrap();
    let second = evaluator.evaluate("main.js", &map, &GlobalBindings::new()).unwrap();

    assert_ne!(first, second);
    assert_eq!(first.kind(), second.kind());

    let params = json!({ "route": "/" });
    assert_eq!(evaluator.invoke(&first, &params).await.unwrap(), html("/#1"));
    assert_eq!(evaluator.invoke(&first, &params).await.unwrap(), html("/#2"));
    // Separate instantiation, separate module state.
    assert_eq!(evaluator.invoke(&second, &params).await.unwrap(), html("/#1"));
}

#[tokio::test]
async fn nested_requires_are_not_memoized() {
    let mut evaluator = evaluator();
    let map = files(&[
        (
            "main.js",
            "module.exports = () => String(require('./counter.js')() + require('./counter.js')());",
        ),
        ("counter.js", "let n = 0; module.exports = () => ++n;"),
    ]);
    let handle = evaluator.evaluate("main.js", &map, &GlobalBindings::new()).unwrap();
    assert_eq!(evaluator.invoke(&handle, &json!({})).await.unwrap(), html("2"));
}

#[tokio::test]
async fn async_renders_settle() {
    let mut evaluator = evaluator();
    let map = files(&[(
        "main.js",
        "module.exports = async (p) => { await null; return 'async ' + p.route; };",
    )]);
    let handle = evaluator.evaluate("main.js", &map, &GlobalBindings::new()).unwrap();
    assert_eq!(
        evaluator.invoke(&handle, &json!({ "route": "/x" })).await.unwrap(),
        html("async /x")
    );
}

#[tokio::test]
async fn non_string_result_reports_its_type() {
    let mut evaluator = evaluator();
    let map = files(&[("main.js", "module.exports = () => 42;")]);
    let handle = evaluator.evaluate("main.js", &map, &GlobalBindings::new()).unwrap();
    assert_eq!(
        evaluator.invoke(&handle, &json!({})).await.unwrap(),
        RenderValue {
            kind: "number".into(),
            value: None
        }
    );
}

#[tokio::test]
async fn rejected_render_is_an_evaluation_error() {
    let mut evaluator = evaluator();
    let map = files(&[(
        "main.js",
        "module.exports = async () => { throw new Error('render exploded'); };",
    )]);
    let handle = evaluator.evaluate("main.js", &map, &GlobalBindings::new()).unwrap();
    match evaluator.invoke(&handle, &json!({})).await {
        Err(RenderError::Evaluation(message)) => {
            assert!(message.contains("render exploded"), "{message}")
        }
        other => panic!("expected evaluation error, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Globals
// ---------------------------------------------------------------------------

#[tokio::test]
async fn extra_globals_are_in_scope() {
    let mut evaluator = evaluator();
    let mut globals = GlobalBindings::new();
    globals.insert("greeting".into(), json!("hi"));
    globals.insert("site".into(), json!({ "name": "docs" }));

    let map = files(&[
        ("main.js", "module.exports = () => global.greeting + ' ' + require('./bare.js');"),
        ("bare.js", "module.exports = site.name + '|' + this.greeting;"),
    ]);
    let handle = evaluator.evaluate("main.js", &map, &globals).unwrap();
    assert_eq!(evaluator.invoke(&handle, &json!({})).await.unwrap(), html("hi docs|hi"));
}

#[tokio::test]
async fn globals_do_not_leak_between_trees() {
    let mut evaluator = evaluator();
    let map = files(&[("main.js", "module.exports = () => typeof greeting;")]);

    let mut globals = GlobalBindings::new();
    globals.insert("greeting".into(), json!("hi"));
    let with = evaluator.evaluate("main.js", &map, &globals).unwrap();
    let without = evaluator.evaluate("main.js", &map, &GlobalBindings::new()).unwrap();

    assert_eq!(evaluator.invoke(&with, &json!({})).await.unwrap(), html("string"));
    assert_eq!(evaluator.invoke(&without, &json!({})).await.unwrap(), html("undefined"));
}

#[tokio::test]
async fn process_env_and_console_are_available() {
    let mut env = BTreeMap::new();
    env.insert("SITE".to_string(), "au".to_string());
    let mut evaluator = ModuleEvaluator::new(EvaluatorOptions {
        env,
        cwd: "/srv/app".into(),
        ..Default::default()
    })
    .unwrap();

    let map = files(&[(
        "main.js",
        r#"
        module.exports = () => {
            console.log('rendering', { site: process.env.SITE });
            console.warn('careful');
            return process.env.SITE + ':' + process.cwd() + ':' + typeof process.platform;
        };
        "#,
    )]);
    let handle = evaluator.evaluate("main.js", &map, &GlobalBindings::new()).unwrap();
    assert_eq!(
        evaluator.invoke(&handle, &json!({})).await.unwrap(),
        html("au:/srv/app:string")
    );
}

#[tokio::test]
async fn module_metadata_is_bound() {
    let mut evaluator = evaluator();
    let map = files(&[(
        "pages/home.js",
        "module.exports = () => __filename + '|' + __dirname + '|' + (global === this);",
    )]);
    let handle = evaluator.evaluate("pages/home.js", &map, &GlobalBindings::new()).unwrap();
    assert_eq!(
        evaluator.invoke(&handle, &json!({})).await.unwrap(),
        html("pages/home.js|pages|true")
    );
}
