//! Template composition: includes, imports, extends/block/super, loader
//! caching, and context isolation across forks.

use cascada::{configure, context, Context, Error, MemoryLoader, Options};

fn env_with(sources: &[(&str, &str)]) -> cascada::Environment {
    let env = configure(Options::default());
    let loader = MemoryLoader::new();
    for (name, src) in sources {
        loader.add(*name, *src);
    }
    env.set_loader(loader);
    env
}

#[tokio::test(flavor = "current_thread")]
async fn include_splices_output_in_place() {
    let env = env_with(&[("item.html", "[{{ label }}]")]);
    let out = env
        .render_template_string(
            "before {% include 'item.html' %} after",
            context! { label: "x" },
        )
        .await
        .expect("render");
    assert_eq!(out, "before [x] after");
}

#[tokio::test(flavor = "current_thread")]
async fn included_template_mutations_do_not_leak_back() {
    let env = env_with(&[("child.html", "{% set x = 'inner' %}{{ x }}")]);
    let out = env
        .render_template_string(
            "{% set x = 'outer' %}{% include 'child.html' %}|{{ x }}",
            Context::new(),
        )
        .await
        .expect("render");
    // The include renders with a forked context; the outer binding is
    // untouched.
    assert_eq!(out, "inner|outer");
}

#[tokio::test(flavor = "current_thread")]
async fn extends_renders_the_parent_with_overridden_blocks() {
    let env = env_with(&[
        ("base.html", "A{% block content %}base{% endblock %}B"),
        (
            "child.html",
            "{% extends 'base.html' %}{% block content %}({{ super() }})child{% endblock %}",
        ),
    ]);
    let out = env
        .render_template("child.html", Context::new())
        .await
        .expect("render");
    assert_eq!(out, "A(base)childB");
}

#[tokio::test(flavor = "current_thread")]
async fn import_exposes_macros_as_a_namespace() {
    let env = env_with(&[(
        "lib.html",
        "{% macro hi(n) %}hi {{ n }}{% endmacro %}{% set version = '1' %}",
    )]);
    let out = env
        .render_template_string(
            "{% import 'lib.html' as lib %}{{ lib.hi('x') }}/{{ lib.version }}",
            Context::new(),
        )
        .await
        .expect("render");
    assert_eq!(out, "hi x/1");
}

#[tokio::test(flavor = "current_thread")]
async fn from_import_picks_names_and_reports_missing_ones() {
    let env = env_with(&[(
        "lib.html",
        "{% macro hi(n) %}hi {{ n }}{% endmacro %}",
    )]);
    let out = env
        .render_template_string(
            "{% from 'lib.html' import hi as hello %}{{ hello('y') }}",
            Context::new(),
        )
        .await
        .expect("render");
    assert_eq!(out, "hi y");

    let err = env
        .render_template_string(
            "{% from 'lib.html' import nope %}{{ nope() }}",
            Context::new(),
        )
        .await
        .expect_err("missing export");
    assert!(err.to_string().contains("does not export"));
}

#[tokio::test(flavor = "current_thread")]
async fn underscore_sets_stay_private() {
    let env = env_with(&[(
        "lib.html",
        "{% set _secret = 'hidden' %}{% set public = 'shown' %}",
    )]);
    let out = env
        .render_template_string(
            "{% import 'lib.html' as lib %}{{ lib.public }}|{{ lib._secret }}",
            Context::new(),
        )
        .await
        .expect("render");
    assert_eq!(out, "shown|");
}

#[tokio::test(flavor = "current_thread")]
async fn missing_templates_fail_with_their_name() {
    let env = env_with(&[]);
    let err = env
        .render_template("ghost.html", Context::new())
        .await
        .expect_err("missing template");
    assert!(matches!(err, Error::TemplateNotFound { ref name } if name == "ghost.html"));
}

#[tokio::test(flavor = "current_thread")]
async fn filesystem_loader_reads_and_caches() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("page.html"), "v{{ n }}").expect("write template");

    let env = configure(Options::default());
    env.set_loader(cascada::FileSystemLoader::new(dir.path()));

    let out = env
        .render_template("page.html", context! { n: 1 })
        .await
        .expect("render");
    assert_eq!(out, "v1");

    // The compiled unit is cached: a source change is not observed.
    std::fs::write(dir.path().join("page.html"), "changed").expect("rewrite");
    let out = env
        .render_template("page.html", context! { n: 2 })
        .await
        .expect("render");
    assert_eq!(out, "v2");
}

#[tokio::test(flavor = "current_thread")]
async fn no_cache_environments_reload_sources() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("page.html"), "one").expect("write template");

    let env = configure(Options::default().no_cache(true));
    env.set_loader(cascada::FileSystemLoader::new(dir.path()));

    assert_eq!(
        env.render_template("page.html", Context::new()).await.expect("render"),
        "one"
    );
    std::fs::write(dir.path().join("page.html"), "two").expect("rewrite");
    assert_eq!(
        env.render_template("page.html", Context::new()).await.expect("render"),
        "two"
    );
}

#[tokio::test(flavor = "current_thread")]
async fn custom_delimiters_parse_end_to_end() {
    let env = configure(Options::default().delimiters(("<%", "%>"), ("<<", ">>"), ("<#", "#>")));
    let out = env
        .render_template_string(
            "<% if on %><< x >><# hidden #><% endif %>",
            context! { on: true, x: "y" },
        )
        .await
        .expect("render");
    assert_eq!(out, "y");
}
