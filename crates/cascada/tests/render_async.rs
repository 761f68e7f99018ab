//! Concurrency semantics of template rendering: parallel starts with ordered
//! output, sequence markers, branch-write cancellation, deterministic poison
//! bundles, and async iterators.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use cascada::{
    configure, context, Args, Context, Error, Func, IterError, Options, RenderError,
    RenderErrorKind, Value,
};
use futures::FutureExt;

fn slow_fn(
    starts: Rc<RefCell<Vec<String>>>,
    finishes: Rc<RefCell<Vec<String>>>,
) -> Func {
    Func::from_async("slow", move |args: Args| {
        let starts = Rc::clone(&starts);
        let finishes = Rc::clone(&finishes);
        async move {
            let tag = args.get(0).render();
            let delay = match args.get(1) {
                Value::Int(ms) => u64::try_from(ms).unwrap_or(1),
                _ => 5,
            };
            starts.borrow_mut().push(tag.clone());
            tokio::time::sleep(Duration::from_millis(delay)).await;
            finishes.borrow_mut().push(tag.clone());
            Ok(Value::from(tag))
        }
        .boxed_local()
    })
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn parallel_calls_keep_source_order() {
    let starts = Rc::new(RefCell::new(Vec::new()));
    let finishes = Rc::new(RefCell::new(Vec::new()));
    let env = configure(Options::default());
    env.add_global("slow", Value::Func(slow_fn(Rc::clone(&starts), Rc::clone(&finishes))));

    // A is slower than B; output must still read A-B, and both calls must be
    // in flight before either resolves.
    let out = env
        .render_template_string("{{ slow('A', 30) }}-{{ slow('B', 1) }}", Context::new())
        .await
        .expect("render");
    assert_eq!(out, "A-B");
    assert_eq!(*starts.borrow(), vec!["A".to_string(), "B".to_string()]);
    assert_eq!(*finishes.borrow(), vec!["B".to_string(), "A".to_string()]);
}

fn counter_state(counter: Rc<Cell<i64>>) -> Value {
    let inc = {
        let counter = Rc::clone(&counter);
        Func::from_async("inc", move |_args: Args| {
            let counter = Rc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.set(counter.get() + 1);
                Ok(Value::Undefined)
            }
            .boxed_local()
        })
    };
    let read = {
        let counter = Rc::clone(&counter);
        Func::from_sync("read", move |_args: Args| Ok(Value::Int(counter.get())))
    };
    Value::map([
        ("inc".to_string(), Value::Func(inc)),
        ("read".to_string(), Value::Func(read)),
    ])
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn sequence_marker_orders_operations_on_a_path() {
    let counter = Rc::new(Cell::new(0));
    let env = configure(Options::default());
    env.add_global("state", counter_state(Rc::clone(&counter)));

    // Both increments await 5ms; the unmarked read on the same path must
    // still observe both, never 0 or 1.
    let out = env
        .render_template_string(
            "{% do state!.inc() %}{% do state!.inc() %}{{ state.read() }}",
            Context::new(),
        )
        .await
        .expect("render");
    assert_eq!(out, "2");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn unsequenced_operations_may_interleave_but_all_run() {
    let counter = Rc::new(Cell::new(0));
    let env = configure(Options::default());
    env.add_global("state", counter_state(Rc::clone(&counter)));

    env.render_template_string("{% do state.inc() %}{% do state.inc() %}", Context::new())
        .await
        .expect("render");
    assert_eq!(counter.get(), 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn untaken_branch_writes_are_cancelled() {
    for cond in [true, false] {
        let env = configure(Options::default());
        env.add_global(
            "a",
            Value::Func(Func::from_async("a", |_| {
                async {
                    tokio::time::sleep(Duration::from_millis(3)).await;
                    Ok(Value::from("from-a"))
                }
                .boxed_local()
            })),
        );
        env.add_global(
            "b",
            Value::Func(Func::from_async("b", |_| {
                async {
                    tokio::time::sleep(Duration::from_millis(3)).await;
                    Ok(Value::from("from-b"))
                }
                .boxed_local()
            })),
        );
        // Two writes to x are announced; only one happens. The read must not
        // deadlock and must see the taken branch's value.
        let out = env
            .render_template_string(
                "{% if cond %}{% set x = a() %}{% else %}{% set x = b() %}{% endif %}{{ x }}",
                context! { cond: cond },
            )
            .await
            .expect("render");
        assert_eq!(out, if cond { "from-a" } else { "from-b" });
    }
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn poison_bundles_collect_every_error_in_source_order() {
    let env = configure(Options::default());
    env.add_global(
        "fail1",
        Value::Func(Func::from_async("fail1", |_| {
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(RenderError::new(RenderErrorKind::UserCallable, "first failure"))
            }
            .boxed_local()
        })),
    );
    env.add_global(
        "fail2",
        Value::Func(Func::from_async("fail2", |_| {
            async {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Err(RenderError::new(RenderErrorKind::UserCallable, "second failure"))
            }
            .boxed_local()
        })),
    );

    let err = env
        .render_template_string("{{ fail1() }} {{ fail2() }}", Context::new())
        .await
        .expect_err("render must fail");
    let Error::Render(poison) = err else {
        panic!("expected a render error, got {err}");
    };

    // fail2 finishes first, but the bundle is source-ordered.
    let errors = poison.errors();
    assert!(errors.len() >= 2, "got {} errors", errors.len());
    assert!(errors[0].message().contains("first failure"));
    assert!(errors[1].message().contains("second failure"));
    let p0 = errors[0].pos().expect("first call site position");
    let p1 = errors[1].pos().expect("second call site position");
    assert!(p0.col < p1.col, "positions must point at the two call sites");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn async_iterator_soft_errors_continue_hard_errors_stop() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let env = configure(Options::default());
    env.add_global(
        "gen",
        Value::Func(Func::from_sync("gen", |_| {
            Ok(cascada::stream_of(vec![
                Ok(Value::Int(1)),
                Err(IterError::Soft(RenderError::new(
                    RenderErrorKind::IteratorSoft,
                    "e2",
                ))),
                Ok(Value::Int(3)),
                Err(IterError::Hard(RenderError::new(
                    RenderErrorKind::IteratorHard,
                    "e4",
                ))),
                Ok(Value::Int(5)),
            ]))
        })),
    );
    let seen_fn = {
        let seen = Rc::clone(&seen);
        Func::from_sync("seen", move |args: Args| {
            seen.borrow_mut().push(args.get(0).render());
            Ok(Value::Undefined)
        })
    };
    env.add_global("seen", Value::Func(seen_fn));

    let err = env
        .render_template_string(
            "{% for item in gen() %}{% do seen(item) %}{{ item }}{% endfor %}",
            Context::new(),
        )
        .await
        .expect_err("iterator errors must surface");
    let Error::Render(poison) = err else {
        panic!("expected render error");
    };

    // The valid items were processed; 5 comes after the hard error and was
    // not.
    assert_eq!(*seen.borrow(), vec!["1".to_string(), "3".to_string()]);
    let messages: Vec<_> = poison.errors().iter().map(|e| e.message().to_string()).collect();
    assert_eq!(messages, ["e2", "e4"]);
}

#[tokio::test(flavor = "current_thread")]
async fn channel_backed_iterators_render_in_yield_order() {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    for v in [1, 2, 3] {
        tx.send(Ok(Value::Int(v))).expect("send");
    }
    drop(tx);
    let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);

    let env = configure(Options::default());
    env.add_global(
        "feed",
        Value::Stream(cascada::ValueStream::new(Box::pin(stream))),
    );
    let out = env
        .render_template_string("{% for x in feed %}{{ x }}{% endfor %}", Context::new())
        .await
        .expect("render");
    assert_eq!(out, "123");
}

#[tokio::test(flavor = "current_thread")]
async fn loops_over_nothing_take_the_else_branch() {
    let env = configure(Options::default());
    let out = env
        .render_template_string(
            "{% for x in missing %}{{ x }}{% else %}empty{% endfor %}",
            Context::new(),
        )
        .await
        .expect("render");
    assert_eq!(out, "empty");
}

#[tokio::test(flavor = "current_thread")]
async fn invalid_concurrency_limit_poisons_the_loop() {
    let env = configure(Options::default());
    let err = env
        .render_template_string(
            "{% asyncAll x in items limit -1 %}{{ x }}{% endall %}",
            context! { items: serde_json::json!([1, 2]) },
        )
        .await
        .expect_err("negative limit");
    assert!(err.to_string().contains("finite non-negative"));

    let out = env
        .render_template_string(
            "{% asyncAll x in items limit 0 %}{{ x }}{% endall %}",
            context! { items: serde_json::json!([1, 2]) },
        )
        .await
        .expect("zero means unlimited");
    assert_eq!(out, "12");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn while_loop_is_sequential_with_respect_to_writes() {
    let env = configure(Options::default());
    let out = env
        .render_template_string(
            "{% set n = 0 %}{% while n < 3 %}{{ n }}{% set n = n + 1 %}{% endwhile %}{{ n }}",
            Context::new(),
        )
        .await
        .expect("render");
    assert_eq!(out, "0123");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn sequential_loop_chains_writes_across_iterations() {
    let env = configure(Options::default());
    let out = env
        .render_template_string(
            "{% set total = 0 %}{% for x in items %}{% set total = total + x %}{% endfor %}{{ total }}",
            context! { items: serde_json::json!([1, 2, 3, 4]) },
        )
        .await
        .expect("render");
    assert_eq!(out, "10");
}

#[tokio::test(flavor = "current_thread")]
async fn loop_bindings_destructure_pairs_and_expose_loop_state() {
    let env = configure(Options::default());
    let out = env
        .render_template_string(
            "{% for k, v in mapping %}{{ loop.index }}:{{ k }}={{ v }}{% if not loop.last %},{% endif %}{% endfor %}",
            context! { mapping: serde_json::json!({"a": 1, "b": 2}) },
        )
        .await
        .expect("render");
    assert_eq!(out, "1:a=1,2:b=2");
}

#[tokio::test(flavor = "current_thread")]
async fn switch_takes_one_case_and_cancels_the_rest() {
    let env = configure(Options::default());
    let template = "{% set x = 0 %}{% switch kind %}{% case 'a' %}{% set x = 1 %}{% case 'b', 'c' %}{% set x = 2 %}{% default %}{% set x = 3 %}{% endswitch %}{{ x }}";
    for (kind, expected) in [("a", "1"), ("c", "2"), ("z", "3")] {
        let out = env
            .render_template_string(template, context! { kind: kind })
            .await
            .expect("render");
        assert_eq!(out, expected, "kind {kind}");
    }
}

#[tokio::test(flavor = "current_thread")]
async fn autoescape_spares_safe_strings() {
    let env = configure(Options::default().autoescape(true));
    let out = env
        .render_template_string(
            "{{ raw }} {{ raw | safe }} {{ raw | escape | escape }}",
            context! { raw: "<b>" },
        )
        .await
        .expect("render");
    assert_eq!(out, "&lt;b&gt; <b> &lt;b&gt;");
}

#[tokio::test(flavor = "current_thread")]
async fn throw_on_undefined_reports_the_expression_position() {
    let env = configure(Options::default().throw_on_undefined(true));
    let err = env
        .render_template_string("ok {{ missing }}", Context::new())
        .await
        .expect_err("undefined output");
    let Error::Render(poison) = err else {
        panic!("expected render error");
    };
    assert_eq!(poison.errors()[0].kind(), RenderErrorKind::Undefined);
    assert!(poison.errors()[0].pos().is_some());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn dependent_read_waits_for_async_write() {
    let env = configure(Options::default());
    env.add_global(
        "fetch",
        Value::Func(Func::from_async("fetch", |_| {
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(Value::from("ready"))
            }
            .boxed_local()
        })),
    );
    let out = env
        .render_template_string("{% set v = fetch() %}{{ v }}!", Context::new())
        .await
        .expect("render");
    assert_eq!(out, "ready!");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn dict_entries_stay_lazy_until_accessed() {
    let runs = Rc::new(Cell::new(0));
    let env = configure(Options::default());
    let faulty = {
        let runs = Rc::clone(&runs);
        Func::from_async("faulty", move |_| {
            let runs = Rc::clone(&runs);
            async move {
                runs.set(runs.get() + 1);
                Err(RenderError::new(RenderErrorKind::UserCallable, "never read"))
            }
            .boxed_local()
        })
    };
    env.add_global("faulty", Value::Func(faulty));

    // Only `.a` is read: the object must not force `b`, so its failing
    // producer never runs and nothing poisons.
    let out = env
        .render_template_string("{{ {a: 1, b: faulty()}.a }}", Context::new())
        .await
        .expect("render");
    assert_eq!(out, "1");
    assert_eq!(runs.get(), 0, "unaccessed entry producers must not run");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn rendering_a_whole_dict_awaits_every_entry_in_place() {
    let env = configure(Options::default());
    env.add_global(
        "boom",
        Value::Func(Func::from_async("boom", |_| {
            async { Err(RenderError::new(RenderErrorKind::UserCallable, "entry failed")) }
                .boxed_local()
        })),
    );

    let err = env
        .render_template_string("{{ {a: 1, b: boom()} }}", Context::new())
        .await
        .expect_err("whole-object output forces every entry");
    let Error::Render(poison) = err else {
        panic!("expected render error");
    };
    assert!(poison.errors()[0].message().contains("entry failed"));

    // The happy path materializes in declaration order.
    let out = env
        .render_template_string("{{ {z: 1, a: 2} }}", Context::new())
        .await
        .expect("render");
    assert_eq!(out, r#"{"z":1,"a":2}"#);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn lazy_entries_memoize_their_producer() {
    let runs = Rc::new(Cell::new(0));
    let env = configure(Options::default());
    let produce = {
        let runs = Rc::clone(&runs);
        Func::from_async("produce", move |_| {
            let runs = Rc::clone(&runs);
            async move {
                runs.set(runs.get() + 1);
                Ok(Value::from(9))
            }
            .boxed_local()
        })
    };
    env.add_global("produce", Value::Func(produce));

    let out = env
        .render_template_string(
            "{% set d = {v: produce()} %}{{ d.v }}-{{ d.v }}",
            Context::new(),
        )
        .await
        .expect("render");
    assert_eq!(out, "9-9");
    assert_eq!(runs.get(), 1, "two accesses, one producer run");
}

#[tokio::test(flavor = "current_thread")]
async fn filters_tests_and_inline_if_compose() {
    let env = configure(Options::default());
    let out = env
        .render_template_string(
            "{{ names | join(', ') | upper }} {{ 'odd' if 3 is odd else 'even' }} {{ missing | default('dflt') }}",
            context! { names: serde_json::json!(["ann", "ben"]) },
        )
        .await
        .expect("render");
    assert_eq!(out, "ANN, BEN odd dflt");
}

#[tokio::test(flavor = "current_thread")]
async fn macros_reshuffle_keyword_arguments() {
    let env = configure(Options::default());
    let out = env
        .render_template_string(
            "{% macro greet(name, punct = '!') %}Hello {{ name }}{{ punct }}{% endmacro %}{{ greet('A') }} {{ greet(punct = '?', name = 'B') }}",
            Context::new(),
        )
        .await
        .expect("render");
    assert_eq!(out, "Hello A! Hello B?");
}

#[tokio::test(flavor = "current_thread")]
async fn call_blocks_bind_caller() {
    let env = configure(Options::default());
    let out = env
        .render_template_string(
            "{% macro wrap() %}[{{ caller() }}]{% endmacro %}{% call wrap() %}inner{% endcall %}",
            Context::new(),
        )
        .await
        .expect("render");
    assert_eq!(out, "[inner]");
}

#[tokio::test(flavor = "current_thread")]
async fn set_capture_produces_a_safe_string() {
    let env = configure(Options::default().autoescape(true));
    let out = env
        .render_template_string(
            "{% set chunk %}<i>{{ 'x' }}</i>{% endset %}{{ chunk }}",
            Context::new(),
        )
        .await
        .expect("render");
    assert_eq!(out, "<i>x</i>");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn do_waits_for_all_side_effects() {
    let counter = Rc::new(Cell::new(0));
    let env = configure(Options::default());
    let bump = {
        let counter = Rc::clone(&counter);
        Func::from_async("bump", move |_| {
            let counter = Rc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                counter.set(counter.get() + 1);
                Ok(Value::Undefined)
            }
            .boxed_local()
        })
    };
    env.add_global("bump", Value::Func(bump));
    env.render_template_string("{% do bump(), bump(), bump() %}", Context::new())
        .await
        .expect("render");
    assert_eq!(counter.get(), 3);
}
