//! Script rendering: the command stream, the synthesized data object, strict
//! lookups, declarations, and custom handlers.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use cascada::{
    configure, context, Args, CommandHandler, Context, Error, Func, Options, PathValue, Pos,
    RenderError, RenderErrorKind, Value,
};
use futures::FutureExt;

#[tokio::test(flavor = "current_thread")]
async fn data_commands_build_the_focused_object() {
    let env = configure(Options::default());
    let out = env
        .render_script_string(
            ":data\n@data.list.push(1)\n@data.list.push(2)\n@data.obj.merge({a: 1})",
            Context::new(),
        )
        .await
        .expect("render");
    assert_eq!(out.data, serde_json::json!({"list": [1, 2], "obj": {"a": 1}}));
    assert_eq!(
        out.result().to_json().expect("json"),
        serde_json::json!({"list": [1, 2], "obj": {"a": 1}})
    );
}

#[tokio::test(flavor = "current_thread")]
async fn data_methods_cover_numbers_strings_and_deletion() {
    let env = configure(Options::default());
    let out = env
        .render_script_string(
            concat!(
                ":data\n",
                "@data.n.increment()\n",
                "@data.n.add(4)\n",
                "@data.n.multiply(2)\n",
                "@data.s.append('ab')\n",
                "@data.s.append('cd')\n",
                "@data.gone.set(1)\n",
                "@data.gone.delete()\n",
                "@data.flags.bitOr(6)\n",
                "@data.flags.bitAnd(3)\n",
            ),
            Context::new(),
        )
        .await
        .expect("render");
    assert_eq!(
        out.data,
        serde_json::json!({"n": 10, "s": "abcd", "flags": 2})
    );
}

#[tokio::test(flavor = "current_thread")]
async fn wrong_kind_data_commands_are_positioned_errors() {
    let env = configure(Options::default());
    let err = env
        .render_script_string(
            ":data\n@data.s.set('text')\n@data.s.push(1)",
            Context::new(),
        )
        .await
        .expect_err("push on a string");
    let Error::Render(poison) = err else {
        panic!("expected render error");
    };
    let e = &poison.errors()[0];
    assert_eq!(e.kind(), RenderErrorKind::DataCommand);
    assert!(e.message().contains("expected array"));
    assert_eq!(e.pos().map(|p| p.line), Some(3));
}

#[tokio::test(flavor = "current_thread")]
async fn scripts_have_declarations_and_control_flow() {
    let env = configure(Options::default());
    let out = env
        .render_script_string(
            concat!(
                ":data\n",
                "var total = 0\n",
                "for x in items\n",
                "  total = total + x\n",
                "endfor\n",
                "if total > 5\n",
                "  @data.size.set('big')\n",
                "else\n",
                "  @data.size.set('small')\n",
                "endif\n",
                "@data.total.set(total)\n",
            ),
            context! { items: serde_json::json!([1, 2, 4]) },
        )
        .await
        .expect("render");
    assert_eq!(out.data, serde_json::json!({"size": "big", "total": 7}));
}

#[tokio::test(flavor = "current_thread")]
async fn print_collects_free_text() {
    let env = configure(Options::default());
    let out = env
        .render_script_string("print 'a'\nprint 'b'", Context::new())
        .await
        .expect("render");
    assert_eq!(out.text, "ab");
}

#[tokio::test(flavor = "current_thread")]
async fn strict_lookup_poisons_missing_names() {
    let env = configure(Options::default());
    let err = env
        .render_script_string("do missing_fn()", Context::new())
        .await
        .expect_err("missing name");
    let Error::Render(poison) = err else {
        panic!("expected render error");
    };
    assert_eq!(poison.errors()[0].kind(), RenderErrorKind::Lookup);
    assert!(poison.errors()[0].message().contains("missing_fn"));
}

#[tokio::test(flavor = "current_thread")]
async fn extern_names_bind_from_the_context() {
    let env = configure(Options::default());
    let out = env
        .render_script_string(
            ":data\nextern seed\n@data.n.set(seed + 1)",
            context! { seed: 41 },
        )
        .await
        .expect("render");
    assert_eq!(out.data, serde_json::json!({"n": 42}));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn concurrent_commands_assemble_in_source_order() {
    let env = configure(Options::default());
    env.add_global(
        "slow_value",
        Value::Func(Func::from_async("slow_value", |args: Args| {
            async move {
                let v = args.get(0);
                let delay = args.get(1).as_number().unwrap_or(1.0) as u64;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(v)
            }
            .boxed_local()
        })),
    );
    let out = env
        .render_script_string(
            ":data\n@data.seq.push(slow_value('x', 30))\n@data.seq.push(slow_value('y', 1))",
            Context::new(),
        )
        .await
        .expect("render");
    // y resolves before x; the command stream still applies in source order.
    assert_eq!(out.data, serde_json::json!({"seq": ["x", "y"]}));
}

struct TurtleHandler {
    moves: Vec<String>,
}

impl CommandHandler for TurtleHandler {
    fn on_command(
        &mut self,
        command: &str,
        _subpath: &[PathValue],
        args: &[Value],
        _pos: Pos,
    ) -> Result<(), RenderError> {
        self.moves.push(format!("{command}({})", args.first().map(Value::render).unwrap_or_default()));
        Ok(())
    }

    fn output(&self) -> Value {
        Value::array(self.moves.iter().map(|m| Value::from(m.clone())))
    }
}

#[tokio::test(flavor = "current_thread")]
async fn handler_classes_receive_commands_in_order() {
    let env = configure(Options::default());
    env.add_command_handler_class("turtle", || {
        Box::new(TurtleHandler { moves: Vec::new() })
    });
    let out = env
        .render_script_string(
            ":turtle\n@turtle.forward(10)\n@turtle.turn(90)\n@turtle.forward(5)",
            Context::new(),
        )
        .await
        .expect("render");
    assert_eq!(
        out.result(),
        Value::array([
            Value::from("forward(10)"),
            Value::from("turn(90)"),
            Value::from("forward(5)"),
        ])
    );
}

#[tokio::test(flavor = "current_thread")]
async fn unknown_handlers_fail_with_their_name() {
    let env = configure(Options::default());
    let err = env
        .render_script_string("@ghost.do(1)", Context::new())
        .await
        .expect_err("unknown handler");
    assert!(err.to_string().contains("ghost"));
}

#[tokio::test(flavor = "current_thread")]
async fn custom_data_methods_extend_the_builtin_set() {
    let env = configure(Options::default());
    env.add_data_method("double", |target, _args| {
        let n = target.as_f64().unwrap_or(0.0);
        *target = serde_json::json!(n * 2.0);
        Ok(())
    });
    let out = env
        .render_script_string(
            ":data\n@data.n.set(21)\n@data.n.double()",
            Context::new(),
        )
        .await
        .expect("render");
    assert_eq!(out.data, serde_json::json!({"n": 42.0}));
}

#[tokio::test(flavor = "current_thread")]
async fn script_while_and_index_paths() {
    let env = configure(Options::default());
    let out = env
        .render_script_string(
            concat!(
                ":data\n",
                "var i = 0\n",
                "while i < 3\n",
                "  @data.seq.push(i)\n",
                "  i = i + 1\n",
                "endwhile\n",
                "@data.seq[0].set(9)\n",
            ),
            Context::new(),
        )
        .await
        .expect("render");
    assert_eq!(out.data, serde_json::json!({"seq": [9, 1, 2]}));
}

#[tokio::test(flavor = "current_thread")]
async fn shared_handler_tracks_state_across_renders() {
    #[derive(Default)]
    struct CountingHandler {
        total: Rc<RefCell<usize>>,
    }
    impl CommandHandler for CountingHandler {
        fn on_command(
            &mut self,
            _command: &str,
            _subpath: &[PathValue],
            _args: &[Value],
            _pos: Pos,
        ) -> Result<(), RenderError> {
            *self.total.borrow_mut() += 1;
            Ok(())
        }
    }

    let total = Rc::new(RefCell::new(0));
    let env = configure(Options::default());
    env.add_command_handler(
        "log",
        CountingHandler {
            total: Rc::clone(&total),
        },
    );
    for _ in 0..2 {
        env.render_script_string("@log.emit(1)", Context::new())
            .await
            .expect("render");
    }
    assert_eq!(*total.borrow(), 2);
}
