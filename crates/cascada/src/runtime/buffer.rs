//! Ordered output assembly.
//!
//! Each async block owns a buffer; a block reserves its slot synchronously at
//! entry and fills it whenever its value arrives, so assembly order is source
//! order no matter which subexpression finishes first. Escaping is a deferred
//! transform applied at flatten time, which keeps safe strings exempt.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Pos, PoisonError, RenderError, RenderErrorKind};
use crate::output::escape_html;
use crate::script::command::CommandRecord;
use crate::script::data::{apply_data_command, DataMethod};
use crate::script::{CommandHandler, HandlerRegistration, ScriptOutput};
use crate::value::Value;

use super::EvalResult;

pub(crate) enum Slot {
    /// Reserved, not yet written.
    Pending,
    /// Raw text, escaped at flatten when autoescape is on.
    Text(Rc<str>),
    /// Already-safe text; never escaped.
    Safe(Rc<str>),
    Nested(Rc<Buffer>),
    Command(CommandRecord),
    Failed(PoisonError),
}

#[derive(Default)]
pub(crate) struct Buffer {
    slots: RefCell<Vec<Slot>>,
}

impl Buffer {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Reserve the next slot; the index stays valid for a later `set`.
    pub fn reserve(&self) -> usize {
        let mut slots = self.slots.borrow_mut();
        slots.push(Slot::Pending);
        slots.len() - 1
    }

    pub fn set(&self, index: usize, slot: Slot) {
        let mut slots = self.slots.borrow_mut();
        debug_assert!(
            matches!(slots[index], Slot::Pending),
            "buffer slot written twice"
        );
        slots[index] = slot;
    }

    /// Reserve-and-fill for synchronously produced output.
    pub fn push(&self, slot: Slot) {
        self.slots.borrow_mut().push(slot);
    }

    /// Template-mode assembly: concatenate in slot order, applying deferred
    /// escaping; every failed slot contributes to one bundle, in slot order.
    pub fn flatten_template(&self, autoescape: bool) -> Result<String, PoisonError> {
        let mut out = String::new();
        let mut poison: Option<PoisonError> = None;
        self.flatten_template_into(autoescape, &mut out, &mut poison);
        match poison {
            Some(p) => Err(p),
            None => Ok(out),
        }
    }

    fn flatten_template_into(
        &self,
        autoescape: bool,
        out: &mut String,
        poison: &mut Option<PoisonError>,
    ) {
        for slot in self.slots.borrow().iter() {
            match slot {
                Slot::Pending => {
                    debug_assert!(false, "pending slot after quiescence");
                }
                Slot::Text(s) => {
                    if autoescape {
                        out.push_str(&escape_html(s));
                    } else {
                        out.push_str(s);
                    }
                }
                Slot::Safe(s) => out.push_str(s),
                Slot::Nested(inner) => inner.flatten_template_into(autoescape, out, poison),
                Slot::Command(cmd) => {
                    debug_assert!(false, "command slot in template mode");
                    let _ = cmd;
                }
                Slot::Failed(p) => match poison {
                    Some(acc) => acc.merge(p.clone()),
                    None => *poison = Some(p.clone()),
                },
            }
        }
    }

    /// Script-mode assembly: dispatch commands in slot order, synthesizing
    /// the data object and feeding other handlers.
    pub fn flatten_script(&self, assembly: &ScriptAssembly<'_>) -> Result<ScriptOutput, PoisonError> {
        let mut state = ScriptAssemblyState {
            data: serde_json::Value::Null,
            text: String::new(),
            instances: indexmap::IndexMap::new(),
            errors: Vec::new(),
        };
        self.flatten_script_into(assembly, &mut state);

        if !state.errors.is_empty() {
            return Err(PoisonError::from_errors(state.errors));
        }

        let mut handlers = indexmap::IndexMap::new();
        for (name, instance) in &state.instances {
            let value = match instance {
                HandlerInstance::Owned(h) => h.output(),
                HandlerInstance::Shared(h) => h.borrow().output(),
            };
            handlers.insert(name.clone(), value);
        }

        Ok(ScriptOutput {
            data: if state.data.is_null() {
                serde_json::Value::Object(serde_json::Map::new())
            } else {
                state.data
            },
            text: state.text,
            handlers,
            focus: assembly.focus.clone(),
        })
    }

    fn flatten_script_into(&self, assembly: &ScriptAssembly<'_>, state: &mut ScriptAssemblyState) {
        for slot in self.slots.borrow().iter() {
            match slot {
                Slot::Pending => {
                    debug_assert!(false, "pending slot after quiescence");
                }
                Slot::Text(s) | Slot::Safe(s) => state.text.push_str(s),
                Slot::Nested(inner) => inner.flatten_script_into(assembly, state),
                Slot::Failed(p) => state.errors.extend(p.errors().iter().cloned()),
                Slot::Command(cmd) => {
                    if let Err(e) = dispatch_command(cmd, assembly, state) {
                        state.errors.push(e);
                    }
                }
            }
        }
    }
}

/// Registries consulted during script assembly.
pub(crate) struct ScriptAssembly<'a> {
    pub data_methods: &'a HashMap<String, Rc<DataMethod>>,
    pub handlers: &'a HashMap<String, HandlerRegistration>,
    pub focus: Option<String>,
}

enum HandlerInstance {
    Owned(Box<dyn CommandHandler>),
    Shared(Rc<RefCell<dyn CommandHandler>>),
}

struct ScriptAssemblyState {
    data: serde_json::Value,
    text: String,
    instances: indexmap::IndexMap<String, HandlerInstance>,
    errors: Vec<RenderError>,
}

fn dispatch_command(
    cmd: &CommandRecord,
    assembly: &ScriptAssembly<'_>,
    state: &mut ScriptAssemblyState,
) -> Result<(), RenderError> {
    if cmd.handler.as_ref() == "data" {
        return apply_data_command(&mut state.data, cmd, assembly.data_methods);
    }

    let name = cmd.handler.to_string();
    if !state.instances.contains_key(&name) {
        let registration = assembly.handlers.get(&name).ok_or_else(|| {
            RenderError::new(
                RenderErrorKind::Runtime,
                format!("unknown command handler {name:?}"),
            )
            .at(cmd.pos)
        })?;
        let instance = match registration {
            HandlerRegistration::Factory(make) => HandlerInstance::Owned(make()),
            HandlerRegistration::Shared(shared) => HandlerInstance::Shared(Rc::clone(shared)),
        };
        state.instances.insert(name.clone(), instance);
    }

    let Some(instance) = state.instances.get_mut(&name) else {
        return Ok(());
    };
    match instance {
        HandlerInstance::Owned(h) => h.on_command(&cmd.command, &cmd.subpath, &cmd.args, cmd.pos),
        HandlerInstance::Shared(h) => {
            h.borrow_mut()
                .on_command(&cmd.command, &cmd.subpath, &cmd.args, cmd.pos)
        }
    }
}

/// Output-stage resolver: convert an evaluated expression into its slot.
pub(crate) fn suppress_value(
    result: EvalResult,
    throw_on_undefined: bool,
    pos: Pos,
) -> Slot {
    match result {
        Err(p) => Slot::Failed(p),
        Ok(Value::Safe(s)) => Slot::Safe(s),
        Ok(v @ (Value::Undefined | Value::None)) => {
            if throw_on_undefined {
                Slot::Failed(PoisonError::new(
                    RenderError::new(
                        RenderErrorKind::Undefined,
                        format!("expression rendered {}", v.type_name()),
                    )
                    .at(pos),
                ))
            } else {
                Slot::Text("".into())
            }
        }
        Ok(v) => Slot::Text(v.render().into()),
    }
}

#[cfg(test)]
mod tests {
    use super::{Buffer, ScriptAssembly, Slot};
    use crate::error::{PoisonError, RenderError, RenderErrorKind};

    #[test]
    fn slot_order_survives_out_of_order_completion() {
        let buf = Buffer::new();
        let first = buf.reserve();
        let second = buf.reserve();
        buf.set(second, Slot::Text("B".into()));
        buf.set(first, Slot::Text("A".into()));
        assert_eq!(buf.flatten_template(false).expect("flatten"), "AB");
    }

    #[test]
    fn autoescape_skips_safe_slots() {
        let buf = Buffer::new();
        buf.push(Slot::Text("<b>".into()));
        buf.push(Slot::Safe("<i>".into()));
        assert_eq!(buf.flatten_template(true).expect("flatten"), "&lt;b&gt;<i>");
    }

    #[test]
    fn flatten_is_idempotent_over_a_resolved_buffer() {
        let buf = Buffer::new();
        buf.push(Slot::Text("x".into()));
        let once = buf.flatten_template(false).expect("flatten");
        let twice = buf.flatten_template(false).expect("flatten");
        assert_eq!(once, twice);
    }

    #[test]
    fn failed_slots_collect_in_slot_order() {
        let buf = Buffer::new();
        let a = RenderError::new(RenderErrorKind::Runtime, "a");
        let b = RenderError::new(RenderErrorKind::Runtime, "b");
        buf.push(Slot::Failed(PoisonError::new(a)));
        buf.push(Slot::Failed(PoisonError::new(b)));
        let err = buf.flatten_template(false).expect_err("poison");
        let messages: Vec<_> = err.errors().iter().map(|e| e.message().to_string()).collect();
        assert_eq!(messages, ["a", "b"]);
    }

    #[test]
    fn script_flatten_builds_the_data_object() {
        use crate::script::command::{CommandRecord, PathValue};
        use crate::value::Value;

        let buf = Buffer::new();
        buf.push(Slot::Command(CommandRecord {
            handler: "data".into(),
            command: "push".into(),
            subpath: vec![PathValue::Key("list".into())],
            args: vec![Value::from(1)],
            pos: crate::error::Pos::new(1, 1),
        }));
        let methods = std::collections::HashMap::new();
        let handlers = std::collections::HashMap::new();
        let out = buf
            .flatten_script(&ScriptAssembly {
                data_methods: &methods,
                handlers: &handlers,
                focus: None,
            })
            .expect("script");
        assert_eq!(out.data, serde_json::json!({"list": [1]}));
    }
}
