use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

/// Result type used throughout `cascada` APIs.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Source position, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pos {
    pub line: u32,
    pub col: u32,
}

impl Pos {
    #[must_use]
    pub const fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Line {}, Column {}]", self.line, self.col)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// Source could not be lexed, parsed or annotated.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// The loader has no source for the requested name.
    #[error("template not found: {name}")]
    TemplateNotFound { name: String },

    /// Embedder-supplied loader failed (type-erased).
    #[error("loader error: {0}")]
    Loader(#[source] anyhow::Error),

    /// One or more render-time failures, in source order.
    #[error(transparent)]
    Render(#[from] PoisonError),
}

/// Compile-time failure with a source position.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub pos: Option<Pos>,
    pub template_path: Option<String>,
}

impl std::error::Error for CompileError {}

impl CompileError {
    pub fn new(message: impl Into<String>, pos: Pos) -> Self {
        Self {
            message: message.into(),
            pos: Some(pos),
            template_path: None,
        }
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.template_path = Some(path.into());
        self
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Template compile error:")?;
        if let Some(path) = &self.template_path {
            write!(f, " ({path})")?;
        }
        if let Some(pos) = self.pos {
            write!(f, " {pos}")?;
        }
        write!(f, " {}", self.message)
    }
}

/// What failed. Mirrors the error taxonomy rather than any type layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderErrorKind {
    /// Missing name in strict lookup.
    Lookup,
    /// `throw_on_undefined` tripped on a rendered expression.
    Undefined,
    /// A filter, global, extension or other user callable failed.
    UserCallable,
    /// A yielded element was an error but iteration continued.
    IteratorSoft,
    /// The iterator itself failed and iteration stopped.
    IteratorHard,
    /// A script data command was applied to the wrong kind of target.
    DataCommand,
    /// Anything else raised by the runtime.
    Runtime,
}

struct RenderErrorInner {
    kind: RenderErrorKind,
    message: String,
    pos: Cell<Option<Pos>>,
    context_tag: RefCell<Option<String>>,
    template_path: RefCell<Option<Rc<str>>>,
    cause: Option<anyhow::Error>,
}

/// A single positioned render-time error.
///
/// Cheaply clonable; clones share identity, which is what poison bundles
/// deduplicate on. Position, context tag and template path may be attached
/// after construction by the closest wrapping boundary that knows them.
#[derive(Clone)]
pub struct RenderError(Rc<RenderErrorInner>);

impl RenderError {
    pub fn new(kind: RenderErrorKind, message: impl Into<String>) -> Self {
        Self(Rc::new(RenderErrorInner {
            kind,
            message: message.into(),
            pos: Cell::new(None),
            context_tag: RefCell::new(None),
            template_path: RefCell::new(None),
            cause: None,
        }))
    }

    pub fn with_cause(kind: RenderErrorKind, message: impl Into<String>, cause: anyhow::Error) -> Self {
        Self(Rc::new(RenderErrorInner {
            kind,
            message: message.into(),
            pos: Cell::new(None),
            context_tag: RefCell::new(None),
            template_path: RefCell::new(None),
            cause: Some(cause),
        }))
    }

    #[must_use]
    pub fn at(self, pos: Pos) -> Self {
        self.0.pos.set(Some(pos));
        self
    }

    #[must_use]
    pub fn kind(&self) -> RenderErrorKind {
        self.0.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.0.message
    }

    #[must_use]
    pub fn pos(&self) -> Option<Pos> {
        self.0.pos.get()
    }

    #[must_use]
    pub fn context_tag(&self) -> Option<String> {
        self.0.context_tag.borrow().clone()
    }

    #[must_use]
    pub fn template_path(&self) -> Option<Rc<str>> {
        self.0.template_path.borrow().clone()
    }

    #[must_use]
    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.0.cause.as_ref()
    }

    /// Attach position/path/tag info that is still missing. Called at each
    /// wrapping boundary; the closest boundary wins because later calls do
    /// not overwrite.
    pub fn ensure_context(&self, pos: Pos, tag: Option<&str>, path: Option<&Rc<str>>) {
        if self.0.pos.get().is_none() {
            self.0.pos.set(Some(pos));
        }
        if let Some(tag) = tag {
            let mut slot = self.0.context_tag.borrow_mut();
            if slot.is_none() {
                *slot = Some(tag.to_string());
            }
        }
        if let Some(path) = path {
            let mut slot = self.0.template_path.borrow_mut();
            if slot.is_none() {
                *slot = Some(Rc::clone(path));
            }
        }
    }

    /// Identity comparison; poison bundles dedup on this, never on message
    /// equality.
    #[must_use]
    pub fn same_instance(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Template render error:")?;
        if let Some(path) = self.0.template_path.borrow().as_deref() {
            write!(f, " ({path})")?;
        }
        if let Some(pos) = self.0.pos.get() {
            write!(f, " {pos}")?;
        }
        if let Some(tag) = self.0.context_tag.borrow().as_deref() {
            write!(f, " {tag}:")?;
        }
        write!(f, " {}", self.0.message)?;
        if let Some(cause) = &self.0.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderError")
            .field("kind", &self.0.kind)
            .field("message", &self.0.message)
            .field("pos", &self.0.pos.get())
            .finish_non_exhaustive()
    }
}

impl std::error::Error for RenderError {}

/// Ordered bundle of every render error collected for one failed value.
///
/// Combinators concatenate bundles in source order; identical instances are
/// kept once.
#[derive(Debug, Clone)]
pub struct PoisonError {
    errors: Vec<RenderError>,
}

impl PoisonError {
    #[must_use]
    pub fn new(error: RenderError) -> Self {
        Self { errors: vec![error] }
    }

    /// Build a bundle from errors already in source order, deduplicating by
    /// instance.
    #[must_use]
    pub fn from_errors(errors: impl IntoIterator<Item = RenderError>) -> Self {
        let mut out = Self { errors: Vec::new() };
        for e in errors {
            out.push(e);
        }
        out
    }

    /// Append another bundle after this one, preserving order and dropping
    /// instances already present.
    pub fn merge(&mut self, other: Self) {
        for e in other.errors {
            self.push(e);
        }
    }

    fn push(&mut self, error: RenderError) {
        if !self.errors.iter().any(|e| e.same_instance(&error)) {
            self.errors.push(error);
        }
    }

    #[must_use]
    pub fn errors(&self) -> &[RenderError] {
        &self.errors
    }

    /// Fill missing context on every contained error.
    pub fn ensure_context(&self, pos: Pos, tag: Option<&str>, path: Option<&Rc<str>>) {
        for e in &self.errors {
            e.ensure_context(pos, tag, path);
        }
    }
}

impl fmt::Display for PoisonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => write!(f, "Template render error"),
            [first] => write!(f, "{first}"),
            [first, rest @ ..] => write!(f, "{first} (and {} more)", rest.len()),
        }
    }
}

impl std::error::Error for PoisonError {}

impl From<RenderError> for PoisonError {
    fn from(error: RenderError) -> Self {
        Self::new(error)
    }
}

#[cfg(test)]
mod tests {
    use super::{Pos, PoisonError, RenderError, RenderErrorKind};

    #[test]
    fn dedup_is_by_instance_not_message() {
        let a = RenderError::new(RenderErrorKind::Runtime, "boom");
        let b = RenderError::new(RenderErrorKind::Runtime, "boom");
        let mut bundle = PoisonError::new(a.clone());
        bundle.merge(PoisonError::new(a));
        bundle.merge(PoisonError::new(b));
        assert_eq!(bundle.errors().len(), 2);
    }

    #[test]
    fn closest_boundary_wins_for_position() {
        let path: std::rc::Rc<str> = "page.html".into();
        let e = RenderError::new(RenderErrorKind::UserCallable, "bad call");
        e.ensure_context(Pos::new(3, 7), Some("slow"), Some(&path));
        e.ensure_context(Pos::new(1, 1), Some("outer"), None);
        assert_eq!(e.pos(), Some(Pos::new(3, 7)));
        assert_eq!(e.context_tag().as_deref(), Some("slow"));
        assert_eq!(e.template_path().as_deref(), Some("page.html"));
    }

    #[test]
    fn merge_keeps_source_order() {
        let a = RenderError::new(RenderErrorKind::Runtime, "first");
        let b = RenderError::new(RenderErrorKind::Runtime, "second");
        let mut bundle = PoisonError::new(a);
        bundle.merge(PoisonError::new(b));
        let messages: Vec<_> = bundle.errors().iter().map(|e| e.message().to_string()).collect();
        assert_eq!(messages, ["first", "second"]);
    }
}
