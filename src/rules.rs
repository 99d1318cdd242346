//! Ordered guard, handler, and fold rules held as data.
//!
//! A [`RuleBook`] describes an aggregate type as lists rather than control
//! flow. For each command phase (creation and update) it keeps:
//!
//! - **guards**: `(predicate, rejection)` pairs. The first guard whose
//!   predicate matches rejects the command.
//! - **handlers**: `(predicate, decision)` pairs. If no guard matched, the
//!   first handler whose predicate matches decides the events.
//!
//! A command that matches neither list is [`InterpretError::Unhandled`].
//! Fold rules are kept the same way, so the engine can ask whether an event
//! has a listener before it is persisted.
//!
//! Because rules are data, [`RuleBookBuilder::build`] can reject books with
//! structural defects (a handler hidden behind a catch-all, duplicate
//! labels, no way to create a value) before any command runs.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::behavior::{Behavior, InterpretError};
use crate::command::Command;

/// An owned, sendable, type-erased future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type Predicate<S, C> = Box<dyn Fn(&S, &C) -> bool + Send + Sync>;
type Reject<S, C, Err> = Box<dyn Fn(&S, &C) -> Err + Send + Sync>;
type Decide<S, C, E, Err> =
    Box<dyn Fn(&S, &C) -> BoxFuture<'static, Result<Vec<E>, Err>> + Send + Sync>;
type CreateFoldFn<V, E> = Box<dyn Fn(&E) -> V + Send + Sync>;
type UpdateFoldFn<V, E> = Box<dyn Fn(V, &E) -> V + Send + Sync>;
type Tagger<E> = Box<dyn Fn(&E) -> BTreeSet<String> + Send + Sync>;

/// The command phase a rule belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Creation,
    Update,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Creation => f.write_str("creation"),
            Phase::Update => f.write_str("update"),
        }
    }
}

/// A structural problem found while building a [`RuleBook`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleDefect {
    /// The handler can never be selected because a catch-all precedes it.
    #[error("{phase} handler '{label}' is unreachable behind catch-all '{shadowed_by}'")]
    Unreachable {
        phase: Phase,
        label: String,
        shadowed_by: String,
    },

    #[error("{phase} rule label '{label}' is used more than once")]
    DuplicateLabel { phase: Phase, label: String },

    #[error("no creation handler: no value can ever be created")]
    NoCreationHandler,

    #[error("no create fold: creation events cannot produce a value")]
    NoCreationFold,
}

/// Returned by [`RuleBookBuilder::build`] when the book has defects.
#[derive(Debug, Clone, thiserror::Error)]
#[error("rule book '{aggregate_type}' has {} defect(s): {}", .defects.len(), list(.defects))]
pub struct RuleBookError {
    pub aggregate_type: String,
    pub defects: Vec<RuleDefect>,
}

fn list(defects: &[RuleDefect]) -> String {
    defects
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

struct Guard<S, C, Err> {
    label: String,
    predicate: Predicate<S, C>,
    reject: Reject<S, C, Err>,
}

enum Matcher<S, C> {
    Always,
    When(Predicate<S, C>),
}

impl<S, C> Matcher<S, C> {
    fn matches(&self, state: &S, cmd: &C) -> bool {
        match self {
            Matcher::Always => true,
            Matcher::When(predicate) => predicate(state, cmd),
        }
    }
}

struct Handler<S, C, E, Err> {
    label: String,
    matcher: Matcher<S, C>,
    decide: Decide<S, C, E, Err>,
}

/// Guards and handlers for one phase. `S` is what predicates see: `()` for
/// creation, the current value for updates.
struct RuleList<S, C, E, Err> {
    phase: Phase,
    guards: Vec<Guard<S, C, Err>>,
    handlers: Vec<Handler<S, C, E, Err>>,
}

impl<S, C, E, Err> RuleList<S, C, E, Err>
where
    E: Send + 'static,
    Err: std::error::Error + Send + Sync + 'static,
{
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            guards: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// First matching guard rejects; otherwise the first matching handler
    /// decides.
    fn evaluate(
        &self,
        state: &S,
        cmd: &C,
    ) -> BoxFuture<'static, Result<Vec<E>, InterpretError<Err>>> {
        for guard in &self.guards {
            if (guard.predicate)(state, cmd) {
                tracing::debug!(phase = %self.phase, rule = %guard.label, "guard rejected command");
                let err = (guard.reject)(state, cmd);
                return Box::pin(std::future::ready(Err(InterpretError::Rejected(err))));
            }
        }
        for handler in &self.handlers {
            if handler.matcher.matches(state, cmd) {
                tracing::debug!(phase = %self.phase, rule = %handler.label, "handler matched command");
                let decision = (handler.decide)(state, cmd);
                return Box::pin(async move { decision.await.map_err(InterpretError::Rejected) });
            }
        }
        tracing::debug!(phase = %self.phase, "no rule matched command");
        Box::pin(std::future::ready(Err(InterpretError::Unhandled)))
    }

    fn defects(&self, out: &mut Vec<RuleDefect>) {
        let mut seen = HashSet::new();
        let labels = self
            .guards
            .iter()
            .map(|g| &g.label)
            .chain(self.handlers.iter().map(|h| &h.label));
        for label in labels {
            if !seen.insert(label.as_str()) {
                out.push(RuleDefect::DuplicateLabel {
                    phase: self.phase,
                    label: label.clone(),
                });
            }
        }

        let catch_all = self
            .handlers
            .iter()
            .position(|h| matches!(h.matcher, Matcher::Always));
        if let Some(at) = catch_all {
            let shadowed_by = &self.handlers[at].label;
            for handler in &self.handlers[at + 1..] {
                out.push(RuleDefect::Unreachable {
                    phase: self.phase,
                    label: handler.label.clone(),
                    shadowed_by: shadowed_by.clone(),
                });
            }
        }
    }
}

struct CreateFold<V, E> {
    predicate: Box<dyn Fn(&E) -> bool + Send + Sync>,
    fold: CreateFoldFn<V, E>,
}

struct UpdateFold<V, E> {
    predicate: Predicate<V, E>,
    fold: UpdateFoldFn<V, E>,
}

/// A [`Behavior`] assembled from ordered rule lists.
///
/// # Examples
///
/// ```
/// use eventfold_aggregates::{Command, CommandClass, RuleBook};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Serialize, Deserialize)]
/// struct Counter { value: u64 }
///
/// struct Bump { id: String, first: bool }
///
/// impl Command for Bump {
///     fn command_id(&self) -> &str { &self.id }
///     fn class(&self) -> CommandClass {
///         if self.first { CommandClass::Creation } else { CommandClass::Update }
///     }
/// }
///
/// #[derive(Clone, Serialize, Deserialize)]
/// #[serde(tag = "type", content = "data")]
/// enum CounterEvent { Started, Bumped }
///
/// #[derive(Debug, thiserror::Error)]
/// #[error("counter is full")]
/// struct Full;
///
/// let book = RuleBook::<Counter, Bump, CounterEvent, Full>::builder("counter")
///     .create_otherwise("start", |_| Ok(vec![CounterEvent::Started]))
///     .reject_update_if("full", |c, _| c.value >= 10, |_, _| Full)
///     .update_otherwise("bump", |_, _| Ok(vec![CounterEvent::Bumped]))
///     .fold_created(|e| matches!(e, CounterEvent::Started), |_| Counter { value: 0 })
///     .fold_updated(|_, e| matches!(e, CounterEvent::Bumped), |c, _| Counter { value: c.value + 1 })
///     .build()
///     .expect("rules are consistent");
/// # let _ = book;
/// ```
pub struct RuleBook<V, C, E, Err> {
    aggregate_type: String,
    creation: RuleList<(), C, E, Err>,
    update: RuleList<V, C, E, Err>,
    create_folds: Vec<CreateFold<V, E>>,
    update_folds: Vec<UpdateFold<V, E>>,
    tagger: Option<Tagger<E>>,
}

impl<V, C, E, Err> RuleBook<V, C, E, Err>
where
    E: Send + 'static,
    Err: std::error::Error + Send + Sync + 'static,
{
    /// Start describing an aggregate type.
    pub fn builder(aggregate_type: impl Into<String>) -> RuleBookBuilder<V, C, E, Err> {
        RuleBookBuilder {
            book: RuleBook {
                aggregate_type: aggregate_type.into(),
                creation: RuleList::new(Phase::Creation),
                update: RuleList::new(Phase::Update),
                create_folds: Vec::new(),
                update_folds: Vec::new(),
                tagger: None,
            },
        }
    }
}

impl<V, C, E, Err> fmt::Debug for RuleBook<V, C, E, Err> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleBook")
            .field("aggregate_type", &self.aggregate_type)
            .field("creation_guards", &self.creation.guards.len())
            .field("creation_handlers", &self.creation.handlers.len())
            .field("update_guards", &self.update.guards.len())
            .field("update_handlers", &self.update.handlers.len())
            .field("create_folds", &self.create_folds.len())
            .field("update_folds", &self.update_folds.len())
            .finish()
    }
}

/// Collects rules in order, then validates them in [`build`](Self::build).
pub struct RuleBookBuilder<V, C, E, Err> {
    book: RuleBook<V, C, E, Err>,
}

impl<V, C, E, Err> RuleBookBuilder<V, C, E, Err>
where
    V: 'static,
    C: 'static,
    E: Send + 'static,
    Err: std::error::Error + Send + Sync + 'static,
{
    /// Reject creation commands matching `predicate`.
    pub fn reject_create_if<P, R>(mut self, label: impl Into<String>, predicate: P, reject: R) -> Self
    where
        P: Fn(&C) -> bool + Send + Sync + 'static,
        R: Fn(&C) -> Err + Send + Sync + 'static,
    {
        self.book.creation.guards.push(Guard {
            label: label.into(),
            predicate: Box::new(move |_: &(), cmd: &C| predicate(cmd)),
            reject: Box::new(move |_: &(), cmd: &C| reject(cmd)),
        });
        self
    }

    /// Handle creation commands matching `predicate` synchronously.
    pub fn create_on<P, D>(self, label: impl Into<String>, predicate: P, decide: D) -> Self
    where
        P: Fn(&C) -> bool + Send + Sync + 'static,
        D: Fn(&C) -> Result<Vec<E>, Err> + Send + Sync + 'static,
    {
        self.create_on_async(label, predicate, move |cmd| std::future::ready(decide(cmd)))
    }

    /// Handle creation commands matching `predicate` with an async decision.
    ///
    /// The future must own what it needs; it outlives the borrow of the
    /// command.
    pub fn create_on_async<P, D, F>(mut self, label: impl Into<String>, predicate: P, decide: D) -> Self
    where
        P: Fn(&C) -> bool + Send + Sync + 'static,
        D: Fn(&C) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Vec<E>, Err>> + Send + 'static,
    {
        self.book.creation.handlers.push(Handler {
            label: label.into(),
            matcher: Matcher::When(Box::new(move |_: &(), cmd: &C| predicate(cmd))),
            decide: Box::new(
                move |_: &(), cmd: &C| -> BoxFuture<'static, Result<Vec<E>, Err>> {
                    Box::pin(decide(cmd))
                },
            ),
        });
        self
    }

    /// Handle every creation command that reached this point.
    pub fn create_otherwise<D>(mut self, label: impl Into<String>, decide: D) -> Self
    where
        D: Fn(&C) -> Result<Vec<E>, Err> + Send + Sync + 'static,
    {
        self.book.creation.handlers.push(Handler {
            label: label.into(),
            matcher: Matcher::Always,
            decide: Box::new(
                move |_: &(), cmd: &C| -> BoxFuture<'static, Result<Vec<E>, Err>> {
                    Box::pin(std::future::ready(decide(cmd)))
                },
            ),
        });
        self
    }

    /// Reject update commands matching `predicate` against the current value.
    pub fn reject_update_if<P, R>(mut self, label: impl Into<String>, predicate: P, reject: R) -> Self
    where
        P: Fn(&V, &C) -> bool + Send + Sync + 'static,
        R: Fn(&V, &C) -> Err + Send + Sync + 'static,
    {
        self.book.update.guards.push(Guard {
            label: label.into(),
            predicate: Box::new(predicate),
            reject: Box::new(reject),
        });
        self
    }

    /// Handle update commands matching `predicate` synchronously.
    pub fn update_on<P, D>(self, label: impl Into<String>, predicate: P, decide: D) -> Self
    where
        P: Fn(&V, &C) -> bool + Send + Sync + 'static,
        D: Fn(&V, &C) -> Result<Vec<E>, Err> + Send + Sync + 'static,
    {
        self.update_on_async(label, predicate, move |value, cmd| {
            std::future::ready(decide(value, cmd))
        })
    }

    /// Handle update commands matching `predicate` with an async decision.
    pub fn update_on_async<P, D, F>(mut self, label: impl Into<String>, predicate: P, decide: D) -> Self
    where
        P: Fn(&V, &C) -> bool + Send + Sync + 'static,
        D: Fn(&V, &C) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Vec<E>, Err>> + Send + 'static,
    {
        self.book.update.handlers.push(Handler {
            label: label.into(),
            matcher: Matcher::When(Box::new(predicate)),
            decide: Box::new(
                move |value: &V, cmd: &C| -> BoxFuture<'static, Result<Vec<E>, Err>> {
                    Box::pin(decide(value, cmd))
                },
            ),
        });
        self
    }

    /// Handle every update command that reached this point.
    pub fn update_otherwise<D>(mut self, label: impl Into<String>, decide: D) -> Self
    where
        D: Fn(&V, &C) -> Result<Vec<E>, Err> + Send + Sync + 'static,
    {
        self.book.update.handlers.push(Handler {
            label: label.into(),
            matcher: Matcher::Always,
            decide: Box::new(
                move |value: &V, cmd: &C| -> BoxFuture<'static, Result<Vec<E>, Err>> {
                    Box::pin(std::future::ready(decide(value, cmd)))
                },
            ),
        });
        self
    }

    /// Fold rule that brings a value into existence.
    pub fn fold_created<P, F>(mut self, predicate: P, fold: F) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
        F: Fn(&E) -> V + Send + Sync + 'static,
    {
        self.book.create_folds.push(CreateFold {
            predicate: Box::new(predicate),
            fold: Box::new(fold),
        });
        self
    }

    /// Fold rule for an existing value.
    pub fn fold_updated<P, F>(mut self, predicate: P, fold: F) -> Self
    where
        P: Fn(&V, &E) -> bool + Send + Sync + 'static,
        F: Fn(V, &E) -> V + Send + Sync + 'static,
    {
        self.book.update_folds.push(UpdateFold {
            predicate: Box::new(predicate),
            fold: Box::new(fold),
        });
        self
    }

    /// Replace the default tags (the aggregate type) stamped on events.
    pub fn with_tags<T>(mut self, tagger: T) -> Self
    where
        T: Fn(&E) -> BTreeSet<String> + Send + Sync + 'static,
    {
        self.book.tagger = Some(Box::new(tagger));
        self
    }

    /// Validate the collected rules.
    ///
    /// # Errors
    ///
    /// Returns [`RuleBookError`] listing every [`RuleDefect`] found.
    pub fn build(self) -> Result<RuleBook<V, C, E, Err>, RuleBookError> {
        let book = self.book;
        let mut defects = Vec::new();
        book.creation.defects(&mut defects);
        book.update.defects(&mut defects);
        if book.creation.handlers.is_empty() {
            defects.push(RuleDefect::NoCreationHandler);
        }
        if book.create_folds.is_empty() {
            defects.push(RuleDefect::NoCreationFold);
        }

        if defects.is_empty() {
            Ok(book)
        } else {
            Err(RuleBookError {
                aggregate_type: book.aggregate_type,
                defects,
            })
        }
    }
}

#[async_trait]
impl<V, C, E, Err> Behavior for RuleBook<V, C, E, Err>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    C: Command,
    E: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    Err: std::error::Error + Send + Sync + 'static,
{
    type Value = V;
    type Command = C;
    type Event = E;
    type Error = Err;

    fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    async fn interpret_create(&self, cmd: &C) -> Result<Vec<E>, InterpretError<Err>> {
        self.creation.evaluate(&(), cmd).await
    }

    async fn interpret_update(&self, value: &V, cmd: &C) -> Result<Vec<E>, InterpretError<Err>> {
        self.update.evaluate(value, cmd).await
    }

    fn has_create_listener(&self, event: &E) -> bool {
        self.create_folds.iter().any(|f| (f.predicate)(event))
    }

    fn has_update_listener(&self, value: &V, event: &E) -> bool {
        self.update_folds.iter().any(|f| (f.predicate)(value, event))
    }

    /// # Panics
    ///
    /// Panics if no create fold matches. The engine checks
    /// [`has_create_listener`](Behavior::has_create_listener) first.
    fn fold_create_event(&self, event: &E) -> V {
        let rule = self
            .create_folds
            .iter()
            .find(|f| (f.predicate)(event))
            .expect("fold_create_event called for an event with no create fold");
        (rule.fold)(event)
    }

    fn fold_update_event(&self, value: V, event: &E) -> V {
        match self.update_folds.iter().find(|f| (f.predicate)(&value, event)) {
            Some(rule) => (rule.fold)(value, event),
            None => value,
        }
    }

    fn event_tags(&self, event: &E) -> BTreeSet<String> {
        match &self.tagger {
            Some(tagger) => tagger(event),
            None => BTreeSet::from([self.aggregate_type.clone()]),
        }
    }
}
