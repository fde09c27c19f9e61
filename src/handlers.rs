//! Query and update handlers bound to an orchestration's in-memory state.
//!
//! State lives in a [`ProcessState`] shared between the orchestration body and
//! its handlers. Queries read it; updates are validated and then applied at
//! their recorded position in the history, so replay rebuilds the same state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::{ConfigErrorKind, ErrorDetails};

/// Shared, mutable orchestration state.
pub struct ProcessState<S>(Arc<Mutex<S>>);

impl<S> Clone for ProcessState<S> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<S> ProcessState<S> {
    pub fn new(initial: S) -> Self {
        Self(Arc::new(Mutex::new(initial)))
    }

    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        let guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn get(&self) -> S
    where
        S: Clone,
    {
        self.read(S::clone)
    }
}

type QueryFn<S> = Arc<dyn Fn(&S) -> Result<String, String> + Send + Sync>;
type ValidateFn<S> = Arc<dyn Fn(&S, &str) -> Result<(), String> + Send + Sync>;
type ApplyFn<S> = Arc<dyn Fn(&mut S, &str) -> Result<String, String> + Send + Sync>;

struct UpdateHandler<S> {
    validate: Option<ValidateFn<S>>,
    apply: ApplyFn<S>,
}

/// Builder for the handler set of one orchestration.
pub struct ProcessHandlers<S> {
    queries: HashMap<String, QueryFn<S>>,
    updates: HashMap<String, UpdateHandler<S>>,
    duplicates: Vec<String>,
}

impl<S> Default for ProcessHandlers<S> {
    fn default() -> Self {
        Self {
            queries: HashMap::new(),
            updates: HashMap::new(),
            duplicates: Vec::new(),
        }
    }
}

impl<S: Clone + Send + 'static> ProcessHandlers<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a read-only query.
    pub fn query<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&S) -> Result<String, String> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.queries.insert(name.clone(), Arc::new(f)).is_some() {
            self.duplicates.push(format!("query '{name}'"));
        }
        self
    }

    /// Register an update with a validator.
    ///
    /// The validator sees current state and rejects by returning `Err`. It must
    /// not have side effects. `apply` runs only for accepted updates.
    pub fn update<V, A>(mut self, name: impl Into<String>, validate: V, apply: A) -> Self
    where
        V: Fn(&S, &str) -> Result<(), String> + Send + Sync + 'static,
        A: Fn(&mut S, &str) -> Result<String, String> + Send + Sync + 'static,
    {
        let name = name.into();
        let handler = UpdateHandler {
            validate: Some(Arc::new(validate)),
            apply: Arc::new(apply),
        };
        if self.updates.insert(name.clone(), handler).is_some() {
            self.duplicates.push(format!("update '{name}'"));
        }
        self
    }

    /// Register an update that accepts any payload its `apply` accepts.
    pub fn update_unvalidated<A>(mut self, name: impl Into<String>, apply: A) -> Self
    where
        A: Fn(&mut S, &str) -> Result<String, String> + Send + Sync + 'static,
    {
        let name = name.into();
        let handler = UpdateHandler {
            validate: None,
            apply: Arc::new(apply),
        };
        if self.updates.insert(name.clone(), handler).is_some() {
            self.duplicates.push(format!("update '{name}'"));
        }
        self
    }

    /// Erase the state type by binding every handler to `state`.
    pub(crate) fn bind(self, state: ProcessState<S>) -> Result<HandlerTable, String> {
        if !self.duplicates.is_empty() {
            return Err(format!("duplicate handler registration: {}", self.duplicates.join(", ")));
        }

        let queries = self
            .queries
            .into_iter()
            .map(|(name, f)| {
                let state = state.clone();
                let erased: ErasedQuery = Arc::new(move || state.read(|s| f(s)));
                (name, erased)
            })
            .collect();

        let updates = self
            .updates
            .into_iter()
            .map(|(name, h)| {
                let validate: ErasedValidate = {
                    let state = state.clone();
                    let v = h.validate.clone();
                    Arc::new(move |payload: &str| match &v {
                        Some(v) => state.read(|s| v(s, payload)),
                        None => Ok(()),
                    })
                };
                let apply: ErasedApply = {
                    let state = state.clone();
                    let v = h.validate;
                    let apply = h.apply;
                    Arc::new(move |payload: &str| {
                        state.write(|s| {
                            if let Some(v) = &v {
                                v(s, payload)?;
                            }
                            // Apply to a copy so a failing apply leaves state untouched
                            let mut next = s.clone();
                            let result = apply(&mut next, payload)?;
                            *s = next;
                            Ok(result)
                        })
                    })
                };
                (name, ErasedUpdate { validate, apply })
            })
            .collect();

        Ok(HandlerTable { queries, updates })
    }
}

type ErasedQuery = Arc<dyn Fn() -> Result<String, String> + Send + Sync>;
type ErasedValidate = Arc<dyn Fn(&str) -> Result<(), String> + Send + Sync>;
type ErasedApply = Arc<dyn Fn(&str) -> Result<String, String> + Send + Sync>;

struct ErasedUpdate {
    validate: ErasedValidate,
    apply: ErasedApply,
}

/// Type-erased handler table owned by the orchestration context.
pub(crate) struct HandlerTable {
    queries: HashMap<String, ErasedQuery>,
    updates: HashMap<String, ErasedUpdate>,
}

fn unregistered(name: &str) -> ErrorDetails {
    ErrorDetails::Configuration {
        kind: ConfigErrorKind::UnregisteredHandler,
        resource: name.to_string(),
        message: None,
    }
}

impl HandlerTable {
    pub(crate) fn query(&self, name: &str) -> Result<String, ErrorDetails> {
        let q = self.queries.get(name).ok_or_else(|| unregistered(name))?;
        q().map_err(|e| ErrorDetails::application(crate::AppErrorKind::OrchestrationFailed, e))
    }

    pub(crate) fn validate_update(&self, name: &str, payload: &str) -> Result<(), ErrorDetails> {
        let u = self.updates.get(name).ok_or_else(|| unregistered(name))?;
        (u.validate)(payload).map_err(|reason| ErrorDetails::application(crate::AppErrorKind::UpdateRejected, reason))
    }

    /// Validate against current state, then apply. `Err` is the rejection reason.
    pub(crate) fn apply_update(&self, name: &str, payload: &str) -> Result<String, String> {
        match self.updates.get(name) {
            Some(u) => (u.apply)(payload),
            None => Err(format!("no update handler registered for '{name}'")),
        }
    }
}
