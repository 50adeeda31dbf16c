//! User transformation interface.
//!
//! An action holds an ordered chain of transformers. Each is either
//! one-to-one (frame in, frame out) or many-to-many (map of named frames
//! in and out). A one-to-one transformer is lifted into the chain by
//! naming the subfeed it applies to; subfeeds it does not name pass
//! through untouched. After the whole chain, the kernel verifies the set
//! of output names equals the action's declared outputs.
//!
//! Options come in two flavours: static (known at configuration time) and
//! runtime (expressions evaluated against the context just before the
//! transformation). Both are substituted into expression-based
//! transformers as `%{name}` tokens.

use std::collections::BTreeMap;
use std::sync::Arc;

use lakerun_types::error::{OrchestrationError, Result};
use lakerun_types::expression::{self, ExpressionContext};
use lakerun_types::DataFrame;

/// Named frames flowing through a transformer chain, keyed by subfeed
/// name (the data object id).
pub type FrameMap = BTreeMap<String, DataFrame>;

/// One-to-one transformation function.
pub type OneToOneFn =
    Arc<dyn Fn(&DataFrame, &ExpressionContext) -> anyhow::Result<DataFrame> + Send + Sync>;

/// Many-to-many transformation function.
pub type ManyToManyFn =
    Arc<dyn Fn(FrameMap, &ExpressionContext) -> anyhow::Result<FrameMap> + Send + Sync>;

/// A single link in a transformer chain.
#[derive(Clone)]
pub enum Transformer {
    /// Apply `func` to the named subfeed, or to every subfeed when no name
    /// is given.
    OneToOne {
        subfeed_name: Option<String>,
        func: OneToOneFn,
    },
    /// Apply `func` to the whole frame map at once.
    ManyToMany { func: ManyToManyFn },
    /// Keep rows matching a predicate expression. `%{name}` tokens in the
    /// predicate are substituted from the options before evaluation.
    Filter {
        subfeed_name: Option<String>,
        predicate: String,
    },
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OneToOne { subfeed_name, .. } => f
                .debug_struct("OneToOne")
                .field("subfeed_name", subfeed_name)
                .finish_non_exhaustive(),
            Self::ManyToMany { .. } => f.debug_struct("ManyToMany").finish_non_exhaustive(),
            Self::Filter {
                subfeed_name,
                predicate,
            } => f
                .debug_struct("Filter")
                .field("subfeed_name", subfeed_name)
                .field("predicate", predicate)
                .finish(),
        }
    }
}

/// Ordered chain of transformers plus its options.
#[derive(Debug, Clone, Default)]
pub struct TransformerChain {
    transformers: Vec<Transformer>,
    static_options: BTreeMap<String, String>,
    /// Option name to expression; evaluated against the context at
    /// transform time.
    runtime_options: BTreeMap<String, String>,
}

impl TransformerChain {
    /// Empty chain (identity copy).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transformer.
    #[must_use]
    pub fn with(mut self, transformer: Transformer) -> Self {
        self.transformers.push(transformer);
        self
    }

    /// Add a static option.
    #[must_use]
    pub fn with_static_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.static_options.insert(name.into(), value.into());
        self
    }

    /// Add a runtime option (an expression evaluated at transform time).
    #[must_use]
    pub fn with_runtime_option(
        mut self,
        name: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        self.runtime_options.insert(name.into(), expr.into());
        self
    }

    /// True when the chain has no transformers.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.transformers.is_empty()
    }

    /// Resolve static + runtime options into concrete values and bind them
    /// into a context usable for `%{name}` substitution.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a runtime option expression fails
    /// to evaluate.
    fn options_context(&self, ctx: &ExpressionContext) -> Result<ExpressionContext> {
        let mut resolved = ctx.clone();
        for (name, value) in &self.static_options {
            resolved = resolved.with(name.clone(), value.clone());
        }
        for (name, expr) in &self.runtime_options {
            let value = expression::evaluate(expr, ctx).map_err(|e| {
                OrchestrationError::Config(format!(
                    "runtime option '{name}' expression '{expr}': {e}"
                ))
            })?;
            resolved = resolved.with(name.clone(), value);
        }
        Ok(resolved)
    }

    /// Run every transformer in order over the frame map.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for bad predicates or option
    /// expressions, or an infrastructure error wrapping a failed user
    /// function.
    pub fn apply(&self, frames: FrameMap, ctx: &ExpressionContext) -> Result<FrameMap> {
        self.apply_phase(frames, ctx, true)
    }

    /// Like [`apply`](Self::apply), but with user functions optionally
    /// held back. During init the engine builds plans without running
    /// opaque user code: built-in filters still apply (their predicates
    /// are validated early), while user functions pass their frames
    /// through and only run during exec.
    ///
    /// # Errors
    ///
    /// See [`apply`](Self::apply).
    pub fn apply_phase(
        &self,
        frames: FrameMap,
        ctx: &ExpressionContext,
        execute_user_fns: bool,
    ) -> Result<FrameMap> {
        let options_ctx = self.options_context(ctx)?;
        let mut current = frames;
        for transformer in &self.transformers {
            current = match transformer {
                Transformer::OneToOne { subfeed_name, func } => {
                    if !execute_user_fns {
                        continue;
                    }
                    let mut next = FrameMap::new();
                    for (name, frame) in current {
                        let applies =
                            subfeed_name.as_ref().map_or(true, |wanted| *wanted == name);
                        let frame = if applies {
                            func(&frame, &options_ctx).map_err(OrchestrationError::from)?
                        } else {
                            frame
                        };
                        next.insert(name, frame);
                    }
                    next
                }
                Transformer::ManyToMany { func } => {
                    if !execute_user_fns {
                        continue;
                    }
                    func(current, &options_ctx).map_err(OrchestrationError::from)?
                }
                Transformer::Filter {
                    subfeed_name,
                    predicate,
                } => {
                    let substituted = expression::substitute_tokens(predicate, &options_ctx)
                        .map_err(|e| {
                            OrchestrationError::Config(format!(
                                "filter predicate '{predicate}': {e}"
                            ))
                        })?;
                    let mut next = FrameMap::new();
                    for (name, frame) in current {
                        let applies =
                            subfeed_name.as_ref().map_or(true, |wanted| *wanted == name);
                        let frame = if applies {
                            frame.filter_expr(&substituted).map_err(|e| {
                                OrchestrationError::Config(format!(
                                    "filter predicate '{substituted}': {e}"
                                ))
                            })?
                        } else {
                            frame
                        };
                        next.insert(name, frame);
                    }
                    next
                }
            };
        }
        Ok(current)
    }
}
