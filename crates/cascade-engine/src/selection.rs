//! Step selection queries over a compiled plan.
//!
//! A query is a union of whitespace- or comma-separated tokens. `name`
//! selects the step (or every clone of the invocation), `name*` adds its
//! transitive data descendants, `*name` its transitive data ancestors.

use std::collections::BTreeSet;

use cascade_types::{CascadeError, Result, StepKey};

use crate::plan::ExecutionPlan;

enum Closure {
    Exact,
    Descendants,
    Ancestors,
}

/// Resolve `query` against `plan`. A token that matches nothing is an error,
/// not an empty selection.
pub fn select(plan: &ExecutionPlan, query: &str) -> Result<BTreeSet<StepKey>> {
    let mut selected = BTreeSet::new();
    let mut matched_any = false;

    for token in query
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
    {
        matched_any = true;
        let (name, closure) = if let Some(name) = token.strip_suffix('*') {
            (name, Closure::Descendants)
        } else if let Some(name) = token.strip_prefix('*') {
            (name, Closure::Ancestors)
        } else {
            (token, Closure::Exact)
        };

        let roots = plan.steps_matching(name);
        if roots.is_empty() {
            return Err(CascadeError::UnknownSelection {
                token: token.to_string(),
            });
        }

        for root in &roots {
            match closure {
                Closure::Exact => {}
                Closure::Descendants => selected.extend(plan.downstream_of(root)),
                Closure::Ancestors => selected.extend(plan.upstream_of(root)),
            }
        }
        selected.extend(roots);
    }

    if !matched_any {
        return Err(CascadeError::UnknownSelection {
            token: query.to_string(),
        });
    }
    Ok(selected)
}
