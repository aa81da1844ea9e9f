//! Correspondence resolution: from one matched file, compute the exact paths
//! its sibling patterns expect to see changed alongside it.

use crate::error::Result;
use crate::matcher::ChangedFiles;
use crate::pattern::{Captures, Pattern};
use serde::Serialize;

/// Substitute `captures` into `pattern`.
pub fn resolve(pattern: &Pattern, captures: &Captures) -> Result<String> {
    pattern.resolve(captures)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Correspondence {
    /// Every resolved sibling path, in sibling order.
    pub expected: Vec<String>,
    /// The subset of `expected` absent from the changed files.
    pub missing: Vec<String>,
}

impl Correspondence {
    pub fn is_satisfied(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Resolve each sibling and check it against `changed`.
///
/// Siblings are checked for concreteness and shared variables when rules load,
/// so an error here means a rule bypassed validation.
pub fn correspond(
    siblings: &[&Pattern],
    captures: &Captures,
    changed: &ChangedFiles,
) -> Result<Correspondence> {
    let mut expected = Vec::with_capacity(siblings.len());
    let mut missing = Vec::new();
    for sibling in siblings {
        let path = resolve(sibling, captures)?;
        if !changed.contains(&path) {
            missing.push(path.clone());
        }
        expected.push(path);
    }
    Ok(Correspondence { expected, missing })
}
