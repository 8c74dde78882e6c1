//! The patch engine: ordered application of path-addressed ops.
//!
//! Paths are root-anchored and slash-segmented (`/signals/open_loops`).
//! On an array, a numeric final segment is positional and the reserved
//! segment `-` appends. `add` materializes missing ancestor objects
//! (the "law-genesis" relaxation of RFC 6902) so a creation delta can
//! list only leaf paths; `replace` and `remove` require the full path
//! to exist.
//!
//! Application is all-or-nothing: the input is never mutated, and an op
//! that conflicts with the existing shape fails the whole patch.

use serde_json::{Map, Value};
use thiserror::Error;
use weft_primitives::delta::{PatchOp, PatchOpKind};

/// The empty state every chain folds from.
#[must_use]
pub fn empty_state() -> Value {
    Value::Object(Map::new())
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum PatchError {
    #[error("path {path:?} is not root-anchored")]
    NotRooted { path: String },
    #[error("path {path:?} addresses nothing")]
    EmptyPath { path: String },
    #[error("segment {segment:?} of {path:?} is not a container")]
    ParentNotContainer { path: String, segment: String },
    #[error("{op:?} at {path:?}: no value at target")]
    MissingTarget { path: String, op: PatchOpKind },
    #[error("{op:?} at {path:?}: missing operand value")]
    MissingValue { path: String, op: PatchOpKind },
    #[error("segment {segment:?} of {path:?} is not a valid array index")]
    BadIndex { path: String, segment: String },
    #[error("index {index} out of bounds (len {len}) at {path:?}")]
    IndexOutOfBounds {
        path: String,
        index: usize,
        len: usize,
    },
}

/// Apply `ops` in order to a copy of `state`.
///
/// The input is untouched regardless of outcome; on error nothing is
/// partially applied.
pub fn apply_all(state: &Value, ops: &[PatchOp]) -> Result<Value, PatchError> {
    let mut next = state.clone();
    for op in ops {
        apply_op(&mut next, op)?;
    }
    Ok(next)
}

fn split_path<'a>(op: &'a PatchOp) -> Result<Vec<&'a str>, PatchError> {
    if op.path.is_empty() {
        return Err(PatchError::EmptyPath {
            path: op.path.clone(),
        });
    }
    let Some(rest) = op.path.strip_prefix('/') else {
        return Err(PatchError::NotRooted {
            path: op.path.clone(),
        });
    };
    if rest.is_empty() {
        return Err(PatchError::EmptyPath {
            path: op.path.clone(),
        });
    }
    Ok(rest.split('/').collect())
}

fn parse_index(op: &PatchOp, segment: &str, len: usize) -> Result<usize, PatchError> {
    let index: usize = segment.parse().map_err(|_| PatchError::BadIndex {
        path: op.path.clone(),
        segment: segment.to_owned(),
    })?;
    if index > len {
        return Err(PatchError::IndexOutOfBounds {
            path: op.path.clone(),
            index,
            len,
        });
    }
    Ok(index)
}

/// Walk to the parent of the final segment, materializing missing
/// object ancestors when `materialize` is set (add ops only).
fn descend<'a>(
    root: &'a mut Value,
    op: &PatchOp,
    segments: &[&str],
    materialize: bool,
) -> Result<&'a mut Value, PatchError> {
    let mut current = root;
    for segment in segments {
        current = match current {
            Value::Object(map) => {
                if materialize && !map.contains_key(*segment) {
                    let _ = map.insert((*segment).to_owned(), empty_state());
                }
                map.get_mut(*segment).ok_or_else(|| PatchError::MissingTarget {
                    path: op.path.clone(),
                    op: op.op,
                })?
            }
            Value::Array(items) => {
                let len = items.len();
                let index = parse_index(op, segment, len)?;
                items
                    .get_mut(index)
                    .ok_or(PatchError::IndexOutOfBounds {
                        path: op.path.clone(),
                        index,
                        len,
                    })?
            }
            _ => {
                return Err(PatchError::ParentNotContainer {
                    path: op.path.clone(),
                    segment: (*segment).to_owned(),
                })
            }
        };
    }
    Ok(current)
}

fn operand(op: &PatchOp) -> Result<Value, PatchError> {
    op.value.clone().ok_or(PatchError::MissingValue {
        path: op.path.clone(),
        op: op.op,
    })
}

fn apply_op(root: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    let segments = split_path(op)?;
    let Some((leaf, ancestors)) = segments.split_last() else {
        return Err(PatchError::EmptyPath {
            path: op.path.clone(),
        });
    };

    let materialize = matches!(op.op, PatchOpKind::Add);
    let parent = descend(root, op, ancestors, materialize)?;

    match op.op {
        PatchOpKind::Add => add(parent, op, leaf),
        PatchOpKind::Replace => replace(parent, op, leaf),
        PatchOpKind::Remove => remove(parent, op, leaf),
    }
}

fn add(parent: &mut Value, op: &PatchOp, leaf: &str) -> Result<(), PatchError> {
    let value = operand(op)?;
    match parent {
        Value::Object(map) => {
            let _ = map.insert(leaf.to_owned(), value);
            Ok(())
        }
        Value::Array(items) => {
            if leaf == "-" {
                items.push(value);
            } else {
                let index = parse_index(op, leaf, items.len())?;
                items.insert(index, value);
            }
            Ok(())
        }
        _ => Err(PatchError::ParentNotContainer {
            path: op.path.clone(),
            segment: leaf.to_owned(),
        }),
    }
}

fn replace(parent: &mut Value, op: &PatchOp, leaf: &str) -> Result<(), PatchError> {
    let value = operand(op)?;
    match parent {
        Value::Object(map) => {
            let slot = map.get_mut(leaf).ok_or_else(|| PatchError::MissingTarget {
                path: op.path.clone(),
                op: op.op,
            })?;
            *slot = value;
            Ok(())
        }
        Value::Array(items) => {
            let len = items.len();
            let index = parse_index(op, leaf, len)?;
            let slot = items.get_mut(index).ok_or(PatchError::IndexOutOfBounds {
                path: op.path.clone(),
                index,
                len,
            })?;
            *slot = value;
            Ok(())
        }
        _ => Err(PatchError::ParentNotContainer {
            path: op.path.clone(),
            segment: leaf.to_owned(),
        }),
    }
}

fn remove(parent: &mut Value, op: &PatchOp, leaf: &str) -> Result<(), PatchError> {
    match parent {
        Value::Object(map) => {
            let _ = map.remove(leaf).ok_or_else(|| PatchError::MissingTarget {
                path: op.path.clone(),
                op: op.op,
            })?;
            Ok(())
        }
        Value::Array(items) => {
            let len = items.len();
            let index = parse_index(op, leaf, len)?;
            if index == len {
                return Err(PatchError::IndexOutOfBounds {
                    path: op.path.clone(),
                    index,
                    len,
                });
            }
            let _ = items.remove(index);
            Ok(())
        }
        _ => Err(PatchError::ParentNotContainer {
            path: op.path.clone(),
            segment: leaf.to_owned(),
        }),
    }
}
