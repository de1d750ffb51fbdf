//! Structural patches over [`Value`] trees.
//!
//! DESIGN
//! ======
//! A patch is `(op, path, value)` with `op` one of add/replace/remove. Batches
//! are applied to a copy of the base, so a failing patch leaves the base
//! untouched (all or nothing). The inverse list is produced in the same pass
//! as the forward application, and `diff` emits forward and inverse lists
//! together, so the two can never drift apart.
//!
//! Application is strict: the parent of every target must exist and be a
//! container, and `replace`/`remove` require the target itself to exist.
//! `diff` never addresses array elements; arrays are replaced wholesale.

use std::fmt;

use frames::{Map, Value};

/// One step of a patch path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl PathSegment {
    #[must_use]
    pub fn as_key(&self) -> Option<&str> {
        match self {
            Self::Key(key) => Some(key),
            Self::Index(_) => None,
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => f.write_str(key),
            Self::Index(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        Self::Key(key.to_owned())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        Self::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

/// Build a path of map keys.
#[must_use]
pub fn key_path(keys: &[&str]) -> Vec<PathSegment> {
    keys.iter().map(|k| PathSegment::from(*k)).collect()
}

/// Render a path as dotted text, e.g. `cell_results.a.running`.
#[must_use]
pub fn display_path(path: &[PathSegment]) -> String {
    path.iter().map(ToString::to_string).collect::<Vec<_>>().join(".")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
}

impl PatchOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Replace => "replace",
            Self::Remove => "remove",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "add" => Some(Self::Add),
            "replace" => Some(Self::Replace),
            "remove" => Some(Self::Remove),
            _ => None,
        }
    }
}

/// A single structural edit.
#[derive(Clone, Debug, PartialEq)]
pub struct Patch {
    pub op: PatchOp,
    pub path: Vec<PathSegment>,
    /// Required for add and replace.
    pub value: Option<Value>,
}

/// Error applying or parsing a patch.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum PatchError {
    #[error("path `{}` does not exist", display_path(.path))]
    MissingPath { path: Vec<PathSegment> },
    #[error("path `{}` addresses into a {found}", display_path(.path))]
    NotContainer { path: Vec<PathSegment>, found: &'static str },
    #[error("index out of range at `{}`", display_path(.path))]
    IndexOutOfRange { path: Vec<PathSegment> },
    #[error("{op} patch at `{}` carries no value", display_path(.path), op = .op.as_str())]
    MissingValue { op: PatchOp, path: Vec<PathSegment> },
    #[error("malformed patch: {0}")]
    Malformed(String),
}

impl PatchError {
    /// Path of the failing patch, empty for malformed input.
    #[must_use]
    pub fn path(&self) -> &[PathSegment] {
        match self {
            Self::MissingPath { path }
            | Self::NotContainer { path, .. }
            | Self::IndexOutOfRange { path }
            | Self::MissingValue { path, .. } => path,
            Self::Malformed(_) => &[],
        }
    }
}

impl Patch {
    #[must_use]
    pub fn add(path: Vec<PathSegment>, value: Value) -> Self {
        Self { op: PatchOp::Add, path, value: Some(value) }
    }

    #[must_use]
    pub fn replace(path: Vec<PathSegment>, value: Value) -> Self {
        Self { op: PatchOp::Replace, path, value: Some(value) }
    }

    #[must_use]
    pub fn remove(path: Vec<PathSegment>) -> Self {
        Self { op: PatchOp::Remove, path, value: None }
    }

    /// First path key, i.e. the top-level subtree this patch touches.
    #[must_use]
    pub fn root_key(&self) -> Option<&str> {
        self.path.first().and_then(PathSegment::as_key)
    }

    /// Whether the path addresses an array element anywhere.
    #[must_use]
    pub fn has_index(&self) -> bool {
        self.path.iter().any(|s| matches!(s, PathSegment::Index(_)))
    }

    /// Wire representation: `{op, path, value?}`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("op".to_owned(), Value::from(self.op.as_str()));
        let path = self
            .path
            .iter()
            .map(|segment| match segment {
                PathSegment::Key(key) => Value::from(key.as_str()),
                PathSegment::Index(i) => Value::Int(i64::try_from(*i).unwrap_or(i64::MAX)),
            })
            .collect();
        map.insert("path".to_owned(), Value::Array(path));
        if let Some(value) = &self.value {
            map.insert("value".to_owned(), value.clone());
        }
        Value::Map(map)
    }

    /// Parse the wire representation.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Malformed`] for unknown ops, non-array paths,
    /// path segments that are neither strings nor non-negative integers, and
    /// add/replace patches without a value.
    pub fn from_value(value: &Value) -> Result<Self, PatchError> {
        let op = value
            .get("op")
            .and_then(Value::as_str)
            .and_then(PatchOp::parse)
            .ok_or_else(|| PatchError::Malformed("missing or unknown `op`".to_owned()))?;
        let raw_path = value
            .get("path")
            .and_then(Value::as_array)
            .ok_or_else(|| PatchError::Malformed("`path` must be an array".to_owned()))?;
        let path = raw_path.iter().map(parse_segment).collect::<Result<Vec<_>, _>>()?;
        let patch_value = value.get("value").cloned();
        if op != PatchOp::Remove && patch_value.is_none() {
            return Err(PatchError::Malformed(format!("{} patch without `value`", op.as_str())));
        }
        Ok(Self { op, path, value: patch_value })
    }
}

fn parse_segment(raw: &Value) -> Result<PathSegment, PatchError> {
    match raw {
        Value::String(key) => Ok(PathSegment::Key(key.clone())),
        Value::Int(i) => usize::try_from(*i)
            .map(PathSegment::Index)
            .map_err(|_| PatchError::Malformed(format!("negative path index {i}"))),
        Value::UInt(i) => usize::try_from(*i)
            .map(PathSegment::Index)
            .map_err(|_| PatchError::Malformed(format!("path index {i} too large"))),
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Value::Float(f) if f.fract() == 0.0 && *f >= 0.0 => Ok(PathSegment::Index(*f as usize)),
        other => Err(PatchError::Malformed(format!("path segment of type {}", other.kind_name()))),
    }
}

/// Encode a patch list for the wire.
#[must_use]
pub fn patches_to_value(patches: &[Patch]) -> Value {
    Value::Array(patches.iter().map(Patch::to_value).collect())
}

/// Decode a wire patch list.
///
/// # Errors
///
/// Returns [`PatchError::Malformed`] if the value is not an array or any
/// element fails [`Patch::from_value`].
pub fn patches_from_value(value: &Value) -> Result<Vec<Patch>, PatchError> {
    value
        .as_array()
        .ok_or_else(|| PatchError::Malformed("patch list must be an array".to_owned()))?
        .iter()
        .map(Patch::from_value)
        .collect()
}

/// Apply a batch to a copy of `base`.
///
/// # Errors
///
/// Returns the first failing patch's error; `base` is never modified.
pub fn apply_patches(base: &Value, patches: &[Patch]) -> Result<Value, PatchError> {
    let mut next = base.clone();
    for patch in patches {
        apply_one(&mut next, patch, None)?;
    }
    Ok(next)
}

/// Apply a batch to a copy of `base`, also returning the inverse batch.
///
/// Applying the inverse to the result yields `base` again.
///
/// # Errors
///
/// As [`apply_patches`].
pub fn apply_patches_with_inverse(base: &Value, patches: &[Patch]) -> Result<(Value, Vec<Patch>), PatchError> {
    let mut next = base.clone();
    let mut inverse = Vec::with_capacity(patches.len());
    for patch in patches {
        apply_one(&mut next, patch, Some(&mut inverse))?;
    }
    inverse.reverse();
    Ok((next, inverse))
}

/// Apply a batch directly to `target`. Not atomic: on error, earlier
/// patches of the batch remain applied.
///
/// # Errors
///
/// As [`apply_patches`].
pub fn apply_in_place(target: &mut Value, patches: &[Patch]) -> Result<(), PatchError> {
    for patch in patches {
        apply_one(target, patch, None)?;
    }
    Ok(())
}

fn apply_one(root: &mut Value, patch: &Patch, inverse: Option<&mut Vec<Patch>>) -> Result<(), PatchError> {
    let value = || {
        patch.value.clone().ok_or_else(|| PatchError::MissingValue {
            op: patch.op,
            path: patch.path.clone(),
        })
    };

    let Some((last, parent_path)) = patch.path.split_last() else {
        let old = match patch.op {
            PatchOp::Add | PatchOp::Replace => std::mem::replace(root, value()?),
            PatchOp::Remove => std::mem::take(root),
        };
        if let Some(inverse) = inverse {
            inverse.push(Patch::replace(Vec::new(), old));
        }
        return Ok(());
    };

    let parent = navigate_mut(root, parent_path)?;
    let undo = match (parent, last) {
        (Value::Map(map), PathSegment::Key(key)) => match patch.op {
            PatchOp::Add => match map.insert(key.clone(), value()?) {
                Some(old) => Patch::replace(patch.path.clone(), old),
                None => Patch::remove(patch.path.clone()),
            },
            PatchOp::Replace => {
                let slot = map.get_mut(key).ok_or_else(|| PatchError::MissingPath { path: patch.path.clone() })?;
                Patch::replace(patch.path.clone(), std::mem::replace(slot, value()?))
            }
            PatchOp::Remove => {
                let old = map.remove(key).ok_or_else(|| PatchError::MissingPath { path: patch.path.clone() })?;
                Patch::add(patch.path.clone(), old)
            }
        },
        (Value::Array(items), PathSegment::Index(index)) => {
            let index = *index;
            let out_of_range = || PatchError::IndexOutOfRange { path: patch.path.clone() };
            match patch.op {
                PatchOp::Add => {
                    if index > items.len() {
                        return Err(out_of_range());
                    }
                    items.insert(index, value()?);
                    Patch::remove(patch.path.clone())
                }
                PatchOp::Replace => {
                    let slot = items.get_mut(index).ok_or_else(out_of_range)?;
                    Patch::replace(patch.path.clone(), std::mem::replace(slot, value()?))
                }
                PatchOp::Remove => {
                    if index >= items.len() {
                        return Err(out_of_range());
                    }
                    Patch::add(patch.path.clone(), items.remove(index))
                }
            }
        }
        (other, _) => {
            return Err(PatchError::NotContainer {
                path: parent_path.to_vec(),
                found: other.kind_name(),
            });
        }
    };

    if let Some(inverse) = inverse {
        inverse.push(undo);
    }
    Ok(())
}

fn navigate_mut<'a>(root: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Value, PatchError> {
    let mut node = root;
    for (depth, segment) in path.iter().enumerate() {
        let next = match (node, segment) {
            (Value::Map(map), PathSegment::Key(key)) => map.get_mut(key),
            (Value::Array(items), PathSegment::Index(i)) => items.get_mut(*i),
            _ => None,
        };
        node = next.ok_or_else(|| PatchError::MissingPath {
            path: path[..=depth].to_vec(),
        })?;
    }
    Ok(node)
}

/// Forward and inverse patches between two trees.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Diff {
    /// Turns `old` into `new`.
    pub patches: Vec<Patch>,
    /// Turns `new` back into `old`.
    pub inverse: Vec<Patch>,
}

impl Diff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

/// Compute the patches turning `old` into `new`, with their inverse.
#[must_use]
pub fn diff(old: &Value, new: &Value) -> Diff {
    let mut out = Diff::default();
    let mut path = Vec::new();
    diff_into(old, new, &mut path, &mut out);
    out.inverse.reverse();
    out
}

fn diff_into(old: &Value, new: &Value, path: &mut Vec<PathSegment>, out: &mut Diff) {
    let (Value::Map(old_map), Value::Map(new_map)) = (old, new) else {
        if old != new {
            out.patches.push(Patch::replace(path.clone(), new.clone()));
            out.inverse.push(Patch::replace(path.clone(), old.clone()));
        }
        return;
    };

    for (key, old_value) in old_map {
        path.push(PathSegment::Key(key.clone()));
        match new_map.get(key) {
            Some(new_value) => diff_into(old_value, new_value, path, out),
            None => {
                out.patches.push(Patch::remove(path.clone()));
                out.inverse.push(Patch::add(path.clone(), old_value.clone()));
            }
        }
        path.pop();
    }
    for (key, new_value) in new_map {
        if !old_map.contains_key(key) {
            path.push(PathSegment::Key(key.clone()));
            out.patches.push(Patch::add(path.clone(), new_value.clone()));
            out.inverse.push(Patch::remove(path.clone()));
            path.pop();
        }
    }
}

#[cfg(test)]
#[path = "patch_test.rs"]
mod tests;
