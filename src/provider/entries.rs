//! Change application over an attribute store.
//!
//! Shared by the reference providers so that idempotence and conflict
//! detection behave identically whatever the storage.

use std::collections::BTreeMap;

use crate::error::ProviderError;
use crate::planner::{Change, ChangeKind};
use crate::resource::Attributes;

use super::ProviderResult;

/// Identity to attributes for one kind on one target.
pub type Entries = BTreeMap<String, Attributes>;

/// Applies `change` to `entries`.
///
/// The store is only mutated once every attribute has been checked, so a
/// conflicting change leaves it untouched.
pub fn apply_change(entries: &mut Entries, change: &Change) -> ProviderResult<()> {
    let identity = &change.key.identity;

    match change.kind {
        ChangeKind::NoOp => Ok(()),

        ChangeKind::Delete => {
            entries.remove(identity);
            Ok(())
        }

        ChangeKind::Create => {
            if let Some(current) = entries.get_mut(identity) {
                // Created concurrently or by a previous attempt: fine as long
                // as nothing disagrees with what we wanted.
                check_targets(current, change)?;
                write_targets(current, change);
            } else {
                let mut attributes = Attributes::new();
                write_targets(&mut attributes, change);
                entries.insert(identity.clone(), attributes);
            }
            Ok(())
        }

        ChangeKind::Update => {
            let Some(current) = entries.get_mut(identity) else {
                return Err(conflict(change, change.attribute_diffs.first().map(|d| d.attribute.as_str())));
            };
            check_targets(current, change)?;
            write_targets(current, change);
            Ok(())
        }
    }
}

/// Every diffed attribute must currently hold either its `from` or its `to`.
fn check_targets(current: &Attributes, change: &Change) -> ProviderResult<()> {
    for diff in &change.attribute_diffs {
        let live = current.get(&diff.attribute);
        let matches_from = live == diff.from.as_ref();
        let matches_to = live == diff.to.as_ref();
        // For a create, `from` is None: an attribute that exists with another
        // value was written by someone else.
        if !matches_from && !matches_to {
            return Err(conflict(change, Some(&diff.attribute)));
        }
    }
    Ok(())
}

fn write_targets(current: &mut Attributes, change: &Change) {
    for diff in &change.attribute_diffs {
        match &diff.to {
            Some(value) => {
                current.insert(diff.attribute.clone(), value.clone());
            }
            None => {
                current.remove(&diff.attribute);
            }
        }
    }
}

fn conflict(change: &Change, attribute: Option<&str>) -> ProviderError {
    ProviderError::Conflict {
        key: change.key.clone(),
        attribute: attribute.unwrap_or("<existence>").to_string(),
    }
}

/// Returns a copy of `entries[identity]`, if any.
pub fn lookup(entries: &Entries, identity: &str) -> Option<Attributes> {
    entries.get(identity).cloned()
}
