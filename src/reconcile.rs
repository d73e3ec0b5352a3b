//! Diffing and repair of lead snapshots fetched from the backend.

use crate::types::Lead;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub field: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedLead {
    pub id: String,
    pub changes: Vec<FieldChange>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LeadChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<ModifiedLead>,
}

impl LeadChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "+{} -{} ~{}",
            self.added.len(),
            self.removed.len(),
            self.modified.len()
        )
    }
}

fn field_map(lead: &Lead) -> BTreeMap<String, serde_json::Value> {
    match serde_json::to_value(lead) {
        Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    }
}

/// Compare two snapshots by id. Output ids keep the order they have in
/// `new` (added, modified) or `old` (removed). `updatedAt` alone does not
/// count as a modification.
pub fn find_changes(old: &[Lead], new: &[Lead]) -> LeadChanges {
    let old_by_id: HashMap<&str, &Lead> = old.iter().map(|l| (l.id.as_str(), l)).collect();
    let new_by_id: HashMap<&str, &Lead> = new.iter().map(|l| (l.id.as_str(), l)).collect();

    let mut changes = LeadChanges::default();
    for lead in new {
        match old_by_id.get(lead.id.as_str()) {
            None => changes.added.push(lead.id.clone()),
            Some(prev) => {
                let diff = diff_fields(prev, lead);
                if !diff.is_empty() {
                    changes.modified.push(ModifiedLead {
                        id: lead.id.clone(),
                        changes: diff,
                    });
                }
            }
        }
    }
    changes.removed = old
        .iter()
        .filter(|l| !new_by_id.contains_key(l.id.as_str()))
        .map(|l| l.id.clone())
        .collect();
    changes
}

fn diff_fields(before: &Lead, after: &Lead) -> Vec<FieldChange> {
    let b = field_map(before);
    let a = field_map(after);
    let mut fields: Vec<&String> = b.keys().chain(a.keys()).collect();
    fields.sort();
    fields.dedup();

    fields
        .into_iter()
        .filter(|f| f.as_str() != "updatedAt")
        .filter_map(|f| {
            let bv = b.get(f).cloned().unwrap_or(serde_json::Value::Null);
            let av = a.get(f).cloned().unwrap_or(serde_json::Value::Null);
            (bv != av).then(|| FieldChange {
                field: f.clone(),
                before: bv,
                after: av,
            })
        })
        .collect()
}

/// Give every lead a unique id.
///
/// Among leads sharing an id, the most recently updated keeps it (ties go
/// to the earlier position); the rest are renamed `{id}-dup-{n}` with `n`
/// counting from 1 and skipping ids already taken. Returns
/// `(old_id, new_id)` for each rename.
pub fn resolve_duplicate_ids(leads: &mut [Lead]) -> Vec<(String, String)> {
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, lead) in leads.iter().enumerate() {
        groups.entry(lead.id.clone()).or_default().push(i);
    }

    let mut taken: std::collections::HashSet<String> =
        leads.iter().map(|l| l.id.clone()).collect();
    let mut renames = Vec::new();

    for (id, mut idx) in groups.into_iter().filter(|(_, v)| v.len() > 1) {
        // Stable sort keeps earlier positions first among equal timestamps
        idx.sort_by(|&x, &y| leads[y].updated_at.cmp(&leads[x].updated_at));
        let mut n = 1;
        for &i in idx.iter().skip(1) {
            let mut candidate = format!("{}-dup-{}", id, n);
            while taken.contains(&candidate) {
                n += 1;
                candidate = format!("{}-dup-{}", id, n);
            }
            n += 1;
            taken.insert(candidate.clone());
            leads[i].id = candidate.clone();
            renames.push((id.clone(), candidate));
        }
    }

    if !renames.is_empty() {
        tracing::warn!("[SYNC] renamed {} leads with duplicate ids", renames.len());
    }
    renames
}
