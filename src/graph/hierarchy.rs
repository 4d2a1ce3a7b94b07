//! Capability hierarchy: level computation and multi-level incidence.
//!
//! Levels follow the containment rule: a capability containing only tools
//! sits at level 0; otherwise its level is one more than its deepest
//! capability member. Computation is a memoized DFS with a *visiting* set
//! for cycle detection, iterating members in id-sorted order so results
//! are deterministic.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::GraphError;
use crate::math::Matrix;

use super::GraphResult;
use super::store::GraphStore;

/// Level assignment for every capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyLevels {
    /// Capability id → level.
    pub levels: BTreeMap<String, usize>,
    /// Highest assigned level (`L_max`).
    pub max_level: usize,
}

/// Compute hierarchy levels for the given membership view.
///
/// `membership` maps capability ids to their member ids; member ids that are
/// not keys of the map are treated as tools. Fails with
/// [`GraphError::HierarchyCycle`] carrying the cycle path if an in-progress
/// capability is revisited.
pub fn compute_hierarchy_levels(
    membership: &HashMap<String, Vec<String>>,
) -> GraphResult<HierarchyLevels> {
    let mut memo: BTreeMap<String, usize> = BTreeMap::new();
    let mut visiting: HashSet<String> = HashSet::new();
    let mut stack: Vec<String> = Vec::new();

    let mut ids: Vec<&String> = membership.keys().collect();
    ids.sort();

    for id in ids {
        visit(id, membership, &mut memo, &mut visiting, &mut stack)?;
    }

    let max_level = memo.values().copied().max().unwrap_or(0);
    Ok(HierarchyLevels {
        levels: memo,
        max_level,
    })
}

fn visit(
    id: &str,
    membership: &HashMap<String, Vec<String>>,
    memo: &mut BTreeMap<String, usize>,
    visiting: &mut HashSet<String>,
    stack: &mut Vec<String>,
) -> GraphResult<usize> {
    if let Some(level) = memo.get(id) {
        return Ok(*level);
    }
    if visiting.contains(id) {
        // The cycle is the stack suffix starting at the revisited node.
        let start = stack.iter().position(|s| s == id).unwrap_or(0);
        return Err(GraphError::HierarchyCycle {
            node: id.to_string(),
            path: stack[start..].to_vec(),
        });
    }

    let Some(members) = membership.get(id) else {
        // Not a capability: tools sit below level 0 and contribute nothing.
        return Ok(0);
    };

    visiting.insert(id.to_string());
    stack.push(id.to_string());

    let mut sorted_members: Vec<&String> = members.iter().collect();
    sorted_members.sort();

    let mut level = 0usize;
    for member in sorted_members {
        if membership.contains_key(member.as_str()) {
            let child = visit(member, membership, memo, visiting, stack)?;
            level = level.max(child + 1);
        }
    }

    stack.pop();
    visiting.remove(id);
    memo.insert(id.to_string(), level);
    Ok(level)
}

/// Dry-run cycle check for a capability registration.
///
/// Overlays `(candidate, members)` onto the existing membership view and
/// recomputes; nothing is mutated on failure.
pub fn check_acyclic_with(
    membership: &HashMap<String, Vec<String>>,
    candidate: &str,
    members: &[String],
) -> GraphResult<()> {
    let mut overlay = membership.clone();
    overlay.insert(candidate.to_string(), members.to_vec());
    compute_hierarchy_levels(&overlay).map(|_| ())
}

// ---------------------------------------------------------------------------
// Multi-level incidence
// ---------------------------------------------------------------------------

/// Incidence between capability members and their owners at one level.
#[derive(Debug, Clone)]
pub struct LevelIncidence {
    /// Owners are the capabilities at this level (≥ 1).
    pub owner_level: usize,
    /// Row entries: `(member id, member level)` — capability members of the
    /// owners, whatever their intrinsic level.
    pub members: Vec<(String, usize)>,
    /// Column entries: owner capability ids, sorted.
    pub owners: Vec<String>,
    /// `|members| × |owners|` indicator matrix.
    pub matrix: Matrix,
    /// Member id → row.
    pub member_index: HashMap<String, usize>,
    /// Owner id → column.
    pub owner_index: HashMap<String, usize>,
}

/// Incidence structure for the whole hierarchy.
#[derive(Debug, Clone)]
pub struct MultiLevelIncidence {
    /// All tool ids, sorted; row space of the tool incidences.
    pub tool_ids: Vec<String>,
    /// Tool id → row.
    pub tool_index: HashMap<String, usize>,
    /// Capability ids grouped by level, each group sorted.
    pub caps_by_level: Vec<Vec<String>>,
    /// Per level: capability id → column in that level's matrices.
    pub cap_index_by_level: Vec<HashMap<String, usize>>,
    /// Per level: `|tools| × |caps at level|` direct tool-membership indicator.
    pub tool_to_cap: Vec<Matrix>,
    /// Per owner level `ℓ+1` (index `ℓ`): capability-member incidence.
    pub cap_to_cap: Vec<LevelIncidence>,
    /// Highest capability level.
    pub max_level: usize,
}

/// Build the incidence structure from the current graph state.
///
/// Recomputes levels first, so the result is consistent even after raw
/// membership edits. Deterministic: every id list is sorted.
pub fn build_multi_level_incidence(store: &GraphStore) -> GraphResult<MultiLevelIncidence> {
    let membership = store.membership_view();
    let levels = compute_hierarchy_levels(&membership)?;
    let max_level = levels.max_level;

    let tool_ids = store.tool_ids();
    let tool_index: HashMap<String, usize> = tool_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.clone(), i))
        .collect();

    let mut caps_by_level: Vec<Vec<String>> = vec![Vec::new(); max_level + 1];
    for (id, level) in &levels.levels {
        caps_by_level[*level].push(id.clone());
    }
    for group in &mut caps_by_level {
        group.sort();
    }
    let cap_index_by_level: Vec<HashMap<String, usize>> = caps_by_level
        .iter()
        .map(|group| {
            group
                .iter()
                .enumerate()
                .map(|(i, id)| (id.clone(), i))
                .collect()
        })
        .collect();

    // Direct tool membership, one indicator per level.
    let mut tool_to_cap = Vec::with_capacity(max_level + 1);
    for group in &caps_by_level {
        let mut m = Matrix::zeros(tool_ids.len(), group.len());
        for (col, cap_id) in group.iter().enumerate() {
            if let Some(members) = membership.get(cap_id) {
                for member in members {
                    if let Some(&row) = tool_index.get(member) {
                        m.set(row, col, 1.0);
                    }
                }
            }
        }
        tool_to_cap.push(m);
    }

    // Capability membership, grouped by the owner's level.
    let mut cap_to_cap = Vec::with_capacity(max_level);
    for owner_level in 1..=max_level {
        let owners = caps_by_level[owner_level].clone();
        let mut member_set: Vec<(String, usize)> = Vec::new();
        let mut member_index: HashMap<String, usize> = HashMap::new();
        for owner in &owners {
            if let Some(members) = membership.get(owner) {
                for member in members {
                    if let Some(level) = levels.levels.get(member) {
                        if !member_index.contains_key(member) {
                            member_index.insert(member.clone(), member_set.len());
                            member_set.push((member.clone(), *level));
                        }
                    }
                }
            }
        }
        // Stable row order: sort, then rebuild the index.
        member_set.sort_by(|a, b| a.0.cmp(&b.0));
        member_index = member_set
            .iter()
            .enumerate()
            .map(|(i, (id, _))| (id.clone(), i))
            .collect();

        let owner_index: HashMap<String, usize> = owners
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        let mut matrix = Matrix::zeros(member_set.len(), owners.len());
        for (col, owner) in owners.iter().enumerate() {
            if let Some(members) = membership.get(owner) {
                for member in members {
                    if let Some(&row) = member_index.get(member) {
                        matrix.set(row, col, 1.0);
                    }
                }
            }
        }

        cap_to_cap.push(LevelIncidence {
            owner_level,
            members: member_set,
            owners,
            matrix,
            member_index,
            owner_index,
        });
    }

    Ok(MultiLevelIncidence {
        tool_ids,
        tool_index,
        caps_by_level,
        cap_index_by_level,
        tool_to_cap,
        cap_to_cap,
        max_level,
    })
}

impl GraphStore {
    /// Build the multi-level incidence for the current graph state.
    pub fn build_multi_level_incidence(&self) -> GraphResult<MultiLevelIncidence> {
        build_multi_level_incidence(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::CapabilityOptions;

    fn membership(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(id, members)| {
                (
                    id.to_string(),
                    members.iter().map(|m| m.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn levels_for_nested_capabilities() {
        // A = {t1, t2}, B = {t1, A}, C = {B}
        let m = membership(&[
            ("A", &["t1", "t2"]),
            ("B", &["t1", "A"]),
            ("C", &["B"]),
        ]);
        let levels = compute_hierarchy_levels(&m).unwrap();
        assert_eq!(levels.levels["A"], 0);
        assert_eq!(levels.levels["B"], 1);
        assert_eq!(levels.levels["C"], 2);
        assert_eq!(levels.max_level, 2);
    }

    #[test]
    fn cycle_is_reported_with_path() {
        let m = membership(&[("X", &["Y"]), ("Y", &["X"])]);
        let err = compute_hierarchy_levels(&m).unwrap_err();
        match err {
            GraphError::HierarchyCycle { path, .. } => {
                assert_eq!(path.len(), 2);
                assert!(path.contains(&"X".to_string()));
                assert!(path.contains(&"Y".to_string()));
            }
            other => panic!("expected HierarchyCycle, got {other:?}"),
        }
    }

    #[test]
    fn self_containment_is_a_cycle() {
        let m = membership(&[("X", &["X"])]);
        assert!(matches!(
            compute_hierarchy_levels(&m),
            Err(GraphError::HierarchyCycle { .. })
        ));
    }

    #[test]
    fn recompute_is_idempotent() {
        let m = membership(&[("A", &["t"]), ("B", &["A"])]);
        let first = compute_hierarchy_levels(&m).unwrap();
        let second = compute_hierarchy_levels(&m).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn store_registration_rejects_cycles() {
        let store = GraphStore::new();
        store.register_tool("t", None).unwrap();
        store
            .register_capability(
                "A",
                CapabilityOptions {
                    members: vec!["t".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .register_capability(
                "B",
                CapabilityOptions {
                    members: vec!["A".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        // Re-registering A with B as a member would close A → B → A.
        let err = store.register_capability(
            "A",
            CapabilityOptions {
                members: vec!["t".into(), "B".into()],
                ..Default::default()
            },
        );
        assert!(matches!(err, Err(GraphError::HierarchyCycle { .. })));
        // The failed registration left levels intact.
        assert_eq!(store.capability("A").unwrap().level, 0);
        assert_eq!(store.capability("B").unwrap().level, 1);
    }

    #[test]
    fn parents_are_rebuilt_on_recompute() {
        let store = GraphStore::new();
        store.register_tool("t", None).unwrap();
        store
            .register_capability(
                "A",
                CapabilityOptions {
                    members: vec!["t".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .register_capability(
                "B",
                CapabilityOptions {
                    members: vec!["A".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(store.capability("A").unwrap().parents, vec!["B".to_string()]);
        assert!(store.capability("B").unwrap().parents.is_empty());
    }

    #[test]
    fn incidence_shapes_match_hierarchy() {
        let store = GraphStore::new();
        for t in ["t1", "t2"] {
            store.register_tool(t, None).unwrap();
        }
        store
            .register_capability(
                "A",
                CapabilityOptions {
                    members: vec!["t1".into(), "t2".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .register_capability(
                "B",
                CapabilityOptions {
                    members: vec!["t1".into(), "A".into()],
                    ..Default::default()
                },
            )
            .unwrap();

        let inc = store.build_multi_level_incidence().unwrap();
        assert_eq!(inc.max_level, 1);
        assert_eq!(inc.tool_ids, vec!["t1".to_string(), "t2".to_string()]);
        assert_eq!(inc.caps_by_level[0], vec!["A".to_string()]);
        assert_eq!(inc.caps_by_level[1], vec!["B".to_string()]);

        // Level 0: A contains both tools.
        let a_col = inc.cap_index_by_level[0]["A"];
        assert_eq!(inc.tool_to_cap[0].get(inc.tool_index["t1"], a_col), 1.0);
        assert_eq!(inc.tool_to_cap[0].get(inc.tool_index["t2"], a_col), 1.0);

        // Level 1: B directly contains t1 but not t2.
        let b_col = inc.cap_index_by_level[1]["B"];
        assert_eq!(inc.tool_to_cap[1].get(inc.tool_index["t1"], b_col), 1.0);
        assert_eq!(inc.tool_to_cap[1].get(inc.tool_index["t2"], b_col), 0.0);

        // Cap-to-cap: A is a member of B.
        assert_eq!(inc.cap_to_cap.len(), 1);
        let li = &inc.cap_to_cap[0];
        assert_eq!(li.owner_level, 1);
        assert_eq!(li.members, vec![("A".to_string(), 0)]);
        assert_eq!(li.matrix.get(0, li.owner_index["B"]), 1.0);
    }
}
