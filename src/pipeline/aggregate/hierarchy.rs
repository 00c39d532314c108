use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::FilterSpec;
use crate::domain::{ObservationTable, PathologyLevel, PathologyNode};

/// One node of the pathology treemap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreemapNode {
    pub code: String,
    pub label: String,
    pub level: PathologyLevel,
    pub value: u64,
    pub low_confidence: bool,
    pub children: Vec<TreemapNode>,
}

impl TreemapNode {
    /// Internal nodes equal the sum of their children, all the way down
    pub fn is_additive(&self) -> bool {
        self.children.is_empty()
            || (self.value == self.children.iter().map(|c| c.value).sum::<u64>()
                && self.children.iter().all(TreemapNode::is_additive))
    }

    fn depth(&self) -> usize {
        1 + self.children.iter().map(TreemapNode::depth).max().unwrap_or(0)
    }
}

/// Flat column projection consumed by treemap renderers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreemapColumns {
    pub ids: Vec<String>,
    /// Empty string for top-level categories
    pub parents: Vec<String>,
    pub labels: Vec<String>,
    pub values: Vec<u64>,
}

/// Forest of top-level categories with their nested counts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathologyTree {
    pub roots: Vec<TreemapNode>,
}

impl PathologyTree {
    pub fn total(&self) -> u64 {
        self.roots.iter().map(|r| r.value).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn is_additive(&self) -> bool {
        self.roots.iter().all(TreemapNode::is_additive)
    }

    /// Number of levels actually present
    pub fn depth(&self) -> usize {
        self.roots.iter().map(TreemapNode::depth).max().unwrap_or(0)
    }

    pub fn find(&self, code: &str) -> Option<&TreemapNode> {
        let mut stack: Vec<&TreemapNode> = self.roots.iter().collect();
        while let Some(node) = stack.pop() {
            if node.code == code {
                return Some(node);
            }
            stack.extend(node.children.iter());
        }
        None
    }

    /// Pre-order projection into parallel columns
    pub fn to_columns(&self) -> TreemapColumns {
        fn walk(node: &TreemapNode, parent: &str, out: &mut TreemapColumns) {
            out.ids.push(node.code.clone());
            out.parents.push(parent.to_string());
            out.labels.push(node.label.clone());
            out.values.push(node.value);
            for child in &node.children {
                walk(child, &node.code, out);
            }
        }

        let mut out = TreemapColumns::default();
        for root in &self.roots {
            walk(root, "", &mut out);
        }
        out
    }
}

struct TreeBuilder<'a> {
    children: BTreeMap<&'a str, Vec<&'a PathologyNode>>,
    own: HashMap<&'a str, (u64, bool)>,
    max_depth: usize,
}

impl<'a> TreeBuilder<'a> {
    /// Returns `None` for nodes whose value is zero
    fn build(&self, node: &'a PathologyNode) -> Option<TreemapNode> {
        let (value, low_confidence, children) = match self.children.get(node.code.as_str()) {
            Some(kids) if !kids.is_empty() => {
                let built: Vec<TreemapNode> = kids.iter().filter_map(|k| self.build(*k)).collect();
                let value = built.iter().map(|c| c.value).sum::<u64>();
                let low = built.iter().any(|c| c.low_confidence);
                (value, low, built)
            }
            _ => {
                let (value, low) = self.own.get(node.code.as_str()).copied().unwrap_or((0, false));
                (value, low, Vec::new())
            }
        };
        if value == 0 {
            return None;
        }
        let children = if node.level.depth() >= self.max_depth {
            Vec::new()
        } else {
            children
        };
        Some(TreemapNode {
            code: node.code.clone(),
            label: node.label.clone(),
            level: node.level,
            value,
            low_confidence,
            children,
        })
    }
}

/// Patient counts over the taxonomy.
///
/// Nodes without taxonomy children take their own rows' counts; every other
/// node is the sum of its children, so totals are never double-counted across
/// levels. `filter.pathology_level` bounds the depth of the returned tree.
pub fn hierarchy_aggregate(table: &ObservationTable, filter: &FilterSpec) -> PathologyTree {
    let mut own: HashMap<&str, (u64, bool)> = HashMap::new();
    for row in table
        .rows
        .iter()
        .filter(|r| filter.matches_ignoring_level(r, &table.taxonomy))
    {
        let entry = own.entry(row.pathology_code.as_str()).or_insert((0, false));
        entry.0 += row.patient_count;
        entry.1 |= row.low_confidence;
    }
    if own.is_empty() {
        return PathologyTree::default();
    }

    let builder = TreeBuilder {
        children: table.taxonomy.children_index(),
        own,
        max_depth: filter
            .pathology_level
            .map(|l| l.depth())
            .unwrap_or(PathologyLevel::Leaf.depth()),
    };
    let roots = table
        .taxonomy
        .roots()
        .into_iter()
        .filter_map(|root| builder.build(root))
        .collect();
    PathologyTree { roots }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgeBand, Coded, Observation, PathologyTaxonomy, Sex};

    fn row(code: &str, path: &[&str], count: u64, year: i32) -> Observation {
        Observation {
            region_code: "11".to_string(),
            department_code: "75".to_string(),
            sex: Coded::Canonical(Sex::Both),
            age_band: Coded::Canonical(AgeBand::Band(60)),
            year,
            pathology_code: code.to_string(),
            pathology_level: PathologyLevel::from_depth(path.len()),
            pathology_path: path.iter().map(|s| s.to_string()).collect(),
            patient_count: count,
            population: Some(100_000),
            geo_resolved: true,
            prevalence_rate: None,
            low_confidence: count < 11,
        }
    }

    fn table(rows: Vec<Observation>) -> ObservationTable {
        let taxonomy = PathologyTaxonomy::from_paths(
            rows.iter()
                .map(|r| (r.pathology_code.as_str(), r.pathology_path.as_slice())),
        )
        .unwrap();
        ObservationTable {
            rows,
            taxonomy,
            ..ObservationTable::default()
        }
    }

    fn sample() -> ObservationTable {
        table(vec![
            row("CAN", &["Cancers"], 999, 2022),
            row("CAN_SEIN", &["Cancers", "Cancer du sein"], 70, 2022),
            row("CAN_SEIN_ACT", &["Cancers", "Cancer du sein", "Actif"], 30, 2022),
            row("CAN_SEIN_SURV", &["Cancers", "Cancer du sein", "Sous surveillance"], 40, 2022),
            row("CAN_COLON", &["Cancers", "Cancer du côlon"], 20, 2022),
            row("DIAB", &["Diabète"], 500, 2022),
            row("DIAB", &["Diabète"], 5, 2021),
        ])
    }

    #[test]
    fn test_internal_nodes_sum_their_children() {
        let tree = hierarchy_aggregate(&sample(), &FilterSpec::all());
        assert!(tree.is_additive());
        let cancers = tree.find("CAN").unwrap();
        assert_eq!(cancers.value, 90);
        assert_eq!(tree.find("CAN_SEIN").unwrap().value, 70);
        assert_eq!(tree.find("DIAB").unwrap().value, 505);
        assert_eq!(tree.total(), 595);
        assert!(tree.find("DIAB").unwrap().low_confidence);
        assert_eq!(tree.depth(), 3);
    }

    #[test]
    fn test_level_bounds_depth_without_changing_totals() {
        let full = hierarchy_aggregate(&sample(), &FilterSpec::all());
        let top = hierarchy_aggregate(&sample(), &FilterSpec::all().with_level(PathologyLevel::Top));
        assert_eq!(top.depth(), 1);
        assert_eq!(top.total(), full.total());
    }

    #[test]
    fn test_zero_nodes_are_pruned() {
        let tree = hierarchy_aggregate(&sample(), &FilterSpec::all().with_pathologies(["DIAB"]));
        assert_eq!(tree.roots.len(), 1);
        assert_eq!(tree.roots[0].code, "DIAB");
    }

    #[test]
    fn test_columns_follow_preorder() {
        let tree = hierarchy_aggregate(&sample(), &FilterSpec::all().with_years([2022]));
        let columns = tree.to_columns();
        assert_eq!(columns.ids[0], "CAN");
        assert_eq!(columns.parents[0], "");
        let idx = columns.ids.iter().position(|c| c == "CAN_SEIN_ACT").unwrap();
        assert_eq!(columns.parents[idx], "CAN_SEIN");
        assert_eq!(columns.ids.len(), columns.values.len());
    }

    #[test]
    fn test_empty_selection_gives_empty_tree() {
        let tree = hierarchy_aggregate(&sample(), &FilterSpec::all().with_years([1990]));
        assert!(tree.is_empty());
        assert_eq!(tree.total(), 0);
    }
}
