use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::PathologyLevel;
use crate::error::{PipelineError, Result};

/// Prefix of codes given to ancestors that never appear as rows of their own
pub const SYNTHETIC_CODE_PREFIX: &str = "path:";

/// One node of the pathology taxonomy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathologyNode {
    pub code: String,
    pub label: String,
    pub parent_code: Option<String>,
    pub level: PathologyLevel,
    /// Code derived from the label path rather than read from the source
    pub synthesized: bool,
}

/// Tree of pathology codes; every node's ancestor chain ends at one top-level node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathologyTaxonomy {
    nodes: BTreeMap<String, PathologyNode>,
}

fn synthetic_code(path: &[String]) -> String {
    format!("{}{}", SYNTHETIC_CODE_PREFIX, path.join("/"))
}

impl PathologyTaxonomy {
    /// Build the tree from `(code, label path)` pairs.
    ///
    /// A code must always carry the same path and a path the same code;
    /// ancestors missing from the input get a synthesized code.
    pub fn from_paths<'a, I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let mut code_to_path: BTreeMap<&str, &[String]> = BTreeMap::new();
        let mut path_to_code: BTreeMap<Vec<String>, (String, bool)> = BTreeMap::new();

        for (code, path) in entries {
            if path.is_empty() {
                return Err(PipelineError::InvalidTaxonomy {
                    code: code.to_string(),
                    reason: "has an empty label path".to_string(),
                });
            }
            match code_to_path.get(code) {
                Some(existing) if *existing != path => {
                    return Err(PipelineError::TaxonomyConflict {
                        code: code.to_string(),
                        existing: existing.join(" > "),
                        incoming: path.join(" > "),
                    });
                }
                Some(_) => continue,
                None => {
                    code_to_path.insert(code, path);
                }
            }
            if let Some((existing, _)) = path_to_code.get(path) {
                return Err(PipelineError::TaxonomyConflict {
                    code: path.join(" > "),
                    existing: existing.clone(),
                    incoming: code.to_string(),
                });
            }
            path_to_code.insert(path.to_vec(), (code.to_string(), false));
        }

        let explicit: Vec<Vec<String>> = path_to_code.keys().cloned().collect();
        for path in explicit {
            for depth in 1..path.len() {
                let prefix = &path[..depth];
                if !path_to_code.contains_key(prefix) {
                    path_to_code.insert(prefix.to_vec(), (synthetic_code(prefix), true));
                }
            }
        }

        let mut nodes = BTreeMap::new();
        for (path, (code, synthesized)) in &path_to_code {
            let parent_code = if path.len() > 1 {
                path_to_code.get(&path[..path.len() - 1]).map(|(c, _)| c.clone())
            } else {
                None
            };
            let label = path.last().cloned().unwrap_or_default();
            nodes.insert(
                code.clone(),
                PathologyNode {
                    code: code.clone(),
                    label,
                    parent_code,
                    level: PathologyLevel::from_depth(path.len()),
                    synthesized: *synthesized,
                },
            );
        }

        let taxonomy = Self { nodes };
        taxonomy.validate()?;
        Ok(taxonomy)
    }

    /// Check the tree invariants: parents exist, levels deepen by one, no cycles
    pub fn validate(&self) -> Result<()> {
        for node in self.nodes.values() {
            let mut current = node;
            let mut steps = 0;
            while let Some(parent_code) = &current.parent_code {
                let parent = self.nodes.get(parent_code).ok_or_else(|| PipelineError::InvalidTaxonomy {
                    code: node.code.clone(),
                    reason: format!("references missing parent `{}`", parent_code),
                })?;
                if parent.level.depth() + 1 != current.level.depth() {
                    return Err(PipelineError::InvalidTaxonomy {
                        code: current.code.clone(),
                        reason: format!("sits at level {} under a {} parent", current.level, parent.level),
                    });
                }
                steps += 1;
                if steps > PathologyLevel::Leaf.depth() {
                    return Err(PipelineError::InvalidTaxonomy {
                        code: node.code.clone(),
                        reason: "has a cyclic ancestor chain".to_string(),
                    });
                }
                current = parent;
            }
            if current.level != PathologyLevel::Top {
                return Err(PipelineError::InvalidTaxonomy {
                    code: node.code.clone(),
                    reason: "does not terminate at a top-level category".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn get(&self, code: &str) -> Option<&PathologyNode> {
        self.nodes.get(code)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &PathologyNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Top-level categories ordered by label
    pub fn roots(&self) -> Vec<&PathologyNode> {
        let mut roots: Vec<&PathologyNode> = self
            .nodes
            .values()
            .filter(|n| n.parent_code.is_none())
            .collect();
        roots.sort_by(|a, b| a.label.cmp(&b.label).then_with(|| a.code.cmp(&b.code)));
        roots
    }

    /// Children of every node, each list ordered by label
    pub fn children_index(&self) -> BTreeMap<&str, Vec<&PathologyNode>> {
        let mut index: BTreeMap<&str, Vec<&PathologyNode>> = BTreeMap::new();
        for node in self.nodes.values() {
            if let Some(parent) = &node.parent_code {
                index.entry(parent.as_str()).or_default().push(node);
            }
        }
        for children in index.values_mut() {
            children.sort_by(|a, b| a.label.cmp(&b.label).then_with(|| a.code.cmp(&b.code)));
        }
        index
    }

    /// The code itself followed by its ancestors up to the top level
    pub fn lineage(&self, code: &str) -> Vec<&str> {
        let mut chain = Vec::new();
        let mut current = self.nodes.get(code);
        while let Some(node) = current {
            chain.push(node.code.as_str());
            if chain.len() > PathologyLevel::Leaf.depth() {
                break;
            }
            current = node.parent_code.as_deref().and_then(|p| self.nodes.get(p));
        }
        chain
    }

    /// Code of the top-level category a pathology belongs to
    pub fn top_level_of(&self, code: &str) -> Option<&str> {
        self.lineage(code)
            .last()
            .copied()
            .filter(|c| self.nodes.get(*c).map(|n| n.level) == Some(PathologyLevel::Top))
    }

    pub fn label_of<'a>(&'a self, code: &'a str) -> &'a str {
        self.nodes.get(code).map(|n| n.label.as_str()).unwrap_or(code)
    }
}
