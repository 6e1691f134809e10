//! Imposition normalization.
//!
//! Declared impositions are reduced to a shadow map in which every imposer
//! constrains exactly one node: its nearest imposed ancestor. When an
//! imposer was declared against several ancestors, each farther ancestor is
//! rewritten as imposed by the nearer one, since honoring the nearest
//! already carries the constraint upward. Rewriting repeats until stable.
//!
//! Self-impositions and duplicates are dropped.

use super::{AggregateQuery, QueryLinkId, QueryNodeId};
use crate::types::MeshError;
use std::collections::BTreeMap;
use tracing::debug;

/// One normalized imposition on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Imposition {
    pub imposer: QueryNodeId,
    /// Tree links from the imposed node down to the imposer.
    pub path: Vec<QueryLinkId>,
}

/// Imposed node -> its impositions, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImpositionMap {
    by_imposed: BTreeMap<QueryNodeId, Vec<Imposition>>,
}

impl ImpositionMap {
    pub fn build(query: &AggregateQuery) -> Result<Self, MeshError> {
        let mut pairs: Vec<(QueryNodeId, QueryNodeId)> = Vec::new();
        for imposed in query.node_ids() {
            for &imposer in &query.node(imposed)?.impositions {
                if imposer == imposed {
                    debug!(node = imposed.0, "Dropped self-imposition");
                    continue;
                }
                if query.path(imposed, imposer)?.is_none() {
                    return Err(MeshError::InvalidRequest(format!(
                        "query node {} is not below node {} it imposes on",
                        imposer.0, imposed.0
                    )));
                }
                if !pairs.contains(&(imposed, imposer)) {
                    pairs.push((imposed, imposer));
                }
            }
        }

        while let Some((imposer, nearest)) = split_imposer(query, &pairs)? {
            let mut rewritten = Vec::with_capacity(pairs.len());
            for (imposed, by) in pairs {
                let pair = if by == imposer && imposed != nearest {
                    (imposed, nearest)
                } else {
                    (imposed, by)
                };
                if !rewritten.contains(&pair) {
                    rewritten.push(pair);
                }
            }
            pairs = rewritten;
        }

        let mut by_imposed: BTreeMap<QueryNodeId, Vec<Imposition>> = BTreeMap::new();
        for (imposed, imposer) in pairs {
            let path = query.path(imposed, imposer)?.ok_or_else(|| {
                MeshError::InvalidRequest(format!("no tree path from {} to {}", imposed.0, imposer.0))
            })?;
            by_imposed
                .entry(imposed)
                .or_default()
                .push(Imposition { imposer, path });
        }
        Ok(Self { by_imposed })
    }

    /// Impositions on `node`.
    #[must_use]
    pub fn imposers(&self, node: QueryNodeId) -> &[Imposition] {
        self.by_imposed.get(&node).map(Vec::as_slice).unwrap_or_default()
    }

    #[must_use]
    pub fn is_imposed(&self, node: QueryNodeId) -> bool {
        self.by_imposed.contains_key(&node)
    }

    /// The single node `imposer` constrains, if any.
    #[must_use]
    pub fn target_of(&self, imposer: QueryNodeId) -> Option<QueryNodeId> {
        self.by_imposed
            .iter()
            .find(|(_, list)| list.iter().any(|i| i.imposer == imposer))
            .map(|(imposed, _)| *imposed)
    }

    /// Number of normalized impositions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_imposed.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_imposed.is_empty()
    }
}

/// First imposer still constraining more than one node, with the nearest
/// (deepest) of its targets.
fn split_imposer(
    query: &AggregateQuery,
    pairs: &[(QueryNodeId, QueryNodeId)],
) -> Result<Option<(QueryNodeId, QueryNodeId)>, MeshError> {
    for &(_, imposer) in pairs {
        let mut nearest: Option<(usize, QueryNodeId)> = None;
        let mut targets = 0_usize;
        for &(imposed, by) in pairs {
            if by != imposer {
                continue;
            }
            targets += 1;
            let depth = query.path(query.root(), imposed)?.map(|p| p.len()).unwrap_or_default();
            if nearest.is_none_or(|(best, _)| depth > best) {
                nearest = Some((depth, imposed));
            }
        }
        if targets > 1
            && let Some((_, nearest)) = nearest
        {
            return Ok(Some((imposer, nearest)));
        }
    }
    Ok(None)
}
