//! Graph entity structures and path reconstruction.
//!
//! Paths arrive on the wire as three parallel collections: the distinct
//! nodes visited, the distinct relationships traversed (unbound, i.e.
//! without endpoint ids), and an index sequence describing the walk. Even
//! positions hold 1-based signed relationship indices (negative means the
//! relationship was traversed against its direction), odd positions hold
//! 0-based node indices.

use std::collections::HashMap;

use crate::ProtoError;
use crate::value::Value;

/// Structure signature bytes for graph entities.
pub mod signature {
    pub const NODE: u8 = 0x4E;
    pub const RELATIONSHIP: u8 = 0x52;
    pub const PATH: u8 = 0x50;
    pub const UNBOUND_RELATIONSHIP: u8 = 0x72;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: i64,
    pub labels: Vec<String>,
    pub properties: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relationship {
    pub id: i64,
    pub start_node_id: i64,
    pub end_node_id: i64,
    pub rel_type: String,
    pub properties: HashMap<String, Value>,
}

/// A relationship as it appears inside a path: endpoints are implied by the
/// walk and not carried on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct UnboundRelationship {
    pub id: i64,
    pub rel_type: String,
    pub properties: HashMap<String, Value>,
}

impl UnboundRelationship {
    /// Bind the relationship to the endpoint ids inferred from the walk.
    pub fn bind(&self, start_node_id: i64, end_node_id: i64) -> Relationship {
        Relationship {
            id: self.id,
            start_node_id,
            end_node_id,
            rel_type: self.rel_type.clone(),
            properties: self.properties.clone(),
        }
    }
}

/// One hop of a path, in traversal order.
#[derive(Debug, Clone, PartialEq)]
pub struct PathSegment {
    pub start: Node,
    pub relationship: Relationship,
    pub end: Node,
}

/// A path exactly as received: reconstruction into segments is lazy so the
/// wire form survives a round-trip unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    pub nodes: Vec<Node>,
    pub relationships: Vec<UnboundRelationship>,
    pub indices: Vec<i64>,
}

impl Path {
    /// The node the path starts at.
    pub fn start(&self) -> Option<&Node> {
        self.nodes.first()
    }

    /// The node the path ends at (the last node index in the walk).
    pub fn end(&self) -> Option<&Node> {
        match self.indices.last() {
            None => self.nodes.first(),
            Some(&idx) => usize::try_from(idx).ok().and_then(|i| self.nodes.get(i)),
        }
    }

    /// Number of hops.
    pub fn len(&self) -> usize {
        self.indices.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Reconstruct the traversal segments.
    ///
    /// Each unbound relationship is bound at most once, on first traversal,
    /// and the bound form is cached by its index so a walk crossing the same
    /// relationship twice reuses the first binding.
    pub fn segments(&self) -> Result<Vec<PathSegment>, ProtoError> {
        let mut segments = Vec::with_capacity(self.len());
        let mut bound: HashMap<usize, Relationship> = HashMap::new();

        let mut prev = self
            .nodes
            .first()
            .ok_or(ProtoError::MalformedStruct {
                entity: "path",
                reason: "node list is empty".to_owned(),
            })?
            .clone();

        for pair in self.indices.chunks(2) {
            let [rel_index, node_index] = pair else {
                return Err(ProtoError::MalformedStruct {
                    entity: "path",
                    reason: "odd-length index sequence".to_owned(),
                });
            };
            let next = self
                .node_at(*node_index)
                .ok_or(ProtoError::PathIndexOutOfRange(*node_index))?
                .clone();

            // 1-based and signed: the sign carries traversal direction.
            let relationship = if *rel_index > 0 {
                let slot = (*rel_index - 1) as usize;
                match bound.get(&slot) {
                    Some(r) => r.clone(),
                    None => {
                        let r = self
                            .relationships
                            .get(slot)
                            .ok_or(ProtoError::PathIndexOutOfRange(*rel_index))?
                            .bind(prev.id, next.id);
                        bound.insert(slot, r.clone());
                        r
                    }
                }
            } else if *rel_index < 0 {
                let slot = (-*rel_index - 1) as usize;
                match bound.get(&slot) {
                    Some(r) => r.clone(),
                    None => {
                        let r = self
                            .relationships
                            .get(slot)
                            .ok_or(ProtoError::PathIndexOutOfRange(*rel_index))?
                            .bind(next.id, prev.id);
                        bound.insert(slot, r.clone());
                        r
                    }
                }
            } else {
                return Err(ProtoError::PathIndexOutOfRange(0));
            };

            segments.push(PathSegment {
                start: prev.clone(),
                relationship,
                end: next.clone(),
            });
            prev = next;
        }

        Ok(segments)
    }

    fn node_at(&self, index: i64) -> Option<&Node> {
        usize::try_from(index).ok().and_then(|i| self.nodes.get(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i64) -> Node {
        Node {
            id,
            labels: vec!["Label".to_owned()],
            properties: HashMap::new(),
        }
    }

    fn rel(id: i64) -> UnboundRelationship {
        UnboundRelationship {
            id,
            rel_type: "KNOWS".to_owned(),
            properties: HashMap::new(),
        }
    }

    #[test]
    fn segments_of_forward_walk_bind_relationships_in_walk_order() {
        // (0)-[10]->(1)-[11]->(2)
        let path = Path {
            nodes: vec![node(0), node(1), node(2)],
            relationships: vec![rel(10), rel(11)],
            indices: vec![1, 1, 2, 2],
        };

        let segments = path.segments().expect("segments");
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].start.id, 0);
        assert_eq!(segments[0].end.id, 1);
        assert_eq!(segments[0].relationship.start_node_id, 0);
        assert_eq!(segments[0].relationship.end_node_id, 1);
        assert_eq!(segments[1].relationship.id, 11);
        assert_eq!(segments[1].relationship.start_node_id, 1);
        assert_eq!(segments[1].relationship.end_node_id, 2);
        assert_eq!(path.end().expect("end").id, 2);
    }

    #[test]
    fn negative_relationship_index_reverses_endpoint_inference() {
        // (0)<-[10]-(1): walked from node 0 to node 1 against the edge.
        let path = Path {
            nodes: vec![node(0), node(1)],
            relationships: vec![rel(10)],
            indices: vec![-1, 1],
        };

        let segments = path.segments().expect("segments");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start.id, 0);
        assert_eq!(segments[0].end.id, 1);
        // The relationship itself points the other way.
        assert_eq!(segments[0].relationship.start_node_id, 1);
        assert_eq!(segments[0].relationship.end_node_id, 0);
    }

    #[test]
    fn revisited_relationship_reuses_first_binding() {
        // (0)-[10]->(1)<-[10]-(0): same relationship crossed twice.
        let path = Path {
            nodes: vec![node(0), node(1)],
            relationships: vec![rel(10)],
            indices: vec![1, 1, -1, 0],
        };

        let segments = path.segments().expect("segments");
        assert_eq!(segments.len(), 2);
        assert_eq!(
            segments[0].relationship, segments[1].relationship,
            "second traversal must reuse the cached binding"
        );
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let path = Path {
            nodes: vec![node(0)],
            relationships: vec![],
            indices: vec![1, 0],
        };
        assert!(matches!(
            path.segments(),
            Err(ProtoError::PathIndexOutOfRange(_))
        ));
    }

    #[test]
    fn empty_path_has_no_segments_and_starts_where_it_ends() {
        let path = Path {
            nodes: vec![node(7)],
            relationships: vec![],
            indices: vec![],
        };
        assert!(path.segments().expect("segments").is_empty());
        assert_eq!(path.start().expect("start").id, 7);
        assert_eq!(path.end().expect("end").id, 7);
    }
}
