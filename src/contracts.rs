// Contract-First Design
// This module defines the graph operation contract consumed by upstream
// ingestion pipelines, with preconditions and postconditions spelled out
// per operation. `GraphAdapter` is the embedded implementation.

use anyhow::{ensure, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::types::{AttributeFilter, EdgeKey, EdgeSpec, EventRecord, GraphEntity, GraphMetrics, NodeDict};

/// A node/edge pair as returned by the graph-wide reads: node tuples are
/// `(id, dict)`, edge tuples are `(source, target, label, properties)`.
pub type GraphData = (
    Vec<(String, NodeDict)>,
    Vec<(String, String, String, NodeDict)>,
);

/// Core trait for asynchronous graph operations
///
/// Every operation runs its blocking engine work on a worker executor or
/// under the configured external lock; the caller's scheduler is never
/// stalled. Within one adapter, operations issued by a single caller are
/// observed in issue order; cross-caller ordering is unspecified.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Forward an opaque statement to the underlying engine.
    ///
    /// # Postconditions
    /// - Returns the engine's row tuples unchanged
    /// - Statements the engine does not understand propagate as errors
    async fn query(&self, statement: &str) -> Result<Vec<Vec<Value>>>;

    /// Whether the graph holds no nodes at all.
    async fn is_empty(&self) -> Result<bool>;

    /// Check if a node exists.
    async fn has_node(&self, node_id: &str) -> Result<bool>;

    /// Add a single node (merge-by-id).
    ///
    /// # Postconditions
    /// - A new node's `created_at` and `updated_at` are both set
    /// - An existing node keeps `created_at`, refreshes `updated_at`,
    ///   and has its core columns and properties blob overwritten
    async fn add_node(&self, node: &GraphEntity) -> Result<()>;

    /// Batch form of [`Self::add_node`]; one timestamp for the batch.
    async fn add_nodes(&self, nodes: &[GraphEntity]) -> Result<()>;

    /// Delete a node and detach every incident edge.
    ///
    /// # Postconditions
    /// - `has_node(id)` is false
    /// - No edge touching `id` remains
    /// - Deleting a missing node succeeds
    async fn delete_node(&self, node_id: &str) -> Result<()>;

    async fn delete_nodes(&self, node_ids: &[String]) -> Result<()>;

    /// Extract a node as a dictionary with the properties blob merged
    /// in and the blob key removed. Missing node yields `None`.
    async fn extract_node(&self, node_id: &str) -> Result<Option<NodeDict>>;

    /// Batch extraction; missing ids are simply absent from the result.
    async fn extract_nodes(&self, node_ids: &[String]) -> Result<Vec<NodeDict>>;

    /// Dict-shaped single node read; same merging rules as
    /// [`Self::extract_node`].
    async fn get_node(&self, node_id: &str) -> Result<Option<NodeDict>> {
        self.extract_node(node_id).await
    }

    /// Dict-shaped batch node read; same merging rules as
    /// [`Self::extract_nodes`].
    async fn get_nodes(&self, node_ids: &[String]) -> Result<Vec<NodeDict>> {
        self.extract_nodes(node_ids).await
    }

    /// Check if a directed labeled edge exists.
    async fn has_edge(&self, from_node: &str, to_node: &str, edge_label: &str) -> Result<bool>;

    /// Of the given identities, return the ones present.
    async fn has_edges(&self, edges: &[EdgeKey]) -> Result<Vec<EdgeKey>>;

    /// Upsert one edge by `(source, target, label)` identity.
    ///
    /// # Preconditions
    /// - Both endpoints already exist (the merge matches existing
    ///   nodes; nothing is created for unknown endpoints)
    ///
    /// # Postconditions
    /// - Repeated insertion with one identity leaves a single edge;
    ///   `updated_at` and `properties` reflect the last write,
    ///   `created_at` the first
    async fn add_edge(
        &self,
        from_node: &str,
        to_node: &str,
        relationship_name: &str,
        edge_properties: Map<String, Value>,
    ) -> Result<()>;

    /// Batch form of [`Self::add_edge`].
    async fn add_edges(&self, edges: &[EdgeSpec]) -> Result<()>;

    /// Every edge incident to a node as
    /// `(queried_node, relationship_name, other_node)` tuples.
    async fn get_edges(&self, node_id: &str) -> Result<Vec<(NodeDict, String, NodeDict)>>;

    /// Distinct nodes adjacent to a node in either direction.
    async fn get_neighbors(&self, node_id: &str) -> Result<Vec<NodeDict>>;

    /// British-spelling alias of [`Self::get_neighbors`].
    async fn get_neighbours(&self, node_id: &str) -> Result<Vec<NodeDict>> {
        self.get_neighbors(node_id).await
    }

    /// Nodes with an edge into `node_id`, optionally label-filtered.
    async fn get_predecessors(
        &self,
        node_id: &str,
        edge_label: Option<&str>,
    ) -> Result<Vec<NodeDict>>;

    /// Nodes reachable over one outgoing edge, optionally filtered.
    async fn get_successors(
        &self,
        node_id: &str,
        edge_label: Option<&str>,
    ) -> Result<Vec<NodeDict>>;

    /// Incident edges with both endpoint dictionaries and the edge's
    /// own dictionary (label plus merged properties).
    async fn get_connections(
        &self,
        node_id: &str,
    ) -> Result<Vec<(NodeDict, NodeDict, NodeDict)>>;

    /// Drop incoming edges of one label for the given nodes.
    async fn remove_connection_to_predecessors_of(
        &self,
        node_ids: &[String],
        edge_label: &str,
    ) -> Result<()>;

    /// Drop outgoing edges of one label for the given nodes.
    async fn remove_connection_to_successors_of(
        &self,
        node_ids: &[String],
        edge_label: &str,
    ) -> Result<()>;

    /// All nodes and edges, properties merged.
    async fn get_graph_data(&self) -> Result<GraphData>;

    /// The 1-hop closure of the named seed nodes: seeds of the given
    /// type, their direct neighbors, and every edge whose both
    /// endpoints lie in that union. Result ordering is unspecified.
    async fn get_nodeset_subgraph(
        &self,
        node_type: &str,
        node_names: &[String],
    ) -> Result<GraphData>;

    /// Nodes whose attributes satisfy every filter, plus the edges
    /// between them.
    async fn get_filtered_graph_data(&self, filters: &[AttributeFilter]) -> Result<GraphData>;

    /// Structural metrics. Optional metrics are computed only when
    /// requested and individually degrade to `-1`.
    async fn get_graph_metrics(&self, include_optional: bool) -> Result<GraphMetrics>;

    /// Ids of nodes without any incident edge.
    async fn get_disconnected_nodes(&self) -> Result<Vec<String>>;

    /// Distinct node labels and relationship names present.
    async fn get_model_independent_graph_data(&self) -> Result<(Vec<String>, Vec<String>)>;

    /// Nodes of type `Entity` or `EntityType` with exactly one
    /// connection; other types are rejected.
    async fn get_degree_one_nodes(&self, node_type: &str) -> Result<Vec<NodeDict>>;

    /// Most recent `UserInteraction` node ids, newest first.
    async fn get_last_interaction_ids(&self, limit: usize) -> Result<Vec<String>>;

    /// Add `weight` to the `feedback_weight` property of every
    /// `used_graph_element_to_answer` edge leaving the given nodes.
    /// Read-modify-write within one lock window; last writer wins.
    async fn apply_feedback_weight(&self, node_ids: &[String], weight: f64) -> Result<()>;

    /// Quoted, comma-separated ids of `Timestamp` nodes whose `time_at`
    /// lies in `[time_from, time_to]`. A missing bound is unbounded on
    /// that side; no bounds at all yield an empty result.
    async fn collect_time_ids(
        &self,
        time_from: Option<i64>,
        time_to: Option<i64>,
    ) -> Result<String>;

    /// `Event` nodes within two hops of the given ids, normalized.
    async fn collect_events(&self, ids: &[String]) -> Result<Vec<EventRecord>>;

    /// Close the adapter and remove the backing files (including the
    /// `.lock` and `.wal` sidecars). A cloud-hosted database loses only
    /// its local shadow; the canonical cloud copy is preserved.
    async fn delete_graph(&self) -> Result<()>;
}

/// Runtime contract validation
pub mod validation {
    use super::*;

    /// Validate a database storage path
    pub fn validate_storage_path(path: &str) -> Result<()> {
        ensure!(!path.is_empty(), "Storage path cannot be empty");
        ensure!(path.len() < 4096, "Storage path too long");
        ensure!(!path.contains('\0'), "Storage path contains a null byte");
        Ok(())
    }

    /// Validate a batch of entities before any query is issued
    pub fn validate_entities(entities: &[GraphEntity]) -> Result<()> {
        for entity in entities {
            ensure!(!entity.id.is_empty(), "Node id cannot be empty");
        }
        Ok(())
    }
}
