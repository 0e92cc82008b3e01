// Validated Types
// Strongly-typed wrappers and entity shapes used across the graph API.
// These types cannot be constructed with invalid data, eliminating entire
// classes of bugs before a query is ever issued.

use anyhow::{ensure, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Property dictionary shape returned by every read operation.
///
/// The `properties` JSON blob has been merged into the map and the blob
/// key removed by the time callers see one of these.
pub type NodeDict = Map<String, Value>;

/// An entity handed to `add_node` / `add_nodes`.
///
/// `id`, `name` and `node_type` are materialized as dedicated columns;
/// every other attribute travels in the `properties` map and is
/// serialized into the JSON blob column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEntity {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
}

impl GraphEntity {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        node_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            node_type: node_type.into(),
            properties: Map::new(),
        }
    }

    /// Attach an extended attribute carried in the JSON blob column.
    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// Identity of a directed edge: `(source_id, target_id, relationship_name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub source: String,
    pub target: String,
    pub label: String,
}

impl EdgeKey {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            label: label.into(),
        }
    }
}

impl fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})-[{}]->({})", self.source, self.label, self.target)
    }
}

/// An edge handed to `add_edge` / `add_edges`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub source: String,
    pub target: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
}

impl EdgeSpec {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            label: label.into(),
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(
            self.source.clone(),
            self.target.clone(),
            self.label.clone(),
        )
    }
}

/// A single attribute filter: the attribute must take one of the values.
///
/// Filters address the materialized columns (`id`, `name`, `type`);
/// several filters combine conjunctively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeFilter {
    pub attribute: String,
    pub values: Vec<Value>,
}

impl AttributeFilter {
    pub fn new(attribute: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            attribute: attribute.into(),
            values,
        }
    }
}

/// Ordered pair of timestamps (created, updated)
///
/// # Invariants
/// - `updated >= created`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampPair {
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl TimestampPair {
    pub fn new(created: DateTime<Utc>, updated: DateTime<Utc>) -> Result<Self> {
        ensure!(
            updated >= created,
            "Updated timestamp must be >= created timestamp"
        );
        Ok(Self { created, updated })
    }

    /// Create a new pair with both timestamps set to now.
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            created: now,
            updated: now,
        }
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn updated(&self) -> DateTime<Utc> {
        self.updated
    }

    /// Refresh the updated timestamp, keeping creation fixed.
    pub fn touch(&mut self) {
        self.updated = Utc::now();
    }
}

/// Structural metrics over the whole graph.
///
/// Mandatory metrics are always populated. Optional metrics are computed
/// only on request and individually degrade to `-1` when they cannot be
/// computed, so one pathological subcomputation never fails the call.
///
/// Connected components are approximated with a bounded-depth traversal
/// (depth <= 3); on large graphs the reported component count and sizes
/// overestimate the true partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphMetrics {
    pub num_nodes: usize,
    pub num_edges: usize,
    /// `2E / V`; `None` for the empty graph.
    pub mean_degree: Option<f64>,
    /// `E / (V * (V - 1))`; `0` when `V <= 1`.
    pub edge_density: f64,
    pub num_connected_components: usize,
    pub sizes_of_connected_components: Vec<usize>,
    pub num_selfloops: i64,
    pub diameter: f64,
    pub avg_shortest_path_length: f64,
    pub avg_clustering: f64,
}

impl GraphMetrics {
    /// Metrics of the empty graph with optional metrics unset.
    pub fn empty() -> Self {
        Self {
            num_nodes: 0,
            num_edges: 0,
            mean_degree: None,
            edge_density: 0.0,
            num_connected_components: 0,
            sizes_of_connected_components: Vec::new(),
            num_selfloops: -1,
            diameter: -1.0,
            avg_shortest_path_length: -1.0,
            avg_clustering: -1.0,
        }
    }
}

/// A normalized event emitted by `collect_events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}
