//! Pure graph-metric functions
//!
//! Every function here is side-effect free and operates on plain id and
//! edge slices, so the computations are testable without a database.
//! Edges are `(source, target)` id pairs; all traversals treat the graph
//! as undirected, matching how connectivity metrics are defined.

use petgraph::algo::dijkstra;
use petgraph::graph::{NodeIndex, UnGraph};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Maximum traversal depth used by the connected-component
/// approximation. Bounds the computation on large graphs; the result is
/// an approximation, not the true component partition.
pub const COMPONENT_TRAVERSAL_DEPTH: usize = 3;

/// Mean degree `2E / V`; `None` for the empty graph.
pub fn mean_degree(num_nodes: usize, num_edges: usize) -> Option<f64> {
    if num_nodes == 0 {
        None
    } else {
        Some(2.0 * num_edges as f64 / num_nodes as f64)
    }
}

/// Edge density `E / (V * (V - 1))`; `0` when `V <= 1`.
pub fn edge_density(num_nodes: usize, num_edges: usize) -> f64 {
    if num_nodes <= 1 {
        0.0
    } else {
        num_edges as f64 / (num_nodes as f64 * (num_nodes as f64 - 1.0))
    }
}

/// Undirected adjacency lists over string ids.
fn adjacency<'a>(
    nodes: &'a [String],
    edges: &'a [(String, String)],
) -> HashMap<&'a str, HashSet<&'a str>> {
    let mut adj: HashMap<&str, HashSet<&str>> = HashMap::new();
    for id in nodes {
        adj.entry(id.as_str()).or_default();
    }
    for (source, target) in edges {
        adj.entry(source.as_str()).or_default().insert(target);
        adj.entry(target.as_str()).or_default().insert(source);
    }
    adj
}

/// Reachable set of a node within `max_depth` hops, including the node.
fn bounded_reachable<'a>(
    start: &'a str,
    adj: &HashMap<&'a str, HashSet<&'a str>>,
    max_depth: usize,
) -> BTreeSet<&'a str> {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut queue: VecDeque<(&str, usize)> = VecDeque::new();
    seen.insert(start);
    queue.push_back((start, 0));

    while let Some((current, depth)) = queue.pop_front() {
        if depth == max_depth {
            continue;
        }
        if let Some(neighbors) = adj.get(current) {
            for &next in neighbors {
                if seen.insert(next) {
                    queue.push_back((next, depth + 1));
                }
            }
        }
    }
    seen
}

/// Approximate connected components via bounded-depth traversal.
///
/// Each node's reachable set within [`COMPONENT_TRAVERSAL_DEPTH`] hops is
/// collected; the distinct sets are reported as components. For graphs
/// whose true components have diameter beyond the bound, this
/// overcounts: two nodes of one large component can report different
/// neighborhoods. Documented trade-off for very large graphs.
pub fn bounded_components(nodes: &[String], edges: &[(String, String)]) -> Vec<usize> {
    let adj = adjacency(nodes, edges);
    let mut distinct: BTreeSet<BTreeSet<&str>> = BTreeSet::new();
    for id in nodes {
        distinct.insert(bounded_reachable(id, &adj, COMPONENT_TRAVERSAL_DEPTH));
    }
    distinct.into_iter().map(|set| set.len()).collect()
}

/// Number of self-loops (edges whose endpoints coincide).
pub fn self_loop_count(edges: &[(String, String)]) -> usize {
    edges.iter().filter(|(s, t)| s == t).count()
}

/// Shortest-path lengths between all distinct connected node pairs.
///
/// All-pairs over an unweighted undirected graph; quadratic in the node
/// count, intended for the opt-in metrics path only.
pub fn shortest_path_lengths(nodes: &[String], edges: &[(String, String)]) -> Vec<usize> {
    let mut graph: UnGraph<&str, ()> = UnGraph::default();
    let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
    for id in nodes {
        indices.insert(id.as_str(), graph.add_node(id.as_str()));
    }
    for (source, target) in edges {
        if let (Some(&a), Some(&b)) = (indices.get(source.as_str()), indices.get(target.as_str()))
        {
            graph.add_edge(a, b, ());
        }
    }

    let mut lengths = Vec::new();
    for (i, id) in nodes.iter().enumerate() {
        let Some(&start) = indices.get(id.as_str()) else {
            continue;
        };
        let distances = dijkstra(&graph, start, None, |_| 1usize);
        for other in nodes.iter().skip(i + 1) {
            if let Some(&idx) = indices.get(other.as_str()) {
                if let Some(&d) = distances.get(&idx) {
                    if d > 0 {
                        lengths.push(d);
                    }
                }
            }
        }
    }
    lengths
}

/// Average local clustering coefficient.
///
/// For each node with degree >= 2, the fraction of neighbor pairs that
/// are themselves connected; nodes of smaller degree contribute 0.
pub fn average_clustering(nodes: &[String], edges: &[(String, String)]) -> f64 {
    if nodes.is_empty() {
        return 0.0;
    }
    let adj = adjacency(nodes, edges);

    let mut total = 0.0;
    for id in nodes {
        let Some(neighbors) = adj.get(id.as_str()) else {
            continue;
        };
        let neighbors: Vec<&str> = neighbors
            .iter()
            .copied()
            .filter(|n| *n != id.as_str())
            .collect();
        let degree = neighbors.len();
        if degree < 2 {
            continue;
        }

        let mut closed = 0usize;
        for (i, a) in neighbors.iter().enumerate() {
            for b in neighbors.iter().skip(i + 1) {
                if adj.get(a).map(|set| set.contains(b)).unwrap_or(false) {
                    closed += 1;
                }
            }
        }
        total += 2.0 * closed as f64 / (degree as f64 * (degree as f64 - 1.0));
    }
    total / nodes.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn test_mean_degree_and_density() {
        assert_eq!(mean_degree(0, 0), None);
        assert_eq!(mean_degree(2, 1), Some(1.0));
        assert_eq!(edge_density(0, 0), 0.0);
        assert_eq!(edge_density(1, 0), 0.0);
        assert_eq!(edge_density(2, 1), 0.5);
    }

    #[test]
    fn test_bounded_components_small_graph() {
        // Two separate pairs: each pair's reachable set is the pair.
        let nodes = ids(&["a", "b", "c", "d"]);
        let edges = pairs(&[("a", "b"), ("c", "d")]);
        let mut sizes = bounded_components(&nodes, &edges);
        sizes.sort_unstable();
        assert_eq!(sizes, vec![2, 2]);
    }

    #[test]
    fn test_bounded_components_isolated_nodes() {
        let nodes = ids(&["a", "b"]);
        let sizes = bounded_components(&nodes, &[]);
        assert_eq!(sizes, vec![1, 1]);
    }

    #[test]
    fn test_bounded_components_overcounts_long_chains() {
        // A 6-node chain exceeds the depth bound; the endpoints see
        // different neighborhoods, so more than one set is reported.
        let nodes = ids(&["a", "b", "c", "d", "e", "f"]);
        let edges = pairs(&[("a", "b"), ("b", "c"), ("c", "d"), ("d", "e"), ("e", "f")]);
        let sizes = bounded_components(&nodes, &edges);
        assert!(sizes.len() > 1);
    }

    #[test]
    fn test_self_loops() {
        let edges = pairs(&[("a", "a"), ("a", "b"), ("b", "b")]);
        assert_eq!(self_loop_count(&edges), 2);
    }

    #[test]
    fn test_shortest_paths_triangle_plus_tail() {
        let nodes = ids(&["a", "b", "c", "d"]);
        let edges = pairs(&[("a", "b"), ("b", "c"), ("a", "c"), ("c", "d")]);
        let mut lengths = shortest_path_lengths(&nodes, &edges);
        lengths.sort_unstable();
        // Pairs: ab=1 ac=1 ad=2 bc=1 bd=2 cd=1
        assert_eq!(lengths, vec![1, 1, 1, 1, 2, 2]);
    }

    #[test]
    fn test_shortest_paths_disconnected_pairs_omitted() {
        let nodes = ids(&["a", "b", "c"]);
        let edges = pairs(&[("a", "b")]);
        assert_eq!(shortest_path_lengths(&nodes, &edges), vec![1]);
    }

    #[test]
    fn test_clustering_triangle() {
        let nodes = ids(&["a", "b", "c"]);
        let edges = pairs(&[("a", "b"), ("b", "c"), ("a", "c")]);
        let clustering = average_clustering(&nodes, &edges);
        assert!((clustering - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_clustering_star_is_zero() {
        let nodes = ids(&["hub", "a", "b", "c"]);
        let edges = pairs(&[("hub", "a"), ("hub", "b"), ("hub", "c")]);
        assert_eq!(average_clustering(&nodes, &edges), 0.0);
    }
}
