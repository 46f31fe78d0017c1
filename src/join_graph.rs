//! Reachability and path finding over the model's join edges.
//!
//! The graph is undirected: an edge declared `left -> right` can be walked
//! from either end. Edges are scanned in declaration order, so among paths of
//! equal length the one discovered first by declaration order wins. Reordering
//! the `joins` list in the model source can therefore change which path is
//! chosen in multi-path graphs.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::model::{JoinEdge, SemanticModel};

impl SemanticModel {
    /// Every table transitively connected to `start`, `start` included.
    #[must_use]
    pub fn tables_reachable_from<'a>(&'a self, start: &'a str) -> BTreeSet<&'a str> {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            for edge in self.joins() {
                if let Some(next) = edge.neighbor_of(current) {
                    if !visited.contains(next) {
                        queue.push_back(next);
                    }
                }
            }
        }
        visited
    }

    /// Shortest sequence of edges leading from `from` to `to`.
    ///
    /// Returns `Some(vec![])` when both ends are the same table and `None`
    /// when `to` cannot be reached.
    #[must_use]
    pub fn find_join_path(&self, from: &str, to: &str) -> Option<Vec<&JoinEdge>> {
        if from == to {
            return Some(Vec::new());
        }

        // table -> (parent table, index of the edge used to reach it)
        let mut parents: HashMap<&str, (&str, usize)> = HashMap::new();
        let mut visited: HashSet<&str> = HashSet::from([from]);
        let mut queue = VecDeque::from([from]);

        while let Some(current) = queue.pop_front() {
            for (idx, edge) in self.joins().iter().enumerate() {
                let Some(next) = edge.neighbor_of(current) else {
                    continue;
                };
                if !visited.insert(next) {
                    continue;
                }
                parents.insert(next, (current, idx));
                if next == to {
                    return Some(self.reconstruct_path(from, to, &parents));
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// Walk parent pointers back from `to`, then reverse into travel order.
    fn reconstruct_path(
        &self,
        from: &str,
        to: &str,
        parents: &HashMap<&str, (&str, usize)>,
    ) -> Vec<&JoinEdge> {
        let mut edges = Vec::new();
        let mut current = to;
        while current != from {
            let (parent, idx) = parents[current];
            edges.push(&self.joins()[idx]);
            current = parent;
        }
        edges.reverse();
        edges
    }

    /// The single edge directly connecting `a` and `b`, in either direction.
    #[must_use]
    pub fn find_join(&self, a: &str, b: &str) -> Option<&JoinEdge> {
        self.joins()
            .iter()
            .find(|edge| edge.neighbor_of(a) == Some(b))
    }
}

#[cfg(test)]
mod tests {
    use crate::model::SemanticModel;

    /// items -- orders -- users -- sessions, orders -- calendar,
    /// items -- products, plus an isolated warehouses table.
    fn shop() -> SemanticModel {
        SemanticModel::from_yaml(
            r"
joins:
  - {left: s.items, left_alias: oi, right: s.orders, right_alias: o, on: oi.order_id = o.order_id, type: inner}
  - {left: s.orders, left_alias: o, right: s.users, right_alias: u, on: o.user_id = u.user_id}
  - {left: s.orders, left_alias: o, right: s.calendar, right_alias: d, on: o.order_date = d.date_day}
  - {left: s.items, left_alias: oi, right: s.products, right_alias: p, on: oi.product_id = p.product_id}
  - {left: s.sessions, left_alias: se, right: s.users, right_alias: u, on: se.user_id = u.user_id}
",
        )
        .unwrap()
    }

    #[test]
    fn reachable_includes_start_and_follows_both_directions() {
        let model = shop();
        let reachable = model.tables_reachable_from("s.sessions");
        assert!(reachable.contains("s.sessions"));
        assert!(reachable.contains("s.users"));
        assert!(reachable.contains("s.orders"));
        assert!(reachable.contains("s.products"));
        assert!(!reachable.contains("s.warehouses"));
    }

    #[test]
    fn isolated_table_reaches_only_itself() {
        let model = shop();
        let reachable = model.tables_reachable_from("s.warehouses");
        assert_eq!(reachable.into_iter().collect::<Vec<_>>(), ["s.warehouses"]);
    }

    #[test]
    fn path_to_self_is_empty() {
        let model = shop();
        assert_eq!(model.find_join_path("s.orders", "s.orders"), Some(vec![]));
    }

    #[test]
    fn path_to_disconnected_table_is_none() {
        let model = shop();
        assert!(model.find_join_path("s.items", "s.warehouses").is_none());
    }

    #[test]
    fn multi_hop_path_is_ordered_from_source() {
        let model = shop();
        let path = model.find_join_path("s.items", "s.sessions").unwrap();
        let hops: Vec<(&str, &str)> = path
            .iter()
            .map(|e| (e.left.as_str(), e.right.as_str()))
            .collect();
        assert_eq!(
            hops,
            [
                ("s.items", "s.orders"),
                ("s.orders", "s.users"),
                ("s.sessions", "s.users"),
            ]
        );
        assert!(path.first().unwrap().touches("s.items"));
        assert!(path.last().unwrap().touches("s.sessions"));
    }

    #[test]
    fn path_walks_edges_against_declared_direction() {
        let model = shop();
        let path = model.find_join_path("s.users", "s.items").unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].on, "o.user_id = u.user_id");
        assert_eq!(path[1].on, "oi.order_id = o.order_id");
    }

    #[test]
    fn equal_length_paths_break_ties_by_declaration_order() {
        let model = SemanticModel::from_yaml(
            r"
joins:
  - {left: t.a, left_alias: a, right: t.b, right_alias: b, on: a.id = b.a_id}
  - {left: t.a, left_alias: a, right: t.c, right_alias: c, on: a.id = c.a_id}
  - {left: t.c, left_alias: c, right: t.d, right_alias: d, on: c.id = d.c_id}
  - {left: t.b, left_alias: b, right: t.d, right_alias: d, on: b.id = d.b_id}
",
        )
        .unwrap();
        let path = model.find_join_path("t.a", "t.d").unwrap();
        let via: Vec<&str> = path.iter().map(|e| e.on.as_str()).collect();
        assert_eq!(via, ["a.id = b.a_id", "b.id = d.b_id"]);
        // Same inputs, same answer.
        assert_eq!(model.find_join_path("t.a", "t.d").unwrap(), path);
    }

    #[test]
    fn find_join_is_direction_agnostic_and_single_hop() {
        let model = shop();
        let forward = model.find_join("s.orders", "s.users").unwrap();
        let backward = model.find_join("s.users", "s.orders").unwrap();
        assert_eq!(forward, backward);
        assert!(model.find_join("s.items", "s.users").is_none());
        assert!(model.find_join("s.products", "s.sessions").is_none());
    }
}
