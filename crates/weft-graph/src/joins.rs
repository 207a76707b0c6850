use std::collections::{BTreeSet, HashMap, VecDeque};

use weft_core::types::ActivationToken;

/// Pending tokens per `(target, parent)`, private to the task driving one run.
#[derive(Debug, Default)]
pub struct JoinBuffer {
    pending: HashMap<(String, String), VecDeque<ActivationToken>>,
}

impl JoinBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `token` from `parent` to `target`.
    ///
    /// Returns the join set once every required parent has a token waiting,
    /// popping exactly one token per parent. A parent outside `required`
    /// (a loop edge) activates the target with its token alone.
    pub fn offer(
        &mut self,
        target: &str,
        parent: &str,
        token: ActivationToken,
        required: Option<&BTreeSet<String>>,
    ) -> Option<Vec<ActivationToken>> {
        let required = match required {
            Some(r) if r.contains(parent) => r,
            _ => return Some(vec![token]),
        };

        self.pending
            .entry((target.to_string(), parent.to_string()))
            .or_default()
            .push_back(token);

        let complete = required.iter().all(|p| {
            self.pending
                .get(&(target.to_string(), p.clone()))
                .is_some_and(|q| !q.is_empty())
        });
        if !complete {
            return None;
        }

        let mut set = Vec::with_capacity(required.len());
        for p in required {
            if let Some(token) = self
                .pending
                .get_mut(&(target.to_string(), p.clone()))
                .and_then(VecDeque::pop_front)
            {
                set.push(token);
            }
        }
        set.sort_by_key(|t| t.sequence);
        Some(set)
    }

    /// Tokens still waiting for `target`, across all parents.
    #[cfg(test)]
    pub fn waiting(&self, target: &str) -> usize {
        self.pending
            .iter()
            .filter(|((t, _), _)| t == target)
            .map(|(_, q)| q.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::types::RoutingState;

    fn token(parent: &str, sequence: u64) -> ActivationToken {
        ActivationToken {
            source_node_id: parent.into(),
            source_edge_id: format!("{}-join", parent),
            output_state: json!({ "from": parent, "seq": sequence }),
            routing_state: RoutingState::default(),
            sequence,
        }
    }

    fn parents(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_join_waits_for_every_parent() {
        let required = parents(&["left", "right"]);
        let mut joins = JoinBuffer::new();

        assert!(joins.offer("join", "left", token("left", 1), Some(&required)).is_none());
        assert!(joins.offer("join", "left", token("left", 2), Some(&required)).is_none());
        assert_eq!(joins.waiting("join"), 2);

        let set = joins
            .offer("join", "right", token("right", 3), Some(&required))
            .unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set[0].sequence, 1);
        assert_eq!(set[1].source_node_id, "right");
        // The second left token stays buffered for the next join.
        assert_eq!(joins.waiting("join"), 1);
    }

    #[test]
    fn test_single_parent_activates_immediately() {
        let required = parents(&["a"]);
        let mut joins = JoinBuffer::new();
        let set = joins.offer("b", "a", token("a", 1), Some(&required)).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(joins.waiting("b"), 0);
    }

    #[test]
    fn test_loop_token_bypasses_join() {
        let required = parents(&["start"]);
        let mut joins = JoinBuffer::new();
        let set = joins.offer("work", "check", token("check", 5), Some(&required)).unwrap();
        assert_eq!(set[0].source_node_id, "check");
        assert_eq!(joins.waiting("work"), 0);
    }
}
