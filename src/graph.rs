use action::Action;
use error::TgenError;

/// An opaque handle into the `Graph`'s vertex arena. §9's design notes
/// call for indices into an arena rather than pointer chains so that
/// cycles in the action graph are representable without `Rc`/`Weak`
/// cycles of our own.
pub type VertexId = usize;

/// Read-only, validated view over a parsed action graph: exactly one
/// `Start` vertex, no edges into it, and a deterministic successor
/// ordering fixed by the loader.
pub struct Graph {
    actions: Vec<Action>,
    successors: Vec<Vec<VertexId>>,
    start: VertexId,
}

impl Graph {
    pub fn start_vertex(&self) -> VertexId {
        self.start
    }

    pub fn action_of(&self, v: VertexId) -> &Action {
        &self.actions[v]
    }

    pub fn successors(&self, v: VertexId) -> &[VertexId] {
        &self.successors[v]
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// In-degree of every vertex, used by the driver to know how many
    /// predecessor branches a `Synchronize` vertex must wait for.
    pub fn in_degrees(&self) -> Vec<usize> {
        let mut degrees = vec![0usize; self.actions.len()];
        for succs in &self.successors {
            for &s in succs {
                degrees[s] += 1;
            }
        }
        degrees
    }

    pub fn vertex_ids(&self) -> impl Iterator<Item = VertexId> {
        0..self.actions.len()
    }
}

/// Builds a `Graph` from loosely-ordered vertex insertions, enforcing
/// the invariants of §3/§6.1 at `build()` time.
pub struct GraphBuilder {
    actions: Vec<Action>,
    successors: Vec<Vec<VertexId>>,
}

impl GraphBuilder {
    pub fn new() -> GraphBuilder {
        GraphBuilder {
            actions: Vec::new(),
            successors: Vec::new(),
        }
    }

    /// Adds a vertex and returns its id for use in `add_edge`.
    pub fn add_vertex(&mut self, action: Action) -> VertexId {
        self.actions.push(action);
        self.successors.push(Vec::new());
        self.actions.len() - 1
    }

    pub fn add_edge(&mut self, from: VertexId, to: VertexId) {
        self.successors[from].push(to);
    }

    pub fn build(self) -> Result<Graph, TgenError> {
        let starts: Vec<VertexId> = self
            .actions
            .iter()
            .enumerate()
            .filter(|&(_, a)| a.is_start())
            .map(|(i, _)| i)
            .collect();

        let start = match starts.len() {
            0 => return Err(TgenError::Graph("graph has no Start vertex".into())),
            1 => starts[0],
            n => {
                return Err(TgenError::Graph(format!(
                    "graph has {} Start vertices, exactly one is required",
                    n
                )))
            }
        };

        for (from, succs) in self.successors.iter().enumerate() {
            for &to in succs {
                if to == start {
                    return Err(TgenError::Graph(format!(
                        "Start vertex may not have incoming edges (from vertex {})",
                        from
                    )));
                }
            }
        }

        Ok(Graph {
            actions: self.actions,
            successors: self.successors,
            start: start,
        })
    }
}

impl Default for GraphBuilder {
    fn default() -> GraphBuilder {
        GraphBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use action::Action;
    use peer::PeerPool;

    fn start() -> Action {
        Action::Start {
            time_s: 0,
            server_port: 9000,
            peers: PeerPool::new(),
            socks_proxy: None,
        }
    }

    #[test]
    fn requires_exactly_one_start() {
        let mut b = GraphBuilder::new();
        b.add_vertex(Action::Synchronize);
        assert!(b.build().is_err());

        let mut b = GraphBuilder::new();
        b.add_vertex(start());
        b.add_vertex(start());
        assert!(b.build().is_err());
    }

    #[test]
    fn rejects_incoming_edges_to_start() {
        let mut b = GraphBuilder::new();
        let s = b.add_vertex(start());
        let sync = b.add_vertex(Action::Synchronize);
        b.add_edge(sync, s);
        assert!(b.build().is_err());
    }

    #[test]
    fn preserves_successor_order() {
        let mut b = GraphBuilder::new();
        let s = b.add_vertex(start());
        let a = b.add_vertex(Action::Pause { time_s: 1 });
        let c = b.add_vertex(Action::Pause { time_s: 2 });
        b.add_edge(s, c);
        b.add_edge(s, a);
        let g = b.build().unwrap();
        assert_eq!(g.successors(s), &[c, a]);
    }

    #[test]
    fn computes_in_degrees() {
        let mut b = GraphBuilder::new();
        let s = b.add_vertex(start());
        let sync = b.add_vertex(Action::Synchronize);
        let p1 = b.add_vertex(Action::Pause { time_s: 1 });
        let p2 = b.add_vertex(Action::Pause { time_s: 2 });
        b.add_edge(s, p1);
        b.add_edge(s, p2);
        b.add_edge(p1, sync);
        b.add_edge(p2, sync);
        let g = b.build().unwrap();
        assert_eq!(g.in_degrees()[sync], 2);
    }
}
