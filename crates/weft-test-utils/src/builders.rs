use weft_core::graph::{Edge, Graph, Guardrails, Node, NodeKind};

/// Builder for `Graph` to simplify test setup. Edge ids are assigned in
/// insertion order (`e1`, `e2`, ...).
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            graph: Graph {
                id: id.to_string(),
                name: None,
                nodes: Vec::new(),
                edges: Vec::new(),
                guardrails: Guardrails::default(),
            },
        }
    }

    pub fn node(mut self, node: Node) -> Self {
        self.graph.nodes.push(node);
        self
    }

    pub fn start(self, id: &str) -> Self {
        self.node(Node::new(id, NodeKind::Start))
    }

    pub fn end(self, id: &str) -> Self {
        self.node(Node::new(id, NodeKind::End))
    }

    pub fn task(self, id: &str) -> Self {
        self.node(Node::new(id, NodeKind::Task))
    }

    pub fn decision(self, id: &str) -> Self {
        self.node(Node::new(id, NodeKind::Decision))
    }

    fn next_edge_id(&self) -> String {
        format!("e{}", self.graph.edges.len() + 1)
    }

    pub fn edge(mut self, from: &str, to: &str) -> Self {
        let id = self.next_edge_id();
        self.graph.edges.push(Edge::solid(id, from, to));
        self
    }

    pub fn route(mut self, from: &str, to: &str, key: &str) -> Self {
        let id = self.next_edge_id();
        self.graph.edges.push(Edge::conditioned(id, from, to, key));
        self
    }

    pub fn dotted(mut self, from: &str, to: &str) -> Self {
        let id = self.next_edge_id();
        self.graph.edges.push(Edge::dotted(id, from, to));
        self
    }

    pub fn max_node_executions(mut self, n: u32) -> Self {
        self.graph.guardrails.max_node_executions = Some(n);
        self
    }

    pub fn max_runtime_secs(mut self, secs: u64) -> Self {
        self.graph.guardrails.max_runtime_secs = Some(secs);
        self
    }

    pub fn max_parallelism(mut self, n: usize) -> Self {
        self.graph.guardrails.max_parallelism = Some(n);
        self
    }

    pub fn build(self) -> Graph {
        self.graph
    }
}

/// `start -> task -> end`
pub fn linear(id: &str) -> Graph {
    GraphBuilder::new(id)
        .start("start")
        .task("task")
        .end("end")
        .edge("start", "task")
        .edge("task", "end")
        .build()
}

/// `start -> decision -(A)-> taskA -> end`, `decision -(B)-> taskB -> end`
pub fn branching(id: &str) -> Graph {
    GraphBuilder::new(id)
        .start("start")
        .decision("decision")
        .task("taskA")
        .task("taskB")
        .end("end")
        .edge("start", "decision")
        .route("decision", "taskA", "A")
        .route("decision", "taskB", "B")
        .edge("taskA", "end")
        .edge("taskB", "end")
        .build()
}

/// `start -> {left, right} -> join -> end`
pub fn diamond(id: &str) -> Graph {
    GraphBuilder::new(id)
        .start("start")
        .task("left")
        .task("right")
        .task("join")
        .end("end")
        .edge("start", "left")
        .edge("start", "right")
        .edge("left", "join")
        .edge("right", "join")
        .edge("join", "end")
        .build()
}
