//! Workflow Executor: build a DAG from the declared ports/steps/links, then run it to
//! completion with a ready-set round-robin scheduler (§4.6).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde_json::{Map, Value};

use crate::document::WorkflowDoc;
use crate::error::EngineError;
use crate::loader::{load_guarded, LoadContext};
use crate::runnable::Runnable;
use crate::value::{bare_name, last_segment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeStatus {
    Running,
    Done,
}

#[derive(Debug)]
enum NodeKind {
    Port,
    Step(Box<Runnable>),
}

#[derive(Debug)]
struct NodeRecord {
    id: String,
    kind: NodeKind,
    val: Option<Value>,
    result: Option<Value>,
    status: Option<NodeStatus>,
}

impl NodeRecord {
    fn port(id: String, default_value: Option<Value>) -> Self {
        Self {
            id,
            kind: NodeKind::Port,
            val: default_value,
            result: None,
            status: None,
        }
    }

    fn step(id: String, runnable: Runnable) -> Self {
        Self {
            id,
            kind: NodeKind::Step(Box::new(runnable)),
            val: None,
            result: None,
            status: None,
        }
    }
}

#[derive(Debug)]
struct EdgeRecord {
    pos: i64,
    seq: usize,
}

#[derive(Debug)]
pub struct WorkflowRunnable {
    pub doc: WorkflowDoc,
    pub origin: PathBuf,
    graph: StableDiGraph<NodeRecord, EdgeRecord>,
    node_ids: HashMap<String, NodeIndex>,
    output_names: Vec<(String, String)>,
    edge_seq: usize,
}

impl WorkflowRunnable {
    pub(crate) fn build(doc: WorkflowDoc, origin: &Path, ctx: &mut LoadContext) -> Result<Self> {
        let mut graph = StableDiGraph::new();
        let mut node_ids: HashMap<String, NodeIndex> = HashMap::new();

        // Pass 1: every port and step becomes a node before any edge references it.
        for port in &doc.inputs {
            let idx = graph.add_node(NodeRecord::port(port.id.clone(), port.value.clone()));
            node_ids.insert(port.id.clone(), idx);
        }
        for port in &doc.outputs {
            let idx = graph.add_node(NodeRecord::port(port.id.clone(), port.value.clone()));
            node_ids.insert(port.id.clone(), idx);
        }

        let mut step_runnables = Vec::with_capacity(doc.steps.len());
        for step in &doc.steps {
            let runnable = load_guarded(&step.impl_path, Some(origin), ctx)
                .with_context(|| format!("failed to load step '{}'", step.id))?;
            step_runnables.push(runnable);

            for port in &step.inputs {
                let idx = graph.add_node(NodeRecord::port(port.id.clone(), port.value.clone()));
                node_ids.insert(port.id.clone(), idx);
            }
            for port in &step.outputs {
                let idx = graph.add_node(NodeRecord::port(port.id.clone(), port.value.clone()));
                node_ids.insert(port.id.clone(), idx);
            }
        }
        for (step, runnable) in doc.steps.iter().zip(step_runnables) {
            let idx = graph.add_node(NodeRecord::step(step.id.clone(), runnable));
            node_ids.insert(step.id.clone(), idx);
        }

        let mut built = Self {
            doc,
            origin: origin.to_path_buf(),
            graph,
            node_ids,
            output_names: Vec::new(),
            edge_seq: 0,
        };

        // Pass 2: wire up edges now that every id resolves to a node.
        for step in &built.doc.steps.clone() {
            let step_idx = *built
                .node_ids
                .get(&step.id)
                .ok_or_else(|| anyhow!("unknown step id '{}'", step.id))?;

            for port in &step.inputs {
                let port_idx = *built
                    .node_ids
                    .get(&port.id)
                    .ok_or_else(|| anyhow!("unknown port id '{}'", port.id))?;
                built.link_sources(port, port_idx)?;
                built.add_edge(port_idx, step_idx, 0);
            }
            for port in &step.outputs {
                let port_idx = *built
                    .node_ids
                    .get(&port.id)
                    .ok_or_else(|| anyhow!("unknown port id '{}'", port.id))?;
                built.add_edge(step_idx, port_idx, 0);
            }
        }

        for port in &built.doc.outputs.clone() {
            let port_idx = *built
                .node_ids
                .get(&port.id)
                .ok_or_else(|| anyhow!("unknown port id '{}'", port.id))?;
            built.link_sources(port, port_idx)?;
            built
                .output_names
                .push((bare_name(&port.id).to_string(), port.id.clone()));
        }

        built.verify_acyclic()?;
        Ok(built)
    }

    fn link_sources(&mut self, port: &crate::document::PortDoc, port_idx: NodeIndex) -> Result<()> {
        for link in &port.links {
            let source_idx = *self
                .node_ids
                .get(&link.source)
                .ok_or_else(|| anyhow!("link source '{}' does not resolve to a known port", link.source))?;
            self.add_edge(source_idx, port_idx, link.position);
        }
        Ok(())
    }

    fn add_edge(&mut self, from: NodeIndex, to: NodeIndex, pos: i64) {
        let seq = self.edge_seq;
        self.edge_seq += 1;
        self.graph.add_edge(from, to, EdgeRecord { pos, seq });
    }

    fn verify_acyclic(&self) -> Result<()> {
        toposort(&self.graph, None)
            .map(|_| ())
            .map_err(|_| EngineError::CycleDetected { path: self.origin.clone() }.into())
    }

    fn set_inputs(&mut self, inputs: Map<String, Value>) {
        for port in &self.doc.inputs {
            let name = bare_name(&port.id);
            if let Some(value) = inputs.get(name) {
                if let Some(&idx) = self.node_ids.get(&port.id) {
                    self.graph[idx].val = Some(value.clone());
                }
            }
        }
    }

    fn next_ready(&self) -> Option<NodeIndex> {
        self.graph.node_indices().find(|&idx| {
            let node = &self.graph[idx];
            node.status.is_none()
                && self
                    .graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .all(|pred| self.graph[pred].status == Some(NodeStatus::Done))
        })
    }

    /// Compose the value a node consumes, per the predecessor-shape table (§4.6.3).
    fn make_val(&self, idx: NodeIndex) -> Value {
        let node = &self.graph[idx];
        let mut incoming: Vec<_> = self
            .graph
            .edges_directed(idx, Direction::Incoming)
            .map(|e| (e.source(), e.weight().pos, e.weight().seq))
            .collect();
        incoming.sort_by_key(|(_, pos, seq)| (*pos, *seq));

        match node.kind {
            NodeKind::Port => {
                if incoming.is_empty() {
                    return node.val.clone().unwrap_or(Value::Null);
                }
                if incoming.len() == 1 {
                    let (pred_idx, _, _) = incoming[0];
                    let pred = &self.graph[pred_idx];
                    return match pred.kind {
                        NodeKind::Port => pred.result.clone().unwrap_or(Value::Null),
                        NodeKind::Step(_) => pred
                            .result
                            .as_ref()
                            .and_then(Value::as_object)
                            .and_then(|m| m.get(last_segment(&node.id)))
                            .cloned()
                            .unwrap_or(Value::Null),
                    };
                }
                let series: Vec<Value> = incoming
                    .iter()
                    .map(|(pred_idx, _, _)| self.graph[*pred_idx].result.clone().unwrap_or(Value::Null))
                    .collect();
                Value::Array(series)
            }
            NodeKind::Step(_) => {
                let mut map = Map::new();
                for (pred_idx, _, _) in &incoming {
                    let pred = &self.graph[*pred_idx];
                    map.insert(last_segment(&pred.id).to_string(), pred.result.clone().unwrap_or(Value::Null));
                }
                Value::Object(map)
            }
        }
    }

    fn execute(&mut self, idx: NodeIndex) -> Result<()> {
        self.graph[idx].status = Some(NodeStatus::Running);
        let input_value = self.make_val(idx);

        let node_id = self.graph[idx].id.clone();
        let result = match &mut self.graph[idx].kind {
            NodeKind::Port => input_value,
            NodeKind::Step(runnable) => {
                let inputs = input_value.as_object().cloned().unwrap_or_default();
                let output = runnable
                    .run(inputs)
                    .with_context(|| format!("step '{node_id}' failed"))?;
                Value::Object(output)
            }
        };

        let node = &mut self.graph[idx];
        node.result = Some(result);
        node.status = Some(NodeStatus::Done);
        Ok(())
    }

    fn project_outputs(&self) -> Result<Map<String, Value>> {
        let mut projected = Map::new();
        for (name, port_id) in &self.output_names {
            let idx = self
                .node_ids
                .get(port_id)
                .ok_or_else(|| anyhow!("unknown output port '{port_id}'"))?;
            let value = self.graph[*idx].result.clone().unwrap_or(Value::Null);
            projected.insert(name.clone(), value);
        }
        Ok(projected)
    }

    pub fn run(&mut self, inputs: Map<String, Value>) -> Result<Map<String, Value>> {
        self.set_inputs(inputs);
        loop {
            let total = self.graph.node_count();
            let done = self
                .graph
                .node_indices()
                .filter(|&idx| self.graph[idx].status == Some(NodeStatus::Done))
                .count();
            if done == total {
                break;
            }
            match self.next_ready() {
                Some(idx) => self.execute(idx)?,
                None => return Err(EngineError::CycleDetected { path: self.origin.clone() }.into()),
            }
        }
        self.project_outputs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    fn write_doc(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn single_step_workflow_projects_output() {
        let dir = tempfile::tempdir().unwrap();
        write_doc(
            dir.path(),
            "square.json",
            r##"{
                "class": "ExpressionTool",
                "inputs": [{"id": "#x", "depth": 0}],
                "outputs": [{"id": "#result", "depth": 0}],
                "expression": {"value": "inputs.x * inputs.x"}
            }"##,
        );
        let wf_path = write_doc(
            dir.path(),
            "wf.json",
            r##"{
                "class": "Workflow",
                "inputs": [{"id": "#n"}],
                "outputs": [{"id": "#out", "links": [{"source": "#square/result"}]}],
                "steps": [{
                    "id": "#square",
                    "impl": "square.json",
                    "inputs": [{"id": "#square/x", "links": [{"source": "#n"}]}],
                    "outputs": [{"id": "#square/result"}]
                }]
            }"##,
        );

        let runnable = crate::loader::load(wf_path.to_str().unwrap(), None).unwrap();
        let mut workflow = match runnable {
            Runnable::Workflow(w) => w,
            _ => panic!("expected a workflow"),
        };
        let mut inputs = Map::new();
        inputs.insert("n".to_string(), serde_json::json!(4));
        let outputs = workflow.run(inputs).unwrap();
        assert_eq!(outputs.get("out"), Some(&serde_json::json!(16.0)));
    }

    #[test]
    fn omitted_input_falls_back_to_declared_default_value() {
        let dir = tempfile::tempdir().unwrap();
        write_doc(
            dir.path(),
            "square.json",
            r##"{
                "class": "ExpressionTool",
                "inputs": [{"id": "#x", "depth": 0}],
                "outputs": [{"id": "#result", "depth": 0}],
                "expression": {"value": "inputs.x * inputs.x"}
            }"##,
        );
        let wf_path = write_doc(
            dir.path(),
            "wf.json",
            r##"{
                "class": "Workflow",
                "inputs": [{"id": "#n", "value": 5}],
                "outputs": [{"id": "#out", "links": [{"source": "#square/result"}]}],
                "steps": [{
                    "id": "#square",
                    "impl": "square.json",
                    "inputs": [{"id": "#square/x", "links": [{"source": "#n"}]}],
                    "outputs": [{"id": "#square/result"}]
                }]
            }"##,
        );

        let mut workflow = load_workflow(&wf_path);
        let outputs = workflow.run(Map::new()).unwrap();
        assert_eq!(outputs.get("out"), Some(&serde_json::json!(25.0)));
    }

    #[test]
    fn unknown_link_source_is_rejected_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let wf_path = write_doc(
            dir.path(),
            "wf.json",
            r##"{
                "class": "Workflow",
                "inputs": [],
                "outputs": [{"id": "#out", "links": [{"source": "#missing"}]}],
                "steps": []
            }"##,
        );
        let err = crate::loader::load(wf_path.to_str().unwrap(), None).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    fn write_sum_of_squares_workflow(dir: &Path, name: &str) -> PathBuf {
        write_doc(
            dir,
            "ss_square.json",
            r##"{
                "class": "ExpressionTool",
                "inputs": [{"id": "#x", "depth": 0}],
                "outputs": [{"id": "#result", "depth": 0}],
                "expression": {"value": "inputs.x * inputs.x"}
            }"##,
        );
        write_doc(
            dir,
            "ss_sum.json",
            r##"{
                "class": "ExpressionTool",
                "inputs": [{"id": "#counts", "depth": 1}],
                "outputs": [{"id": "#total", "depth": 0}],
                "expression": {"value": "inputs.counts[0] + inputs.counts[1] + inputs.counts[2]"}
            }"##,
        );
        write_doc(
            dir,
            name,
            r##"{
                "class": "Workflow",
                "inputs": [{"id": "#arr"}],
                "outputs": [{"id": "#out", "links": [{"source": "#sum/total"}]}],
                "steps": [
                    {
                        "id": "#square",
                        "impl": "ss_square.json",
                        "inputs": [{"id": "#square/x", "links": [{"source": "#arr"}]}],
                        "outputs": [{"id": "#square/result"}]
                    },
                    {
                        "id": "#sum",
                        "impl": "ss_sum.json",
                        "inputs": [{"id": "#sum/counts", "links": [{"source": "#square/result"}]}],
                        "outputs": [{"id": "#sum/total"}]
                    }
                ]
            }"##,
        )
    }

    fn load_workflow(path: &Path) -> WorkflowRunnable {
        match crate::loader::load(path.to_str().unwrap(), None).unwrap() {
            Runnable::Workflow(w) => w,
            _ => panic!("expected a workflow"),
        }
    }

    #[test]
    fn two_step_workflow_scatters_then_aggregates() {
        let dir = tempfile::tempdir().unwrap();
        let wf_path = write_sum_of_squares_workflow(dir.path(), "ss_wf.json");

        let mut workflow = load_workflow(&wf_path);
        let mut inputs = Map::new();
        inputs.insert("arr".to_string(), serde_json::json!([1, 2, 3]));
        let outputs = workflow.run(inputs).unwrap();
        assert_eq!(outputs.get("out"), Some(&serde_json::json!(14.0)));
    }

    #[test]
    fn nested_workflow_wraps_inner_workflow_as_a_step() {
        let dir = tempfile::tempdir().unwrap();
        write_sum_of_squares_workflow(dir.path(), "inner_wf.json");
        write_doc(
            dir.path(),
            "double.json",
            r##"{
                "class": "ExpressionTool",
                "inputs": [{"id": "#x", "depth": 0}],
                "outputs": [{"id": "#result", "depth": 0}],
                "expression": {"value": "inputs.x * 2"}
            }"##,
        );
        let outer_path = write_doc(
            dir.path(),
            "outer_wf.json",
            r##"{
                "class": "Workflow",
                "inputs": [{"id": "#arr"}],
                "outputs": [{"id": "#final", "links": [{"source": "#double/result"}]}],
                "steps": [
                    {
                        "id": "#inner",
                        "impl": "inner_wf.json",
                        "inputs": [{"id": "#inner/arr", "links": [{"source": "#arr"}]}],
                        "outputs": [{"id": "#inner/out"}]
                    },
                    {
                        "id": "#double",
                        "impl": "double.json",
                        "inputs": [{"id": "#double/x", "links": [{"source": "#inner/out"}]}],
                        "outputs": [{"id": "#double/result"}]
                    }
                ]
            }"##,
        );

        let mut workflow = load_workflow(&outer_path);
        let mut inputs = Map::new();
        inputs.insert("arr".to_string(), serde_json::json!([1, 2, 3]));
        let outputs = workflow.run(inputs).unwrap();
        assert_eq!(outputs.get("final"), Some(&serde_json::json!(28.0)));
    }

    #[test]
    fn file_array_input_is_scattered_per_file_then_counts_are_summed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("file1.txt"), "find_me\nother\nfind_me\n").unwrap();
        fs::write(dir.path().join("file2.txt"), "other\nfind_me\n").unwrap();

        write_doc(
            dir.path(),
            "count.json",
            r##"{
                "class": "CommandLineTool",
                "inputs": [{"id": "#file", "depth": 0, "type": "File"}, {"id": "#pattern", "depth": 0}],
                "outputs": [{"id": "#result", "depth": 0}],
                "baseCmd": ["sh", "-c", "path=$(grep -o '\"path\": *\"[^\"]*\"' job.cwl.json | sed -n '1p' | cut -d'\"' -f4)\npattern=$(grep -o '\"pattern\": *\"[^\"]*\"' job.cwl.json | sed -n '1p' | cut -d'\"' -f4)\ncount=$(grep -c \"$pattern\" \"$path\" 2>/dev/null)\ncount=${count:-0}\nprintf '{\"result\": %s}' \"$count\" > result.cwl.json"]
            }"##,
        );
        write_doc(
            dir.path(),
            "sum_counts.json",
            r##"{
                "class": "ExpressionTool",
                "inputs": [{"id": "#counts", "depth": 1}],
                "outputs": [{"id": "#total", "depth": 0}],
                "expression": {"value": "inputs.counts[0] + inputs.counts[1]"}
            }"##,
        );
        let wf_path = write_doc(
            dir.path(),
            "line_count_wf.json",
            r##"{
                "class": "Workflow",
                "inputs": [{"id": "#files"}, {"id": "#pattern"}],
                "outputs": [{"id": "#result", "links": [{"source": "#sum/total"}]}],
                "steps": [
                    {
                        "id": "#count",
                        "impl": "count.json",
                        "inputs": [
                            {"id": "#count/file", "links": [{"source": "#files"}]},
                            {"id": "#count/pattern", "links": [{"source": "#pattern"}]}
                        ],
                        "outputs": [{"id": "#count/result"}]
                    },
                    {
                        "id": "#sum",
                        "impl": "sum_counts.json",
                        "inputs": [{"id": "#sum/counts", "links": [{"source": "#count/result"}]}],
                        "outputs": [{"id": "#sum/total"}]
                    }
                ]
            }"##,
        );

        let file1 = crate::value::file_handle(&dir.path().join("file1.txt"));
        let file2 = crate::value::file_handle(&dir.path().join("file2.txt"));
        let mut workflow = load_workflow(&wf_path);
        let mut inputs = Map::new();
        inputs.insert("files".to_string(), Value::Array(vec![file1, file2]));
        inputs.insert("pattern".to_string(), serde_json::json!("find_me"));
        let outputs = workflow.run(inputs).unwrap();
        assert_eq!(outputs.get("result"), Some(&serde_json::json!(3.0)));
    }

    #[test]
    fn self_feeding_step_ports_are_rejected_as_a_cycle() {
        let dir = tempfile::tempdir().unwrap();
        write_doc(
            dir.path(),
            "square.json",
            r##"{
                "class": "ExpressionTool",
                "inputs": [{"id": "#x", "depth": 0}],
                "outputs": [{"id": "#result", "depth": 0}],
                "expression": {"value": "inputs.x * inputs.x"}
            }"##,
        );
        let wf_path = write_doc(
            dir.path(),
            "cyclic_wf.json",
            r##"{
                "class": "Workflow",
                "inputs": [],
                "outputs": [],
                "steps": [{
                    "id": "#a",
                    "impl": "square.json",
                    "inputs": [{"id": "#a/x", "links": [{"source": "#a/result"}]}],
                    "outputs": [{"id": "#a/result"}]
                }]
            }"##,
        );
        let err = crate::loader::load(wf_path.to_str().unwrap(), None).unwrap_err();
        assert!(err.to_string().to_lowercase().contains("cycle"));
    }
}
