//! The Runnable interface: a shared `run(inputs) -> outputs` contract over the three document
//! variants, wrapped by implicit elementwise scatter (§4.3).

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde_json::{Map, Value};

use crate::document::PortDoc;
use crate::error::EngineError;
use crate::expression::ExpressionTool;
use crate::process::ProcessTool;
use crate::value::{bare_name, depth_of};
use crate::workflow::WorkflowRunnable;

#[derive(Debug)]
pub enum Runnable {
    Process(ProcessTool),
    Expression(ExpressionTool),
    Workflow(WorkflowRunnable),
}

impl Runnable {
    fn input_ports(&self) -> &[PortDoc] {
        match self {
            Runnable::Process(p) => &p.doc.inputs,
            Runnable::Expression(e) => &e.doc.inputs,
            Runnable::Workflow(w) => &w.doc.inputs,
        }
    }

    fn run_inner(&mut self, inputs: Map<String, Value>) -> Result<Map<String, Value>> {
        match self {
            Runnable::Process(p) => p.run(inputs),
            Runnable::Expression(e) => e.run(inputs),
            Runnable::Workflow(w) => w.run(inputs),
        }
    }

    /// Apply the implicit-scatter wrapper, then dispatch to the variant-specific body.
    pub fn run(&mut self, inputs: Map<String, Value>) -> Result<Map<String, Value>> {
        let expected_depths: BTreeMap<String, usize> = self
            .input_ports()
            .iter()
            .map(|p| (bare_name(&p.id).to_string(), p.depth))
            .collect();

        let mismatched: Vec<(String, usize, usize)> = inputs
            .iter()
            .filter_map(|(name, value)| {
                expected_depths.get(name).and_then(|&expected| {
                    let actual = depth_of(value);
                    (actual != expected).then_some((name.clone(), expected, actual))
                })
            })
            .collect();

        if mismatched.is_empty() {
            return self.run_inner(inputs);
        }

        let over_nested: Vec<&(String, usize, usize)> =
            mismatched.iter().filter(|(_, e, a)| a > e).collect();
        let under_nested: Vec<&(String, usize, usize)> =
            mismatched.iter().filter(|(_, e, a)| a < e).collect();

        if over_nested.len() > 1 {
            bail!(EngineError::ScatterAmbiguous {
                ports: over_nested.iter().map(|(n, _, _)| n.clone()).collect(),
            });
        }
        if !under_nested.is_empty() {
            let (port, expected, actual) = under_nested[0].clone();
            bail!(EngineError::UnderNested {
                port,
                expected,
                actual
            });
        }

        let (port, expected_depth, actual_depth) = over_nested[0].clone();
        let levels = actual_depth - expected_depth;
        if levels != 1 {
            bail!(EngineError::ScatterUnsupported { port, levels });
        }

        self.scatter(inputs, &port)
    }

    fn scatter(&mut self, inputs: Map<String, Value>, port: &str) -> Result<Map<String, Value>> {
        let elements = inputs
            .get(port)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut per_element_results: Vec<Map<String, Value>> = Vec::with_capacity(elements.len());
        for element in elements {
            let mut scattered_inputs = inputs.clone();
            scattered_inputs.insert(port.to_string(), element);
            per_element_results.push(self.run_inner(scattered_inputs)?);
        }

        let mut output_keys: Vec<String> = Vec::new();
        for result in &per_element_results {
            for key in result.keys() {
                if !output_keys.contains(key) {
                    output_keys.push(key.clone());
                }
            }
        }

        let mut aggregated = Map::new();
        for key in output_keys {
            let series: Vec<Value> = per_element_results
                .iter()
                .map(|r| r.get(&key).cloned().unwrap_or(Value::Null))
                .collect();
            aggregated.insert(key, Value::Array(series));
        }
        Ok(aggregated)
    }
}
