//! Symbolic composition of [`Function`]s into new functions.
//!
//! A [`GraphBuilder`] records nodes in creation order, so every node only
//! refers to earlier ones and a single forward sweep evaluates the graph.
//! Values are flat column-major vectors; a call node stores the outputs of
//! its callee back to back and slices pick them apart again.

use std::sync::Arc;

use log::debug;

use crate::autodiff::Dual;
use crate::error::{Error, Result};
use crate::function::{check_arguments, Function, FunctionRef, Port, Shape};
use crate::traits::GraphScalar;

/// Handle to a node inside a [`GraphBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sym {
    id: usize,
    len: usize,
}

impl Sym {
    /// Number of entries the node evaluates to.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone)]
enum Node {
    Input(usize),
    Constant(Vec<f64>),
    Slice { arg: usize, offset: usize, len: usize },
    Concat(Vec<usize>),
    /// Sum of constant multiples of equally sized nodes.
    Linear(Vec<(f64, usize)>),
    /// Product of a one-entry node with another node.
    ScalarMul { scalar: usize, arg: usize },
    Call { function: FunctionRef, args: Vec<usize> },
}

/// Records the nodes of a function under construction.
#[derive(Debug)]
pub struct GraphBuilder {
    name: String,
    inputs: Vec<Port>,
    nodes: Vec<Node>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            nodes: Vec::new(),
        }
    }

    fn push(&mut self, node: Node, len: usize) -> Sym {
        self.nodes.push(node);
        Sym {
            id: self.nodes.len() - 1,
            len,
        }
    }

    fn mismatch(&self, what: &str, expected: usize, actual: usize) -> Error {
        Error::DimensionMismatch {
            function: self.name.clone(),
            port: what.to_string(),
            expected,
            actual,
        }
    }

    /// Declares the next input of the function.
    pub fn input(&mut self, name: impl Into<String>, shape: Shape) -> Sym {
        let index = self.inputs.len();
        self.inputs.push(Port::new(name, shape));
        self.push(Node::Input(index), shape.numel())
    }

    pub fn constant(&mut self, values: Vec<f64>) -> Sym {
        let len = values.len();
        self.push(Node::Constant(values), len)
    }

    /// Entries `offset..offset + len` of `arg`.
    pub fn slice(&mut self, arg: Sym, offset: usize, len: usize) -> Result<Sym> {
        if offset + len > arg.len {
            return Err(self.mismatch("slice bound", arg.len, offset + len));
        }
        Ok(self.push(
            Node::Slice {
                arg: arg.id,
                offset,
                len,
            },
            len,
        ))
    }

    /// Column `col` of `arg` viewed as a matrix with `rows` rows.
    pub fn column(&mut self, arg: Sym, rows: usize, col: usize) -> Result<Sym> {
        self.slice(arg, col * rows, rows)
    }

    /// Stacks the entries of `parts` one after another (horizontal concatenation of
    /// columns, or vertical concatenation of vectors).
    pub fn concat(&mut self, parts: &[Sym]) -> Sym {
        let len = parts.iter().map(|s| s.len).sum();
        self.push(Node::Concat(parts.iter().map(|s| s.id).collect()), len)
    }

    /// `Σ coeff_k * term_k`; all terms must have the same length.
    pub fn linear(&mut self, terms: &[(f64, Sym)]) -> Result<Sym> {
        let first = terms
            .first()
            .ok_or_else(|| Error::InvalidArgument("empty linear combination".to_string()))?;
        let len = first.1.len;
        for (_, term) in terms {
            if term.len != len {
                return Err(self.mismatch("linear combination term", len, term.len));
            }
        }
        Ok(self.push(
            Node::Linear(terms.iter().map(|&(c, s)| (c, s.id)).collect()),
            len,
        ))
    }

    pub fn add(&mut self, a: Sym, b: Sym) -> Result<Sym> {
        self.linear(&[(1.0, a), (1.0, b)])
    }

    pub fn sub(&mut self, a: Sym, b: Sym) -> Result<Sym> {
        self.linear(&[(1.0, a), (-1.0, b)])
    }

    /// `scalar * arg` where `scalar` has exactly one entry.
    pub fn scalar_mul(&mut self, scalar: Sym, arg: Sym) -> Result<Sym> {
        if scalar.len != 1 {
            return Err(self.mismatch("scalar factor", 1, scalar.len));
        }
        Ok(self.push(
            Node::ScalarMul {
                scalar: scalar.id,
                arg: arg.id,
            },
            arg.len,
        ))
    }

    /// Calls `function` on `args` and returns one handle per output.
    pub fn call(&mut self, function: &FunctionRef, args: &[Sym]) -> Result<Vec<Sym>> {
        if args.len() != function.n_in() {
            return Err(Error::DimensionMismatch {
                function: function.name().to_string(),
                port: "argument count".to_string(),
                expected: function.n_in(),
                actual: args.len(),
            });
        }
        for (port, arg) in function.inputs().iter().zip(args) {
            if port.shape.numel() != arg.len {
                return Err(Error::DimensionMismatch {
                    function: function.name().to_string(),
                    port: format!("input '{}'", port.name),
                    expected: port.shape.numel(),
                    actual: arg.len,
                });
            }
        }
        let total = function.outputs().iter().map(|p| p.shape.numel()).sum();
        let call = self.push(
            Node::Call {
                function: Arc::clone(function),
                args: args.iter().map(|s| s.id).collect(),
            },
            total,
        );
        let mut offset = 0;
        let mut outputs = Vec::with_capacity(function.n_out());
        for port in function.outputs() {
            let len = port.shape.numel();
            outputs.push(self.slice(call, offset, len)?);
            offset += len;
        }
        Ok(outputs)
    }

    /// Finalizes the graph with the given named outputs.
    pub fn build(self, outputs: &[(&str, Sym, Shape)]) -> Result<GraphFunction> {
        let mut ports = Vec::with_capacity(outputs.len());
        let mut ids = Vec::with_capacity(outputs.len());
        for &(name, sym, shape) in outputs {
            if shape.numel() != sym.len {
                return Err(Error::DimensionMismatch {
                    function: self.name.clone(),
                    port: format!("output '{name}'"),
                    expected: shape.numel(),
                    actual: sym.len,
                });
            }
            ports.push(Port::new(name, shape));
            ids.push(sym.id);
        }
        debug!(
            "built graph '{}': {} inputs, {} outputs, {} nodes",
            self.name,
            self.inputs.len(),
            ports.len(),
            self.nodes.len()
        );
        Ok(GraphFunction {
            name: self.name,
            inputs: self.inputs,
            outputs: ports,
            nodes: self.nodes.into(),
            output_ids: ids,
        })
    }
}

/// An immutable function defined by a recorded graph.
#[derive(Debug, Clone)]
pub struct GraphFunction {
    name: String,
    inputs: Vec<Port>,
    outputs: Vec<Port>,
    nodes: Arc<[Node]>,
    output_ids: Vec<usize>,
}

impl GraphFunction {
    /// Number of recorded nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of call nodes, i.e. how many times other functions are embedded.
    pub fn call_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Call { .. }))
            .count()
    }

    fn evaluate<T: GraphScalar>(&self, args: &[&[T]]) -> Result<Vec<Vec<T>>> {
        check_arguments(self, args)?;
        let mut values: Vec<Vec<T>> = Vec::with_capacity(self.nodes.len());
        for node in self.nodes.iter() {
            let value = match node {
                Node::Input(index) => args[*index].to_vec(),
                Node::Constant(data) => data.iter().map(|&v| T::lift(v)).collect(),
                Node::Slice { arg, offset, len } => values[*arg][*offset..*offset + *len].to_vec(),
                Node::Concat(parts) => parts
                    .iter()
                    .flat_map(|&id| values[id].iter().copied())
                    .collect(),
                Node::Linear(terms) => {
                    let len = values[terms[0].1].len();
                    let mut acc = vec![T::zero(); len];
                    for &(coeff, id) in terms {
                        if coeff == 0.0 {
                            continue;
                        }
                        let c = T::lift(coeff);
                        for (a, &v) in acc.iter_mut().zip(&values[id]) {
                            *a = *a + c * v;
                        }
                    }
                    acc
                }
                Node::ScalarMul { scalar, arg } => {
                    let s = values[*scalar][0];
                    values[*arg].iter().map(|&v| s * v).collect()
                }
                Node::Call { function, args } => {
                    let views: Vec<&[T]> = args.iter().map(|&id| values[id].as_slice()).collect();
                    let out = T::invoke(function.as_ref(), &views)?;
                    out.into_iter().flatten().collect()
                }
            };
            values.push(value);
        }
        Ok(self
            .output_ids
            .iter()
            .map(|&id| values[id].clone())
            .collect())
    }
}

impl Function for GraphFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> &[Port] {
        &self.inputs
    }

    fn outputs(&self) -> &[Port] {
        &self.outputs
    }

    fn eval(&self, args: &[&[f64]]) -> Result<Vec<Vec<f64>>> {
        self.evaluate(args)
    }

    fn eval_dual(&self, args: &[&[Dual]]) -> Result<Vec<Vec<Dual>>> {
        self.evaluate(args)
    }
}
