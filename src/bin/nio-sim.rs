//! Host CLI: loads an accelerator config and a small built-in-operator
//! description, runs one layer on the simulated tile grid, and prints the
//! resulting cycle report.
//!
//! The full ONNX-graph front-end is out of scope; `--graph` names one of the
//! reference `FlexNode`s from [`nio_sim::operator`] plus its literal input
//! data instead of a lowered compute graph.

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use ndarray::{Array2, Array4, ArrayD, IxDyn};
use serde::Deserialize;
use tracing::info;

use nio_sim::config::AcceleratorConfig;
use nio_sim::message::BinaryOperator;
use nio_sim::operator::conv2d::Conv2d;
use nio_sim::operator::elementwise::ElementWise;
use nio_sim::operator::gemm::Gemm;
use nio_sim::operator::matmul::MatMul;
use nio_sim::operator::relu::Relu;
use nio_sim::operator::reshape::{Reshape, Squeeze, Transpose};
use nio_sim::operator::FlexNode;
use nio_sim::system::AcceleratorSystem;
use nio_sim::trace::write_trace_file;

#[derive(Parser, Debug)]
#[command(name = "nio-sim", about = "Cycle-accurate tiled-accelerator simulator")]
struct Args {
    /// Path to a YAML description of one reference operator and its inputs.
    #[arg(long)]
    graph: PathBuf,

    /// Path to the accelerator YAML (tile grid shape, memory size, ...).
    #[arg(long)]
    config: PathBuf,

    /// Optional path to dump the memory transaction trace. Requires
    /// `log_memory_trace: true` in the accelerator config.
    #[arg(long)]
    trace: Option<PathBuf>,
}

#[derive(Deserialize)]
struct TensorSpec {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl TensorSpec {
    fn into_array(self) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data).expect("graph tensor data length must match its shape")
    }

    fn into_array2(self) -> Array2<f32> {
        assert_eq!(self.shape.len(), 2, "expected a rank-2 tensor");
        Array2::from_shape_vec((self.shape[0], self.shape[1]), self.data).expect("graph tensor data length must match its shape")
    }

    fn into_array4(self) -> Array4<f32> {
        assert_eq!(self.shape.len(), 4, "expected a rank-4 tensor");
        Array4::from_shape_vec((self.shape[0], self.shape[1], self.shape[2], self.shape[3]), self.data)
            .expect("graph tensor data length must match its shape")
    }
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum GraphSpec {
    Elementwise { op: BinaryOperator, lhs: TensorSpec, rhs: TensorSpec },
    Relu { input: TensorSpec },
    MatMul { lhs: TensorSpec, rhs: TensorSpec },
    Gemm {
        a: TensorSpec,
        b: TensorSpec,
        #[serde(default = "default_alpha")]
        alpha: f32,
        #[serde(default = "default_alpha")]
        beta: f32,
        #[serde(default)]
        trans_a: bool,
        #[serde(default)]
        trans_b: bool,
        #[serde(default)]
        bias: Option<TensorSpec>,
    },
    Conv2d {
        input: TensorSpec,
        weight: TensorSpec,
        #[serde(default)]
        bias: Option<Vec<f32>>,
        #[serde(default = "default_stride")]
        stride: (usize, usize),
    },
    Reshape { input: TensorSpec, shape: Vec<usize> },
    Transpose { input: TensorSpec, #[serde(default)] axes: Vec<usize> },
    Squeeze { input: TensorSpec, #[serde(default)] axes: Vec<usize> },
}

fn default_alpha() -> f32 {
    1.0
}

fn default_stride() -> (usize, usize) {
    (1, 1)
}

fn build_operator(spec: GraphSpec) -> Box<dyn FlexNode> {
    match spec {
        GraphSpec::Elementwise { op, lhs, rhs } => Box::new(ElementWise::new(op, lhs.into_array(), rhs.into_array(), 0)),
        GraphSpec::Relu { input } => Box::new(Relu::new(input.into_array(), 0)),
        GraphSpec::MatMul { lhs, rhs } => Box::new(MatMul::new(lhs.into_array2(), rhs.into_array2(), 0)),
        GraphSpec::Gemm { a, b, alpha, beta, trans_a, trans_b, bias } => Box::new(Gemm::new(
            a.into_array2(),
            b.into_array2(),
            alpha,
            beta,
            trans_a,
            trans_b,
            bias.map(TensorSpec::into_array2),
            0,
        )),
        GraphSpec::Conv2d { input, weight, bias, stride } => {
            Box::new(Conv2d::new(input.into_array4(), weight.into_array4(), bias, stride, 0))
        }
        GraphSpec::Reshape { input, shape } => Box::new(Reshape::new(input.into_array(), shape)),
        GraphSpec::Transpose { input, axes } => Box::new(Transpose::new(input.into_array(), axes)),
        GraphSpec::Squeeze { input, axes } => Box::new(Squeeze::new(input.into_array(), axes)),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = AcceleratorConfig::from_file(&args.config)?;
    let graph_text = fs::read_to_string(&args.graph)?;
    let graph: GraphSpec = serde_yaml::from_str(&graph_text)?;

    let mut system = AcceleratorSystem::new(&config);
    let mut op = build_operator(graph);

    op.map(&mut system)?;
    let commands = op.compile(&system, config.num_tile_rows, config.num_tile_cols);
    let report = if commands.is_empty() {
        info!(op = op.op_name(), "no tile commands to run, operator is host-only");
        nio_sim::system::LayerReport { cycles: 0, stalled_cycles: 0 }
    } else {
        system.run_layer(commands)
    };
    let output = op.unmap(&mut system)?;

    info!(
        op = op.op_name(),
        cycles = report.cycles,
        stalled_cycles = report.stalled_cycles,
        "layer complete"
    );
    println!("output shape: {:?}", output.shape());
    println!("output: {:?}", output);
    println!("cycles: {}, stalled_cycles: {}", report.cycles, report.stalled_cycles);

    if let Some(trace_path) = args.trace {
        let log = system.memory().transaction_log().ok_or("log_memory_trace was not enabled in the accelerator config")?;
        write_trace_file(&trace_path, log)?;
    }

    Ok(())
}
