//! strata-demo: Run a built-in control-flow graph through a session.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use serde::Serialize;

use strata_session::cli;
use strata_session::config::SessionConfig;
use strata_session::error::SessionError;
use strata_session::graph::{Graph, GraphBuilder, Kernel, OpKind, OperationSpec};
use strata_session::invoke::FunctionLibrary;
use strata_session::memory::{MemoryManager, MemoryStats};
use strata_session::session::{ExecutedOp, OutputValue, Session, SessionStats};
use strata_session::tensor::Tensor;
use strata_session::select_backend;

#[derive(Parser)]
#[command(name = "strata-demo", about = "Execute a built-in computation graph")]
struct Args {
    /// Scenario: add, cond, loop, invoke
    #[arg(value_parser = validate_scenario)]
    scenario: String,

    /// Branch taken by the cond scenario
    #[arg(long, default_value = "true")]
    predicate: bool,

    /// Loop bound for the loop scenario, recursion depth for invoke
    #[arg(short = 'n', long, default_value = "10")]
    iterations: u32,

    /// Cached buffers kept per free-list key (overrides STRATA_FREE_LIST_DEPTH)
    #[arg(long)]
    free_list_depth: Option<usize>,

    /// Cap on nested invocations (overrides STRATA_MAX_INVOKE_DEPTH)
    #[arg(long)]
    max_invoke_depth: Option<usize>,

    /// JSON file with placeholder values, replacing the scenario defaults
    #[arg(short = 'i', long)]
    inputs: Option<PathBuf>,

    /// Include the executed-operation trace in the output
    #[arg(long)]
    trace: bool,

    /// Output format: text or json
    #[arg(long, default_value = "text", value_parser = validate_output_format)]
    output_format: String,

    /// Suppress all logging
    #[arg(long)]
    log_disable: bool,
}

fn validate_scenario(s: &str) -> Result<String, String> {
    match s {
        "add" | "cond" | "loop" | "invoke" => Ok(s.to_string()),
        _ => Err(format!(
            "Unknown scenario '{}'. Options: add, cond, loop, invoke",
            s
        )),
    }
}

fn validate_output_format(s: &str) -> Result<String, String> {
    match s {
        "text" | "json" => Ok(s.to_string()),
        _ => Err(format!(
            "Unknown output format '{}'. Options: text, json",
            s
        )),
    }
}

#[derive(Serialize)]
struct OutputJson {
    name: String,
    kind: &'static str,
    shapes: Vec<Vec<usize>>,
    data: Vec<Vec<f32>>,
}

#[derive(Serialize)]
struct ResultJson<'a> {
    scenario: &'a str,
    outputs: Vec<OutputJson>,
    stats: SessionStats,
    memory: MemoryStats,
    elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace: Option<&'a [ExecutedOp]>,
}

struct Scenario {
    graph: Graph,
    library: FunctionLibrary,
    outputs: Vec<&'static str>,
    inputs: HashMap<String, Tensor>,
}

fn main() {
    let args = Args::parse();
    cli::init_logging(args.log_disable);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = SessionConfig::from_env()?;
    if let Some(depth) = args.free_list_depth {
        config = config.with_free_list_depth(depth);
    }
    if args.max_invoke_depth.is_some() {
        config = config.with_max_invoke_depth(args.max_invoke_depth);
    }
    config.record_trace = args.trace;

    let mut scenario = match args.scenario.as_str() {
        "add" => add_scenario()?,
        "cond" => cond_scenario(args.predicate)?,
        "loop" => loop_scenario(args.iterations)?,
        _ => invoke_scenario(args.iterations)?,
    };
    if let Some(path) = &args.inputs {
        scenario.inputs = cli::read_inputs(path)?;
    }

    let backend = select_backend();
    let memory = Arc::new(MemoryManager::from_config(Arc::clone(&backend), &config));
    let session = Session::new(scenario.graph)
        .with_backend(backend)
        .with_memory(Arc::clone(&memory))
        .with_library(scenario.library)
        .with_config(config);

    let start = Instant::now();
    let result = session.execute(&scenario.outputs, &scenario.inputs)?;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    if args.output_format == "json" {
        let outputs = result
            .outputs()
            .iter()
            .map(|(name, value)| output_json(name, value))
            .collect();
        let json = ResultJson {
            scenario: &args.scenario,
            outputs,
            stats: *result.stats(),
            memory: memory.stats(),
            elapsed_ms,
            trace: args.trace.then(|| result.trace()),
        };
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        for (name, value) in result.outputs() {
            match value {
                OutputValue::Array(t) => println!("{} {:?} = {:?}", name, t.shape(), values(t)),
                OutputValue::List(items) => {
                    let all: Vec<Vec<f32>> = items.iter().map(values).collect();
                    println!("{} list[{}] = {:?}", name, items.len(), all);
                }
                OutputValue::Empty => println!("{} = <not produced>", name),
            }
        }
        if args.trace {
            for op in result.trace() {
                println!("  {} (frame {}, iteration {})", op.name, op.frame.0, op.iteration);
            }
        }
        let stats = result.stats();
        let mem = memory.stats();
        eprintln!(
            "\n{} ops executed, {} pruned, {} iterations, {} invocations in {:.2} ms",
            stats.ops_executed, stats.ops_pruned, stats.iterations, stats.invocations, elapsed_ms
        );
        eprintln!(
            "memory: {} allocations, {} reuses, {} cached",
            mem.allocations,
            mem.reuses,
            memory.cached_len()
        );
    }

    Ok(())
}

fn values(t: &Tensor) -> Vec<f32> {
    (0..t.n_elements()).map(|i| t.get_f32(i)).collect()
}

fn output_json(name: &str, value: &OutputValue) -> OutputJson {
    let (kind, tensors): (&'static str, Vec<&Tensor>) = match value {
        OutputValue::Array(t) => ("array", vec![t]),
        OutputValue::List(items) => ("list", items.iter().collect()),
        OutputValue::Empty => ("empty", Vec::new()),
    };
    OutputJson {
        name: name.to_string(),
        kind,
        shapes: tensors.iter().map(|t| t.shape().to_vec()).collect(),
        data: tensors.iter().map(|t| values(t)).collect(),
    }
}

fn named(pairs: Vec<(&str, Tensor)>) -> HashMap<String, Tensor> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn add_scenario() -> Result<Scenario, SessionError> {
    let mut b = GraphBuilder::new("add");
    b.placeholder("x")?;
    b.placeholder("y")?;
    b.computed("out")?;
    b.add_operation(OperationSpec::kernel("add", Kernel::Add).inputs(["x", "y"]).outputs(["out"]))?;
    Ok(Scenario {
        graph: b.build()?,
        library: FunctionLibrary::new(),
        outputs: vec!["out"],
        inputs: named(vec![
            ("x", Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0])),
            ("y", Tensor::new(vec![2, 2], vec![1.0, 1.0, 1.0, 1.0])),
        ]),
    })
}

/// out = p ? x * 2 : -x
fn cond_scenario(predicate: bool) -> Result<Scenario, SessionError> {
    let mut b = GraphBuilder::new("cond");
    b.placeholder("p")?;
    b.placeholder("x")?;
    for v in ["x_t", "x_f", "doubled", "negated", "out"] {
        b.computed(v)?;
    }
    b.add_operation(OperationSpec::new("switch", OpKind::Switch).inputs(["p", "x"]).outputs(["x_t", "x_f"]))?;
    b.add_operation(OperationSpec::kernel("double", Kernel::Scale(2.0)).inputs(["x_t"]).outputs(["doubled"]))?;
    b.add_operation(OperationSpec::kernel("negate", Kernel::Neg).inputs(["x_f"]).outputs(["negated"]))?;
    b.add_operation(OperationSpec::new("merge", OpKind::Merge).inputs(["doubled", "negated"]).outputs(["out"]))?;
    Ok(Scenario {
        graph: b.build()?,
        library: FunctionLibrary::new(),
        outputs: vec!["out", "doubled", "negated"],
        inputs: named(vec![
            ("p", Tensor::scalar_bool(predicate)),
            ("x", Tensor::new(vec![3], vec![1.0, -2.0, 3.0])),
        ]),
    })
}

/// i = 0; x = 1; while i < n { i += 1; x *= 2 }
fn loop_scenario(n: u32) -> Result<Scenario, SessionError> {
    let mut b = GraphBuilder::new("loop");
    for p in ["i0", "n", "x0"] {
        b.placeholder(p)?;
    }
    for v in [
        "i_enter", "x_enter", "n_enter", "pred", "i_true", "i_false", "x_true", "x_false", "i_body",
        "x_body", "i_out", "x_out",
    ] {
        b.computed(v)?;
    }
    for v in ["i_cur", "x_cur", "i_next", "x_next"] {
        b.loop_carried(v)?;
    }
    let enter = |name: &str, is_constant: bool, input: &str, output: &str| {
        OperationSpec::new(
            name,
            OpKind::Enter {
                frame: "while".into(),
                is_constant,
            },
        )
        .inputs([input])
        .outputs([output])
    };
    let specs = vec![
        enter("enter_i", false, "i0", "i_enter"),
        enter("enter_x", false, "x0", "x_enter"),
        enter("enter_n", true, "n", "n_enter"),
        OperationSpec::new("merge_i", OpKind::Merge).inputs(["i_enter", "i_next"]).outputs(["i_cur"]),
        OperationSpec::new("merge_x", OpKind::Merge).inputs(["x_enter", "x_next"]).outputs(["x_cur"]),
        OperationSpec::kernel("cond", Kernel::Less).inputs(["i_cur", "n_enter"]).outputs(["pred"]),
        OperationSpec::new("switch_i", OpKind::Switch).inputs(["pred", "i_cur"]).outputs(["i_true", "i_false"]),
        OperationSpec::new("switch_x", OpKind::Switch).inputs(["pred", "x_cur"]).outputs(["x_true", "x_false"]),
        OperationSpec::kernel("inc", Kernel::AddScalar(1.0)).inputs(["i_true"]).outputs(["i_body"]),
        OperationSpec::kernel("dbl", Kernel::Scale(2.0)).inputs(["x_true"]).outputs(["x_body"]),
        OperationSpec::new("next_i", OpKind::NextIteration).inputs(["i_body"]).outputs(["i_next"]),
        OperationSpec::new("next_x", OpKind::NextIteration).inputs(["x_body"]).outputs(["x_next"]),
        OperationSpec::new("exit_i", OpKind::Exit).inputs(["i_false"]).outputs(["i_out"]),
        OperationSpec::new("exit_x", OpKind::Exit).inputs(["x_false"]).outputs(["x_out"]),
    ];
    for spec in specs {
        b.add_operation(spec)?;
    }
    Ok(Scenario {
        graph: b.build()?,
        library: FunctionLibrary::new(),
        outputs: vec!["i_out", "x_out"],
        inputs: named(vec![
            ("i0", Tensor::scalar(0.0)),
            ("n", Tensor::scalar(n as f32)),
            ("x0", Tensor::scalar(1.0)),
        ]),
    })
}

/// countdown(x) = x > 0 ? countdown(x - 1) + 2 : x
fn invoke_scenario(n: u32) -> Result<Scenario, SessionError> {
    let mut b = GraphBuilder::new("countdown");
    b.placeholder("x")?;
    b.constant("zero", Tensor::scalar(0.0))?;
    for v in ["pos", "x_t", "x_f", "x_dec", "rec", "x_rec", "y"] {
        b.computed(v)?;
    }
    let specs = vec![
        OperationSpec::kernel("pos", Kernel::Greater).inputs(["x", "zero"]).outputs(["pos"]),
        OperationSpec::new("switch", OpKind::Switch).inputs(["pos", "x"]).outputs(["x_t", "x_f"]),
        OperationSpec::kernel("dec", Kernel::AddScalar(-1.0)).inputs(["x_t"]).outputs(["x_dec"]),
        OperationSpec::new(
            "recurse",
            OpKind::Invoke {
                function: "countdown".into(),
            },
        )
        .inputs(["x_dec"])
        .outputs(["rec"]),
        OperationSpec::kernel("add2", Kernel::AddScalar(2.0)).inputs(["rec"]).outputs(["x_rec"]),
        OperationSpec::new("merge", OpKind::Merge).inputs(["x_rec", "x_f"]).outputs(["y"]),
    ];
    for spec in specs {
        b.add_operation(spec)?;
    }
    b.declare_outputs(["y"])?;
    let graph = b.build()?;

    let mut library = FunctionLibrary::new();
    library.register("countdown", graph.clone())?;
    Ok(Scenario {
        graph,
        library,
        outputs: vec!["y"],
        inputs: named(vec![("x", Tensor::scalar(n as f32))]),
    })
}
