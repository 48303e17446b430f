use confluence::arch::RegisterDictionary;
use confluence::chunks::MemoryChunks;
use confluence::state::SymbolicState;
use confluence::state::memory::IoProperty;
use confluence::{BasicOps, ConfluenceContext, SemanticOps, SymbolicValue};
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use petgraph::prelude::DiGraph;
use std::collections::{HashMap, VecDeque};
use tracing_subscriber::EnvFilter;
use z3::ast::BV;
use z3::{Config, Context};

/// Run a worklist dataflow pass over a diamond-shaped CFG and print what the
/// join node learns: the merged register, the weakened one-sided stores, and
/// the chunked view of the written buffer.
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "debug".into()))
        .with_target(false)
        .init();

    let z3 = Context::new(&Config::new());
    let ctx = ConfluenceContext::new(&z3, RegisterDictionary::amd64());
    let ops = BasicOps::with_solver(&z3);
    let buf = BV::new_const(&z3, "buf", 64);
    // the branch condition; at each merge, nonzero selects the incoming state
    let branch = SymbolicValue::variable(&z3, "branch", 1);

    let mut cfg: DiGraph<&str, ()> = DiGraph::new();
    let entry = cfg.add_node("entry");
    let then_arm = cfg.add_node("then");
    let else_arm = cfg.add_node("else");
    let join = cfg.add_node("join");
    cfg.add_edge(entry, then_arm, ());
    cfg.add_edge(entry, else_arm, ());
    cfg.add_edge(then_arm, join, ());
    cfg.add_edge(else_arm, join, ());

    let mut states: HashMap<NodeIndex, SymbolicState> = HashMap::new();
    states.insert(entry, ctx.fresh_state());
    let mut worklist = VecDeque::from([entry]);
    let mut visits = 0usize;
    while let Some(node) = worklist.pop_front() {
        visits += 1;
        tracing::info!("visiting {}", cfg[node]);
        let outgoing = transfer(cfg[node], states[&node].clone(), &z3, &buf);
        for succ in cfg.neighbors_directed(node, Direction::Outgoing) {
            let changed = match states.get_mut(&succ) {
                Some(existing) => existing.merge(&outgoing, &ops, &branch).changed(),
                None => {
                    states.insert(succ, outgoing.clone());
                    true
                }
            };
            if changed {
                worklist.push_back(succ);
            }
        }
    }
    tracing::info!("converged after {visits} node visits");

    let dictionary = &ctx.dictionary;
    let joined = &states[&join];
    let rax = dictionary.register("rax").unwrap();
    println!("rax at join: {}", joined.registers().inspect_register(rax).unwrap());

    println!("registers that moved between entry and join:");
    for register in joined.diff(&states[&entry], ops.solver()) {
        println!("  {}", register.display(dictionary));
    }

    println!("chunked view of memory at the join:");
    let view = MemoryChunks::new(&states[&entry], joined, false);
    for chunk in &view {
        println!("  {chunk}");
        for (offset, value) in chunk.cells() {
            println!("    {:+}: {}", offset, value);
        }
    }
}

/// The per-node semantics: tiny straight-line effects standing in for a real
/// instruction walk.
fn transfer<'ctx>(
    name: &str,
    mut state: SymbolicState<'ctx>,
    z3: &'ctx Context,
    buf: &BV<'ctx>,
) -> SymbolicState<'ctx> {
    let rax = state.dictionary().register("rax").unwrap();
    let store = |state: &mut SymbolicState<'ctx>, offset: u64, byte: u64, pc: u64| {
        let address = SymbolicValue::new(buf.bvadd(&BV::from_u64(z3, offset, 64)), false);
        let cell = state
            .memory_mut()
            .write(address, SymbolicValue::constant(z3, byte, 8));
        cell.add_writer(pc);
        cell.add_io_property(IoProperty::Written);
    };
    match name {
        "entry" => {
            state
                .registers_mut()
                .write_register(rax, SymbolicValue::constant(z3, 0, 64))
                .unwrap();
        }
        "then" => {
            state
                .registers_mut()
                .write_register(rax, SymbolicValue::constant(z3, 1, 64))
                .unwrap();
            store(&mut state, 0, 0x11, 0x401000);
            store(&mut state, 1, 0x22, 0x401004);
        }
        "else" => {
            state
                .registers_mut()
                .write_register(rax, SymbolicValue::constant(z3, 2, 64))
                .unwrap();
            store(&mut state, 0, 0x33, 0x401010);
            store(&mut state, 3, 0x44, 0x401014);
        }
        _ => {}
    }
    state
}
