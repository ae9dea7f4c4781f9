//! Graph diagnostics: a per-node performance table and a Graphviz dump.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use log::debug;

use crate::core::arena::Context;
use crate::core::tensor::TensorId;
use crate::error::Result;
use crate::graph::Graph;

/// Print the graph: one line per node with shape, op, gradient marker and
/// accumulated perf counters, then per-op totals.
pub fn graph_print(ctx: &Context, graph: &Graph) {
    let mut per_op_us: BTreeMap<&'static str, u64> = BTreeMap::new();

    println!("=== GRAPH ===");
    debug!("n_threads = {}", graph.n_threads);

    println!("n_nodes = {}", graph.nodes().len());
    for (i, &id) in graph.nodes().iter().enumerate() {
        let node = ctx.tensor(id);
        *per_op_us.entry(node.op().label()).or_default() += node.perf_time_us();

        let marker = if node.is_param() {
            "x"
        } else if node.grad().is_some() {
            "g"
        } else {
            " "
        };
        let runs = node.perf_runs().max(1) as f64;
        println!(
            " - {:3}: [ {:6}, {:6}, {:6}] {:16} {} ({:3}) wall = {:7.3} / {:7.3} ms",
            i,
            node.ne()[0],
            node.ne()[1],
            node.ne()[2],
            node.op().label(),
            marker,
            node.perf_runs(),
            node.perf_time_us() as f64 / 1000.0,
            node.perf_time_us() as f64 / 1000.0 / runs,
        );
    }

    println!("n_leafs = {}", graph.leafs().len());
    for (i, &id) in graph.leafs().iter().enumerate() {
        let leaf = ctx.tensor(id);
        println!(
            " - {:3}: [ {:6}, {:6}] {:8}",
            i,
            leaf.ne()[0],
            leaf.ne()[1],
            leaf.op().label(),
        );
    }

    for (label, us) in &per_op_us {
        println!("perf_total_per_op_us[{label:>16}] = {:7.3} ms", *us as f64 / 1000.0);
    }

    println!("========================================");
}

fn node_name(id: TensorId) -> String {
    format!("t{}", id.0)
}

/// Write the backward graph `gb` as Graphviz. When the matching forward
/// graph `gf` is given, nodes that keep their gradient across passes are
/// colored differently from intermediate ones.
pub fn graph_dump_dot(
    ctx: &Context,
    gb: &Graph,
    gf: Option<&Graph>,
    filename: impl AsRef<Path>,
) -> Result<()> {
    let file = File::create(filename.as_ref())?;
    let mut fp = BufWriter::new(file);

    writeln!(fp, "digraph G {{")?;
    writeln!(fp, "  newrank = true;")?;
    writeln!(fp, "  rankdir = LR;")?;

    for (i, &id) in gb.nodes().iter().enumerate() {
        let node = ctx.tensor(id);

        if gb.get_parent(ctx, id).is_some() {
            continue;
        }

        let color = if node.is_param() {
            "yellow"
        } else if node.grad().is_some() {
            if gf.map(|g| g.find(id)).unwrap_or(true) {
                "green"
            } else {
                "lightblue"
            }
        } else {
            "white"
        };

        write!(
            fp,
            "  \"{}\" [ style = filled; fillcolor = {}; shape = record; label=\"{} [{}, {}] | <x>{}",
            node_name(id),
            color,
            i,
            node.ne()[0],
            node.ne()[1],
            node.op().symbol(),
        )?;
        if let Some(grad) = node.grad() {
            writeln!(fp, " | <g>{}\"; ]", ctx.tensor(grad).op().symbol())?;
        } else {
            writeln!(fp, "\"; ]")?;
        }
    }

    for (i, &id) in gb.leafs().iter().enumerate() {
        let leaf = ctx.tensor(id);
        if leaf.nelements() == 1 {
            writeln!(
                fp,
                "  \"{}\" [ style = filled; fillcolor = pink; shape = record; label=\"<x>{:.1e}\"; ]",
                node_name(id),
                ctx.get_f32_1d(id, 0),
            )?;
        } else {
            writeln!(
                fp,
                "  \"{}\" [ style = filled; fillcolor = pink; shape = record; label=\"<x>CONST {} [{}, {}]\"; ]",
                node_name(id),
                i,
                leaf.ne()[0],
                leaf.ne()[1],
            )?;
        }
    }

    for &id in gb.nodes() {
        let node = ctx.tensor(id);
        let parent = gb.get_parent(ctx, id);

        for (src, label) in [(node.src0(), "x"), (node.src1(), "y")] {
            let Some(src) = src else { continue };
            let src_parent = gb.get_parent(ctx, src);
            writeln!(
                fp,
                "  \"{}\":{} -> \"{}\":{} [ arrowhead = {}; style = {}; label = \"{}\"; ]",
                node_name(src_parent.unwrap_or(src)),
                if src_parent.is_some() { "g" } else { "x" },
                node_name(parent.unwrap_or(id)),
                if parent.is_some() { "g" } else { "x" },
                if parent.is_some() { "empty" } else { "vee" },
                if parent.is_some() { "dashed" } else { "solid" },
                label,
            )?;
        }
    }

    for &id in gb.leafs() {
        let leaf = ctx.tensor(id);
        for (src, label) in [(leaf.src0(), "x"), (leaf.src1(), "y")] {
            let Some(src) = src else { continue };
            writeln!(
                fp,
                "  \"{}\":x -> \"{}\":x [ label = \"{}\"; ]",
                node_name(src),
                node_name(id),
                label,
            )?;
        }
    }

    writeln!(fp, "}}")?;

    debug!("dot graph written to {}", filename.as_ref().display());
    Ok(())
}
