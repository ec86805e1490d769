use camino::Utf8PathBuf;
use taskfuse::{Engine, GraphError, Invocation, Op, TaskGraph, Value};

fn graph() -> TaskGraph {
    let half = Op::new("math.half", |call: &Invocation| {
        Ok(Value::Int(call.arg(0)?.as_i64().unwrap_or_default() / 2))
    });
    let x = half.call([10]).unwrap();
    let y = x.add(half.call([4]).unwrap()).unwrap();
    TaskGraph::collect([y]).graph
}

fn path(dir: &tempfile::TempDir, name: &str) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().join(name)).unwrap()
}

#[test]
fn visualize_by_extension() {
    let dir = tempfile::tempdir().unwrap();
    let graph = graph();

    let dot = path(&dir, "graph.dot");
    graph.visualize(&dot).unwrap();
    let written = std::fs::read_to_string(&dot).unwrap();
    assert!(written.starts_with("digraph {"));
    assert_eq!(written.matches(" -> ").count(), 2);

    let mermaid = path(&dir, "graph.mmd");
    graph.visualize(&mermaid).unwrap();
    assert_eq!(std::fs::read_to_string(&mermaid).unwrap(), graph.to_string());

    let unknown = path(&dir, "graph.txt");
    assert!(matches!(graph.visualize(&unknown), Err(GraphError::UnsupportedFormat(_))));
    assert!(!unknown.exists());
}

#[test]
fn diagnostics_cover_every_task_that_ran() {
    let graph = graph();

    let half = Op::new("math.half", |call: &Invocation| {
        Ok(Value::Int(call.arg(0)?.as_i64().unwrap_or_default() / 2))
    });
    let y = half.call([10]).unwrap().add(half.call([4]).unwrap()).unwrap();
    let run = Engine::new().optimize(false).run([&y]).unwrap();
    assert_eq!(run.values, [Value::Int(7)]);

    let rendered = run.diagnostics.render_mermaid(&graph);
    assert_eq!(rendered.matches("style").count(), 3);
    assert!(!rendered.contains("not run"));
    assert_eq!(rendered.matches("-->").count(), 2);
}
