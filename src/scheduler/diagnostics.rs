use std::collections::HashMap;
use std::fmt::{self, Write};
use std::time::{Duration, Instant};

use crate::core::Key;
use crate::graph::TaskGraph;

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
    /// Index of the pool thread that ran the task, `None` when it ran on the
    /// driving thread.
    pub worker: Option<usize>,
}

/// What happened during one run.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    pub execution_times: HashMap<Key, TaskExecution>,
    /// Size of every dispatched chunk, in dispatch order.
    pub chunks: Vec<usize>,
    /// Keys that failed on a worker and were run again locally.
    pub reruns: Vec<Key>,
}

impl Diagnostics {
    /// Renders the graph as a Mermaid diagram, color-coded by execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Not run
    pub fn render_mermaid(&self, graph: &TaskGraph) -> String {
        let mut f = String::new();
        // writing into a String cannot fail
        let _ = self.write_mermaid(&mut f, graph);
        f
    }

    fn write_mermaid(&self, f: &mut String, graph: &TaskGraph) -> fmt::Result {
        writeln!(f, "graph LR")?;

        let times = &self.execution_times;
        let (min_time, max_time) = times
            .values()
            .map(|t| t.duration.as_secs_f64())
            .fold(None, |range, secs| match range {
                None => Some((secs, secs)),
                Some((lo, hi)) => Some((f64::min(lo, secs), f64::max(hi, secs))),
            })
            .unwrap_or((0.0, 0.0));

        // all tasks took the same time
        let spread = match max_time - min_time {
            spread if spread.abs() < f64::EPSILON => 1.0,
            spread => spread,
        };

        let index: HashMap<&Key, usize> = graph.keys().enumerate().map(|(i, key)| (key, i)).collect();

        for (i, (key, task)) in graph.iter().enumerate() {
            let name = task.label().replace('"', "\\\"");

            let (label_extra, color_code) = match times.get(key) {
                Some(exec) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / spread;
                    (format!("{:.2?}", exec.duration), heat(t))
                }
                None => ("not run".to_string(), "#ADD8E6".to_string()),
            };

            writeln!(f, "    {i}[\"{name}\\n{label_extra}\"]")?;
            writeln!(f, "    style {i} fill:{color_code}")?;
        }

        for (key, task) in graph.iter() {
            for dependency in task.dependencies() {
                if let Some(source) = index.get(&dependency) {
                    writeln!(f, "    {source} --> {}", index[key])?;
                }
            }
        }

        Ok(())
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn heat(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);
    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };
    format!("#{r:02X}{g:02X}00")
}
